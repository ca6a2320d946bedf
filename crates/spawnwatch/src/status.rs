//! Status command: print tracked bosses from a state file.

use std::path::Path;

use chrono::{DateTime, Utc};
use miette::Result;

use spawnwatch_tracker::{Entity, JsonFileStore, Snapshot, SnapshotStore};

pub async fn run(state_path: &Path, group: Option<&str>) -> Result<()> {
    let store = JsonFileStore::new(state_path);
    let Some(snapshot) = store
        .load()
        .await
        .map_err(|e| miette::miette!("failed to read {}: {}", state_path.display(), e))?
    else {
        println!("No state file at {}", state_path.display());
        return Ok(());
    };

    let lines = render(&snapshot, group);
    if lines.is_empty() {
        println!("No bosses tracked.");
    }
    for line in lines {
        println!("{}", line);
    }
    Ok(())
}

/// Render one block per group, bosses ordered by window start.
fn render(snapshot: &Snapshot, only: Option<&str>) -> Vec<String> {
    let mut lines = Vec::new();

    for (group, bosses) in &snapshot.groups {
        if only.is_some_and(|only| only != group.0) {
            continue;
        }

        lines.push(format!("=== {} ===", group));
        if let Some(channel) = snapshot.channels.get(group) {
            lines.push(format!("channel: {}", channel));
        }

        let mut bosses: Vec<&Entity> = bosses.values().collect();
        bosses.sort_by(|a, b| {
            (a.next_window_start.is_none(), a.next_window_start, &a.name).cmp(&(
                b.next_window_start.is_none(),
                b.next_window_start,
                &b.name,
            ))
        });
        for boss in bosses {
            lines.push(describe(boss));
        }
    }

    lines
}

fn describe(boss: &Entity) -> String {
    let window = match (boss.next_window_start, boss.next_window_end) {
        (None, _) => "no kill reported".to_string(),
        (Some(start), Some(end)) => format!("{} .. {}", timestamp(start), timestamp(end)),
        (Some(start), None) => timestamp(start),
    };

    let mut line = format!("  {} ({}): {}", boss.name, boss.location, window);
    if boss.is_window {
        line.push_str(" [estimated]");
    }
    if boss.pending_message.is_some() {
        line.push_str(" [awaiting response]");
    }
    line
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M UTC").to_string()
}
