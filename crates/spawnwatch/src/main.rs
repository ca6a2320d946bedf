//! spawnwatch: boss respawn tracker
//!
//! Main binary with subcommands:
//! - `daemon`: Track bosses, send timed alerts and serve the HTTP commands
//! - `status`: Print tracked bosses from a state file

use std::path::PathBuf;

use chrono::Duration;
use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use spawnwatch_tracker::TrackerConfig;

mod daemon;
mod status;
mod transport;

#[derive(Parser)]
#[command(name = "spawnwatch")]
#[command(about = "Boss respawn tracker with timed alerts", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tracker daemon (timers, alerts, HTTP commands)
    Daemon {
        /// State file (defaults to <data dir>/spawnwatch/state.json)
        #[arg(long, env = "SPAWNWATCH_STATE_PATH")]
        state_path: Option<PathBuf>,

        /// HTTP server port
        #[arg(long, env = "SPAWNWATCH_PORT", default_value = "8080")]
        port: u16,

        /// Base URL of the chat webhook bridge. Alerts are only logged when unset.
        #[arg(long, env = "SPAWNWATCH_WEBHOOK_URL")]
        webhook_url: Option<String>,

        /// Minutes before the window opens to send the pre-alert
        #[arg(long, env = "SPAWNWATCH_PRE_LEAD_MINUTES", default_value = "10")]
        pre_lead_minutes: u32,

        /// Minutes a spawn alert waits for an answer before counting as missed
        #[arg(long, env = "SPAWNWATCH_RESPONSE_TIMEOUT_MINUTES", default_value = "20")]
        response_timeout_minutes: u32,
    },

    /// Print tracked bosses from a state file
    Status {
        /// State file (defaults to <data dir>/spawnwatch/state.json)
        #[arg(long, env = "SPAWNWATCH_STATE_PATH")]
        state_path: Option<PathBuf>,

        /// Only show this group
        #[arg(long)]
        group: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "spawnwatch=info,spawnwatch_tracker=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon {
            state_path,
            port,
            webhook_url,
            pre_lead_minutes,
            response_timeout_minutes,
        } => {
            daemon::run(daemon::DaemonConfig {
                state_path: state_path.unwrap_or_else(default_state_path),
                port,
                webhook_url: webhook_url.filter(|url| !url.is_empty()),
                tracker: TrackerConfig {
                    pre_lead: Duration::minutes(i64::from(pre_lead_minutes)),
                    response_timeout: Duration::minutes(i64::from(response_timeout_minutes)),
                },
            })
            .await
        }

        Commands::Status { state_path, group } => {
            let state_path = state_path.unwrap_or_else(default_state_path);
            status::run(&state_path, group.as_deref()).await
        }
    }
}

fn default_state_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("spawnwatch")
        .join("state.json")
}
