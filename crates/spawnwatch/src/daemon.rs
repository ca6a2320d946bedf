//! Daemon command.
//!
//! Wires the snapshot file, the alert transport and the tracker together,
//! rebuilds timers from the last snapshot and serves the HTTP commands until
//! ctrl-c.

use std::path::PathBuf;
use std::sync::Arc;

use miette::Result;
use tokio::sync::watch;
use tracing::{info, warn};

use spawnwatch_tracker::{JsonFileStore, SystemClock, Tracker, TrackerConfig, Transport};
use spawnwatch_web::create_router;

use crate::transport::{LogTransport, WebhookTransport};

/// Settings for [`run`].
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub state_path: PathBuf,
    pub port: u16,
    pub webhook_url: Option<String>,
    pub tracker: TrackerConfig,
}

/// Run the daemon until a shutdown signal arrives.
pub async fn run(config: DaemonConfig) -> Result<()> {

    let transport: Arc<dyn Transport> = match &config.webhook_url {
        Some(url) => {
            info!(url = %url, "delivering alerts through webhook");
            Arc::new(WebhookTransport::new(url).map_err(|e| miette::miette!("{}", e))?)
        }
        None => {
            warn!("no webhook configured, alerts will only be logged");
            Arc::new(LogTransport)
        }
    };
    let persistence = Arc::new(JsonFileStore::new(config.state_path.clone()));
    info!(state_path = %persistence.path().display(), "starting spawnwatch daemon");

    let (tracker, fired_rx) = Tracker::open(
        transport,
        persistence,
        Arc::new(SystemClock),
        config.tracker,
    )
    .await
    .map_err(|e| miette::miette!("failed to load state: {}", e))?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Handle shutdown signals
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx_clone.send(true);
    });

    let report = tracker.reconcile().await;
    for entity in &report.unroutable {
        warn!(entity = %entity, "boss has no alert destination; set a group channel to schedule it");
    }

    let dispatcher_handle = {
        let tracker = tracker.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            tracker.run(fired_rx, shutdown_rx).await;
        })
    };

    let router = create_router(tracker);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    info!("command server listening on http://0.0.0.0:{}", config.port);

    let mut server_shutdown = shutdown_rx.clone();
    let served = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.wait_for(|stop| *stop).await;
        })
        .await;

    // Stop the dispatcher even when the server exited on its own
    let _ = shutdown_tx.send(true);
    let _ = dispatcher_handle.await;

    served.map_err(|e| miette::miette!("{}", e))?;
    info!("daemon shut down gracefully");
    Ok(())
}
