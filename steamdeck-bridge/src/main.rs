//! Steam Deck telemetry bridge daemon
//!
//! Publishes telemetry to the MQTT broker configured in the settings file
//! and listens for platform notifications as JSON lines on stdin (see
//! `platform::JsonLinesPlatform`). Runs until Ctrl-C.

use anyhow::{Context, Result};
use std::sync::Arc;
use steamdeck_bridge::platform::{self, JsonLinesPlatform};
use steamdeck_bridge::{Bridge, LinuxTelemetrySource, MqttConnector, TomlSettingsStore};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("steamdeck_bridge=info")),
        )
        .init();

    info!("Steam Deck bridge v{} starting...", env!("CARGO_PKG_VERSION"));

    let store = TomlSettingsStore::default_location().context("Failed to locate settings file")?;
    info!("Settings file: {:?}", store.path());

    let (handle, task) = Bridge::spawn(
        Arc::new(store),
        Arc::new(MqttConnector::new()),
        Arc::new(LinuxTelemetrySource::new()),
    );

    let feed = Arc::new(JsonLinesPlatform::new());
    let subscriptions = platform::attach(&feed.hooks(), &handle);

    // a plain thread: a blocked stdin read must not hold up runtime shutdown
    let reader = Arc::clone(&feed);
    std::thread::Builder::new()
        .name("platform-feed".into())
        .spawn(move || {
            if let Err(e) = reader.run(std::io::stdin().lock()) {
                error!("Platform feed failed: {}", e);
            }
        })
        .context("Failed to start platform feed")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down...");

    let failed = subscriptions.shutdown();
    if failed > 0 {
        warn!("{} platform subscriptions failed to unregister", failed);
    }
    handle.shutdown().await.context("Bridge shutdown failed")?;
    task.await.context("Bridge task panicked")?;

    info!("Steam Deck bridge stopped");
    Ok(())
}
