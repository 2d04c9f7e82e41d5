//! Wires the store, the protocol bridge and the device registry together.

use std::sync::Arc;

use atvlink_bridge::BridgeClient;
use atvlink_connection::{DeviceRegistry, DriverEvent, JsonFileStore};
use atvlink_discovery::Scanner;
use tokio::sync::mpsc;

use crate::config::Config;

/// Runs the driver until ctrl-c.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let store = Arc::new(JsonFileStore::open(config.devices_path())?);
    tracing::info!(path = %store.path().display(), "device store opened");

    let scanner = if config.discovery.all_models {
        Scanner::new().include_all_models()
    } else {
        Scanner::new()
    };
    let client = Arc::new(BridgeClient::new(config.bridge.url.clone()).with_scanner(scanner));

    let registry = DeviceRegistry::new(client.clone(), store, config.to_settings());
    let events = registry
        .take_events()
        .ok_or_else(|| anyhow::anyhow!("driver event stream already taken"))?;
    let logger = tokio::spawn(log_events(events));

    let loaded = registry.load_from_store()?;
    registry.enable_all().await;
    tracing::info!(devices = loaded, "driver ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("SIGINT received, shutting down");

    registry.shutdown().await;
    client.close().await;
    drop(registry);
    logger.abort();
    Ok(())
}

async fn log_events(mut events: mpsc::Receiver<DriverEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            DriverEvent::StateChanged { device, state } => {
                tracing::info!(device = %device, %state, "session state");
            }
            DriverEvent::Reconnecting {
                device,
                attempt,
                next_retry,
            } => {
                tracing::info!(
                    device = %device,
                    attempt,
                    delay_secs = next_retry.as_secs_f64(),
                    "reconnecting"
                );
            }
            DriverEvent::CommandCompleted {
                device,
                correlation,
                command,
                result: Err(e),
            } => {
                tracing::warn!(device = %device, %correlation, command, error = %e, "command failed");
            }
            DriverEvent::PairingPin {
                device, protocol, ..
            } => {
                tracing::info!(device = %device, %protocol, "enter the announced PIN on the device");
            }
            DriverEvent::PairingStep { device, step } => {
                tracing::info!(device = %device, ?step, "pairing step");
            }
            other => tracing::debug!(event = ?other, "driver event"),
        }
    }
}
