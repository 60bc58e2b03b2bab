//! sentineld - the primary monitoring process.
//!
//! Runs the monitor loop and the supervisor heartbeat. Paths are taken
//! from the environment with working-directory defaults.

use std::sync::Arc;

use lansentinel::config::ConfigStore;
use lansentinel::monitor::{IncidentLedger, MonitorDaemon};
use lansentinel::notify::{LogSink, NoCapture};
use lansentinel::watchdog;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("lansentinel=info".parse()?),
        )
        .init();

    let config_path =
        std::env::var("LANSENTINEL_CONFIG").unwrap_or_else(|_| "sentinel.conf".to_string());
    let ledger_path =
        std::env::var("LANSENTINEL_LEDGER").unwrap_or_else(|_| "incidents_log.csv".to_string());

    tracing::info!("Starting sentineld, config at {}", config_path);
    let store = Arc::new(ConfigStore::open(&config_path));

    // The other half of the mutual watchdog: resurrect the supervisor if
    // it vanishes.
    watchdog::spawn_supervisor_heartbeat();

    let daemon = MonitorDaemon::new(
        store,
        Arc::new(LogSink),
        Arc::new(NoCapture),
        IncidentLedger::new(&ledger_path),
    );
    daemon.run().await;

    Ok(())
}
