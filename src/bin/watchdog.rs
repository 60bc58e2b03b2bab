//! sentinel-watch - the supervisor process.
//!
//! Keeps `sentineld` alive: attaches if it is already running, spawns it
//! otherwise, and relaunches on any abnormal exit. Stops on a clean exit
//! or when setup was cancelled (dedicated exit code, or missing vault).

use lansentinel::watchdog::{sibling_binary, CredentialVault, Supervisor, PRIMARY_PROCESS};

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

    let vault_path =
        std::env::var("LANSENTINEL_VAULT").unwrap_or_else(|_| "sentinel.vault".to_string());

    tracing::info!("Starting sentinel-watch");
    let supervisor = Supervisor::new(
        sibling_binary(PRIMARY_PROCESS),
        CredentialVault::new(vault_path),
    );
    supervisor.run().await;

    Ok(())
}
