//! Reachability probing over sets of hosts.
//!
//! One ICMP echo per host, the whole batch in flight concurrently. The
//! probe layer never retries; verification policy lives in the incident
//! tracker.

mod ping;

pub use ping::echo;

use std::collections::HashSet;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinSet;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("command failed: {0}")]
    Command(String),
}

/// Check a single host. `false` on timeout and on any probe failure:
/// an unanswerable question about reachability is answered "unreachable".
pub async fn check_host(address: &str, timeout: Duration) -> bool {
    match echo(address, timeout).await {
        Ok(_) => true,
        Err(ProbeError::Timeout(_)) => false,
        Err(e) => {
            tracing::debug!("probe error for {}: {}", address, e);
            false
        }
    }
}

/// Scan an address set concurrently and return the reachable subset.
///
/// Each host gets its own task, so wall-clock cost is one round trip plus
/// the timeout for the slowest host, not a sum over hosts. A host that
/// errors is simply absent from the result; if every echo fails (no raw
/// socket privilege, no usable `ping` binary) the result is the empty set
/// and the caller must treat that as everything-unreachable.
pub async fn scan_hosts<I>(addresses: I, timeout: Duration) -> HashSet<String>
where
    I: IntoIterator<Item = String>,
{
    let mut tasks = JoinSet::new();

    for address in addresses {
        tasks.spawn(async move {
            let up = check_host(&address, timeout).await;
            (address, up)
        });
    }

    let mut reachable = HashSet::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((address, true)) => {
                reachable.insert(address);
            }
            Ok((_, false)) => {}
            Err(e) => tracing::error!("probe task panicked: {}", e),
        }
    }

    reachable
}
