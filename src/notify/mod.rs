//! Seams to the external notification and evidence collaborators.
//!
//! Everything here is fire-and-forget: the monitor loop hands work to a
//! background task and never waits on it. Delivery is best-effort; a late
//! alert has no value, so there is no retry queue and incident-record
//! correctness never depends on a send succeeding.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::monitor::Role;

/// A closed session summary: client name plus human-readable duration.
pub type EndedSession = (String, String);

/// Outbound notification surface. Implementations may block (webhook
/// POSTs); they are always invoked from a blocking-capable task.
pub trait NotificationSink: Send + Sync {
    /// A confirmed outage has resolved.
    fn incident_resolved(
        &self,
        role: Role,
        duration: Duration,
        clients_online: usize,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        evidence: Option<Vec<u8>>,
    );

    /// A batch of session starts and ends, flushed together.
    fn session_batch(&self, started: Vec<String>, ended: Vec<EndedSession>);

    /// Periodic online/total occupancy snapshot.
    fn periodic_snapshot(&self, online: usize, total: usize, evidence: Option<Vec<u8>>);
}

/// Screen evidence source. `None` is a normal outcome (headless host,
/// capture disabled), never an error.
pub trait EvidenceCapture: Send + Sync {
    fn capture_current_screen(&self) -> Option<Vec<u8>>;
}

/// Sink that only writes to the log. Default for `sentineld`; webhook
/// transports live outside this crate and wrap the same trait.
pub struct LogSink;

impl NotificationSink for LogSink {
    fn incident_resolved(
        &self,
        role: Role,
        duration: Duration,
        clients_online: usize,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        evidence: Option<Vec<u8>>,
    ) {
        tracing::info!(
            "notify: {} restored after {:?} ({} clients online, {} - {}, evidence: {})",
            role,
            duration,
            clients_online,
            start.format("%H:%M:%S"),
            end.format("%H:%M:%S"),
            evidence.map_or(0, |e| e.len()),
        );
    }

    fn session_batch(&self, started: Vec<String>, ended: Vec<EndedSession>) {
        tracing::info!(
            "notify: session batch, {} started, {} ended",
            started.len(),
            ended.len()
        );
    }

    fn periodic_snapshot(&self, online: usize, total: usize, _evidence: Option<Vec<u8>>) {
        tracing::info!("notify: occupancy snapshot {}/{}", online, total);
    }
}

/// Capture source for hosts without a screen collaborator.
pub struct NoCapture;

impl EvidenceCapture for NoCapture {
    fn capture_current_screen(&self) -> Option<Vec<u8>> {
        None
    }
}

/// Run a notification closure on a background blocking thread. The caller
/// returns immediately; failure inside the closure is the closure's
/// problem to log.
pub fn dispatch<F>(job: F)
where
    F: FnOnce() + Send + 'static,
{
    tokio::task::spawn_blocking(job);
}

/// Capture-then-notify helper used for incident closes and snapshots, so
/// the capture I/O also stays off the monitor loop.
pub fn dispatch_with_evidence<F>(capture: Arc<dyn EvidenceCapture>, job: F)
where
    F: FnOnce(Option<Vec<u8>>) + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let evidence = capture.capture_current_screen();
        job(evidence);
    });
}
