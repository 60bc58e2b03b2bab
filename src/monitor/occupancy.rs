//! Occupancy sessions with stability confirmation and batched events.
//!
//! A raw presence flip is committed only after it holds unchanged for the
//! stability window: client machines flicker on netboot and reboot, and a
//! flicker is not a session. Committed transitions queue start/end events;
//! the queue flushes as one batch once the quiet period after the *first*
//! queued event elapses, so a wave of simultaneous logons becomes a single
//! notification.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};

/// One client machine position, derived from subnet/start/count.
#[derive(Debug, Clone)]
pub struct ClientSlot {
    pub index: u32,
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Presence {
    Online,
    Offline,
}

#[derive(Debug)]
struct ClientState {
    committed: Presence,
    /// Raw state observed but not yet stable, and when it first appeared.
    pending: Option<(Presence, DateTime<Utc>)>,
    session_start: Option<DateTime<Utc>>,
}

impl ClientState {
    fn new() -> Self {
        Self {
            committed: Presence::Offline,
            pending: None,
            session_start: None,
        }
    }
}

/// Start and end events flushed as one notification.
#[derive(Debug, Default)]
pub struct SessionBatch {
    pub started: Vec<String>,
    /// (client name, human-readable session duration)
    pub ended: Vec<(String, String)>,
}

impl SessionBatch {
    pub fn is_empty(&self) -> bool {
        self.started.is_empty() && self.ended.is_empty()
    }
}

/// Per-client presence debouncer and session batcher. Time is injected;
/// the tracker never looks at a wall clock.
pub struct OccupancyTracker {
    stability: Duration,
    batch_delay: Duration,
    clients: HashMap<String, ClientState>,
    queued: SessionBatch,
    /// Set when the first event of the current batch is queued; the flush
    /// window is anchored here and is not extended by later arrivals.
    batch_anchor: Option<DateTime<Utc>>,
    last_snapshot: DateTime<Utc>,
}

const SNAPSHOT_CADENCE_SECS: i64 = 3600;

impl OccupancyTracker {
    pub fn new(stability: Duration, batch_delay: Duration, now: DateTime<Utc>) -> Self {
        Self {
            stability,
            batch_delay,
            clients: HashMap::new(),
            queued: SessionBatch::default(),
            batch_anchor: None,
            // Anchor at startup so the first snapshot waits a full hour.
            last_snapshot: now,
        }
    }

    /// Adopt new debounce/batch windows on config reload. In-flight
    /// pending states and the current batch keep their original anchors.
    pub fn reconfigure(&mut self, stability: Duration, batch_delay: Duration) {
        self.stability = stability;
        self.batch_delay = batch_delay;
    }

    /// Feed one scan cycle: the reachable subset of the slot addresses.
    pub fn process_scan(
        &mut self,
        slots: &[ClientSlot],
        online: &HashSet<String>,
        now: DateTime<Utc>,
    ) {
        for slot in slots {
            let detected = if online.contains(&slot.address) {
                Presence::Online
            } else {
                Presence::Offline
            };

            let state = self
                .clients
                .entry(slot.name.clone())
                .or_insert_with(ClientState::new);

            if state.committed == detected {
                state.pending = None;
                continue;
            }

            match state.pending {
                Some((pending, first_seen)) if pending == detected => {
                    if now - first_seen >= self.stability {
                        Self::commit(
                            &mut self.queued,
                            &mut self.batch_anchor,
                            slot,
                            state,
                            detected,
                            now,
                        );
                    }
                }
                // First divergence, or the raw state flapped again: restart
                // the stability window from here.
                _ => state.pending = Some((detected, now)),
            }
        }
    }

    fn commit(
        queued: &mut SessionBatch,
        batch_anchor: &mut Option<DateTime<Utc>>,
        slot: &ClientSlot,
        state: &mut ClientState,
        detected: Presence,
        now: DateTime<Utc>,
    ) {
        state.committed = detected;
        state.pending = None;

        if batch_anchor.is_none() {
            *batch_anchor = Some(now);
        }

        match detected {
            Presence::Online => {
                state.session_start = Some(now);
                tracing::info!("occupancy: {} session started", slot.name);
                queued.started.push(slot.name.clone());
            }
            Presence::Offline => {
                let elapsed = state
                    .session_start
                    .take()
                    .map_or_else(|| "unknown".to_string(), |start| format_elapsed(start, now));
                tracing::info!("occupancy: {} session ended after {}", slot.name, elapsed);
                queued.ended.push((slot.name.clone(), elapsed));
            }
        }
    }

    /// Flush the queue once the quiet period since the first queued event
    /// has elapsed. Everything queued in the window leaves together.
    pub fn take_due_batch(&mut self, now: DateTime<Utc>) -> Option<SessionBatch> {
        let anchor = self.batch_anchor?;
        if now - anchor < self.batch_delay {
            return None;
        }
        self.batch_anchor = None;
        Some(std::mem::take(&mut self.queued))
    }

    /// True when the fixed one-hour snapshot cadence has elapsed; resets
    /// the cadence.
    pub fn snapshot_due(&mut self, now: DateTime<Utc>) -> bool {
        if (now - self.last_snapshot).num_seconds() > SNAPSHOT_CADENCE_SECS {
            self.last_snapshot = now;
            true
        } else {
            false
        }
    }
}

/// Human-readable session length: "2h 15m", or "7m" under an hour.
pub fn format_elapsed(start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    let total_seconds = (end - start).num_seconds().max(0);
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m", minutes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn slots(n: u32) -> Vec<ClientSlot> {
        (0..n)
            .map(|i| ClientSlot {
                index: i,
                name: format!("PC-{}", i + 1),
                address: format!("192.168.1.{}", 110 + i),
            })
            .collect()
    }

    fn online(addrs: &[&str]) -> HashSet<String> {
        addrs.iter().map(|s| (*s).to_string()).collect()
    }

    fn tracker() -> OccupancyTracker {
        // 60s stability, 30s batch window.
        OccupancyTracker::new(Duration::seconds(60), Duration::seconds(30), at(0))
    }

    #[test]
    fn flicker_shorter_than_stability_commits_nothing() {
        let mut t = tracker();
        let slots = slots(1);

        t.process_scan(&slots, &online(&["192.168.1.110"]), at(0));
        t.process_scan(&slots, &online(&[]), at(30));
        t.process_scan(&slots, &online(&["192.168.1.110"]), at(40));
        // The online run never held for 60s, so nothing was queued.
        assert!(t.take_due_batch(at(500)).is_none());
    }

    #[test]
    fn stable_online_opens_session_and_queues_start() {
        let mut t = tracker();
        let slots = slots(1);

        t.process_scan(&slots, &online(&["192.168.1.110"]), at(0));
        t.process_scan(&slots, &online(&["192.168.1.110"]), at(60));

        let batch = t.take_due_batch(at(95)).expect("batch due");
        assert_eq!(batch.started, vec!["PC-1"]);
        assert!(batch.ended.is_empty());
    }

    #[test]
    fn stable_offline_closes_session_with_duration() {
        let mut t = tracker();
        let slots = slots(1);

        // Session opens at t=60.
        t.process_scan(&slots, &online(&["192.168.1.110"]), at(0));
        t.process_scan(&slots, &online(&["192.168.1.110"]), at(60));
        let _ = t.take_due_batch(at(95));

        // Goes dark at t=3720, confirmed at t=3780.
        t.process_scan(&slots, &online(&[]), at(3720));
        t.process_scan(&slots, &online(&[]), at(3780));

        let batch = t.take_due_batch(at(3815)).expect("batch due");
        assert!(batch.started.is_empty());
        // 60 -> 3780 is 62 minutes.
        assert_eq!(batch.ended, vec![("PC-1".to_string(), "1h 2m".to_string())]);
    }

    #[test]
    fn batch_window_is_anchored_to_first_event() {
        let mut t = tracker();
        let slots = slots(3);

        // PC-1 goes online at t=0, PC-2 at t=25.
        t.process_scan(&slots, &online(&["192.168.1.110"]), at(0));
        t.process_scan(
            &slots,
            &online(&["192.168.1.110", "192.168.1.111"]),
            at(25),
        );
        // PC-1 confirmed at t=60 anchors the batch; PC-2 confirmed at
        // t=85, inside the window, must not extend it.
        t.process_scan(
            &slots,
            &online(&["192.168.1.110", "192.168.1.111"]),
            at(60),
        );
        t.process_scan(
            &slots,
            &online(&["192.168.1.110", "192.168.1.111"]),
            at(85),
        );

        assert!(t.take_due_batch(at(89)).is_none(), "window not elapsed yet");
        let batch = t.take_due_batch(at(90)).expect("due 30s after first event");
        assert_eq!(batch.started.len(), 2);
        // Flushed exactly once.
        assert!(t.take_due_batch(at(300)).is_none());
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(format_elapsed(at(0), at(135 * 60)), "2h 15m");
        assert_eq!(format_elapsed(at(0), at(420)), "7m");
        assert_eq!(format_elapsed(at(0), at(0)), "0m");
    }

    #[test]
    fn snapshot_fires_on_hour_cadence() {
        let mut t = tracker();
        assert!(!t.snapshot_due(at(3599)));
        assert!(t.snapshot_due(at(3601)));
        // Cadence resets from the firing point.
        assert!(!t.snapshot_due(at(3700)));
        assert!(t.snapshot_due(at(3601 + 3601)));
    }

    #[test]
    fn reappearing_raw_state_restarts_stability_window() {
        let mut t = tracker();
        let slots = slots(1);

        t.process_scan(&slots, &online(&["192.168.1.110"]), at(0));
        // Dropped out at t=30, back at t=50: the online run restarts at 50.
        t.process_scan(&slots, &online(&[]), at(30));
        t.process_scan(&slots, &online(&["192.168.1.110"]), at(50));
        t.process_scan(&slots, &online(&["192.168.1.110"]), at(100));
        assert!(t.take_due_batch(at(200)).is_none());

        t.process_scan(&slots, &online(&["192.168.1.110"]), at(110));
        let batch = t.take_due_batch(at(200)).expect("stable since t=50");
        assert_eq!(batch.started, vec!["PC-1"]);
    }
}
