//! Per-role incident state machine.
//!
//! A single failed sample proves nothing. The tracker reports that a role
//! needs verification; the caller performs the delayed re-probe and either
//! confirms the outage (backdated to the original failure time) or
//! suppresses it as if it never happened. Recovery closes the incident and
//! applies the minimum-duration floor: a confirmed outage shorter than the
//! floor is jitter, logged but never notified.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Monitored infrastructure role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Gateway,
    Server,
    Egress,
}

impl Role {
    /// Diagnosis order: the first broken link in this chain owns the
    /// outage.
    pub const ALL: [Role; 3] = [Role::Gateway, Role::Server, Role::Egress];
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Gateway => write!(f, "GATEWAY"),
            Role::Server => write!(f, "SERVER"),
            Role::Egress => write!(f, "EGRESS"),
        }
    }
}

/// A closed incident. `suppressed` marks a sub-minimum outage that must
/// never be notified.
#[derive(Debug, Clone)]
pub struct IncidentRecord {
    pub role: Role,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration: Duration,
    pub suppressed: bool,
}

#[derive(Debug, Clone, Copy)]
enum RoleState {
    Up,
    Down { since: DateTime<Utc> },
}

/// What the tracker wants done with one sample.
#[derive(Debug)]
pub enum SampleDecision {
    /// Nothing changed.
    Unchanged,
    /// Role was UP and the sample failed: run the verification re-probe.
    NeedsVerification,
    /// Confirmed-down role answered: the incident is closed.
    Recovered(IncidentRecord),
}

/// Down/up state for every role, with verification hand-off and
/// minimum-duration hysteresis. Timestamps are injected so transitions
/// are deterministic under test.
pub struct IncidentTracker {
    states: HashMap<Role, RoleState>,
    min_duration: Duration,
}

impl IncidentTracker {
    pub fn new(min_duration: Duration) -> Self {
        let states = Role::ALL.iter().map(|r| (*r, RoleState::Up)).collect();
        Self {
            states,
            min_duration,
        }
    }

    /// Adopt a new hysteresis floor on config reload. Open incidents keep
    /// their start time; the floor applies at close.
    pub fn set_min_duration(&mut self, min_duration: Duration) {
        self.min_duration = min_duration;
    }

    pub fn is_down(&self, role: Role) -> bool {
        matches!(self.states.get(&role), Some(RoleState::Down { .. }))
    }

    /// Feed one reachability sample for `role` taken at `now`.
    pub fn apply_sample(&mut self, role: Role, reachable: bool, now: DateTime<Utc>) -> SampleDecision {
        let state = self.states.get_mut(&role).expect("all roles initialized");

        match (*state, reachable) {
            (RoleState::Up, true) | (RoleState::Down { .. }, false) => SampleDecision::Unchanged,
            (RoleState::Up, false) => SampleDecision::NeedsVerification,
            (RoleState::Down { since }, true) => {
                *state = RoleState::Up;
                let duration = (now - since).to_std().unwrap_or_default();
                let suppressed = duration < self.min_duration;
                SampleDecision::Recovered(IncidentRecord {
                    role,
                    start: since,
                    end: now,
                    duration,
                    suppressed,
                })
            }
        }
    }

    /// Verification failed too: the role is confirmed down, backdated to
    /// the original failure time, not the re-probe time.
    pub fn confirm_down(&mut self, role: Role, failed_at: DateTime<Utc>) {
        let state = self.states.get_mut(&role).expect("all roles initialized");
        if matches!(state, RoleState::Up) {
            *state = RoleState::Down { since: failed_at };
            tracing::warn!("incident: {} confirmed DOWN at {}", role, failed_at);
        }
    }
}
