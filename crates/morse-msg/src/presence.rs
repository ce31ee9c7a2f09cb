//! ---
//! morse_section: "02-messaging-ipc-data-model"
//! morse_subsection: "module"
//! morse_type: "source"
//! morse_scope: "code"
//! morse_description: "Envelope schema, codecs and delivery discipline."
//! morse_version: "v0.1.0"
//! morse_owner: "tbd"
//! ---
use tracing::debug;

use crate::types::Status;

/// Change in an upstream's observed liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceTransition {
    /// Previous state, `None` before the first report.
    pub from: Option<Status>,
    /// Newly observed state.
    pub to: Status,
}

/// Last observed liveness of one upstream stage.
///
/// Repeated identical reports (retained replays, reconnect announcements) do
/// not produce a transition, so callers only react to real changes.
#[derive(Debug, Clone)]
pub struct PresenceTracker {
    upstream: String,
    state: Option<Status>,
    transitions: u64,
}

impl PresenceTracker {
    /// Tracker for the stage publishing on `upstream`'s status topic.
    pub fn new(upstream: impl Into<String>) -> Self {
        Self {
            upstream: upstream.into(),
            state: None,
            transitions: 0,
        }
    }

    /// Label of the tracked upstream.
    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    /// Record a status report, returning the transition if the state changed.
    pub fn on_status_message(&mut self, status: Status) -> Option<PresenceTransition> {
        if self.state == Some(status) {
            return None;
        }
        let transition = PresenceTransition {
            from: self.state.replace(status),
            to: status,
        };
        self.transitions += 1;
        debug!(upstream = %self.upstream, from = ?transition.from, to = %status, "upstream presence changed");
        Some(transition)
    }

    /// Current view; an upstream that never reported counts as offline.
    pub fn current_state(&self) -> Status {
        self.state.unwrap_or(Status::Offline)
    }

    /// Whether any report has been seen yet.
    pub fn has_reported(&self) -> bool {
        self.state.is_some()
    }

    /// Number of transitions observed so far.
    pub fn transitions(&self) -> u64 {
        self.transitions
    }
}
