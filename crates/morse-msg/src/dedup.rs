//! ---
//! morse_section: "02-messaging-ipc-data-model"
//! morse_subsection: "module"
//! morse_type: "source"
//! morse_scope: "code"
//! morse_description: "Envelope schema, codecs and delivery discipline."
//! morse_version: "v0.1.0"
//! morse_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use crate::types::MessageId;

/// Counters describing gate activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupStats {
    /// Envelopes let through.
    pub accepted: u64,
    /// Envelopes recognised as immediate redeliveries.
    pub suppressed: u64,
}

/// Suppresses immediate redeliveries of the same envelope.
///
/// Each topic remembers exactly one id, the last one accepted. An id equal to
/// that slot is rejected, anything else is accepted and replaces it. The gate
/// does not keep history, so `A, B, A` accepts all three.
#[derive(Debug, Default)]
pub struct DedupGate {
    last_seen: Mutex<HashMap<String, MessageId>>,
    accepted: AtomicU64,
    suppressed: AtomicU64,
}

impl DedupGate {
    /// Create an empty gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the envelope should be processed.
    pub fn accept(&self, topic: &str, id: &MessageId) -> bool {
        let mut slots = self.last_seen.lock();
        match slots.get(topic) {
            Some(previous) if previous == id => {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                trace!(topic, id = %id, "duplicate delivery suppressed");
                false
            }
            _ => {
                slots.insert(topic.to_owned(), id.clone());
                self.accepted.fetch_add(1, Ordering::Relaxed);
                true
            }
        }
    }

    /// The id currently held for `topic`.
    pub fn last_seen(&self, topic: &str) -> Option<MessageId> {
        self.last_seen.lock().get(topic).cloned()
    }

    /// Forget every remembered id. Counters are kept.
    pub fn reset(&self) {
        self.last_seen.lock().clear();
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> DedupStats {
        DedupStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
        }
    }
}
