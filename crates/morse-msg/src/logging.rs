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

use crate::types::Envelope;

/// Direction of the message movement, used for consistent logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    /// Envelope published to the broker.
    Outbound,
    /// Envelope delivered by the broker.
    Inbound,
    /// Envelope dropped as an immediate redelivery.
    Duplicate,
}

/// Emit a structured log entry for envelope activity.
pub fn log_message(direction: MessageDirection, topic: &str, envelope: &Envelope) {
    debug!(
        message_id = %envelope.id,
        topic,
        payload_len = envelope.payload.len(),
        direction = ?direction,
        "messaging activity"
    );
}
