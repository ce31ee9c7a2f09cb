//! ---
//! morse_section: "02-messaging-ipc-data-model"
//! morse_subsection: "module"
//! morse_type: "source"
//! morse_scope: "code"
//! morse_description: "Envelope schema, codecs and delivery discipline."
//! morse_version: "v0.1.0"
//! morse_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Messaging primitives shared by the pipeline stages: the envelope and status
//! model, the wire codec, the broker [`Transport`] seam with an in-process and
//! an MQTT implementation, and the per-topic [`DedupGate`] / [`PresenceTracker`].

pub mod codec;
pub mod dedup;
pub mod logging;
#[cfg(feature = "mqtt")]
pub mod mqtt;
pub mod presence;
pub mod transport;
pub mod types;

/// Shared result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Errors raised by codecs and transports.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// A wire frame could not be decoded into an envelope.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    /// A status topic carried something other than `Online`/`Offline`.
    #[error("unknown status payload: {0:?}")]
    UnknownStatus(String),
    /// The transport rejected an operation (connection drop, full queue, ...).
    #[error("transport failure: {0}")]
    Transport(String),
    /// The session was already disconnected.
    #[error("transport session closed")]
    Closed,
    /// Wrapper for JSON serialization or deserialization problems.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub use codec::{decode_envelope, encode_envelope};
pub use dedup::{DedupGate, DedupStats};
pub use logging::{log_message, MessageDirection};
#[cfg(feature = "mqtt")]
pub use mqtt::MqttTransport;
pub use presence::{PresenceTracker, PresenceTransition};
pub use transport::{
    ConnectOptions, Delivery, InMemoryBroker, InMemorySession, LastWill, Transport,
    TransportEvent,
};
pub use types::{Envelope, MessageId, Status};
