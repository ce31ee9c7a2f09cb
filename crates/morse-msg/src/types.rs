//! ---
//! morse_section: "02-messaging-ipc-data-model"
//! morse_subsection: "module"
//! morse_type: "source"
//! morse_scope: "code"
//! morse_description: "Envelope schema, codecs and delivery discipline."
//! morse_version: "v0.1.0"
//! morse_owner: "tbd"
//! ---
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::MessagingError;

/// Opaque identifier attached to every published envelope.
///
/// Only equality is meaningful; ids carry no ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Generate a fresh random token.
    pub fn fresh() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unit of application data carried on an event topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Raw text (source events) or signal code (encoded events).
    pub payload: String,
    /// Deduplication token.
    pub id: MessageId,
}

impl Envelope {
    /// Wrap a payload with a freshly generated id.
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            id: MessageId::fresh(),
        }
    }

    /// Wrap a payload with a caller supplied id.
    pub fn with_id(payload: impl Into<String>, id: impl Into<MessageId>) -> Self {
        Self {
            payload: payload.into(),
            id: id.into(),
        }
    }
}

/// Liveness value published on status topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// The publishing stage is connected and serving.
    Online,
    /// The publishing stage left, gracefully or through its last-will.
    Offline,
}

impl Status {
    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Online => "Online",
            Status::Offline => "Offline",
        }
    }

    /// Parse a raw status payload.
    pub fn from_payload(payload: &[u8]) -> crate::Result<Self> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| MessagingError::UnknownStatus(String::from_utf8_lossy(payload).into()))?;
        text.parse()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = MessagingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Online" => Ok(Status::Online),
            "Offline" => Ok(Status::Offline),
            other => Err(MessagingError::UnknownStatus(other.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_ids_are_distinct() {
        assert_ne!(MessageId::fresh(), MessageId::fresh());
        let envelope = Envelope::new("SOS");
        assert_eq!(envelope.payload, "SOS");
        assert!(!envelope.id.as_str().is_empty());
    }

    #[test]
    fn status_payloads_parse_strictly() {
        assert_eq!(Status::from_payload(b"Online").unwrap(), Status::Online);
        assert_eq!(Status::from_payload(b"Offline\n").unwrap(), Status::Offline);
        assert!(matches!(
            Status::from_payload(b"online"),
            Err(MessagingError::UnknownStatus(_))
        ));
        assert!(Status::from_payload(&[0xff, 0xfe]).is_err());
    }
}
