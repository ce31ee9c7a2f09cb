//! ---
//! morse_section: "02-messaging-ipc-data-model"
//! morse_subsection: "module"
//! morse_type: "source"
//! morse_scope: "code"
//! morse_description: "Envelope schema, codecs and delivery discipline."
//! morse_version: "v0.1.0"
//! morse_owner: "tbd"
//! ---
//! Wire framing for event envelopes.
//!
//! Two framings are understood. The marker framing `msg: <payload> id: <token>`
//! is the historical format; the JSON framing carries the same two fields as
//! tagged members. Decoding sniffs the frame so either side can migrate first.

use bytes::Bytes;
use morse_common::config::WireFormat;

use crate::types::{Envelope, MessageId};
use crate::{MessagingError, Result};

const PAYLOAD_MARKER: &str = "msg: ";
const ID_MARKER: &str = " id:";

/// Serialize an envelope with the requested framing.
pub fn encode_envelope(envelope: &Envelope, format: WireFormat) -> Result<Bytes> {
    match format {
        WireFormat::Marker => Ok(Bytes::from(format!(
            "{}{}{} {}",
            PAYLOAD_MARKER, envelope.payload, ID_MARKER, envelope.id
        ))),
        WireFormat::Json => Ok(Bytes::from(serde_json::to_vec(envelope)?)),
    }
}

/// Parse a frame in either framing.
pub fn decode_envelope(frame: &[u8]) -> Result<Envelope> {
    let text = std::str::from_utf8(frame)
        .map_err(|err| MessagingError::MalformedEnvelope(format!("frame is not utf-8: {err}")))?;
    if text.trim_start().starts_with('{') {
        return serde_json::from_str::<Envelope>(text)
            .map_err(|err| MessagingError::MalformedEnvelope(format!("invalid json frame: {err}")))
            .and_then(validate);
    }
    decode_marker(text).and_then(validate)
}

fn decode_marker(text: &str) -> Result<Envelope> {
    let start = text
        .find(PAYLOAD_MARKER)
        .ok_or_else(|| MessagingError::MalformedEnvelope("missing `msg:` marker".into()))?
        + PAYLOAD_MARKER.len();
    // The last marker wins so payloads that happen to contain ` id:` survive.
    let end = text[start..]
        .rfind(ID_MARKER)
        .map(|offset| start + offset)
        .ok_or_else(|| MessagingError::MalformedEnvelope("missing `id:` marker".into()))?;
    let payload = &text[start..end];
    let id = text[end + ID_MARKER.len()..].trim();
    Ok(Envelope::with_id(payload, MessageId::from(id)))
}

fn validate(envelope: Envelope) -> Result<Envelope> {
    if envelope.id.as_str().trim().is_empty() {
        return Err(MessagingError::MalformedEnvelope("empty message id".into()));
    }
    Ok(envelope)
}
