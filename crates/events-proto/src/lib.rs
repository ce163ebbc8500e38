//! Client events wire protocol between subscriber and validator.
//!
//! ## Wire Format
//!
//! ```text
//! [4-byte length][2-byte type][1-byte corr_len][correlation id][payload]
//! ```
//!
//! - **length**: big-endian u32, size of (type + corr_len + correlation id + payload)
//! - **type**: big-endian u16 message type
//! - **corr_len**: u8 length of the correlation id (0 for unsolicited messages)
//! - **correlation id**: UTF-8 token pairing a request with its response
//! - **payload**: MessagePack document, see [`payload`]
//!
//! ## Message Types
//!
//! | Type | Direction | Name                               | Payload                |
//! |------|-----------|------------------------------------|------------------------|
//! | 500  | C→V       | client_events_subscribe_request    | `SubscribeRequest`     |
//! | 501  | V→C       | client_events_subscribe_response   | `SubscribeResponse`    |
//! | 502  | C→V       | client_events_unsubscribe_request  | `UnsubscribeRequest`   |
//! | 503  | V→C       | client_events_unsubscribe_response | `UnsubscribeResponse`  |
//! | 504  | V→C       | client_events                      | `EventList`            |

pub mod payload;

pub use payload::{
    Event, EventFilter, EventList, EventSubscription, MatchMode, SubscribeRequest,
    SubscribeResponse, SubscribeStatus, UnsubscribeRequest, UnsubscribeResponse,
    UnsubscribeStatus, decode_payload, encode_payload,
};

/// Header size (4-byte length prefix).
pub const HEADER_SIZE: usize = 4;

/// Maximum message body size (16 MB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Minimum body size: type (2) + corr_len (1).
pub const MIN_BODY_SIZE: usize = 3;

// Message type constants.
pub const MSG_CLIENT_EVENTS_SUBSCRIBE_REQUEST: u16 = 500;
pub const MSG_CLIENT_EVENTS_SUBSCRIBE_RESPONSE: u16 = 501;
pub const MSG_CLIENT_EVENTS_UNSUBSCRIBE_REQUEST: u16 = 502;
pub const MSG_CLIENT_EVENTS_UNSUBSCRIBE_RESPONSE: u16 = 503;
pub const MSG_CLIENT_EVENTS: u16 = 504;

/// Human-readable name of a message type, for logs and errors.
pub fn message_type_name(msg_type: u16) -> &'static str {
    match msg_type {
        MSG_CLIENT_EVENTS_SUBSCRIBE_REQUEST => "client_events_subscribe_request",
        MSG_CLIENT_EVENTS_SUBSCRIBE_RESPONSE => "client_events_subscribe_response",
        MSG_CLIENT_EVENTS_UNSUBSCRIBE_REQUEST => "client_events_unsubscribe_request",
        MSG_CLIENT_EVENTS_UNSUBSCRIBE_RESPONSE => "client_events_unsubscribe_response",
        MSG_CLIENT_EVENTS => "client_events",
        _ => "unknown",
    }
}

/// Protocol error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    MessageTooLarge(usize),
    MessageTooSmall(usize),
    InvalidPayload(String),
    PayloadTooLarge(&'static str, usize),
    Encode(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MessageTooLarge(size) => write!(f, "message too large: {size}"),
            Self::MessageTooSmall(size) => write!(f, "message too small: {size}"),
            Self::InvalidPayload(msg) => write!(f, "invalid payload: {msg}"),
            Self::PayloadTooLarge(field, size) => {
                write!(f, "payload field too large: {field} ({size} bytes)")
            }
            Self::Encode(msg) => write!(f, "encode failed: {msg}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Opaque token pairing a request with its response.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Read a `u8` from `data` at `offset`. Returns `None` if out of bounds.
fn read_u8_at(data: &[u8], offset: usize) -> Option<u8> {
    data.get(offset).copied()
}

/// Read a `u16` from `data` at `offset`. Returns `None` if out of bounds.
fn read_u16_at(data: &[u8], offset: usize) -> Option<u16> {
    let bytes: [u8; 2] = data.get(offset..offset + 2)?.try_into().ok()?;
    Some(u16::from_be_bytes(bytes))
}

/// Read a `u32` from `data` at `offset`. Returns `None` if out of bounds.
fn read_u32_at(data: &[u8], offset: usize) -> Option<u32> {
    let bytes: [u8; 4] = data.get(offset..offset + 4)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

/// A raw decoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub msg_type: u16,
    /// `None` for unsolicited (pushed) messages.
    pub correlation_id: Option<CorrelationId>,
    pub payload: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// Encode a raw message: `[4-byte length][2-byte type][1-byte corr_len][corr id][payload]`.
pub fn encode(
    msg_type: u16,
    correlation_id: Option<&CorrelationId>,
    payload: &[u8],
) -> Result<Vec<u8>, ProtocolError> {
    let corr = correlation_id.map(|c| c.as_str().as_bytes()).unwrap_or_default();
    if corr.len() > u8::MAX as usize {
        return Err(ProtocolError::PayloadTooLarge("correlation_id", corr.len()));
    }
    let body_len = MIN_BODY_SIZE + corr.len() + payload.len();
    if body_len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(body_len));
    }
    let mut buf = Vec::with_capacity(HEADER_SIZE + body_len);
    buf.extend_from_slice(&(body_len as u32).to_be_bytes());
    buf.extend_from_slice(&msg_type.to_be_bytes());
    buf.push(corr.len() as u8);
    buf.extend_from_slice(corr);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Split a complete message body into its fields.
fn decode_body(body: &[u8]) -> Result<RawMessage, ProtocolError> {
    let msg_type = read_u16_at(body, 0).ok_or(ProtocolError::MessageTooSmall(body.len()))?;
    let corr_len =
        read_u8_at(body, 2).ok_or(ProtocolError::MessageTooSmall(body.len()))? as usize;
    let corr_end = MIN_BODY_SIZE + corr_len;
    let corr = body
        .get(MIN_BODY_SIZE..corr_end)
        .ok_or_else(|| ProtocolError::InvalidPayload("correlation id truncated".to_string()))?;
    let correlation_id = if corr.is_empty() {
        None
    } else {
        let id = std::str::from_utf8(corr).map_err(|_| {
            ProtocolError::InvalidPayload("invalid UTF-8 in correlation id".to_string())
        })?;
        Some(CorrelationId::new(id))
    };
    let payload = body.get(corr_end..).unwrap_or_default().to_vec();
    Ok(RawMessage {
        msg_type,
        correlation_id,
        payload,
    })
}

// ---------------------------------------------------------------------------
// Decoder (buffered, handles partial reads)
// ---------------------------------------------------------------------------

/// Buffered message decoder for streaming data.
///
/// When a chunk holds complete frames followed by a malformed one, the
/// frames before it are returned and the error is held back until
/// [`Decoder::take_error`] or the next [`Decoder::decode`] call.
pub struct Decoder {
    buf: Vec<u8>,
    deferred: Option<ProtocolError>,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(64 * 1024),
            deferred: None,
        }
    }

    /// Framing error held back from an earlier chunk, if any.
    pub fn take_error(&mut self) -> Option<ProtocolError> {
        self.deferred.take()
    }

    /// Feed data and extract complete messages.
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<RawMessage>, ProtocolError> {
        if let Some(e) = self.deferred.take() {
            return Err(e);
        }
        self.buf.extend_from_slice(data);
        let mut messages = Vec::new();
        match self.extract(&mut messages) {
            Ok(()) => Ok(messages),
            Err(e) if messages.is_empty() => Err(e),
            Err(e) => {
                self.deferred = Some(e);
                Ok(messages)
            }
        }
    }

    fn extract(&mut self, messages: &mut Vec<RawMessage>) -> Result<(), ProtocolError> {
        let mut offset = 0;

        while offset + HEADER_SIZE <= self.buf.len() {
            let length = match read_u32_at(&self.buf, offset) {
                Some(v) => v as usize,
                None => break,
            };

            if length > MAX_MESSAGE_SIZE {
                self.buf.clear();
                return Err(ProtocolError::MessageTooLarge(length));
            }
            if length < MIN_BODY_SIZE {
                self.buf.clear();
                return Err(ProtocolError::MessageTooSmall(length));
            }

            let total = HEADER_SIZE + length;
            if offset + total > self.buf.len() {
                break;
            }

            let body = self
                .buf
                .get(offset + HEADER_SIZE..offset + total)
                .unwrap_or_default();
            match decode_body(body) {
                Ok(msg) => messages.push(msg),
                Err(e) => {
                    self.buf.clear();
                    return Err(e);
                }
            }
            offset += total;
        }

        // Compact: remove consumed bytes once at the end
        if offset > 0 {
            self.buf.drain(..offset);
        }

        Ok(())
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
