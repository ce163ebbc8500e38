//! Payload schema for client event messages and MessagePack encode/decode.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::ProtocolError;

/// Well-known event types published by the validator.
pub mod event_type {
    pub const BLOCK_COMMIT: &str = "sawtooth/block-commit";
    pub const STATE_DELTA: &str = "sawtooth/state-delta";
}

/// How an [`EventFilter`] matches an event attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchMode {
    /// Exact match against any attribute with the key.
    #[default]
    SimpleAny,
    /// Exact match against every attribute with the key.
    SimpleAll,
    RegexAny,
    RegexAll,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EventFilter {
    pub key: String,
    pub match_string: String,
    pub filter_type: MatchMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EventSubscription {
    pub event_type: String,
    pub filters: Vec<EventFilter>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscribeRequest {
    pub subscriptions: Vec<EventSubscription>,
    /// Block ids the client already has; the validator replays from there.
    pub last_known_block_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscribeStatus {
    #[default]
    StatusUnset,
    Ok,
    InvalidFilter,
    UnknownBlock,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscribeResponse {
    pub status: SubscribeStatus,
    pub response_message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UnsubscribeRequest {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnsubscribeStatus {
    #[default]
    StatusUnset,
    Ok,
    InternalError,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UnsubscribeResponse {
    pub status: UnsubscribeStatus,
}

/// A single published event.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Event {
    pub event_type: String,
    pub attributes: BTreeMap<String, String>,
    pub data: Bytes,
}

/// A batch of events pushed in one `client_events` message.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EventList {
    pub events: Vec<Event>,
}

pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    rmp_serde::to_vec_named(value).map_err(|e| ProtocolError::Encode(e.to_string()))
}

pub fn decode_payload<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    rmp_serde::from_slice(data).map_err(|e| ProtocolError::InvalidPayload(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_request_keeps_subscription_order() {
        let req = SubscribeRequest {
            subscriptions: vec![
                EventSubscription {
                    event_type: event_type::BLOCK_COMMIT.to_string(),
                    filters: vec![],
                },
                EventSubscription {
                    event_type: event_type::STATE_DELTA.to_string(),
                    filters: vec![EventFilter {
                        key: "address".to_string(),
                        match_string: "ce2292.*".to_string(),
                        filter_type: MatchMode::RegexAny,
                    }],
                },
            ],
            last_known_block_ids: vec![],
        };
        let bytes = encode_payload(&req).unwrap();
        let parsed: SubscribeRequest = decode_payload(&bytes).unwrap();
        assert_eq!(parsed, req);
        assert_eq!(parsed.subscriptions[0].event_type, "sawtooth/block-commit");
        assert_eq!(parsed.subscriptions[1].filters[0].filter_type, MatchMode::RegexAny);
    }

    #[test]
    fn event_list_preserves_binary_data() {
        let list = EventList {
            events: vec![Event {
                event_type: event_type::STATE_DELTA.to_string(),
                attributes: BTreeMap::from([("address".to_string(), "ce2292ab".to_string())]),
                data: Bytes::from_static(&[0x00, 0xFF, 0x10]),
            }],
        };
        let parsed: EventList = decode_payload(&encode_payload(&list).unwrap()).unwrap();
        assert_eq!(parsed.events[0].data, Bytes::from_static(&[0x00, 0xFF, 0x10]));
        assert_eq!(parsed.events[0].attributes["address"], "ce2292ab");
    }

    #[test]
    fn missing_status_defaults_to_unset() {
        let empty = encode_payload(&UnsubscribeRequest {}).unwrap();
        let resp: SubscribeResponse = decode_payload(&empty).unwrap();
        assert_eq!(resp.status, SubscribeStatus::StatusUnset);
        assert!(resp.response_message.is_empty());
    }

    #[test]
    fn garbage_is_invalid_payload() {
        let err = decode_payload::<EventList>(&[0xC1, 0xC1, 0xC1]).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload(_)));
    }
}
