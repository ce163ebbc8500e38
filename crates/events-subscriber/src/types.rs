use std::time::Duration;

use events_proto::{EventFilter, ProtocolError, SubscribeStatus, UnsubscribeStatus};
use events_transport::TransportError;

use crate::session::SessionState;

/// Validator address used when none is configured.
pub const DEFAULT_VALIDATOR_URL: &str = "tcp://localhost:4004";

/// How long to wait for the validator to answer a request.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for a subscription session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberConfig {
    /// Validator endpoint, `tcp://host:port`.
    pub endpoint: String,
    /// Filters for the state-delta subscription. Empty means every state-delta event.
    pub filters: Vec<EventFilter>,
    /// Block ids already seen; the validator replays events committed after them.
    pub last_known_block_ids: Vec<String>,
    /// Upper bound on each request/response exchange (and on connecting).
    pub response_timeout: Duration,
    /// Fail the stream if no message arrives for this long. `None` waits forever.
    pub idle_timeout: Option<Duration>,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_VALIDATOR_URL.to_string(),
            filters: Vec::new(),
            last_known_block_ids: Vec::new(),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            idle_timeout: None,
        }
    }
}

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("unexpected message type {actual}, expected {expected}")]
    ProtocolViolation { expected: u16, actual: u16 },

    #[error("malformed {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: ProtocolError,
    },

    #[error("encode error: {0}")]
    Encode(ProtocolError),

    #[error("subscription rejected: {status:?} {message}")]
    RejectedSubscription {
        status: SubscribeStatus,
        message: String,
    },

    #[error("unsubscribe rejected: {status:?}")]
    RejectedUnsubscription { status: UnsubscribeStatus },

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("session is {actual}, expected {expected}")]
    InvalidState {
        expected: SessionState,
        actual: SessionState,
    },
}

impl Error {
    /// Process exit code for this failure kind.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Transport(_) => 2,
            Self::Timeout(_) => 3,
            Self::ProtocolViolation { .. } => 4,
            Self::Decode { .. } | Self::Encode(_) => 5,
            Self::RejectedSubscription { .. } => 6,
            Self::RejectedUnsubscription { .. } => 7,
            Self::InvalidFilter(_) => 64,
            Self::InvalidState { .. } => 70,
        }
    }

    /// Whether the validator answered but refused the request.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::RejectedSubscription { .. } | Self::RejectedUnsubscription { .. }
        )
    }
}
