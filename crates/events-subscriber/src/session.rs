//! Subscription session: subscribe handshake, event stream, unsubscribe.
//!
//! ```text
//! Init ─▶ Subscribing ─▶ Streaming ─▶ Unsubscribing ─▶ Done
//!              │             │               │
//!              └─────────────┴───────────────┴──▶ Failed
//! ```
//!
//! Only one request is ever outstanding. The stream leaves `Streaming`
//! through an error (straight to `Failed`, no teardown) or the shutdown
//! token (graceful unsubscribe).

use std::fmt;

use events_proto::payload::event_type;
use events_proto::{
    CorrelationId, EventFilter, EventList, EventSubscription, MSG_CLIENT_EVENTS,
    MSG_CLIENT_EVENTS_SUBSCRIBE_REQUEST, MSG_CLIENT_EVENTS_SUBSCRIBE_RESPONSE,
    MSG_CLIENT_EVENTS_UNSUBSCRIBE_REQUEST, MSG_CLIENT_EVENTS_UNSUBSCRIBE_RESPONSE, RawMessage,
    SubscribeRequest, SubscribeResponse, SubscribeStatus, UnsubscribeRequest,
    UnsubscribeResponse, UnsubscribeStatus, decode_payload, encode_payload,
};
use events_transport::Transport;
use tokio_util::sync::CancellationToken;

use crate::sink::EventSink;
use crate::types::{Error, SubscriberConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Subscribing,
    Streaming,
    Unsubscribing,
    Done,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Subscribing => "subscribing",
            Self::Streaming => "streaming",
            Self::Unsubscribing => "unsubscribing",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Counters for the streaming phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub batches: u64,
    pub events: u64,
}

/// Result of a session that streamed until shutdown.
///
/// `teardown` is the unsubscribe result, reported next to the stream
/// statistics rather than replacing them.
#[derive(Debug)]
pub struct SessionOutcome {
    pub stats: StreamStats,
    pub teardown: Result<(), Error>,
}

/// Build the subscribe request: block commits unfiltered, state deltas
/// filtered by `filters`.
pub fn subscribe_request(
    filters: &[EventFilter],
    last_known_block_ids: &[String],
) -> SubscribeRequest {
    SubscribeRequest {
        subscriptions: vec![
            EventSubscription {
                event_type: event_type::BLOCK_COMMIT.to_string(),
                filters: Vec::new(),
            },
            EventSubscription {
                event_type: event_type::STATE_DELTA.to_string(),
                filters: filters.to_vec(),
            },
        ],
        last_known_block_ids: last_known_block_ids.to_vec(),
    }
}

/// One subscription over one transport.
pub struct Session<T> {
    transport: T,
    config: SubscriberConfig,
    state: SessionState,
    stats: StreamStats,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, config: SubscriberConfig) -> Self {
        Self {
            transport,
            config,
            state: SessionState::Init,
            stats: StreamStats::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    fn expect_state(&self, expected: SessionState) -> Result<(), Error> {
        if self.state != expected {
            return Err(Error::InvalidState {
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }

    /// Run the whole lifecycle: subscribe, stream until `shutdown`, unsubscribe.
    ///
    /// The transport is closed on every exit path.
    pub async fn run<S: EventSink>(
        mut self,
        sink: &mut S,
        shutdown: &CancellationToken,
    ) -> Result<SessionOutcome, Error> {
        let result = self.run_phases(sink, shutdown).await;
        if let Err(e) = self.transport.close().await {
            tracing::debug!(error = %e, "Failed to close connection");
        }
        result
    }

    async fn run_phases<S: EventSink>(
        &mut self,
        sink: &mut S,
        shutdown: &CancellationToken,
    ) -> Result<SessionOutcome, Error> {
        self.subscribe().await?;
        let stats = self.stream(sink, shutdown).await?;
        let teardown = self.unsubscribe().await;
        if let Err(e) = &teardown {
            tracing::warn!(error = %e, "Unsubscribe failed");
        }
        Ok(SessionOutcome { stats, teardown })
    }

    /// Send the subscribe request and wait for an OK response.
    pub async fn subscribe(&mut self) -> Result<(), Error> {
        self.expect_state(SessionState::Init)?;
        self.state = SessionState::Subscribing;
        match self.try_subscribe().await {
            Ok(()) => {
                self.state = SessionState::Streaming;
                tracing::info!(filters = self.config.filters.len(), "Subscribed to events");
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Failed;
                Err(e)
            }
        }
    }

    async fn try_subscribe(&mut self) -> Result<(), Error> {
        let request = subscribe_request(&self.config.filters, &self.config.last_known_block_ids);
        let payload = encode_payload(&request).map_err(Error::Encode)?;
        let id = self
            .transport
            .send(MSG_CLIENT_EVENTS_SUBSCRIBE_REQUEST, None, &payload)
            .await?;

        let reply = self
            .await_reply(&id, MSG_CLIENT_EVENTS_SUBSCRIBE_RESPONSE, "subscribe response")
            .await?;
        let response: SubscribeResponse =
            decode_payload(&reply.payload).map_err(|source| Error::Decode {
                what: "subscribe response",
                source,
            })?;
        if response.status != SubscribeStatus::Ok {
            return Err(Error::RejectedSubscription {
                status: response.status,
                message: response.response_message,
            });
        }
        Ok(())
    }

    /// Wait for the response to request `id` and check its type.
    async fn await_reply(
        &mut self,
        id: &CorrelationId,
        expected: u16,
        what: &'static str,
    ) -> Result<RawMessage, Error> {
        let reply = tokio::time::timeout(
            self.config.response_timeout,
            self.transport.recv_correlated(id),
        )
        .await
        .map_err(|_| Error::Timeout(what))??;
        if reply.msg_type != expected {
            return Err(Error::ProtocolViolation {
                expected,
                actual: reply.msg_type,
            });
        }
        Ok(reply)
    }

    /// Dispatch pushed event batches to `sink` until `shutdown` fires.
    ///
    /// Returns the stream statistics on shutdown; any error fails the session.
    pub async fn stream<S: EventSink>(
        &mut self,
        sink: &mut S,
        shutdown: &CancellationToken,
    ) -> Result<StreamStats, Error> {
        self.expect_state(SessionState::Streaming)?;
        tracing::info!("Listening to events");
        match self.stream_until_shutdown(sink, shutdown).await {
            Ok(()) => {
                tracing::info!(
                    batches = self.stats.batches,
                    events = self.stats.events,
                    "Shutdown requested"
                );
                Ok(self.stats)
            }
            Err(e) => {
                self.state = SessionState::Failed;
                Err(e)
            }
        }
    }

    async fn stream_until_shutdown<S: EventSink>(
        &mut self,
        sink: &mut S,
        shutdown: &CancellationToken,
    ) -> Result<(), Error> {
        loop {
            let msg = tokio::select! {
                biased;
                () = shutdown.cancelled() => return Ok(()),
                msg = self.next_message() => msg?,
            };
            self.dispatch(&msg, sink)?;
        }
    }

    async fn next_message(&mut self) -> Result<RawMessage, Error> {
        match self.config.idle_timeout {
            Some(limit) => tokio::time::timeout(limit, self.transport.recv())
                .await
                .map_err(|_| Error::Timeout("event batch"))?
                .map_err(Error::from),
            None => Ok(self.transport.recv().await?),
        }
    }

    fn dispatch<S: EventSink>(&mut self, msg: &RawMessage, sink: &mut S) -> Result<(), Error> {
        if msg.msg_type != MSG_CLIENT_EVENTS {
            return Err(Error::ProtocolViolation {
                expected: MSG_CLIENT_EVENTS,
                actual: msg.msg_type,
            });
        }
        let batch: EventList = decode_payload(&msg.payload).map_err(|source| Error::Decode {
            what: "event batch",
            source,
        })?;

        self.stats.batches += 1;
        tracing::debug!(events = batch.events.len(), "Received event batch");
        for event in &batch.events {
            sink.accept(event);
            self.stats.events += 1;
        }
        Ok(())
    }

    /// Send the unsubscribe request and wait for an OK response.
    ///
    /// Batches that arrive meanwhile are not dispatched.
    pub async fn unsubscribe(&mut self) -> Result<(), Error> {
        self.expect_state(SessionState::Streaming)?;
        self.state = SessionState::Unsubscribing;
        match self.try_unsubscribe().await {
            Ok(()) => {
                self.state = SessionState::Done;
                tracing::info!("Unsubscribed from events");
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Failed;
                Err(e)
            }
        }
    }

    async fn try_unsubscribe(&mut self) -> Result<(), Error> {
        let payload = encode_payload(&UnsubscribeRequest {}).map_err(Error::Encode)?;
        let id = self
            .transport
            .send(MSG_CLIENT_EVENTS_UNSUBSCRIBE_REQUEST, None, &payload)
            .await?;

        let reply = self
            .await_reply(
                &id,
                MSG_CLIENT_EVENTS_UNSUBSCRIBE_RESPONSE,
                "unsubscribe response",
            )
            .await?;
        let response: UnsubscribeResponse =
            decode_payload(&reply.payload).map_err(|source| Error::Decode {
                what: "unsubscribe response",
                source,
            })?;
        if response.status != UnsubscribeStatus::Ok {
            return Err(Error::RejectedUnsubscription {
                status: response.status,
            });
        }
        Ok(())
    }
}
