#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use events_proto::payload::event_type;
use events_proto::{
    Event, EventFilter, EventList, EventSubscription, MSG_CLIENT_EVENTS,
    MSG_CLIENT_EVENTS_SUBSCRIBE_REQUEST, MSG_CLIENT_EVENTS_SUBSCRIBE_RESPONSE,
    MSG_CLIENT_EVENTS_UNSUBSCRIBE_REQUEST, MSG_CLIENT_EVENTS_UNSUBSCRIBE_RESPONSE, MatchMode,
    SubscribeRequest, SubscribeResponse, SubscribeStatus, UnsubscribeResponse, UnsubscribeStatus,
    decode_payload, encode_payload,
};
use events_subscriber::filter::{self, FilterSpec};
use events_subscriber::{Error, SessionOutcome, SubscriberConfig};
use events_transport::{Connection, Transport, TransportError};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

// ── mock validator ───────────────────────────────────────────────────

/// A validator stand-in accepting a single client connection.
struct MockValidator {
    listener: TcpListener,
    port: u16,
}

impl MockValidator {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        Self { listener, port }
    }

    fn endpoint(&self) -> String {
        format!("tcp://127.0.0.1:{}", self.port)
    }

    /// Accept the client and hand the connection to `script` on a background task.
    fn serve<F, Fut>(self, script: F) -> JoinHandle<()>
    where
        F: FnOnce(Connection<TcpStream>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            let (stream, _) = self.listener.accept().await.unwrap();
            script(Connection::from_stream(stream)).await;
        })
    }
}

/// Read the subscribe request and answer it with `status`.
async fn answer_subscribe(
    conn: &mut Connection<TcpStream>,
    status: SubscribeStatus,
    message: &str,
) -> SubscribeRequest {
    let msg = conn.recv().await.unwrap();
    assert_eq!(msg.msg_type, MSG_CLIENT_EVENTS_SUBSCRIBE_REQUEST);
    assert!(msg.correlation_id.is_some());

    let resp = SubscribeResponse {
        status,
        response_message: message.to_string(),
    };
    conn.send(
        MSG_CLIENT_EVENTS_SUBSCRIBE_RESPONSE,
        msg.correlation_id,
        &encode_payload(&resp).unwrap(),
    )
    .await
    .unwrap();
    decode_payload(&msg.payload).unwrap()
}

/// Read the unsubscribe request and answer it with `status`.
async fn answer_unsubscribe(conn: &mut Connection<TcpStream>, status: UnsubscribeStatus) {
    let msg = conn.recv().await.unwrap();
    assert_eq!(msg.msg_type, MSG_CLIENT_EVENTS_UNSUBSCRIBE_REQUEST);
    conn.send(
        MSG_CLIENT_EVENTS_UNSUBSCRIBE_RESPONSE,
        msg.correlation_id,
        &encode_payload(&UnsubscribeResponse { status }).unwrap(),
    )
    .await
    .unwrap();
}

async fn push_batch(conn: &mut Connection<TcpStream>, events: Vec<Event>) {
    let payload = encode_payload(&EventList { events }).unwrap();
    conn.send_unsolicited(MSG_CLIENT_EVENTS, &payload)
        .await
        .unwrap();
}

/// Wait until the client releases the connection.
async fn expect_closed(conn: &mut Connection<TcpStream>) {
    let err = conn.recv().await.unwrap_err();
    assert!(matches!(err, TransportError::Closed), "got {err:?}");
}

fn state_delta(address: &str, data: &'static [u8]) -> Event {
    Event {
        event_type: event_type::STATE_DELTA.to_string(),
        attributes: BTreeMap::from([("address".to_string(), address.to_string())]),
        data: Bytes::from_static(data),
    }
}

fn block_commit(block_num: &str) -> Event {
    Event {
        event_type: event_type::BLOCK_COMMIT.to_string(),
        attributes: BTreeMap::from([("block_num".to_string(), block_num.to_string())]),
        data: Bytes::new(),
    }
}

fn config(endpoint: String, filters: Vec<EventFilter>) -> SubscriberConfig {
    SubscriberConfig {
        endpoint,
        filters,
        response_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

/// Run a session, cancelling it after `stop_after` events have been received.
async fn listen_until(
    config: SubscriberConfig,
    stop_after: usize,
) -> (Result<SessionOutcome, Error>, Vec<Event>) {
    let shutdown = CancellationToken::new();
    let mut received = Vec::new();
    let mut sink = |e: &Event| {
        received.push(e.clone());
        if received.len() >= stop_after {
            shutdown.cancel();
        }
    };
    let result = tokio::time::timeout(
        TEST_TIMEOUT,
        events_subscriber::listen(config, &mut sink, &shutdown),
    )
    .await
    .expect("session hung");
    (result, received)
}

// ── happy path ───────────────────────────────────────────────────────

#[tokio::test]
async fn state_delta_event_reaches_sink() {
    let validator = MockValidator::start().await;
    let endpoint = validator.endpoint();
    let event = state_delta("ce2292ab", b"x");

    let expected_event = event.clone();
    let server = validator.serve(|mut conn| async move {
        let req = answer_subscribe(&mut conn, SubscribeStatus::Ok, "").await;
        assert_eq!(
            req.subscriptions,
            vec![
                EventSubscription {
                    event_type: "sawtooth/block-commit".to_string(),
                    filters: vec![],
                },
                EventSubscription {
                    event_type: "sawtooth/state-delta".to_string(),
                    filters: vec![EventFilter {
                        key: "address".to_string(),
                        match_string: "ce2292.*".to_string(),
                        filter_type: MatchMode::RegexAny,
                    }],
                },
            ]
        );
        push_batch(&mut conn, vec![expected_event]).await;
        answer_unsubscribe(&mut conn, UnsubscribeStatus::Ok).await;
        expect_closed(&mut conn).await;
    });

    let filters =
        filter::build_filters([FilterSpec::new("address", "ce2292.*", MatchMode::RegexAny)])
            .unwrap();
    let (result, received) = listen_until(config(endpoint, filters), 1).await;

    let outcome = result.unwrap();
    assert_eq!(received, vec![event]);
    assert_eq!(outcome.stats.batches, 1);
    assert_eq!(outcome.stats.events, 1);
    assert!(outcome.teardown.is_ok());
    server.await.unwrap();
}

#[tokio::test]
async fn batches_are_dispatched_in_wire_order() {
    let validator = MockValidator::start().await;
    let endpoint = validator.endpoint();
    let batches = vec![
        vec![block_commit("1"), state_delta("ce229201", b"a")],
        vec![state_delta("ce229202", b"b"), state_delta("ce229203", b"c")],
        vec![block_commit("2")],
    ];
    let expected: Vec<Event> = batches.iter().flatten().cloned().collect();

    let server = validator.serve(|mut conn| async move {
        answer_subscribe(&mut conn, SubscribeStatus::Ok, "").await;
        for batch in batches {
            push_batch(&mut conn, batch).await;
        }
        answer_unsubscribe(&mut conn, UnsubscribeStatus::Ok).await;
        expect_closed(&mut conn).await;
    });

    let filters = vec![filter::namespace_filter(filter::DEFAULT_NAMESPACE_PREFIX)];
    let (result, received) = listen_until(config(endpoint, filters), expected.len()).await;

    let outcome = result.unwrap();
    assert_eq!(received, expected);
    assert_eq!(outcome.stats.batches, 3);
    server.await.unwrap();
}

#[tokio::test]
async fn unfiltered_subscription_sends_no_filters() {
    let validator = MockValidator::start().await;
    let endpoint = validator.endpoint();

    let server = validator.serve(|mut conn| async move {
        let req = answer_subscribe(&mut conn, SubscribeStatus::Ok, "").await;
        assert_eq!(req.subscriptions.len(), 2);
        assert!(req.subscriptions.iter().all(|s| s.filters.is_empty()));
        assert_eq!(req.last_known_block_ids, vec!["b1".to_string()]);
        push_batch(&mut conn, vec![block_commit("9")]).await;
        answer_unsubscribe(&mut conn, UnsubscribeStatus::Ok).await;
    });

    let mut cfg = config(endpoint, vec![]);
    cfg.last_known_block_ids = vec!["b1".to_string()];
    let (result, received) = listen_until(cfg, 1).await;

    assert!(result.unwrap().teardown.is_ok());
    assert_eq!(received, vec![block_commit("9")]);
    server.await.unwrap();
}

// ── failures ─────────────────────────────────────────────────────────

#[tokio::test]
async fn rejected_subscription_is_an_error() {
    let validator = MockValidator::start().await;
    let endpoint = validator.endpoint();

    let server = validator.serve(|mut conn| async move {
        answer_subscribe(&mut conn, SubscribeStatus::InvalidFilter, "bad regex").await;
        expect_closed(&mut conn).await;
    });

    let (result, received) = listen_until(config(endpoint, vec![]), 1).await;

    match result {
        Err(Error::RejectedSubscription { status, message }) => {
            assert_eq!(status, SubscribeStatus::InvalidFilter);
            assert_eq!(message, "bad regex");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    assert!(received.is_empty());
    server.await.unwrap();
}

#[tokio::test]
async fn unexpected_message_type_is_protocol_violation() {
    let validator = MockValidator::start().await;
    let endpoint = validator.endpoint();

    let server = validator.serve(|mut conn| async move {
        answer_subscribe(&mut conn, SubscribeStatus::Ok, "").await;
        push_batch(&mut conn, vec![state_delta("ce2292ab", b"x")]).await;
        // A well-formed batch under the wrong message type
        let payload = encode_payload(&EventList {
            events: vec![state_delta("ce2292cd", b"y")],
        })
        .unwrap();
        conn.send_unsolicited(MSG_CLIENT_EVENTS_SUBSCRIBE_RESPONSE, &payload)
            .await
            .unwrap();
        expect_closed(&mut conn).await;
    });

    let (result, received) = listen_until(config(endpoint, vec![]), usize::MAX).await;

    assert!(matches!(
        result,
        Err(Error::ProtocolViolation {
            expected: MSG_CLIENT_EVENTS,
            actual: MSG_CLIENT_EVENTS_SUBSCRIBE_RESPONSE,
        })
    ));
    assert_eq!(received, vec![state_delta("ce2292ab", b"x")]);
    server.await.unwrap();
}

#[tokio::test]
async fn validator_disconnect_ends_session() {
    let validator = MockValidator::start().await;
    let endpoint = validator.endpoint();

    let server = validator.serve(|mut conn| async move {
        answer_subscribe(&mut conn, SubscribeStatus::Ok, "").await;
        push_batch(&mut conn, vec![block_commit("1")]).await;
        conn.close().await.unwrap();
    });

    let (result, received) = listen_until(config(endpoint, vec![]), usize::MAX).await;

    let err = result.unwrap_err();
    assert!(matches!(err, Error::Transport(TransportError::Closed)));
    assert_eq!(err.exit_code(), 2);
    assert_eq!(received.len(), 1);
    server.await.unwrap();
}

#[tokio::test]
async fn rejected_unsubscribe_is_reported_with_outcome() {
    let validator = MockValidator::start().await;
    let endpoint = validator.endpoint();

    let server = validator.serve(|mut conn| async move {
        answer_subscribe(&mut conn, SubscribeStatus::Ok, "").await;
        push_batch(&mut conn, vec![state_delta("ce2292ab", b"x")]).await;
        answer_unsubscribe(&mut conn, UnsubscribeStatus::InternalError).await;
        expect_closed(&mut conn).await;
    });

    let (result, received) = listen_until(config(endpoint, vec![]), 1).await;

    let outcome = result.unwrap();
    assert_eq!(outcome.stats.events, 1);
    assert!(matches!(
        outcome.teardown,
        Err(Error::RejectedUnsubscription {
            status: UnsubscribeStatus::InternalError
        })
    ));
    assert_eq!(received.len(), 1);
    server.await.unwrap();
}

#[tokio::test]
async fn unreachable_validator_is_transport_error() {
    // Grab a free port, then release it so nothing is listening
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let (result, _) = listen_until(config(format!("tcp://127.0.0.1:{port}"), vec![]), 1).await;
    assert!(matches!(
        result,
        Err(Error::Transport(TransportError::Io(_)))
    ));
}

#[tokio::test]
async fn malformed_endpoint_is_rejected_before_connecting() {
    let (result, _) = listen_until(config("localhost".to_string(), vec![]), 1).await;
    assert!(matches!(
        result,
        Err(Error::Transport(TransportError::InvalidEndpoint(_)))
    ));
}
