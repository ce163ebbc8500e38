//! Validator client-event subscriber.
//!
//! Subscribes to block-commit and (filtered) state-delta events, dispatches
//! every pushed event batch to an [`EventSink`], and unsubscribes when the
//! shutdown token fires.
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), events_subscriber::Error> {
//! use events_subscriber::{LogSink, SubscriberConfig, filter};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = SubscriberConfig {
//!     filters: vec![filter::namespace_filter(filter::DEFAULT_NAMESPACE_PREFIX)],
//!     ..Default::default()
//! };
//! let shutdown = CancellationToken::new();
//! let outcome = events_subscriber::listen(config, &mut LogSink::default(), &shutdown).await?;
//! println!("received {} events", outcome.stats.events);
//! # Ok(())
//! # }
//! ```

pub mod filter;
mod session;
mod sink;
mod types;

pub use events_proto::{Event, EventFilter, MatchMode};
pub use session::{Session, SessionOutcome, SessionState, StreamStats, subscribe_request};
pub use sink::{EventSink, LogSink};
pub use types::{DEFAULT_RESPONSE_TIMEOUT, DEFAULT_VALIDATOR_URL, Error, SubscriberConfig};

use events_transport::{Connection, Endpoint};
use tokio_util::sync::CancellationToken;

/// Connect to the configured validator and run one subscription session.
///
/// Returns once `shutdown` fires and the unsubscribe handshake has been
/// attempted, or as soon as any phase fails.
pub async fn listen<S: EventSink>(
    config: SubscriberConfig,
    sink: &mut S,
    shutdown: &CancellationToken,
) -> Result<SessionOutcome, Error> {
    let endpoint = Endpoint::parse(&config.endpoint)?;
    tracing::info!(%endpoint, "Connecting to validator");
    let connection = tokio::time::timeout(config.response_timeout, Connection::connect(&endpoint))
        .await
        .map_err(|_| Error::Timeout("connection"))??;
    Session::new(connection, config).run(sink, shutdown).await
}
