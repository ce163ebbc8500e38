use std::fmt;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::Parser;
use events_subscriber::filter::{self, FilterSpec};
use events_subscriber::{DEFAULT_VALIDATOR_URL, Error, LogSink, SubscriberConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::fmt::time::FormatTime;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        write!(
            w,
            "[{:02}:{:02}:{:03}]",
            total_secs / 60,
            total_secs % 60,
            d.subsec_millis()
        )
    }
}

/// Listen to validator state-delta events until interrupted.
#[derive(Parser)]
#[command(name = "events-subscriber", version)]
struct Cli {
    /// Validator endpoint
    #[arg(long, env = "VALIDATOR_URL", default_value = DEFAULT_VALIDATOR_URL)]
    url: String,

    /// State-delta filter, repeatable (default: the application's address namespace)
    #[arg(long = "filter", value_name = "KEY:MODE:PATTERN")]
    filters: Vec<FilterSpec>,

    /// Receive every state-delta event, without filters
    #[arg(long, conflicts_with = "filters")]
    all: bool,

    /// Block id already processed, repeatable; events after it are replayed
    #[arg(long = "last-block", value_name = "BLOCK_ID")]
    last_known_block_ids: Vec<String>,

    /// Seconds to wait for each validator response
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    response_timeout_secs: u64,

    /// Give up if no event batch arrives for this many seconds
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    idle_timeout_secs: Option<u64>,
}

impl Cli {
    fn into_config(self) -> Result<SubscriberConfig, Error> {
        let filters = if self.all {
            Vec::new()
        } else if self.filters.is_empty() {
            vec![filter::namespace_filter(filter::DEFAULT_NAMESPACE_PREFIX)]
        } else {
            filter::build_filters(self.filters)?
        };
        Ok(SubscriberConfig {
            endpoint: self.url,
            filters,
            last_known_block_ids: self.last_known_block_ids,
            response_timeout: Duration::from_secs(self.response_timeout_secs),
            idle_timeout: self.idle_timeout_secs.map(Duration::from_secs),
        })
    }
}

fn fail(e: &Error) -> ExitCode {
    eprintln!("error: {e}");
    ExitCode::from(e.exit_code())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .init();

    let config = match Cli::parse().into_config() {
        Ok(config) => config,
        Err(e) => return fail(&e),
    };

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupted, unsubscribing");
                shutdown.cancel();
            }
        }
    });

    let mut sink = LogSink::default();
    match events_subscriber::listen(config, &mut sink, &shutdown).await {
        Ok(outcome) => {
            tracing::info!(
                batches = outcome.stats.batches,
                events = outcome.stats.events,
                "Session finished"
            );
            match outcome.teardown {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => fail(&e),
            }
        }
        Err(e) => fail(&e),
    }
}
