//! Event consumers.

use events_proto::Event;

/// Receives decoded events one at a time, in arrival order.
///
/// Runs inline in the receive loop, so implementations must not block for
/// long. Failures are the sink's own concern.
pub trait EventSink {
    fn accept(&mut self, event: &Event);
}

impl<F> EventSink for F
where
    F: FnMut(&Event),
{
    fn accept(&mut self, event: &Event) {
        self(event)
    }
}

/// Emits every event as a `tracing` record.
#[derive(Debug, Default)]
pub struct LogSink {
    received: u64,
}

impl LogSink {
    pub fn received(&self) -> u64 {
        self.received
    }
}

impl EventSink for LogSink {
    fn accept(&mut self, event: &Event) {
        self.received += 1;
        tracing::info!(
            seq = self.received,
            event_type = %event.event_type,
            attributes = ?event.attributes,
            data_len = event.data.len(),
            "Event"
        );
    }
}
