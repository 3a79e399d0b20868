//! Lifecycle notifications
//!
//! Events go to broadcast subscribers and to an optional telemetry sink.
//! Neither path can block or fail the capture pipeline.

use super::state::RecorderEvent;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Receiver of fire-and-forget lifecycle notifications
///
/// Implementations must return quickly; hand work off to another task if
/// recording the event involves I/O.
pub trait TelemetrySink: Send + Sync + 'static {
    fn record(&self, event: &RecorderEvent);
}

/// Sink that mirrors events into the tracing log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn record(&self, event: &RecorderEvent) {
        tracing::info!(target: "replay_buffer::telemetry", ?event, "lifecycle event");
    }
}

/// Fan-out of recorder events
#[derive(Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<RecorderEvent>,
    sink: Option<Arc<dyn TelemetrySink>>,
}

impl EventPublisher {
    pub fn new(capacity: usize, sink: Option<Arc<dyn TelemetrySink>>) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, sink }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecorderEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: RecorderEvent) {
        if let Some(sink) = &self.sink {
            sink.record(&event);
        }
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}
