use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{info, warn};

use crate::core::Measurement;

/// Notifications raised by a concentrator
///
/// Every method has a no-op default so sinks only implement what they care about. Calls
/// happen on sorting threads and the publication thread, so implementations must not block.
pub trait ConcentratorEvents: Send + Sync {
    /// Whole seconds of data queued beyond the second currently publishing
    fn unpublished_samples(&self, _seconds: usize) {}

    fn process_exception(&self, _error: &anyhow::Error) {}

    /// Measurements dropped during one sort call
    fn discarding_measurements(&self, _measurements: &[Measurement]) {}

    fn disposed(&self) {}
}

/// Ignores every notification
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEvents;

impl ConcentratorEvents for NoopEvents {}

/// Default sink: logs notifications through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEvents;

impl ConcentratorEvents for TracingEvents {
    fn unpublished_samples(&self, seconds: usize) {
        if seconds > 0 {
            warn!(seconds, "concentrator has unpublished seconds of data queued");
        }
    }

    fn process_exception(&self, error: &anyhow::Error) {
        warn!(error = %error, "concentrator processing exception");
    }

    fn discarding_measurements(&self, measurements: &[Measurement]) {
        if let Some(first) = measurements.first() {
            info!(count = measurements.len(), first = %first, "discarding measurements");
        }
    }

    fn disposed(&self) {
        info!("concentrator disposed");
    }
}

/// Owned form of a notification for channel delivery
#[derive(Debug, Clone, PartialEq)]
pub enum ConcentratorEvent {
    UnpublishedSamples(usize),
    ProcessException(String),
    DiscardingMeasurements(Vec<Measurement>),
    Disposed,
}

/// Forwards notifications into a crossbeam channel
#[derive(Debug, Clone)]
pub struct ChannelEvents {
    tx: Sender<ConcentratorEvent>,
}

impl ChannelEvents {
    pub fn new(tx: Sender<ConcentratorEvent>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, Receiver<ConcentratorEvent>) {
        let (tx, rx) = unbounded();
        (Self::new(tx), rx)
    }

    fn send(&self, event: ConcentratorEvent) {
        // Receiver gone means nobody is listening anymore
        let _ = self.tx.send(event);
    }
}

impl ConcentratorEvents for ChannelEvents {
    fn unpublished_samples(&self, seconds: usize) {
        self.send(ConcentratorEvent::UnpublishedSamples(seconds));
    }

    fn process_exception(&self, error: &anyhow::Error) {
        self.send(ConcentratorEvent::ProcessException(format!("{:#}", error)));
    }

    fn discarding_measurements(&self, measurements: &[Measurement]) {
        self.send(ConcentratorEvent::DiscardingMeasurements(measurements.to_vec()));
    }

    fn disposed(&self) {
        self.send(ConcentratorEvent::Disposed);
    }
}
