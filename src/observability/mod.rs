pub mod events;
pub mod metrics;
pub mod monitor;

pub use events::{ChannelEvents, ConcentratorEvent, ConcentratorEvents, NoopEvents, TracingEvents};
pub use metrics::{ConcentratorMetrics, MetricsSnapshot};
pub use monitor::StatusReport;
