pub mod clock;
pub mod filter;
pub mod frame;
pub mod measurement;
pub mod ticks;

pub use clock::{Clock, ManualClock, WallClock};
pub use filter::{DownsamplingMethod, MajorityFilter, MeanFilter, MeasurementFilter};
pub use frame::{Frame, MergeOutcome, PublishedFrame};
pub use measurement::{Measurement, MeasurementFlags, MeasurementKey};
pub use ticks::Ticks;
