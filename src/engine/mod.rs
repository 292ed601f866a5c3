pub mod concentrator;
pub mod config;
pub mod frame_queue;
pub mod latest;
pub mod publisher;
pub mod state;

pub use concentrator::{Concentrator, ConcentratorBuilder, DiscardedMeasurement};
pub use config::{ConcentratorConfig, ConfigError, Settings};
pub use frame_queue::{FrameAlignment, FrameQueue, FrameTemplate};
pub use latest::LatestMeasurements;
pub use publisher::{ChannelPublisher, FramePublisher};
pub use state::ConcentratorState;
