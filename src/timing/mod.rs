pub mod distribution;
pub mod frame_rate_timer;
pub mod input_timer;
pub mod registry;
pub mod wait_handle;

pub use distribution::{frame_periods, subsecond_distribution};
pub use frame_rate_timer::{FrameRateTimer, TimerKey};
pub use input_timer::{InputTimer, TimerErrorHandler, MAX_MISSED_WINDOWS};
pub use registry::{InputTimerHandle, TimerRegistry, TimerSubscription};
pub use wait_handle::WaitHandle;
