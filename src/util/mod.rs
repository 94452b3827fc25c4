//! Time and retry utilities shared by every request manager

pub mod backoff;
pub mod time;

pub use backoff::ExponentialBackoff;
pub use time::{Clock, MockClock, SystemClock, Timer};
