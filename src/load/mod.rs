//! Load generation: concurrent bursts and closed-loop paced rates.

pub mod burst;
pub mod pid;
pub mod rate;

use thiserror::Error;

pub use burst::{BurstResult, BurstRunner};
pub use pid::{PidController, PidGains};
pub use rate::{RateController, RateResult};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("burst size must be at least 1")]
    InvalidBurstSize,

    #[error("requested rate {0} is not a positive finite number")]
    InvalidRate(f64),

    #[error("test duration must be non-zero")]
    InvalidDuration,
}

/// `max(0, 1 - successes/total)`, clamped to `[0, 1]`.
///
/// A zero total reports 0: nothing was dispatched, so nothing failed.
pub fn failure_rate(successes: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (1.0 - successes as f64 / total as f64).clamp(0.0, 1.0)
}
