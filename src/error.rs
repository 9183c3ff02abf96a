//! Configuration errors surfaced at queue construction.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Clients must be marked idle before they can be erased.
    #[error("erase_age ({erase_age:?}) must be at least idle_age ({idle_age:?})")]
    EraseBeforeIdle {
        idle_age: Duration,
        erase_age: Duration,
    },

    /// The janitor has to run more often than clients go idle.
    #[error("idle_age ({idle_age:?}) must exceed check_time ({check_time:?})")]
    CheckSlowerThanIdle {
        idle_age: Duration,
        check_time: Duration,
    },

    #[error("system capacity must be a positive rate, got {0}")]
    NonPositiveCapacity(f64),

    #[error("window size must be a positive duration, got {0}")]
    NonPositiveWindow(f64),
}
