use std::time::Duration;

/// Reasons a [`RateLimiterConfig`](crate::RateLimiterConfig), or a limiter
/// from it, cannot be built.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("rate limiter name must not be empty")]
    EmptyName,

    #[error("limit_for_period must be greater than 0")]
    ZeroLimitForPeriod,

    #[error("limit_refresh_period must be at least 1ns")]
    RefreshPeriodTooShort,

    /// The duration does not fit in a signed 64 bit nanosecond count.
    #[error("{0} is too large")]
    DurationTooLarge(&'static str),

    #[error("permit_capacity ({permit_capacity}) must not be lower than limit_for_period ({limit_for_period})")]
    CapacityBelowLimit {
        permit_capacity: u32,
        limit_for_period: u32,
    },

    #[error("initial_permits ({initial_permits}) must not exceed permit_capacity ({permit_capacity})")]
    InitialPermitsAboveCapacity {
        initial_permits: u32,
        permit_capacity: u32,
    },

    /// The continuous refill variant needs at least one nanosecond per permit.
    #[error("{limit_for_period} permits per {limit_refresh_period:?} leads to zero nanos per permit")]
    ZeroNanosPerPermit {
        limit_for_period: u32,
        limit_refresh_period: Duration,
    },

    #[error("no configuration named '{0}'")]
    UnknownConfiguration(String),

    #[error("could not start the refresh thread of RateLimiter '{name}': {reason}")]
    RefresherSpawn { name: String, reason: String },
}

/// Errors surfaced by rate limiter operations.
///
/// Timeouts and contention are not errors: `acquire_permission` reports them
/// as `false` and `reserve_permission` as `-1`. These variants are produced by
/// the decorators and by variants that cannot honour an operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimiterError {
    /// Permits could not be obtained within the timeout.
    #[error("RateLimiter '{name}' does not permit further calls")]
    RequestNotPermitted { name: String },

    /// The calling thread was interrupted while waiting for permits.
    ///
    /// The thread's interrupt flag is still set when this is returned.
    #[error("thread was interrupted while waiting for a permission from RateLimiter '{name}'")]
    Cancelled { name: String },

    #[error("{operation} is not supported by this rate limiter")]
    Unsupported { operation: &'static str },
}
