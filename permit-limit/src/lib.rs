//! # permit-limit
//!
//! `permit-limit` is an in-process rate limiter: given a budget of permits per
//! refresh period, it decides for any number of concurrent callers whether,
//! and for how long, a caller must wait before it may proceed.
//!
//! ## Core Philosophy
//!
//! The two precise limiters keep their whole budget in one immutable state
//! behind an atomic reference. A request computes the next state with a pure
//! function and publishes it with a Compare-And-Swap, so no two callers can
//! ever be handed the same permit and no lock sits in the hot path. Permits
//! that arrive in the future may be *reserved*: the budget goes negative and
//! the caller parks until its turn.
//!
//! ## Key Concepts
//!
//! * **Lazy Refresh**: permits are recalculated at the moment of the request
//!   from a monotonic clock anchored at construction. No timer threads.
//! * **Reservation**: `reserve_permission` never blocks; it returns how long
//!   the caller has to wait, which suits async callers scheduling their own
//!   wake-up.
//! * **Variants**: [`AtomicRateLimiter`] (fixed cycles), [`RefillRateLimiter`]
//!   (continuous refill with burst capacity) and [`SemaphoreRateLimiter`]
//!   (a counting semaphore topped up by a background thread).
//!
//! ## Example
//!
//! ```rust
//! use permit_limit::AtomicRateLimiter;
//! use permit_limit::RateLimiter;
//! use permit_limit::RateLimiterConfig;
//! use std::time::Duration;
//!
//! let config = RateLimiterConfig::builder()
//!     .limit_for_period(10)
//!     .limit_refresh_period(Duration::from_secs(1))
//!     .timeout_duration(Duration::ZERO)
//!     .build()
//!     .unwrap();
//! let limiter = AtomicRateLimiter::new("backend", config).unwrap();
//!
//! if limiter.acquire() {
//!     // Request allowed
//! }
//! ```

use std::collections::HashMap;
use std::fmt::Debug;
use std::time::Duration;

mod atomic;
mod config;
mod error;
mod event;
mod fixed_cycle;
pub mod interrupt;
mod refill;
mod registry;
mod semaphore;

pub use crate::atomic::AtomicLimiter;
pub use crate::atomic::CAS_BACKOFF;
pub use crate::atomic::DetailedMetrics;
pub use crate::atomic::NEVER;
pub use crate::atomic::NextState;
pub use crate::atomic::PermitState;
pub use crate::config::RateLimiterConfig;
pub use crate::config::RateLimiterConfigBuilder;
pub use crate::error::ConfigError;
pub use crate::error::RateLimiterError;
pub use crate::event::EventPublisher;
pub use crate::event::RateLimiterEvent;
pub use crate::event::RateLimiterEventKind;
pub use crate::fixed_cycle::AtomicRateLimiter;
pub use crate::fixed_cycle::FixedCycle;
pub use crate::fixed_cycle::FixedCycleState;
pub use crate::interrupt::InterruptHandle;
pub use crate::refill::Refill;
pub use crate::refill::RefillRateLimiter;
pub use crate::refill::RefillState;
pub use crate::registry::DEFAULT_CONFIG;
pub use crate::registry::RateLimiterRegistry;
pub use crate::registry::RateLimiterRegistryBuilder;
pub use crate::semaphore::SemaphoreRateLimiter;

/// Free-form labels attached to a limiter.
pub type Tags = HashMap<String, String>;

/// Point-in-time view of a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metrics {
    /// Permits a single-permit request would find. Negative when callers
    /// have reserved permits that have not been refreshed yet.
    pub available_permissions: i32,
    pub number_of_waiting_threads: u32,
}

/// Limiters that a [`RateLimiterRegistry`] can create on demand.
pub trait FromConfig: Sized {
    fn from_config(name: String, config: RateLimiterConfig, tags: Tags) -> Result<Self, ConfigError>;
}

/// The contract shared by every limiter variant.
///
/// Limiters are `Send` and `Sync` and are meant to be shared via `Arc`.
pub trait RateLimiter: Debug + Send + Sync {
    fn name(&self) -> &str;

    fn tags(&self) -> &Tags;

    /// The current config. Reconfiguration swaps in a new value, so the
    /// result is a snapshot.
    fn config(&self) -> RateLimiterConfig;

    fn event_publisher(&self) -> &EventPublisher;

    /// Never blocks and never changes the limiter's state.
    fn metrics(&self) -> Metrics;

    /// Acquire `permits`, blocking for up to `timeout`.
    ///
    /// Returns `false` when the permits cannot be had in time or the calling
    /// thread was interrupted while waiting. In the latter case the thread's
    /// interrupt flag stays set.
    fn acquire_permission_within(&self, permits: u32, timeout: Duration) -> bool;

    /// Reserve `permits` without blocking.
    ///
    /// Returns `Ok(0)` if they are available now, `Ok(n)` if they will be in
    /// `n` nanoseconds (the permits are already taken; the caller must wait
    /// `n` before proceeding), or `Ok(-1)` if the wait would exceed
    /// `timeout`, in which case nothing was reserved.
    ///
    /// # Errors
    ///
    /// [`RateLimiterError::Unsupported`] when the variant cannot reserve.
    fn reserve_permission_within(
        &self,
        permits: u32,
        timeout: Duration,
    ) -> Result<i64, RateLimiterError>;

    /// Consume every permit available right now.
    fn drain_permissions(&self);

    fn change_limit_for_period(&self, limit_for_period: u32) -> Result<(), ConfigError>;

    fn change_timeout_duration(&self, timeout_duration: Duration) -> Result<(), ConfigError>;

    /// Acquire `permits` within the configured timeout.
    fn acquire_permission(&self, permits: u32) -> bool {
        self.acquire_permission_within(permits, self.config().timeout_duration())
    }

    fn acquire(&self) -> bool {
        self.acquire_permission(1)
    }

    /// Reserve `permits` within the configured timeout.
    fn reserve_permission(&self, permits: u32) -> Result<i64, RateLimiterError> {
        self.reserve_permission_within(permits, self.config().timeout_duration())
    }

    fn reserve(&self) -> Result<i64, RateLimiterError> {
        self.reserve_permission(1)
    }

    /// Block until `permits` are granted.
    ///
    /// # Errors
    ///
    /// [`RateLimiterError::Cancelled`] if the thread was interrupted while
    /// waiting, [`RateLimiterError::RequestNotPermitted`] if the permits could
    /// not be had within the configured timeout.
    fn wait_for_permission(&self, permits: u32) -> Result<(), RateLimiterError> {
        if self.acquire_permission(permits) {
            return Ok(());
        }
        if interrupt::is_interrupted() {
            return Err(RateLimiterError::Cancelled {
                name: self.name().to_string(),
            });
        }
        Err(RateLimiterError::RequestNotPermitted {
            name: self.name().to_string(),
        })
    }

    /// Run `f` once `permits` have been granted.
    fn execute<T, F>(&self, permits: u32, f: F) -> Result<T, RateLimiterError>
    where
        Self: Sized,
        F: FnOnce() -> T,
    {
        self.wait_for_permission(permits)?;
        Ok(f())
    }

    /// Run a fallible `f` once `permits` have been granted.
    ///
    /// If `f` fails and the config sets `drain_permissions_on_error`, the
    /// limiter is drained so that following callers back off.
    fn execute_result<T, E, F>(&self, permits: u32, f: F) -> Result<T, E>
    where
        Self: Sized,
        E: From<RateLimiterError>,
        F: FnOnce() -> Result<T, E>,
    {
        self.wait_for_permission(permits)?;
        let result = f();
        if result.is_err() && self.config().drain_permissions_on_error() {
            self.drain_permissions();
        }
        result
    }
}
