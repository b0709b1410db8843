//! The permit accounting protocol shared by the lock-free variants.
//!
//! A limiter keeps one immutable state behind an atomic reference. Every
//! operation reads the current state, asks the variant's pure
//! [`NextState::next_state`] for a candidate, and publishes it with a
//! compare-and-swap. A lost race parks for [`CAS_BACKOFF`] and starts over.
//! Callers whose permits lie in the future park until their deadline.

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwap;
use quanta::Clock;
use quanta::Instant;
use tracing::debug;
use tracing::trace;

use crate::FromConfig;
use crate::Metrics;
use crate::RateLimiter;
use crate::Tags;
use crate::config::RateLimiterConfig;
use crate::error::ConfigError;
use crate::error::RateLimiterError;
use crate::event::EventPublisher;
use crate::event::RateLimiterEventKind;
use crate::interrupt;

/// Pause after a failed compare-and-swap before reading the state again.
pub const CAS_BACKOFF: Duration = Duration::from_nanos(1);

/// `nanos_to_wait` of a request that no amount of waiting can satisfy.
pub const NEVER: i64 = i64::MAX;

/// A snapshot of a limiter's permit budget.
pub trait PermitState: Debug + Send + Sync + 'static {
    fn config(&self) -> &RateLimiterConfig;

    /// Permits left. Negative when callers hold reservations against
    /// future refills.
    fn active_permissions(&self) -> i32;

    /// Nanoseconds, from the time this state was computed, until the
    /// permits requested in that computation become available.
    fn nanos_to_wait(&self) -> i64;
}

/// A permit accounting algorithm.
///
/// Every function is pure: it may be evaluated any number of times under
/// contention and only the result that wins the compare-and-swap counts.
pub trait NextState: Debug + Send + Sync + 'static {
    type State: PermitState;

    /// Extra validation the variant needs on top of the config's own.
    fn check_config(_config: &RateLimiterConfig) -> Result<(), ConfigError> {
        Ok(())
    }

    fn initial_state(config: RateLimiterConfig, now_nanos: i64) -> Self::State;

    /// Compute the state after a request for `permits` at `now_nanos`.
    ///
    /// The permits are reserved only when they become available within
    /// `timeout_nanos`. A negative timeout never reserves, which makes it a
    /// side-effect free estimate.
    fn next_state(
        permits: u32,
        timeout_nanos: i64,
        state: &Self::State,
        now_nanos: i64,
    ) -> Self::State;

    /// The same state under a different config.
    fn with_config(state: &Self::State, config: RateLimiterConfig) -> Self::State;

    fn with_permissions(state: &Self::State, active_permissions: i32) -> Self::State;

    /// Upper bound of the permits that can accumulate.
    fn max_permissions(config: &RateLimiterConfig) -> u32;
}

/// Metrics of a lock-free limiter, with the estimated wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetailedMetrics {
    pub available_permissions: i32,
    /// Estimated nanoseconds until a single permit is available.
    pub nanos_to_wait: i64,
    pub number_of_waiting_threads: u32,
}

/// A lock-free limiter driven by the algorithm `A`.
#[derive(Debug)]
pub struct AtomicLimiter<A: NextState> {
    name: String,
    tags: Tags,
    pub(crate) state: ArcSwap<A::State>,
    waiting_threads: AtomicU32,
    events: EventPublisher,
    clock: Clock,
    anchor: Instant,
}

impl<A: NextState> AtomicLimiter<A> {
    /// Creates a new limiter with no tags, timed by the system clock.
    ///
    /// # Arguments
    ///
    /// * `name` - The name reported in events, metrics and errors. Must not be empty.
    /// * `config` - The permit budget, refresh period and default timeout.
    pub fn new(name: impl Into<String>, config: RateLimiterConfig) -> Result<Self, ConfigError> {
        Self::with_tags(name, config, Tags::new())
    }

    /// Creates a new limiter carrying `tags`, timed by the system clock.
    ///
    /// # Arguments
    ///
    /// * `name` - The name reported in events, metrics and errors. Must not be empty.
    /// * `config` - The permit budget, refresh period and default timeout.
    /// * `tags` - Labels handed back by [`RateLimiter::tags`].
    pub fn with_tags(
        name: impl Into<String>,
        config: RateLimiterConfig,
        tags: Tags,
    ) -> Result<Self, ConfigError> {
        Self::with_clock(name, config, tags, Clock::new())
    }

    /// Creates a new limiter reading time from `clock`. Time zero is the
    /// moment of construction.
    ///
    /// # Arguments
    ///
    /// * `name` - The name reported in events, metrics and errors. Must not be empty.
    /// * `config` - The permit budget, refresh period and default timeout.
    /// * `tags` - Labels handed back by [`RateLimiter::tags`].
    /// * `clock` - The time source, typically `Clock::mock()` in tests.
    pub fn with_clock(
        name: impl Into<String>,
        config: RateLimiterConfig,
        tags: Tags,
        clock: Clock,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ConfigError::EmptyName);
        }
        A::check_config(&config)?;

        debug!(name = %name, ?config, "creating rate limiter");
        let anchor = clock.now();
        Ok(Self {
            name,
            tags,
            state: ArcSwap::from_pointee(A::initial_state(config, 0)),
            waiting_threads: AtomicU32::new(0),
            events: EventPublisher::new(),
            clock,
            anchor,
        })
    }

    /// Nanoseconds since construction.
    pub(crate) fn now_nanos(&self) -> i64 {
        self.clock.now().duration_since(self.anchor).as_nanos() as i64
    }

    /// Swap in the result of `next_state`, retrying with a constant back-off
    /// until the swap wins.
    fn update_state_with_backoff(&self, permits: u32, timeout_nanos: i64) -> Arc<A::State> {
        loop {
            let prev = self.state.load_full();
            let next = Arc::new(A::next_state(
                permits,
                timeout_nanos,
                &prev,
                self.now_nanos(),
            ));
            if self.compare_and_set(&prev, &next) {
                return next;
            }
        }
    }

    fn compare_and_set(&self, current: &Arc<A::State>, next: &Arc<A::State>) -> bool {
        let previous = self.state.compare_and_swap(current, Arc::clone(next));
        if Arc::ptr_eq(&*previous, current) {
            return true;
        }
        thread::park_timeout(CAS_BACKOFF);
        false
    }

    /// Park until `nanos_to_wait` has passed. Returns `false` if the thread
    /// was interrupted, in which case its interrupt flag is left set.
    fn park_for_permission(&self, nanos_to_wait: i64) -> bool {
        let deadline = self.now_nanos().saturating_add(nanos_to_wait);
        self.waiting_threads.fetch_add(1, Ordering::SeqCst);
        let mut was_interrupted = false;
        loop {
            let now = self.now_nanos();
            if now >= deadline {
                break;
            }
            if interrupt::interrupted() {
                was_interrupted = true;
                break;
            }
            trace!(name = %self.name, remaining = deadline - now, "parking for permits");
            thread::park_timeout(Duration::from_nanos((deadline - now) as u64));
        }
        self.waiting_threads.fetch_sub(1, Ordering::SeqCst);
        if was_interrupted {
            interrupt::interrupt_current();
        }
        !was_interrupted
    }

    /// Hand back permits reserved by a caller that gave up waiting.
    fn refund(&self, permits: u32) {
        loop {
            let prev = self.state.load_full();
            let max = i64::from(A::max_permissions(prev.config()));
            let permissions = (i64::from(prev.active_permissions()) + i64::from(permits)).min(max);
            let next = Arc::new(A::with_permissions(&prev, clamp_permissions(permissions)));
            if self.compare_and_set(&prev, &next) {
                debug!(name = %self.name, permits, "refunded cancelled reservation");
                return;
            }
        }
    }

    fn reconfigure<F>(&self, change: F) -> Result<(), ConfigError>
    where
        F: Fn(&RateLimiterConfig) -> Result<RateLimiterConfig, ConfigError>,
    {
        loop {
            let prev = self.state.load_full();
            let config = change(prev.config())?;
            A::check_config(&config)?;
            let next = Arc::new(A::with_config(&prev, config));
            if self.compare_and_set(&prev, &next) {
                debug!(name = %self.name, config = ?next.config(), "rate limiter reconfigured");
                return Ok(());
            }
        }
    }

    /// What the next single-permit request would see, without reserving.
    pub fn estimated_state(&self) -> A::State {
        let current = self.state.load_full();
        A::next_state(1, -1, &current, self.now_nanos())
    }

    pub fn detailed_metrics(&self) -> DetailedMetrics {
        let estimated = self.estimated_state();
        DetailedMetrics {
            available_permissions: estimated.active_permissions(),
            nanos_to_wait: estimated.nanos_to_wait(),
            number_of_waiting_threads: self.waiting_threads.load(Ordering::SeqCst),
        }
    }
}

impl<A: NextState> RateLimiter for AtomicLimiter<A> {
    fn name(&self) -> &str {
        &self.name
    }

    fn tags(&self) -> &Tags {
        &self.tags
    }

    fn config(&self) -> RateLimiterConfig {
        self.state.load().config().clone()
    }

    fn event_publisher(&self) -> &EventPublisher {
        &self.events
    }

    fn metrics(&self) -> Metrics {
        let detailed = self.detailed_metrics();
        Metrics {
            available_permissions: detailed.available_permissions,
            number_of_waiting_threads: detailed.number_of_waiting_threads,
        }
    }

    fn acquire_permission_within(&self, permits: u32, timeout: Duration) -> bool {
        let timeout_nanos = duration_nanos(timeout);
        let next = self.update_state_with_backoff(permits, timeout_nanos);
        let nanos_to_wait = next.nanos_to_wait();

        let acquired = if nanos_to_wait <= 0 {
            true
        } else if can_acquire_in_time(timeout_nanos, nanos_to_wait) {
            let completed = self.park_for_permission(nanos_to_wait);
            if !completed && next.config().refund_cancelled_reservations() {
                self.refund(permits);
            }
            completed
        } else {
            // Nothing was reserved. Hold the caller for its timeout, unless
            // the request can never be met.
            if nanos_to_wait != NEVER {
                self.park_for_permission(timeout_nanos);
            }
            false
        };

        self.events.publish_acquisition(&self.name, acquired, permits);
        acquired
    }

    fn reserve_permission_within(
        &self,
        permits: u32,
        timeout: Duration,
    ) -> Result<i64, RateLimiterError> {
        let timeout_nanos = duration_nanos(timeout);
        let next = self.update_state_with_backoff(permits, timeout_nanos);
        let nanos_to_wait = next.nanos_to_wait();

        let reservation = if nanos_to_wait <= 0 {
            0
        } else if can_acquire_in_time(timeout_nanos, nanos_to_wait) {
            nanos_to_wait
        } else {
            -1
        };
        self.events
            .publish_acquisition(&self.name, reservation >= 0, permits);
        Ok(reservation)
    }

    fn drain_permissions(&self) {
        let drained = loop {
            let prev = self.state.load_full();
            let refreshed = A::next_state(0, -1, &prev, self.now_nanos());
            let available = refreshed.active_permissions();
            let next = Arc::new(A::with_permissions(&refreshed, available.min(0)));
            if self.compare_and_set(&prev, &next) {
                break available.max(0);
            }
        };
        debug!(name = %self.name, drained, "drained rate limiter");
        self.events
            .publish(&self.name, RateLimiterEventKind::Drained, drained as u32);
    }

    fn change_limit_for_period(&self, limit_for_period: u32) -> Result<(), ConfigError> {
        self.reconfigure(|config| config.with_limit_for_period(limit_for_period))
    }

    fn change_timeout_duration(&self, timeout_duration: Duration) -> Result<(), ConfigError> {
        self.reconfigure(|config| config.with_timeout_duration(timeout_duration))
    }
}

impl<A: NextState> FromConfig for AtomicLimiter<A> {
    fn from_config(name: String, config: RateLimiterConfig, tags: Tags) -> Result<Self, ConfigError> {
        Self::with_tags(name, config, tags)
    }
}

/// Whether a caller prepared to wait `timeout_nanos` gets its permits.
pub(crate) fn can_acquire_in_time(timeout_nanos: i64, nanos_to_wait: i64) -> bool {
    nanos_to_wait != NEVER && timeout_nanos >= nanos_to_wait
}

pub(crate) fn duration_nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

pub(crate) fn clamp_permissions(permissions: i64) -> i32 {
    permissions.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}
