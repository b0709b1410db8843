//! A limiter built on a fair counting semaphore.
//!
//! Unlike the lock-free variants it does not compute waits: callers block on
//! the semaphore and a background thread tops it up to `limit_for_period` at
//! every refresh period. Timing is therefore only as precise as the thread
//! scheduler, and nothing can be reserved ahead.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::thread::JoinHandle;
use std::thread::Thread;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use quanta::Clock;
use quanta::Instant;
use tracing::debug;
use tracing::trace;
use tracing::warn;

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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Acquire {
    Acquired,
    TimedOut,
    Interrupted,
}

#[derive(Debug)]
struct Waiter {
    ticket: u64,
    thread: Thread,
}

#[derive(Debug)]
struct SemaphoreState {
    permits: u64,
    next_ticket: u64,
    waiters: VecDeque<Waiter>,
}

/// Counting semaphore handing out permits in arrival order.
///
/// A caller that cannot be served at once queues up and parks. Only the head
/// of the queue may take permits, so a large request is never overtaken by
/// smaller ones arriving later.
#[derive(Debug)]
struct Semaphore {
    state: Mutex<SemaphoreState>,
}

impl Semaphore {
    fn new(permits: u32) -> Self {
        Self {
            state: Mutex::new(SemaphoreState {
                permits: u64::from(permits),
                next_ticket: 0,
                waiters: VecDeque::new(),
            }),
        }
    }

    fn try_acquire(&self, permits: u32, timeout: Duration, clock: &Clock) -> Acquire {
        if interrupt::is_interrupted() {
            return Acquire::Interrupted;
        }
        let wanted = u64::from(permits);
        let deadline = clock.now().checked_add(timeout);

        let mut state = self.state.lock();
        if state.waiters.is_empty() && state.permits >= wanted {
            state.permits -= wanted;
            return Acquire::Acquired;
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.waiters.push_back(Waiter {
            ticket,
            thread: thread::current(),
        });

        let outcome = loop {
            let at_head = state.waiters.front().is_some_and(|w| w.ticket == ticket);
            if at_head && state.permits >= wanted {
                state.permits -= wanted;
                break Acquire::Acquired;
            }
            if interrupt::interrupted() {
                break Acquire::Interrupted;
            }
            match deadline {
                Some(deadline) => {
                    let now = clock.now();
                    if now >= deadline {
                        break Acquire::TimedOut;
                    }
                    let remaining = deadline.duration_since(now);
                    MutexGuard::unlocked(&mut state, || thread::park_timeout(remaining));
                }
                None => MutexGuard::unlocked(&mut state, thread::park),
            }
        };

        state.waiters.retain(|w| w.ticket != ticket);
        wake_head(&state);
        drop(state);

        if outcome == Acquire::Interrupted {
            interrupt::interrupt_current();
        }
        outcome
    }

    #[cfg(test)]
    fn release(&self, permits: u32) {
        let mut state = self.state.lock();
        state.permits += u64::from(permits);
        wake_head(&state);
    }

    /// Raise the available permits to `limit`. Returns the number released.
    fn refill_to(&self, limit: u32) -> u64 {
        let mut state = self.state.lock();
        let limit = u64::from(limit);
        if state.permits >= limit {
            return 0;
        }
        let released = limit - state.permits;
        state.permits = limit;
        wake_head(&state);
        released
    }

    /// Take every available permit. Returns the number taken.
    fn drain(&self) -> u64 {
        let mut state = self.state.lock();
        std::mem::take(&mut state.permits)
    }

    fn available(&self) -> u64 {
        self.state.lock().permits
    }

    fn queue_len(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

fn wake_head(state: &SemaphoreState) {
    if let Some(head) = state.waiters.front() {
        head.thread.unpark();
    }
}

fn refresh_limit(semaphore: &Semaphore, config: &ArcSwap<RateLimiterConfig>) -> u64 {
    semaphore.refill_to(config.load().limit_for_period())
}

/// Limiter backed by a fair semaphore and a refresh thread.
///
/// The refresh thread runs until [`SemaphoreRateLimiter::shutdown`] is called
/// or the limiter is dropped.
#[derive(Debug)]
pub struct SemaphoreRateLimiter {
    name: String,
    tags: Tags,
    config: Arc<ArcSwap<RateLimiterConfig>>,
    semaphore: Arc<Semaphore>,
    events: EventPublisher,
    clock: Clock,
    shutdown: Arc<AtomicBool>,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

impl SemaphoreRateLimiter {
    /// Creates a new limiter with no tags and starts its refresh thread.
    ///
    /// # Arguments
    ///
    /// * `name` - The name reported in events, metrics and errors, and used
    ///   for the refresh thread's name. Must not be empty.
    /// * `config` - The permits per period, refresh period and default timeout.
    pub fn new(name: impl Into<String>, config: RateLimiterConfig) -> Result<Self, ConfigError> {
        Self::with_tags(name, config, Tags::new())
    }

    /// Creates a new limiter carrying `tags` and starts its refresh thread.
    ///
    /// # Arguments
    ///
    /// * `name` - The name reported in events, metrics and errors. Must not be empty.
    /// * `config` - The permits per period, refresh period and default timeout.
    /// * `tags` - Labels handed back by [`RateLimiter::tags`].
    pub fn with_tags(
        name: impl Into<String>,
        config: RateLimiterConfig,
        tags: Tags,
    ) -> Result<Self, ConfigError> {
        Self::with_clock(name, config, tags, Clock::new())
    }

    /// Creates a new limiter whose refresh schedule and acquire deadlines
    /// follow `clock`.
    ///
    /// # Arguments
    ///
    /// * `name` - The name reported in events, metrics and errors. Must not be empty.
    /// * `config` - The permits per period, refresh period and default timeout.
    /// * `tags` - Labels handed back by [`RateLimiter::tags`].
    /// * `clock` - The time source, typically `Clock::mock()` in tests. The
    ///   refresh thread still parks in real time between checks of it.
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

        let initial = config.initial_permits().min(config.limit_for_period());
        let period = config.limit_refresh_period();
        let semaphore = Arc::new(Semaphore::new(initial));
        let shutdown = Arc::new(AtomicBool::new(false));
        debug!(name = %name, ?config, "creating semaphore rate limiter");
        let config = Arc::new(ArcSwap::from_pointee(config));

        let refresher = {
            let semaphore = Arc::clone(&semaphore);
            let config = Arc::clone(&config);
            let shutdown = Arc::clone(&shutdown);
            let clock = clock.clone();
            let start = clock.now();
            let limiter_name = name.clone();
            thread::Builder::new()
                .name(format!("permit-refresh-{name}"))
                .spawn(move || {
                    run_refresher(&limiter_name, &semaphore, &config, &shutdown, &clock, start, period)
                })
                .map_err(|e| ConfigError::RefresherSpawn {
                    name: name.clone(),
                    reason: e.to_string(),
                })?
        };

        Ok(Self {
            name,
            tags,
            config,
            semaphore,
            events: EventPublisher::new(),
            clock,
            shutdown,
            refresher: Mutex::new(Some(refresher)),
        })
    }

    /// Stop the refresh thread and wait for it to exit.
    ///
    /// Permits left in the semaphore stay usable. Calling this more than once
    /// is harmless.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let Some(refresher) = self.refresher.lock().take() else {
            return;
        };
        refresher.thread().unpark();
        if refresher.join().is_err() {
            warn!(name = %self.name, "refresh thread panicked");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn reconfigure<F>(&self, change: F) -> Result<(), ConfigError>
    where
        F: Fn(&RateLimiterConfig) -> Result<RateLimiterConfig, ConfigError>,
    {
        loop {
            let prev = self.config.load_full();
            let next = Arc::new(change(&prev)?);
            let previous = self.config.compare_and_swap(&prev, Arc::clone(&next));
            if Arc::ptr_eq(&*previous, &prev) {
                debug!(name = %self.name, config = ?next, "rate limiter reconfigured");
                return Ok(());
            }
        }
    }
}

fn run_refresher(
    name: &str,
    semaphore: &Semaphore,
    config: &ArcSwap<RateLimiterConfig>,
    shutdown: &AtomicBool,
    clock: &Clock,
    start: Instant,
    period: Duration,
) {
    debug!(name, ?period, "refresh thread started");
    let mut next = start;
    'refresh: loop {
        next = match next.checked_add(period) {
            Some(next) => next,
            None => break,
        };
        loop {
            if shutdown.load(Ordering::Acquire) {
                break 'refresh;
            }
            let now = clock.now();
            if now >= next {
                break;
            }
            thread::park_timeout(next.duration_since(now));
        }
        let released = refresh_limit(semaphore, config);
        trace!(name, released, "refreshed permits");
    }
    debug!(name, "refresh thread stopped");
}

impl Drop for SemaphoreRateLimiter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl RateLimiter for SemaphoreRateLimiter {
    fn name(&self) -> &str {
        &self.name
    }

    fn tags(&self) -> &Tags {
        &self.tags
    }

    fn config(&self) -> RateLimiterConfig {
        self.config.load().as_ref().clone()
    }

    fn event_publisher(&self) -> &EventPublisher {
        &self.events
    }

    fn metrics(&self) -> Metrics {
        Metrics {
            available_permissions: i32::try_from(self.semaphore.available()).unwrap_or(i32::MAX),
            number_of_waiting_threads: u32::try_from(self.semaphore.queue_len())
                .unwrap_or(u32::MAX),
        }
    }

    fn acquire_permission_within(&self, permits: u32, timeout: Duration) -> bool {
        // refills stop at the limit, so larger requests would only time out
        let acquired = permits <= self.config.load().limit_for_period()
            && self.semaphore.try_acquire(permits, timeout, &self.clock) == Acquire::Acquired;
        self.events.publish_acquisition(&self.name, acquired, permits);
        acquired
    }

    fn reserve_permission_within(
        &self,
        _permits: u32,
        _timeout: Duration,
    ) -> Result<i64, RateLimiterError> {
        Err(RateLimiterError::Unsupported {
            operation: "reserve_permission",
        })
    }

    fn drain_permissions(&self) {
        let drained = self.semaphore.drain();
        debug!(name = %self.name, drained, "drained rate limiter");
        self.events.publish(
            &self.name,
            RateLimiterEventKind::Drained,
            u32::try_from(drained).unwrap_or(u32::MAX),
        );
    }

    fn change_limit_for_period(&self, limit_for_period: u32) -> Result<(), ConfigError> {
        self.reconfigure(|config| config.with_limit_for_period(limit_for_period))
    }

    fn change_timeout_duration(&self, timeout_duration: Duration) -> Result<(), ConfigError> {
        self.reconfigure(|config| config.with_timeout_duration(timeout_duration))
    }
}

impl FromConfig for SemaphoreRateLimiter {
    fn from_config(name: String, config: RateLimiterConfig, tags: Tags) -> Result<Self, ConfigError> {
        Self::with_tags(name, config, tags)
    }
}
