use crate::atomic::AtomicLimiter;
use crate::atomic::NextState;
use crate::atomic::PermitState;
use crate::atomic::can_acquire_in_time;
use crate::atomic::clamp_permissions;
use crate::config::RateLimiterConfig;

/// Fixed cycle limiter.
///
/// Splits the time since construction into cycles of `limit_refresh_period`.
/// At the start of every cycle `limit_for_period` permits become available.
/// The refresh is lazy: idle cycles are credited on the next call, so a
/// limiter nobody uses costs nothing.
pub type AtomicRateLimiter = AtomicLimiter<FixedCycle>;

#[derive(Debug)]
pub struct FixedCycle;

/// State of an [`AtomicRateLimiter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedCycleState {
    config: RateLimiterConfig,
    /// Cycle seen by the last update.
    active_cycle: i64,
    /// Permits left after the last update; negative if reserved ahead.
    active_permissions: i32,
    nanos_to_wait: i64,
}

impl FixedCycleState {
    pub fn active_cycle(&self) -> i64 {
        self.active_cycle
    }
}

impl PermitState for FixedCycleState {
    fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    fn active_permissions(&self) -> i32 {
        self.active_permissions
    }

    fn nanos_to_wait(&self) -> i64 {
        self.nanos_to_wait
    }
}

impl NextState for FixedCycle {
    type State = FixedCycleState;

    fn initial_state(config: RateLimiterConfig, now_nanos: i64) -> Self::State {
        let active_cycle = now_nanos / config.refresh_period_nanos();
        let active_permissions = clamp_permissions(i64::from(config.initial_permits()));
        FixedCycleState {
            config,
            active_cycle,
            active_permissions,
            nanos_to_wait: 0,
        }
    }

    fn next_state(
        permits: u32,
        timeout_nanos: i64,
        state: &Self::State,
        now_nanos: i64,
    ) -> Self::State {
        let config = &state.config;
        let cycle_period = config.refresh_period_nanos();
        let permissions_per_cycle = i64::from(config.limit_for_period());

        let current_cycle = now_nanos / cycle_period;

        let mut next_cycle = state.active_cycle;
        let mut next_permissions = i64::from(state.active_permissions);
        if next_cycle != current_cycle {
            let elapsed_cycles = current_cycle - next_cycle;
            let accumulated = elapsed_cycles.saturating_mul(permissions_per_cycle);
            next_cycle = current_cycle;
            next_permissions = next_permissions
                .saturating_add(accumulated)
                .min(permissions_per_cycle);
        }

        let permits = i64::from(permits);
        let nanos_to_wait = nanos_to_wait_for_permission(
            permits,
            cycle_period,
            permissions_per_cycle,
            next_permissions,
            now_nanos,
            current_cycle,
        );

        if can_acquire_in_time(timeout_nanos, nanos_to_wait) {
            next_permissions -= permits;
        }

        FixedCycleState {
            config: config.clone(),
            active_cycle: next_cycle,
            active_permissions: clamp_permissions(next_permissions),
            nanos_to_wait,
        }
    }

    fn with_config(state: &Self::State, config: RateLimiterConfig) -> Self::State {
        FixedCycleState {
            config,
            ..state.clone()
        }
    }

    fn with_permissions(state: &Self::State, active_permissions: i32) -> Self::State {
        FixedCycleState {
            active_permissions,
            ..state.clone()
        }
    }

    fn max_permissions(config: &RateLimiterConfig) -> u32 {
        config.limit_for_period()
    }
}

/// Nanoseconds until `permits` have accumulated, given `available` permits
/// (possibly negative) in `current_cycle`.
fn nanos_to_wait_for_permission(
    permits: i64,
    cycle_period: i64,
    permissions_per_cycle: i64,
    available: i64,
    now_nanos: i64,
    current_cycle: i64,
) -> i64 {
    if available >= permits {
        return 0;
    }
    let next_cycle_nanos = current_cycle.saturating_add(1).saturating_mul(cycle_period);
    let nanos_to_next_cycle = next_cycle_nanos - now_nanos;
    let missing_at_next_cycle = permits - (available + permissions_per_cycle);
    let full_cycles_to_wait = if missing_at_next_cycle > 0 {
        (missing_at_next_cycle + permissions_per_cycle - 1) / permissions_per_cycle
    } else {
        0
    };
    full_cycles_to_wait
        .saturating_mul(cycle_period)
        .saturating_add(nanos_to_next_cycle)
}
