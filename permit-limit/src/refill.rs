use crate::atomic::AtomicLimiter;
use crate::atomic::NEVER;
use crate::atomic::NextState;
use crate::atomic::PermitState;
use crate::atomic::can_acquire_in_time;
use crate::atomic::clamp_permissions;
use crate::config::RateLimiterConfig;
use crate::error::ConfigError;

/// Token bucket limiter.
///
/// Permits accrue one at a time, every `limit_refresh_period / limit_for_period`,
/// up to `permit_capacity`. A capacity above the limit allows bursts after an
/// idle spell.
pub type RefillRateLimiter = AtomicLimiter<Refill>;

#[derive(Debug)]
pub struct Refill;

/// State of a [`RefillRateLimiter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefillState {
    config: RateLimiterConfig,
    nanos_per_permission: i64,
    active_permissions: i32,
    nanos_to_wait: i64,
    /// Instant up to which refills have been credited. Lags behind the last
    /// update by the time spent accruing the next, partial, permit.
    updated_at: i64,
}

impl RefillState {
    pub fn nanos_per_permission(&self) -> i64 {
        self.nanos_per_permission
    }

    pub fn updated_at(&self) -> i64 {
        self.updated_at
    }
}

impl PermitState for RefillState {
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

impl NextState for Refill {
    type State = RefillState;

    fn check_config(config: &RateLimiterConfig) -> Result<(), ConfigError> {
        config.check_refill()
    }

    fn initial_state(config: RateLimiterConfig, now_nanos: i64) -> Self::State {
        RefillState {
            nanos_per_permission: config.nanos_per_permit(),
            active_permissions: clamp_permissions(i64::from(config.initial_permits())),
            nanos_to_wait: 0,
            updated_at: now_nanos,
            config,
        }
    }

    fn next_state(
        permits: u32,
        timeout_nanos: i64,
        state: &Self::State,
        now_nanos: i64,
    ) -> Self::State {
        let nanos_per_permission = state.nanos_per_permission;
        let capacity = i64::from(state.config.permit_capacity());

        let elapsed = (now_nanos - state.updated_at).max(0);
        // a bucket with nothing owed is full once it has idled for a whole refill
        let full = state.active_permissions >= 0
            && elapsed >= state.config.nanos_per_full_capacity();
        let accrued = if full {
            capacity
        } else {
            elapsed / nanos_per_permission
        };
        let mut available = i64::from(state.active_permissions).saturating_add(accrued);
        let updated_at = if full || available >= capacity {
            available = capacity;
            now_nanos
        } else {
            state.updated_at + accrued * nanos_per_permission
        };

        let permits = i64::from(permits);
        let nanos_to_wait = if permits > capacity {
            NEVER
        } else if available >= permits {
            0
        } else {
            // the partial permit accrued since updated_at counts towards the wait
            (permits - available)
                .saturating_mul(nanos_per_permission)
                .saturating_sub(now_nanos - updated_at)
        };

        if can_acquire_in_time(timeout_nanos, nanos_to_wait) {
            available -= permits;
        }

        RefillState {
            config: state.config.clone(),
            nanos_per_permission,
            active_permissions: clamp_permissions(available),
            nanos_to_wait,
            updated_at,
        }
    }

    fn with_config(state: &Self::State, config: RateLimiterConfig) -> Self::State {
        RefillState {
            nanos_per_permission: config.nanos_per_permit(),
            config,
            ..state.clone()
        }
    }

    fn with_permissions(state: &Self::State, active_permissions: i32) -> Self::State {
        RefillState {
            active_permissions,
            ..state.clone()
        }
    }

    fn max_permissions(config: &RateLimiterConfig) -> u32 {
        config.permit_capacity()
    }
}
