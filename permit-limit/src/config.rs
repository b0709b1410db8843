use std::time::Duration;

use crate::error::ConfigError;

const DEFAULT_LIMIT_FOR_PERIOD: u32 = 50;
const DEFAULT_LIMIT_REFRESH_PERIOD: Duration = Duration::from_nanos(500);
const DEFAULT_TIMEOUT_DURATION: Duration = Duration::from_secs(5);

/// Immutable description of a rate limiter's budget.
///
/// A config is never mutated in place. Reconfiguration produces a new,
/// validated value with [`RateLimiterConfig::with_limit_for_period`] or
/// [`RateLimiterConfig::with_timeout_duration`] which the limiter then swaps in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterConfig {
    limit_for_period: u32,
    limit_refresh_period: Duration,
    timeout_duration: Duration,
    permit_capacity: u32,
    explicit_capacity: bool,
    initial_permits: u32,
    refund_cancelled_reservations: bool,
    drain_permissions_on_error: bool,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            limit_for_period: DEFAULT_LIMIT_FOR_PERIOD,
            limit_refresh_period: DEFAULT_LIMIT_REFRESH_PERIOD,
            timeout_duration: DEFAULT_TIMEOUT_DURATION,
            permit_capacity: DEFAULT_LIMIT_FOR_PERIOD,
            explicit_capacity: false,
            initial_permits: DEFAULT_LIMIT_FOR_PERIOD,
            refund_cancelled_reservations: false,
            drain_permissions_on_error: false,
        }
    }
}

impl RateLimiterConfig {
    /// Start building a config from the defaults
    /// (50 permits every 500ns, 5s timeout).
    pub fn builder() -> RateLimiterConfigBuilder {
        RateLimiterConfigBuilder::default()
    }

    /// Re-open an existing config as a builder.
    pub fn from(prototype: &RateLimiterConfig) -> RateLimiterConfigBuilder {
        RateLimiterConfigBuilder {
            limit_for_period: prototype.limit_for_period,
            limit_refresh_period: prototype.limit_refresh_period,
            timeout_duration: prototype.timeout_duration,
            permit_capacity: prototype.explicit_capacity.then_some(prototype.permit_capacity),
            initial_permits: Some(prototype.initial_permits),
            refund_cancelled_reservations: prototype.refund_cancelled_reservations,
            drain_permissions_on_error: prototype.drain_permissions_on_error,
        }
    }

    pub fn limit_for_period(&self) -> u32 {
        self.limit_for_period
    }

    pub fn limit_refresh_period(&self) -> Duration {
        self.limit_refresh_period
    }

    pub fn timeout_duration(&self) -> Duration {
        self.timeout_duration
    }

    /// Maximum number of permits that may accumulate. Defaults to
    /// `limit_for_period`.
    pub fn permit_capacity(&self) -> u32 {
        self.permit_capacity
    }

    pub fn initial_permits(&self) -> u32 {
        self.initial_permits
    }

    /// Whether a caller interrupted while waiting gives its reserved
    /// permits back.
    pub fn refund_cancelled_reservations(&self) -> bool {
        self.refund_cancelled_reservations
    }

    /// Whether decorated calls that fail drain the limiter.
    pub fn drain_permissions_on_error(&self) -> bool {
        self.drain_permissions_on_error
    }

    pub(crate) fn refresh_period_nanos(&self) -> i64 {
        // validated on construction
        self.limit_refresh_period.as_nanos() as i64
    }

    /// Nanoseconds needed to accrue a single permit.
    pub fn nanos_per_permit(&self) -> i64 {
        self.refresh_period_nanos() / i64::from(self.limit_for_period)
    }

    /// Nanoseconds needed to refill the bucket from empty to capacity.
    pub fn nanos_per_full_capacity(&self) -> i64 {
        self.nanos_per_permit()
            .saturating_mul(i64::from(self.permit_capacity))
    }

    /// A copy of this config with a different `limit_for_period`.
    ///
    /// An implicit capacity follows the new limit; an explicit one is raised
    /// only if it would otherwise fall below the limit.
    pub fn with_limit_for_period(&self, limit_for_period: u32) -> Result<Self, ConfigError> {
        let mut builder = Self::from(self).limit_for_period(limit_for_period);
        if let Some(capacity) = builder.permit_capacity
            && capacity < limit_for_period
        {
            builder.permit_capacity = Some(limit_for_period);
        }
        // initial permits only matter at construction; keep them in range
        let capacity = builder.permit_capacity.unwrap_or(limit_for_period);
        builder.initial_permits = builder.initial_permits.map(|p| p.min(capacity));
        builder.build()
    }

    /// A copy of this config with a different timeout.
    pub fn with_timeout_duration(&self, timeout_duration: Duration) -> Result<Self, ConfigError> {
        Self::from(self).timeout_duration(timeout_duration).build()
    }

    /// Additional check for the continuous refill variant, which needs at
    /// least one nanosecond per permit.
    pub(crate) fn check_refill(&self) -> Result<(), ConfigError> {
        if self.nanos_per_permit() <= 0 {
            return Err(ConfigError::ZeroNanosPerPermit {
                limit_for_period: self.limit_for_period,
                limit_refresh_period: self.limit_refresh_period,
            });
        }
        Ok(())
    }
}

/// Builder for [`RateLimiterConfig`]. Every setter is infallible; all
/// validation happens in [`RateLimiterConfigBuilder::build`].
#[derive(Debug, Clone)]
pub struct RateLimiterConfigBuilder {
    limit_for_period: u32,
    limit_refresh_period: Duration,
    timeout_duration: Duration,
    permit_capacity: Option<u32>,
    initial_permits: Option<u32>,
    refund_cancelled_reservations: bool,
    drain_permissions_on_error: bool,
}

impl Default for RateLimiterConfigBuilder {
    fn default() -> Self {
        Self {
            limit_for_period: DEFAULT_LIMIT_FOR_PERIOD,
            limit_refresh_period: DEFAULT_LIMIT_REFRESH_PERIOD,
            timeout_duration: DEFAULT_TIMEOUT_DURATION,
            permit_capacity: None,
            initial_permits: None,
            refund_cancelled_reservations: false,
            drain_permissions_on_error: false,
        }
    }
}

impl RateLimiterConfigBuilder {
    /// Permits released during one refresh period.
    pub fn limit_for_period(mut self, limit_for_period: u32) -> Self {
        self.limit_for_period = limit_for_period;
        self
    }

    pub fn limit_refresh_period(mut self, limit_refresh_period: Duration) -> Self {
        self.limit_refresh_period = limit_refresh_period;
        self
    }

    /// Default time a caller may wait for permits.
    pub fn timeout_duration(mut self, timeout_duration: Duration) -> Self {
        self.timeout_duration = timeout_duration;
        self
    }

    pub fn permit_capacity(mut self, permit_capacity: u32) -> Self {
        self.permit_capacity = Some(permit_capacity);
        self
    }

    pub fn initial_permits(mut self, initial_permits: u32) -> Self {
        self.initial_permits = Some(initial_permits);
        self
    }

    pub fn refund_cancelled_reservations(mut self, refund: bool) -> Self {
        self.refund_cancelled_reservations = refund;
        self
    }

    pub fn drain_permissions_on_error(mut self, drain: bool) -> Self {
        self.drain_permissions_on_error = drain;
        self
    }

    pub fn build(self) -> Result<RateLimiterConfig, ConfigError> {
        if self.limit_for_period == 0 {
            return Err(ConfigError::ZeroLimitForPeriod);
        }
        if self.limit_refresh_period.is_zero() {
            return Err(ConfigError::RefreshPeriodTooShort);
        }
        if self.limit_refresh_period.as_nanos() > i64::MAX as u128 {
            return Err(ConfigError::DurationTooLarge("limit_refresh_period"));
        }
        if self.timeout_duration.as_nanos() > i64::MAX as u128 {
            return Err(ConfigError::DurationTooLarge("timeout_duration"));
        }

        let permit_capacity = self.permit_capacity.unwrap_or(self.limit_for_period);
        if permit_capacity < self.limit_for_period {
            return Err(ConfigError::CapacityBelowLimit {
                permit_capacity,
                limit_for_period: self.limit_for_period,
            });
        }

        let initial_permits = self.initial_permits.unwrap_or(self.limit_for_period);
        if initial_permits > permit_capacity {
            return Err(ConfigError::InitialPermitsAboveCapacity {
                initial_permits,
                permit_capacity,
            });
        }

        Ok(RateLimiterConfig {
            limit_for_period: self.limit_for_period,
            limit_refresh_period: self.limit_refresh_period,
            timeout_duration: self.timeout_duration,
            permit_capacity,
            explicit_capacity: self.permit_capacity.is_some(),
            initial_permits,
            refund_cancelled_reservations: self.refund_cancelled_reservations,
            drain_permissions_on_error: self.drain_permissions_on_error,
        })
    }
}
