use std::fmt;
use std::sync::Arc;

use opentelemetry::KeyValue;
use opentelemetry::metrics::Counter;
use opentelemetry::metrics::Meter;
use opentelemetry::metrics::ObservableGauge;
use permit_limit::RateLimiter;

/// OpenTelemetry instruments bound to one limiter.
///
/// Two observable gauges report the limiter's [`metrics`](RateLimiter::metrics)
/// whenever the meter is collected, and `ratelimiter.calls` counts the
/// limiter's events by `kind`. Every measurement carries the limiter's name.
pub struct LimiterMetrics {
    _available_permissions: ObservableGauge<i64>,
    _waiting_threads: ObservableGauge<i64>,
    calls: Counter<u64>,
}

impl fmt::Debug for LimiterMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimiterMetrics").finish_non_exhaustive()
    }
}

impl LimiterMetrics {
    pub fn register<L>(meter: &Meter, limiter: Arc<L>) -> Self
    where
        L: RateLimiter + ?Sized + 'static,
    {
        let attributes = vec![KeyValue::new("name", limiter.name().to_string())];

        let available_permissions = {
            let limiter = Arc::clone(&limiter);
            let attributes = attributes.clone();
            meter
                .i64_observable_gauge("ratelimiter.available_permissions")
                .with_description("The number of available permissions")
                .with_callback(move |observer| {
                    let available = limiter.metrics().available_permissions;
                    observer.observe(i64::from(available), &attributes);
                })
                .build()
        };

        let waiting_threads = {
            let limiter = Arc::clone(&limiter);
            meter
                .i64_observable_gauge("ratelimiter.waiting_threads")
                .with_description("The number of waiting threads")
                .with_callback(move |observer| {
                    let waiting = limiter.metrics().number_of_waiting_threads;
                    observer.observe(i64::from(waiting), &attributes);
                })
                .build()
        };

        let calls = meter
            .u64_counter("ratelimiter.calls")
            .with_description("The number of limiter decisions by kind")
            .build();
        {
            let calls = calls.clone();
            limiter.event_publisher().on_event(move |event| {
                calls.add(
                    1,
                    &[
                        KeyValue::new("name", event.limiter_name.clone()),
                        KeyValue::new("kind", event.kind.as_str()),
                    ],
                );
            });
        }

        Self {
            _available_permissions: available_permissions,
            _waiting_threads: waiting_threads,
            calls,
        }
    }

    /// The counter fed from the limiter's events.
    pub fn calls(&self) -> &Counter<u64> {
        &self.calls
    }
}
