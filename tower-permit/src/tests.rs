use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use futures::future::Ready;
use futures::future::ready;
use opentelemetry::KeyValue;
use opentelemetry::metrics::MeterProvider;
use opentelemetry_sdk::metrics::InMemoryMetricExporter;
use opentelemetry_sdk::metrics::PeriodicReader;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::metrics::data::AggregatedMetrics;
use opentelemetry_sdk::metrics::data::MetricData;
use opentelemetry_sdk::metrics::data::ResourceMetrics;
use permit_limit::AtomicRateLimiter;
use permit_limit::RateLimiter;
use permit_limit::RateLimiterConfig;
use permit_limit::RateLimiterConfigBuilder;
use permit_limit::RefillRateLimiter;
use permit_limit::SemaphoreRateLimiter;
use permit_limit::Tags;
use quanta::Clock;
use tokio::time::advance;
use tokio::time::pause;
use tower::BoxError;
use tower::Layer;
use tower::Service;
use tower::ServiceBuilder;
use tower::ServiceExt;

use super::*;

#[derive(Clone, Debug)]
struct MockService {
    pub count: Arc<AtomicUsize>,
}

impl MockService {
    fn new() -> Self {
        Self {
            count: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Service<()> for MockService {
    type Response = ();
    type Error = BoxError;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: ()) -> Self::Future {
        self.count.fetch_add(1, Ordering::SeqCst);
        ready(Ok(()))
    }
}

fn config(limit: u32, period: Duration, timeout: Duration) -> RateLimiterConfigBuilder {
    RateLimiterConfig::builder()
        .limit_for_period(limit)
        .limit_refresh_period(period)
        .timeout_duration(timeout)
}

/// A limiter whose clock stands still, so only tokio time moves.
fn frozen<L: permit_limit::NextState>(
    builder: RateLimiterConfigBuilder,
) -> Arc<permit_limit::AtomicLimiter<L>> {
    let (clock, _mock) = Clock::mock();
    Arc::new(
        permit_limit::AtomicLimiter::with_clock("tower", builder.build().unwrap(), Tags::new(), clock)
            .unwrap(),
    )
}

fn permit_error(err: &BoxError) -> Option<&PermitError> {
    err.downcast_ref::<PermitError>()
}

macro_rules! test_limiter_service {
    ($name:ident, $algorithm:ty) => {
        #[cfg(test)]
        mod $name {
            use super::*;

            #[tokio::test]
            async fn test_poll_ready_waits_for_reservation() {
                pause();

                let limiter = frozen::<$algorithm>(config(
                    1,
                    Duration::from_millis(100),
                    Duration::from_secs(1),
                ));
                let mock = MockService::new();
                let count = Arc::clone(&mock.count);
                let mut service = RateLimitService::new(mock, Arc::clone(&limiter));

                ServiceExt::<()>::ready(&mut service).await.unwrap();
                service.call(()).await.unwrap();

                // the permit is reserved at once, the service then sleeps
                let mut ready_fut = ServiceExt::<()>::ready(&mut service);
                tokio::select! {
                    _ = &mut ready_fut => panic!("Should be throttled!"),
                    _ = tokio::time::sleep(Duration::from_millis(10)) => {}
                }
                assert_eq!(limiter.metrics().available_permissions, -1);

                advance(Duration::from_millis(110)).await;

                ready_fut.await.expect("Should recover");
                service.call(()).await.unwrap();
                assert_eq!(count.load(Ordering::SeqCst), 2);
            }

            #[tokio::test]
            async fn test_rejects_when_wait_exceeds_timeout() {
                let limiter = frozen::<$algorithm>(config(1, Duration::from_secs(1), Duration::ZERO));
                let mut service = RateLimitService::new(MockService::new(), limiter);

                ServiceExt::<()>::ready(&mut service).await.unwrap();
                service.call(()).await.unwrap();

                let err = ServiceExt::<()>::ready(&mut service).await.unwrap_err();
                assert_eq!(
                    permit_error(&err),
                    Some(&PermitError::RequestNotPermitted {
                        name: "tower".to_string()
                    })
                );
            }
        }
    };
}

test_limiter_service!(fixed_cycle_tests, permit_limit::FixedCycle);

test_limiter_service!(refill_tests, permit_limit::Refill);

#[tokio::test]
async fn test_layer_integration() {
    let limiter = AtomicRateLimiter::new(
        "tower",
        config(100, Duration::from_secs(1), Duration::ZERO).build().unwrap(),
    )
    .unwrap();

    let mut service = ServiceBuilder::new()
        .layer(RateLimitLayer::new(Arc::new(limiter)))
        .service(MockService::new());

    service.ready().await.unwrap().call(()).await.unwrap();
}

#[tokio::test]
async fn test_permits_per_request() {
    let limiter = frozen::<permit_limit::FixedCycle>(config(4, Duration::from_secs(1), Duration::ZERO));
    let mock = MockService::new();
    let count = Arc::clone(&mock.count);

    let mut service = ServiceBuilder::new()
        .layer(RateLimitLayer::new(limiter).with_permits_per_request(2))
        .service(mock);

    service.ready().await.unwrap().call(()).await.unwrap();
    service.ready().await.unwrap().call(()).await.unwrap();
    assert!(ServiceExt::<()>::ready(&mut service).await.is_err());
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_shared_state_across_clones() {
    let rl = AtomicRateLimiter::new(
        "tower",
        config(1, Duration::from_secs(10), Duration::from_secs(10)).build().unwrap(),
    )
    .unwrap();
    let layer = RateLimitLayer::new(Arc::new(rl));

    let mut svc1 = layer.layer(MockService::new());
    let mut svc2 = layer.layer(MockService::new());

    svc1.ready().await.unwrap().call(()).await.unwrap();

    // svc2 reserved the next cycle's permit and is sleeping until then
    assert!(futures::poll!(svc2.ready()).is_pending());
}

#[tokio::test]
async fn test_dynamic_limiter() {
    let limiter: Arc<dyn RateLimiter> = Arc::new(
        RefillRateLimiter::new(
            "tower",
            config(1, Duration::from_secs(60), Duration::ZERO).build().unwrap(),
        )
        .unwrap(),
    );

    let mut service = RateLimitLayer::new(limiter).layer(MockService::new());
    ServiceExt::<()>::ready(&mut service).await.unwrap();
    service.call(()).await.unwrap();
    assert!(ServiceExt::<()>::ready(&mut service).await.is_err());
}

#[tokio::test]
async fn test_unsupported_limiter() {
    let limiter = Arc::new(
        SemaphoreRateLimiter::new(
            "semaphore",
            config(1, Duration::from_secs(60), Duration::ZERO).build().unwrap(),
        )
        .unwrap(),
    );
    let mut service = RateLimitService::new(MockService::new(), Arc::clone(&limiter));

    let err = ServiceExt::<()>::ready(&mut service).await.unwrap_err();
    assert_eq!(
        permit_error(&err),
        Some(&PermitError::Unsupported {
            name: "semaphore".to_string(),
            operation: "reserve_permission",
        })
    );
    limiter.shutdown();
}

#[tokio::test]
async fn test_drains_on_inner_error() {
    let limiter = frozen::<permit_limit::FixedCycle>(
        config(5, Duration::from_secs(1), Duration::ZERO).drain_permissions_on_error(true),
    );
    let (mock, mut handle) = tower_test::mock::pair::<(), ()>();
    let mut service = RateLimitService::new(mock, Arc::clone(&limiter));

    ServiceExt::<()>::ready(&mut service).await.unwrap();
    let response = service.call(());
    let (_, send) = handle.next_request().await.unwrap();
    send.send_error("backend failed");

    assert!(response.await.is_err());
    assert_eq!(limiter.metrics().available_permissions, 0);
}

#[tokio::test]
async fn test_keeps_permits_on_inner_error_by_default() {
    let limiter = frozen::<permit_limit::FixedCycle>(config(5, Duration::from_secs(1), Duration::ZERO));
    let (mock, mut handle) = tower_test::mock::pair::<(), ()>();
    let mut service = RateLimitService::new(mock, Arc::clone(&limiter));

    ServiceExt::<()>::ready(&mut service).await.unwrap();
    let response = service.call(());
    let (_, send) = handle.next_request().await.unwrap();
    send.send_error("backend failed");

    assert!(response.await.is_err());
    assert_eq!(limiter.metrics().available_permissions, 4);
}

#[tokio::test]
async fn test_concurrent_hammer() {
    let capacity = 50;
    let limiter = Arc::new(
        AtomicRateLimiter::new(
            "tower",
            config(capacity, Duration::from_secs(60), Duration::ZERO).build().unwrap(),
        )
        .unwrap(),
    );

    let mock = MockService::new();
    let mock_count = Arc::clone(&mock.count);
    let service = RateLimitService::new(mock, limiter);

    let handles: Vec<_> = (0..100)
        .map(|_| {
            let mut svc = service.clone();
            tokio::spawn(async move { svc.ready().await?.call(()).await })
        })
        .collect();

    let mut success = 0;
    let mut failure = 0;
    for h in handles {
        match h.await.expect("Task panicked") {
            Ok(()) => success += 1,
            Err(_) => failure += 1,
        }
    }

    assert_eq!(success, capacity);
    assert_eq!(failure, 100 - capacity);
    assert_eq!(mock_count.load(Ordering::SeqCst), capacity as usize);
}

fn metric_data<'a>(metrics: &'a ResourceMetrics, name: &str) -> &'a AggregatedMetrics {
    metrics
        .scope_metrics()
        .flat_map(|scope| scope.metrics())
        .find(|metric| metric.name() == name)
        .map(|metric| metric.data())
        .unwrap_or_else(|| panic!("no metric named {name}"))
}

fn attribute(attributes: &mut dyn Iterator<Item = &KeyValue>, key: &str) -> String {
    Iterator::find(&mut &mut *attributes, |kv| kv.key.as_str() == key)
        .map(|kv| kv.value.as_str().to_string())
        .unwrap_or_default()
}

fn gauge_value(metrics: &ResourceMetrics, name: &str) -> i64 {
    match metric_data(metrics, name) {
        AggregatedMetrics::I64(MetricData::Gauge(gauge)) => gauge
            .data_points()
            .next()
            .map(|point| point.value())
            .expect("Gauge has no data point"),
        _ => panic!("{name} is not an i64 gauge"),
    }
}

#[tokio::test]
async fn test_metrics_follow_events() {
    let limiter = frozen::<permit_limit::FixedCycle>(config(3, Duration::from_secs(1), Duration::ZERO));
    assert!(!limiter.event_publisher().has_consumers());

    let exporter = InMemoryMetricExporter::default();
    let provider = SdkMeterProvider::builder()
        .with_reader(PeriodicReader::builder(exporter.clone()).build())
        .build();
    let meter = provider.meter("tower-permit-test");
    let _metrics = LimiterMetrics::register(&meter, Arc::clone(&limiter));
    assert!(limiter.event_publisher().has_consumers());

    let mut service =
        RateLimitService::new(MockService::new(), Arc::clone(&limiter)).with_permits_per_request(2);
    ServiceExt::<()>::ready(&mut service).await.unwrap();
    service.call(()).await.unwrap();
    assert!(ServiceExt::<()>::ready(&mut service).await.is_err());

    provider.force_flush().unwrap();
    let exported = exporter.get_finished_metrics().unwrap();
    let latest = exported.last().expect("Nothing was exported");

    let mut calls = HashMap::new();
    match metric_data(latest, "ratelimiter.calls") {
        AggregatedMetrics::U64(MetricData::Sum(sum)) => {
            for point in sum.data_points() {
                assert_eq!(attribute(&mut point.attributes(), "name"), "tower");
                calls.insert(attribute(&mut point.attributes(), "kind"), point.value());
            }
        }
        _ => panic!("ratelimiter.calls is not a u64 sum"),
    }
    assert_eq!(
        calls,
        HashMap::from([
            ("successful_acquire".to_string(), 1),
            ("failed_acquire".to_string(), 1),
        ])
    );

    assert_eq!(gauge_value(latest, "ratelimiter.available_permissions"), 1);
    assert_eq!(gauge_value(latest, "ratelimiter.waiting_threads"), 0);
    assert_eq!(limiter.metrics().available_permissions, 1);

    provider.shutdown().unwrap();
}
