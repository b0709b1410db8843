use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::SystemTime;

use parking_lot::RwLock;

/// What happened to a request for permits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimiterEventKind {
    /// The permits were granted, possibly after a wait.
    Success,
    /// The permits were refused, because of a timeout or an interrupt.
    Failure,
    /// The limiter was drained; `permits` is the number removed.
    Drained,
}

impl RateLimiterEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "successful_acquire",
            Self::Failure => "failed_acquire",
            Self::Drained => "drained",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterEvent {
    pub limiter_name: String,
    pub kind: RateLimiterEventKind,
    pub permits: u32,
    pub created_at: SystemTime,
}

impl fmt::Display for RateLimiterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RateLimiter '{}' {} {} permit(s)",
            self.limiter_name,
            self.kind.as_str(),
            self.permits
        )
    }
}

type Consumer = Arc<dyn Fn(&RateLimiterEvent) + Send + Sync>;

/// Fan-out of limiter events to registered consumers.
///
/// Events are only built when somebody listens: publishing checks an atomic
/// flag before touching the consumer list.
#[derive(Default)]
pub struct EventPublisher {
    has_consumers: AtomicBool,
    consumers: RwLock<Vec<(Option<RateLimiterEventKind>, Consumer)>>,
}

impl fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPublisher")
            .field("consumers", &self.consumers.read().len())
            .finish()
    }
}

impl EventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every event.
    pub fn on_event<F>(&self, consumer: F) -> &Self
    where
        F: Fn(&RateLimiterEvent) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(consumer))
    }

    pub fn on_success<F>(&self, consumer: F) -> &Self
    where
        F: Fn(&RateLimiterEvent) + Send + Sync + 'static,
    {
        self.register(Some(RateLimiterEventKind::Success), Arc::new(consumer))
    }

    pub fn on_failure<F>(&self, consumer: F) -> &Self
    where
        F: Fn(&RateLimiterEvent) + Send + Sync + 'static,
    {
        self.register(Some(RateLimiterEventKind::Failure), Arc::new(consumer))
    }

    pub fn on_drained<F>(&self, consumer: F) -> &Self
    where
        F: Fn(&RateLimiterEvent) + Send + Sync + 'static,
    {
        self.register(Some(RateLimiterEventKind::Drained), Arc::new(consumer))
    }

    pub fn has_consumers(&self) -> bool {
        self.has_consumers.load(Ordering::Acquire)
    }

    fn register(&self, kind: Option<RateLimiterEventKind>, consumer: Consumer) -> &Self {
        self.consumers.write().push((kind, consumer));
        self.has_consumers.store(true, Ordering::Release);
        self
    }

    /// Build and dispatch an event, unless nobody is listening.
    pub(crate) fn publish(&self, name: &str, kind: RateLimiterEventKind, permits: u32) {
        if !self.has_consumers() {
            return;
        }
        let event = RateLimiterEvent {
            limiter_name: name.to_string(),
            kind,
            permits,
            created_at: SystemTime::now(),
        };
        // Consumers run outside the lock so they may register more consumers.
        let consumers: Vec<Consumer> = self
            .consumers
            .read()
            .iter()
            .filter(|(filter, _)| filter.is_none_or(|k| k == kind))
            .map(|(_, consumer)| Arc::clone(consumer))
            .collect();
        for consumer in consumers {
            consumer(&event);
        }
    }

    pub(crate) fn publish_acquisition(&self, name: &str, acquired: bool, permits: u32) {
        let kind = if acquired {
            RateLimiterEventKind::Success
        } else {
            RateLimiterEventKind::Failure
        };
        self.publish(name, kind, permits);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn it_routes_events_by_kind() {
        let publisher = EventPublisher::new();
        assert!(!publisher.has_consumers());

        let all = Arc::new(Mutex::new(Vec::new()));
        let failures = Arc::new(Mutex::new(Vec::new()));
        let all_clone = Arc::clone(&all);
        let failures_clone = Arc::clone(&failures);
        publisher
            .on_event(move |e| all_clone.lock().unwrap().push(e.kind))
            .on_failure(move |e| failures_clone.lock().unwrap().push(e.permits));
        assert!(publisher.has_consumers());

        publisher.publish_acquisition("test", true, 1);
        publisher.publish_acquisition("test", false, 3);
        publisher.publish("test", RateLimiterEventKind::Drained, 7);

        assert_eq!(
            *all.lock().unwrap(),
            vec![
                RateLimiterEventKind::Success,
                RateLimiterEventKind::Failure,
                RateLimiterEventKind::Drained
            ]
        );
        assert_eq!(*failures.lock().unwrap(), vec![3]);
    }

    #[test]
    fn test_event_display() {
        let event = RateLimiterEvent {
            limiter_name: "backend".to_string(),
            kind: RateLimiterEventKind::Success,
            permits: 2,
            created_at: SystemTime::now(),
        };
        assert_eq!(
            event.to_string(),
            "RateLimiter 'backend' successful_acquire 2 permit(s)"
        );
    }
}
