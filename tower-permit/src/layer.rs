use std::sync::Arc;

use permit_limit::RateLimiter;
use tower::Layer;

use crate::service::RateLimitService;

/// Applies a [`RateLimiter`] to requests.
#[derive(Debug)]
pub struct RateLimitLayer<L>
where
    L: ?Sized,
{
    limiter: Arc<L>,
    permits: u32,
}

impl<L> Clone for RateLimitLayer<L>
where
    L: ?Sized,
{
    fn clone(&self) -> Self {
        Self {
            limiter: Arc::clone(&self.limiter),
            permits: self.permits,
        }
    }
}

impl<L> RateLimitLayer<L>
where
    L: RateLimiter + ?Sized,
{
    /// Create a RateLimitLayer. Services built from it share `limiter`.
    pub fn new(limiter: Arc<L>) -> Self {
        RateLimitLayer {
            limiter,
            permits: 1,
        }
    }

    /// Set how many permits each request costs.
    pub fn with_permits_per_request(mut self, permits: u32) -> Self {
        self.permits = permits;
        self
    }
}

impl<L, S> Layer<S> for RateLimitLayer<L>
where
    L: ?Sized,
{
    type Service = RateLimitService<L, S>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService::new(service, Arc::clone(&self.limiter))
            .with_permits_per_request(self.permits)
    }
}
