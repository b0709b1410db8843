use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use permit_limit::RateLimiter;
use pin_project_lite::pin_project;
use tokio::time::Sleep;
use tokio::time::sleep;
use tower::BoxError;
use tower::Service;
use tracing::trace;

use crate::error::PermitError;

/// Admits requests through a [`RateLimiter`] without blocking the runtime.
///
/// `poll_ready` reserves the request's permits. If they lie in the future
/// the service sleeps on the tokio timer for the reserved wait; the permits
/// are already paid for, so no second attempt is made after waking.
#[derive(Debug)]
pub struct RateLimitService<L, S>
where
    L: ?Sized,
{
    inner: S,
    limiter: Arc<L>,
    permits: u32,
    sleep: Option<Pin<Box<Sleep>>>,
    permit_acquired: bool,
}

pin_project! {
    /// Response future that drains the limiter when the inner service fails
    /// and the limiter asks for it.
    pub struct ResponseFuture<F, L: ?Sized> {
        #[pin]
        inner: F,
        drain_on_error: Option<Arc<L>>,
    }
}

impl<F, T, L> Future for ResponseFuture<F, L>
where
    F: Future<Output = Result<T, BoxError>>,
    L: RateLimiter + ?Sized,
{
    type Output = Result<T, BoxError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let result = std::task::ready!(this.inner.poll(cx));
        if result.is_err()
            && let Some(limiter) = this.drain_on_error.take()
        {
            limiter.drain_permissions();
        }
        Poll::Ready(result)
    }
}

// Manually implement Clone because Pin<Box<Sleep>> cannot be cloned
impl<L, S> Clone for RateLimitService<L, S>
where
    L: ?Sized,
    S: Clone,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: Arc::clone(&self.limiter),
            permits: self.permits,
            // a clone has not reserved anything yet
            sleep: None,
            permit_acquired: false,
        }
    }
}

impl<L, S, Req> Service<Req> for RateLimitService<L, S>
where
    L: RateLimiter + ?Sized + 'static,
    S: Service<Req, Error = BoxError>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future, L>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // 1. Finish the wait for an earlier reservation
        if let Some(fut) = self.sleep.as_mut() {
            match fut.as_mut().poll(cx) {
                Poll::Ready(()) => self.sleep = None,
                Poll::Pending => return Poll::Pending,
            }
        }

        if !self.permit_acquired {
            // 2. Check inner service readiness FIRST to avoid reserving for
            // a request that cannot be sent
            match self.inner.poll_ready(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(())) => {}
            }

            // 3. Reserve
            let nanos_to_wait = match self.limiter.reserve_permission(self.permits) {
                Ok(nanos) if nanos >= 0 => nanos,
                Ok(_) => {
                    return Poll::Ready(Err(Box::new(PermitError::RequestNotPermitted {
                        name: self.limiter.name().to_string(),
                    })));
                }
                Err(e) => {
                    return Poll::Ready(Err(Box::new(PermitError::from_limiter(
                        self.limiter.name(),
                        e,
                    ))));
                }
            };
            self.permit_acquired = true;

            if nanos_to_wait > 0 {
                trace!(
                    name = self.limiter.name(),
                    nanos_to_wait,
                    "waiting for reserved permits"
                );
                let mut sleep_fut = Box::pin(sleep(Duration::from_nanos(nanos_to_wait as u64)));
                if sleep_fut.as_mut().poll(cx).is_pending() {
                    self.sleep = Some(sleep_fut);
                    return Poll::Pending;
                }
            }
        }

        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        self.permit_acquired = false;
        let drain_on_error = self
            .limiter
            .config()
            .drain_permissions_on_error()
            .then(|| Arc::clone(&self.limiter));

        ResponseFuture {
            inner: self.inner.call(req),
            drain_on_error,
        }
    }
}

impl<L, S> RateLimitService<L, S>
where
    L: ?Sized,
{
    pub fn new(inner: S, limiter: Arc<L>) -> Self {
        Self {
            inner,
            limiter,
            permits: 1,
            sleep: None,
            permit_acquired: false,
        }
    }

    /// Set how many permits each request costs. Defaults to 1.
    pub fn with_permits_per_request(mut self, permits: u32) -> Self {
        self.permits = permits;
        self
    }

    pub fn limiter(&self) -> &Arc<L> {
        &self.limiter
    }
}
