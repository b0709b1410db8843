//! # Tower Permit
//!
//! `tower-permit` puts a [`permit_limit`] rate limiter in front of a
//! [Tower](https://github.com/tower-rs/tower) service.
//!
//! ## Reserve, Then Sleep
//!
//! The limiters in `permit-limit` block the calling thread when permits lie in
//! the future, which an async runtime cannot afford. [`RateLimitService`]
//! instead calls `reserve_permission` from `poll_ready`:
//!
//! 1. **Available**: the service is ready straight away.
//! 2. **Reserved**: the permits are taken now and the service sleeps on the
//!    tokio timer until they are due.
//! 3. **Refused**: the wait would exceed the limiter's timeout, and
//!    `poll_ready` fails with [`PermitError::RequestNotPermitted`].
//!
//! Limiters that cannot reserve (the semaphore variant) fail with
//! [`PermitError::Unsupported`].
//!
//! [`LimiterMetrics`] exports a limiter's state and decisions through
//! OpenTelemetry.
//!
//! ## Feature Flags
//!
//! - `axum`: Enables `IntoResponse` for [`PermitError`], allowing automatic conversion
//!   to HTTP status codes (429, 500).

mod error;
mod layer;
mod metrics;
mod service;

#[cfg(test)]
mod tests;

pub use error::PermitError;
pub use layer::RateLimitLayer;
pub use metrics::LimiterMetrics;
pub use service::RateLimitService;
pub use service::ResponseFuture;
