use permit_limit::RateLimiterError;

/// Errors produced by the permit middleware.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PermitError {
    /// The limiter could not grant the request's permits within its timeout.
    ///
    /// When the `axum` feature is enabled, this converts to `429 Too Many Requests`.
    #[error("RateLimiter '{name}' does not permit further calls")]
    RequestNotPermitted { name: String },

    /// The limiter cannot reserve permits ahead, which the middleware needs
    /// to stay non-blocking.
    ///
    /// When the `axum` feature is enabled, this converts to `500 Internal Server Error`.
    #[error("{operation} is not supported by RateLimiter '{name}'")]
    Unsupported {
        name: String,
        operation: &'static str,
    },
}

impl PermitError {
    pub(crate) fn from_limiter(name: &str, error: RateLimiterError) -> Self {
        match error {
            RateLimiterError::Unsupported { operation } => Self::Unsupported {
                name: name.to_string(),
                operation,
            },
            RateLimiterError::RequestNotPermitted { name } | RateLimiterError::Cancelled { name } => {
                Self::RequestNotPermitted { name }
            }
        }
    }
}

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for PermitError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match self {
            Self::RequestNotPermitted { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Unsupported { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}
