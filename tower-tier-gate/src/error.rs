use std::time::Duration;

/// Errors produced by the admission middleware stack.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    /// The principal used up its tier's quota.
    ///
    /// When the `axum` feature is enabled, this converts to `429 Too Many Requests`
    /// with a `Retry-After` header.
    #[error("Rate limit of tier {tier} exceeded; retry after {retry_after:?}")]
    RateLimited {
        tier: String,
        /// The duration to wait before retrying.
        retry_after: Duration,
    },

    /// The shared store could not be consulted and the gate fails closed.
    ///
    /// When the `axum` feature is enabled, this converts to `503 Service Unavailable`.
    #[error("Shared store unavailable")]
    StoreUnavailable,

    /// The request did not complete within the maximum allowed time.
    ///
    /// When the `axum` feature is enabled, this converts to `408 Request Timeout`.
    #[error("Request timed out")]
    Timeout,

    /// The service is at peak capacity; the request was shed.
    ///
    /// When the `axum` feature is enabled, this converts to `503 Service Unavailable`.
    #[error("Service is overloaded; request shed")]
    Overloaded,

    /// The application handler failed.
    ///
    /// The string contains the `Display` representation of the handler's error.
    /// When the `axum` feature is enabled, this converts to `500 Internal Server Error`.
    #[error("Handler error: {0}")]
    Handler(String),

    /// A background admission task could not complete.
    #[error("Internal gate error: {0}")]
    Internal(String),
}

impl GateError {
    /// Whole seconds to advertise in `Retry-After`, rounded up and at least one.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after, .. } => {
                let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
                Some(secs.max(1))
            }
            _ => None,
        }
    }
}

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for GateError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match self {
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::StoreUnavailable | Self::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout => StatusCode::REQUEST_TIMEOUT,
            Self::Handler(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let retry_after = self.retry_after_secs();

        let mut response = (status, self.to_string()).into_response();
        if let Some(secs) = retry_after {
            response.headers_mut().insert(
                axum::http::header::RETRY_AFTER,
                axum::http::HeaderValue::from(secs),
            );
        }
        response
    }
}
