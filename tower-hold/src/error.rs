use hold_limit::LimitError;

/// Errors produced by the hold middleware.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HoldError {
    /// The request waited for capacity longer than the configured timeout.
    ///
    /// When the `axum` feature is enabled, this converts to `408 Request Timeout`.
    #[error("Request timed out waiting for rate limit capacity")]
    Timeout,

    /// The limiter has no room to even queue the request.
    ///
    /// Raised when a leaky bucket's queue is full. When the `axum` feature is
    /// enabled, this converts to `503 Service Unavailable`.
    #[error("Service is overloaded; request shed")]
    Overloaded,

    /// The request was rejected without waiting.
    ///
    /// The duration indicates when the client should retry.
    /// When the `axum` feature is enabled, this converts to `429 Too Many Requests`
    /// with a `Retry-After` header.
    #[error("Rate limit exceeded; retry after {retry_after:?}")]
    RateLimited {
        /// The duration to wait before retrying.
        retry_after: std::time::Duration,
    },

    /// An unexpected error occurred while admitting the request.
    ///
    /// When the `axum` feature is enabled, this converts to `500 Internal Server Error`.
    #[error("Internal service error: {0}")]
    Inner(String),
}

impl HoldError {
    /// Short label used when recording rejections.
    pub(crate) fn reason(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Overloaded => "overloaded",
            Self::RateLimited { .. } => "rate_limited",
            Self::Inner(_) => "inner",
        }
    }
}

impl From<LimitError> for HoldError {
    fn from(err: LimitError) -> Self {
        match err {
            LimitError::Timeout => Self::Timeout,
            LimitError::QueueFull => Self::Overloaded,
            LimitError::Canceled => Self::Inner(err.to_string()),
        }
    }
}

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for HoldError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let (status, msg, headers) = match self {
            Self::Overloaded => (StatusCode::SERVICE_UNAVAILABLE, self.to_string(), None),
            Self::Timeout => (StatusCode::REQUEST_TIMEOUT, self.to_string(), None),
            Self::RateLimited { retry_after } => {
                let secs = retry_after.as_secs().max(1);
                let val = http::HeaderValue::from(secs);
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    self.to_string(),
                    Some((http::header::RETRY_AFTER, val)),
                )
            }
            Self::Inner(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string(), None),
        };

        let mut response = (status, msg).into_response();
        if let Some((name, value)) = headers {
            response.headers_mut().insert(name, value);
        }
        response
    }
}
