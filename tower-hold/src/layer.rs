use std::sync::Arc;
use std::time::Duration;

use hold_limit::Limiter;
use tower::Layer;

use crate::service::LimitService;

/// Admits requests through a shared [`Limiter`] before they reach the inner
/// service.
#[derive(Debug)]
pub struct LimitLayer<L> {
    limiter: Arc<L>,
    fail_fast: bool,
    timeout: Option<Duration>,
}

impl<L> Clone for LimitLayer<L> {
    fn clone(&self) -> Self {
        Self {
            limiter: Arc::clone(&self.limiter),
            fail_fast: self.fail_fast,
            timeout: self.timeout,
        }
    }
}

impl<L> LimitLayer<L>
where
    L: Limiter,
{
    /// Create a LimitLayer
    pub fn new(limiter: Arc<L>) -> Self {
        LimitLayer {
            limiter,
            fail_fast: false,
            timeout: None,
        }
    }

    /// Set whether requests are rejected instead of waiting for capacity.
    ///
    /// If `true`, the service returns `HoldError::RateLimited` immediately
    /// when the limiter has no room.
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Bound how long a request may wait for admission.
    ///
    /// If admission takes longer, the service returns `HoldError::Timeout`.
    /// Ignored when fail-fast is set.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl<L, S> Layer<S> for LimitLayer<L> {
    type Service = LimitService<L, S>;

    fn layer(&self, service: S) -> Self::Service {
        let mut svc = LimitService::new(service, self.limiter.clone()).with_fail_fast(self.fail_fast);
        if let Some(timeout) = self.timeout {
            svc = svc.with_timeout(timeout);
        }
        svc
    }
}
