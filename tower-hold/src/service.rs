use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use futures::future::BoxFuture;
use hold_limit::Limiter;
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use tokio::time::Instant;
use tower::BoxError;
use tower::Service;

use crate::error::HoldError;

#[derive(Clone, Debug)]
struct LimitServiceMetrics {
    rejected: Counter<u64>,
}

/// Waits for admission from a [`Limiter`], then calls the inner service.
#[derive(Debug)]
pub struct LimitService<L, S> {
    inner: S,
    limiter: Arc<L>,
    fail_fast: bool,
    timeout: Option<Duration>,
    instruments: LimitServiceMetrics,
}

impl<L, S> Clone for LimitService<L, S>
where
    S: Clone,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: Arc::clone(&self.limiter),
            fail_fast: self.fail_fast,
            timeout: self.timeout,
            instruments: self.instruments.clone(),
        }
    }
}

impl<L, S> LimitService<L, S> {
    pub fn new(inner: S, limiter: Arc<L>) -> Self {
        let meter = global::meter("limit_service");
        let instruments = LimitServiceMetrics {
            rejected: meter.u64_counter("rejected").build(),
        };

        Self {
            inner,
            limiter,
            fail_fast: false,
            timeout: None,
            instruments,
        }
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

async fn admit<L>(limiter: &L, fail_fast: bool, timeout: Option<Duration>) -> Result<(), HoldError>
where
    L: Limiter,
{
    if fail_fast {
        if limiter.allow() {
            return Ok(());
        }
        let retry_after = limiter
            .stats()
            .next_allowed
            .saturating_duration_since(Instant::now());
        return Err(HoldError::RateLimited { retry_after });
    }

    match timeout {
        Some(timeout) => limiter.wait_timeout(timeout).await?,
        // A plain wait() would swallow a full leaky queue.
        None => limiter.wait_cancellable(std::future::pending()).await?,
    }
    Ok(())
}

impl<L, S, Req> Service<Req> for LimitService<L, S>
where
    L: Limiter + 'static,
    S: Service<Req, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<S::Response, BoxError>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        // The readied service goes into the future; a fresh clone stays behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let limiter = Arc::clone(&self.limiter);
        let fail_fast = self.fail_fast;
        let timeout = self.timeout;
        let rejected = self.instruments.rejected.clone();

        Box::pin(async move {
            if let Err(err) = admit(limiter.as_ref(), fail_fast, timeout).await {
                tracing::debug!(reason = err.reason(), error = %err, "request rejected");
                rejected.add(
                    1,
                    &[
                        KeyValue::new("strategy", std::any::type_name::<L>()),
                        KeyValue::new("reason", err.reason()),
                    ],
                );
                return Err(Box::new(err) as BoxError);
            }
            inner.call(req).await
        })
    }
}
