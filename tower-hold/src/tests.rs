use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use hold_limit::LeakyBucket;
use hold_limit::LimitError;
use hold_limit::Limiter;
use hold_limit::SlidingWindow;
use hold_limit::TokenBucket;
use tokio::time::Instant;
use tower::BoxError;
use tower::Layer;
use tower::Service;
use tower::ServiceBuilder;
use tower::ServiceExt;

use super::*;

use futures::future::Ready;
use futures::future::ready;

#[derive(Clone)]
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

fn nz(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap()
}

fn hold_error(err: BoxError) -> HoldError {
    *err.downcast::<HoldError>().expect("middleware errors are HoldErrors")
}

macro_rules! test_limit_service {
    ($name:ident, $limiter_init:expr, $expected_wait:expr) => {
        mod $name {
            use super::*;

            #[tokio::test(start_paused = true)]
            async fn it_waits_for_capacity() {
                let limiter = ($limiter_init)(nz(2), Duration::from_millis(200));
                let mock = MockService::new();
                let mut service = LimitService::new(mock.clone(), Arc::new(limiter));
                let start = Instant::now();

                service.ready().await.unwrap().call(()).await.unwrap();
                service.ready().await.unwrap().call(()).await.unwrap();
                assert_eq!(start.elapsed(), Duration::ZERO);

                let mut third = service.ready().await.unwrap().call(());
                assert!(futures::poll!(&mut third).is_pending());
                assert_eq!(mock.count.load(Ordering::SeqCst), 2);

                third.await.unwrap();
                assert!(start.elapsed() >= $expected_wait);
                assert_eq!(mock.count.load(Ordering::SeqCst), 3);
            }

            #[tokio::test(start_paused = true)]
            async fn it_times_out_while_waiting() {
                let limiter = ($limiter_init)(nz(1), Duration::from_secs(10));
                let mock = MockService::new();
                let mut service = LimitService::new(mock.clone(), Arc::new(limiter))
                    .with_timeout(Duration::from_millis(100));
                let start = Instant::now();

                service.ready().await.unwrap().call(()).await.unwrap();
                let err = service.ready().await.unwrap().call(()).await.unwrap_err();

                assert_eq!(hold_error(err), HoldError::Timeout);
                assert_eq!(start.elapsed(), Duration::from_millis(100));
                assert_eq!(mock.count.load(Ordering::SeqCst), 1);
            }
        }
    };
}

test_limit_service!(
    sliding_window_tests,
    SlidingWindow::new,
    Duration::from_millis(200)
);

test_limit_service!(
    token_bucket_tests,
    TokenBucket::new,
    Duration::from_millis(100)
);

#[tokio::test(start_paused = true)]
async fn test_layer_integration() {
    let limiter = SlidingWindow::new(nz(100), Duration::from_secs(1));

    let mut service = ServiceBuilder::new()
        .layer(LimitLayer::new(Arc::new(limiter)))
        .service(MockService::new());

    service.ready().await.unwrap().call(()).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn fail_fast_reports_when_to_retry() {
    let limiter = Arc::new(TokenBucket::new(nz(1), Duration::from_secs(1)));
    let mock = MockService::new();
    let mut service = LimitLayer::new(Arc::clone(&limiter))
        .with_fail_fast(true)
        .layer(mock.clone());

    service.ready().await.unwrap().call(()).await.unwrap();
    let err = service.ready().await.unwrap().call(()).await.unwrap_err();

    assert_eq!(
        hold_error(err),
        HoldError::RateLimited {
            retry_after: Duration::from_secs(1)
        }
    );
    assert_eq!(mock.count.load(Ordering::SeqCst), 1);

    let stats = limiter.stats();
    assert_eq!(stats.allowed, 1);
    assert_eq!(stats.denied, 1);
}

#[tokio::test(start_paused = true)]
async fn fail_fast_ignores_the_timeout() {
    let limiter = SlidingWindow::new(nz(1), Duration::from_secs(5));
    let mut service = LimitLayer::new(Arc::new(limiter))
        .with_fail_fast(true)
        .with_timeout(Duration::from_secs(60))
        .layer(MockService::new());
    let start = Instant::now();

    service.ready().await.unwrap().call(()).await.unwrap();
    let err = service.ready().await.unwrap().call(()).await.unwrap_err();

    assert!(matches!(hold_error(err), HoldError::RateLimited { .. }));
    assert_eq!(start.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_shared_state_across_clones() {
    let rl = SlidingWindow::new(nz(1), Duration::from_secs(10));
    let layer = LimitLayer::new(Arc::new(rl)).with_fail_fast(true);

    let mut svc1 = layer.layer(MockService::new());
    let mut svc2 = layer.clone().layer(MockService::new());

    svc1.ready().await.unwrap().call(()).await.unwrap();

    // svc2 is throttled because svc1 used the only slot
    let err = svc2.ready().await.unwrap().call(()).await.unwrap_err();
    assert!(matches!(hold_error(err), HoldError::RateLimited { .. }));
}

#[tokio::test(start_paused = true)]
async fn a_full_leaky_queue_sheds_load() {
    let limiter = LeakyBucket::new(nz(1), Duration::from_secs(1), nz(1));
    let mock = MockService::new();
    let mut service = LimitService::new(mock.clone(), Arc::new(limiter));
    let start = Instant::now();

    // Leaks straight away.
    service.ready().await.unwrap().call(()).await.unwrap();

    // Takes the only queue slot.
    let mut queued = service.ready().await.unwrap().call(());
    assert!(futures::poll!(&mut queued).is_pending());

    let err = service.ready().await.unwrap().call(()).await.unwrap_err();
    assert_eq!(hold_error(err), HoldError::Overloaded);

    queued.await.unwrap();
    assert_eq!(start.elapsed(), Duration::from_secs(1));
    assert_eq!(mock.count.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_layer_clones_share_capacity() {
    let capacity = 5;
    let limiter = SlidingWindow::new(nz(capacity), Duration::from_secs(60));

    // Wait up to 100ms before failing
    let layer = LimitLayer::new(Arc::new(limiter)).with_timeout(Duration::from_millis(100));

    let mock_count = Arc::new(AtomicUsize::new(0));
    let service = ServiceBuilder::new().layer(layer).service(MockService {
        count: mock_count.clone(),
    });

    let mut handles = vec![];

    // Fire 20 requests from 20 different clones
    for _ in 0..20 {
        let mut cloned_svc = service.clone();
        handles.push(tokio::spawn(async move {
            let ready_svc = cloned_svc.ready().await?;
            ready_svc.call(()).await
        }));
    }

    let mut success = 0;
    let mut timed_out = 0;

    for h in handles {
        match h.await.unwrap() {
            Ok(_) => success += 1,
            Err(err) => {
                assert_eq!(hold_error(err), HoldError::Timeout);
                timed_out += 1;
            }
        }
    }

    assert_eq!(success, capacity, "Should have exactly 5 successes");
    assert_eq!(timed_out, 15, "Remaining 15 should have timed out");
    assert_eq!(
        mock_count.load(Ordering::SeqCst),
        capacity,
        "Inner service should only see 5 hits"
    );
}

#[test]
fn limit_errors_map_to_hold_errors() {
    assert_eq!(HoldError::from(LimitError::Timeout), HoldError::Timeout);
    assert_eq!(HoldError::from(LimitError::QueueFull), HoldError::Overloaded);
    assert!(matches!(
        HoldError::from(LimitError::Canceled),
        HoldError::Inner(_)
    ));
}
