//! # hold-limit
//!
//! `hold-limit` provides interchangeable rate limiting strategies behind a single
//! [`Limiter`] contract. Every strategy can admit an event now, make the caller
//! wait for it, deny it, or hand out a [`Reservation`] that is committed or
//! canceled later.
//!
//! ## Core Philosophy
//!
//! Each limiter guards all of its state with one lock. Time-derived state (log
//! expiry, token refill, queue leaks) is recomputed lazily under that lock on
//! every access, so there are no background tasks or timers to drive progress.
//! Waiting callers never sleep holding the lock: they compute when to retry,
//! release it, race a tokio timer against their deadline and cancellation
//! future, and then re-evaluate from scratch.
//!
//! ## Strategies
//!
//! * [`SlidingWindow`]: an exact log of admission times over a rolling window.
//! * [`TokenBucket`]: a bucket of tokens refilled at `window / capacity`.
//! * [`LeakyBucket`]: a bounded queue that releases one event every
//!   `window / capacity`.
//!
//! Waiting is fair in the weak sense only: a newer waiter may be admitted ahead
//! of an older one if it reacquires the lock first.
//!
//! ## Example
//!
//! ```rust
//! use hold_limit::Limiter;
//! use hold_limit::TokenBucket;
//! use std::num::NonZeroUsize;
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let limit = NonZeroUsize::new(100).unwrap();
//! let bucket = TokenBucket::new(limit, Duration::from_secs(60));
//!
//! if bucket.allow() {
//!     // Request allowed
//! }
//!
//! let mut reservation = bucket.reserve(Some(Duration::from_secs(5))).await.unwrap();
//! // ... prepare the work ...
//! reservation.consume().await.unwrap();
//! # }
//! ```

use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

mod config;
mod error;
mod leaky_bucket;
mod ledger;
mod reservation;
mod sliding_window;
mod stats;
mod token_bucket;
mod wait;

pub use config::AnyLimiter;
pub use config::LimiterConfig;
pub use error::ConfigError;
pub use error::LimitError;
pub use error::ReservationError;
pub use leaky_bucket::LeakyBucket;
pub use reservation::Reservation;
pub use sliding_window::SlidingWindow;
pub use stats::Stats;
pub use token_bucket::TokenBucket;

/// The contract shared by every rate-limiting strategy.
///
/// Limiters are cheap to clone and safe to share; all clones observe the same
/// state. Blocking operations suspend the calling task, never the lock.
pub trait Limiter: Debug + Send + Sync {
    /// Wait, without a deadline, until an event is admitted.
    ///
    /// The leaky bucket rejects outright when its queue is full; that
    /// rejection is counted as a denial and otherwise ignored here.
    fn wait(&self) -> impl Future<Output = ()> + Send;

    /// Wait until an event is admitted or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// [`LimitError::Timeout`] if the timeout elapsed first, and
    /// [`LimitError::QueueFull`] for a leaky bucket whose queue is full.
    fn wait_timeout(&self, timeout: Duration)
    -> impl Future<Output = Result<(), LimitError>> + Send;

    /// Wait until an event is admitted or `cancel` resolves.
    ///
    /// # Errors
    ///
    /// [`LimitError::Canceled`] if `cancel` resolved first, and
    /// [`LimitError::QueueFull`] for a leaky bucket whose queue is full.
    fn wait_cancellable<C>(&self, cancel: C) -> impl Future<Output = Result<(), LimitError>> + Send
    where
        C: Future<Output = ()> + Send;

    /// Admit an event if that is possible right now.
    ///
    /// This is not a side-effect free probe: `true` means the event has been
    /// admitted and counted, exactly as if a wait had succeeded.
    fn allow(&self) -> bool;

    /// Reset capacity and time-derived state and cancel every pending
    /// reservation. The allowed/denied counters are kept.
    fn clear(&self);

    /// Snapshot the allowed/denied counters and the next expected admission.
    fn stats(&self) -> Stats;

    /// Wait, without a deadline, for a reservation. The reservation expires
    /// after `ttl` if one is given.
    ///
    /// # Errors
    ///
    /// Only [`LimitError::QueueFull`], from a leaky bucket whose queue is full.
    fn reserve(
        &self,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<Reservation, LimitError>> + Send;

    /// Wait up to `timeout` for a reservation.
    ///
    /// # Errors
    ///
    /// As for [`wait_timeout`](Self::wait_timeout).
    fn reserve_timeout(
        &self,
        timeout: Duration,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<Reservation, LimitError>> + Send;

    /// Wait for a reservation until `cancel` resolves.
    ///
    /// # Errors
    ///
    /// As for [`wait_cancellable`](Self::wait_cancellable).
    fn reserve_cancellable<C>(
        &self,
        cancel: C,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<Reservation, LimitError>> + Send
    where
        C: Future<Output = ()> + Send;
}
