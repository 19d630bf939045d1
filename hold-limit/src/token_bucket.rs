use std::future::Future;
use std::future::pending;
use std::num::NonZeroUsize;
use std::pin::pin;
use std::time::Duration;

use parking_lot::MutexGuard;
use tokio::time::Instant;
use tracing::debug;
use tracing::trace;

use crate::LimitError;
use crate::Limiter;
use crate::Reservation;
use crate::ReservationError;
use crate::Stats;
use crate::ledger::Ledger;
use crate::ledger::Shared;
use crate::ledger::Ticket;
use crate::ledger::interval;
use crate::reservation::Owner;
use crate::wait::deadline_after;
use crate::wait::pause;

const STRATEGY: &str = "token_bucket";

/// A Token Bucket implementation.
///
/// The bucket starts full and regains one token every `window / capacity`.
/// Pending reservations are tracked separately from the token count: they
/// block admission while pending but only spend a token when consumed.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: usize,
    refill_rate: Duration,
    pub(crate) shared: Shared<Tokens>,
}

#[derive(Debug)]
pub(crate) struct Tokens {
    remaining: usize,
    last_refill: Instant,
}

impl TokenBucket {
    /// # Panics
    ///
    /// Panics if `window` is zero.
    pub fn new(capacity: NonZeroUsize, window: Duration) -> Self {
        assert!(!window.is_zero(), "window must be greater than zero");
        Self {
            capacity: capacity.get(),
            refill_rate: interval(window, capacity),
            shared: Ledger::shared(Tokens {
                remaining: capacity.get(),
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The time it takes to regenerate a single token.
    pub fn refill_rate(&self) -> Duration {
        self.refill_rate
    }

    /// Lock the state and add the tokens generated since the last refill.
    fn refresh(&self, now: Instant) -> MutexGuard<'_, Ledger<Tokens>> {
        let mut ledger = self.shared.lock();
        self.refill(&mut ledger.core, now);
        ledger.holds.prune(now);
        ledger
    }

    fn refill(&self, tokens: &mut Tokens, now: Instant) {
        let elapsed = now.duration_since(tokens.last_refill);
        let intervals = elapsed.as_nanos() / self.refill_rate.as_nanos();
        if intervals == 0 {
            // Leave last_refill alone so partial progress is not lost
            return;
        }

        let added = usize::try_from(intervals).unwrap_or(usize::MAX);
        let remaining = tokens.remaining.saturating_add(added);
        if remaining >= self.capacity {
            tokens.remaining = self.capacity;
            tokens.last_refill = now;
        } else {
            tokens.remaining = remaining;
            // Advance the clock by the exact intervals consumed
            tokens.last_refill +=
                Duration::from_nanos((self.refill_rate.as_nanos() * intervals) as u64);
        }
    }

    fn has_token(ledger: &Ledger<Tokens>) -> bool {
        ledger.core.remaining > ledger.holds.len()
    }

    fn retry_at(&self, ledger: &Ledger<Tokens>) -> Instant {
        let refill = ledger.core.last_refill + self.refill_rate;
        ledger
            .holds
            .next_expiry()
            .map_or(refill, |expiry| expiry.min(refill))
    }

    async fn admit<C>(&self, deadline: Option<Instant>, cancel: C) -> Result<(), LimitError>
    where
        C: Future<Output = ()>,
    {
        let mut cancel = pin!(cancel);
        loop {
            let wake = {
                let mut ledger = self.refresh(Instant::now());
                if Self::has_token(&ledger) {
                    ledger.core.remaining -= 1;
                    ledger.counters.admit();
                    trace!(strategy = STRATEGY, remaining = ledger.core.remaining, "admitted");
                    return Ok(());
                }
                self.retry_at(&ledger)
            };

            if let Err(err) = pause(wake, deadline, &mut cancel).await {
                self.shared.lock().counters.deny();
                debug!(strategy = STRATEGY, %err, "gave up waiting");
                return Err(err);
            }
        }
    }

    async fn hold<C>(
        &self,
        deadline: Option<Instant>,
        cancel: C,
        ttl: Option<Duration>,
    ) -> Result<Reservation, LimitError>
    where
        C: Future<Output = ()>,
    {
        let mut cancel = pin!(cancel);
        loop {
            let wake = {
                let now = Instant::now();
                let mut ledger = self.refresh(now);
                if Self::has_token(&ledger) {
                    let ticket = ledger.holds.issue(ttl, now);
                    trace!(strategy = STRATEGY, pending = ledger.holds.len(), "reserved");
                    return Ok(Reservation::new(ticket, Owner::TokenBucket(self.clone())));
                }
                self.retry_at(&ledger)
            };

            if let Err(err) = pause(wake, deadline, &mut cancel).await {
                self.shared.lock().counters.deny();
                debug!(strategy = STRATEGY, %err, "gave up waiting for a reservation");
                return Err(err);
            }
        }
    }

    /// The token is only spent now, at commit time.
    pub(crate) fn commit(&self, ticket: &mut Ticket) -> Result<(), ReservationError> {
        let now = Instant::now();
        let mut ledger = self.refresh(now);
        ledger.settle(ticket, now)?;
        ledger.core.remaining = ledger.core.remaining.saturating_sub(1);
        ledger.counters.admit();
        trace!(strategy = STRATEGY, remaining = ledger.core.remaining, "reservation consumed");
        Ok(())
    }
}

impl Limiter for TokenBucket {
    async fn wait(&self) {
        let _ = self.admit(None, pending()).await;
    }

    async fn wait_timeout(&self, timeout: Duration) -> Result<(), LimitError> {
        self.admit(Some(deadline_after(timeout)), pending()).await
    }

    async fn wait_cancellable<C>(&self, cancel: C) -> Result<(), LimitError>
    where
        C: Future<Output = ()> + Send,
    {
        self.admit(None, cancel).await
    }

    fn allow(&self) -> bool {
        let mut ledger = self.refresh(Instant::now());
        if Self::has_token(&ledger) {
            ledger.core.remaining -= 1;
            ledger.counters.admit();
            true
        } else {
            ledger.counters.deny();
            debug!(strategy = STRATEGY, "denied");
            false
        }
    }

    fn clear(&self) {
        let mut ledger = self.shared.lock();
        let canceled = ledger.holds.cancel_all();
        ledger.core.remaining = self.capacity;
        ledger.core.last_refill = Instant::now();
        debug!(strategy = STRATEGY, canceled, "cleared");
    }

    fn stats(&self) -> Stats {
        let now = Instant::now();
        let ledger = self.refresh(now);
        let next_allowed = if Self::has_token(&ledger) {
            now
        } else {
            ledger.core.last_refill + self.refill_rate
        };
        ledger.counters.snapshot(next_allowed)
    }

    async fn reserve(&self, ttl: Option<Duration>) -> Result<Reservation, LimitError> {
        self.hold(None, pending(), ttl).await
    }

    async fn reserve_timeout(
        &self,
        timeout: Duration,
        ttl: Option<Duration>,
    ) -> Result<Reservation, LimitError> {
        self.hold(Some(deadline_after(timeout)), pending(), ttl).await
    }

    async fn reserve_cancellable<C>(
        &self,
        cancel: C,
        ttl: Option<Duration>,
    ) -> Result<Reservation, LimitError>
    where
        C: Future<Output = ()> + Send,
    {
        self.hold(None, cancel, ttl).await
    }
}
