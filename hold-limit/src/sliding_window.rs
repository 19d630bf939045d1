use std::collections::VecDeque;
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
use crate::reservation::Owner;
use crate::wait::deadline_after;
use crate::wait::pause;

const STRATEGY: &str = "sliding_window";

/// A Sliding Window Log implementation.
///
/// It records the instant of every admitted event and admits a new one while
/// fewer than `capacity` events (plus pending reservations) fall inside the
/// trailing `window`.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    capacity: usize,
    window: Duration,
    pub(crate) shared: Shared<EventLog>,
}

/// Admission instants, oldest first.
#[derive(Debug, Default)]
pub(crate) struct EventLog {
    admitted: VecDeque<Instant>,
}

impl SlidingWindow {
    /// # Panics
    ///
    /// Panics if `window` is zero.
    pub fn new(capacity: NonZeroUsize, window: Duration) -> Self {
        assert!(!window.is_zero(), "window must be greater than zero");
        Self {
            capacity: capacity.get(),
            window,
            shared: Ledger::shared(EventLog::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Lock the state and drop everything that has aged out of the window.
    fn refresh(&self, now: Instant) -> MutexGuard<'_, Ledger<EventLog>> {
        let mut ledger = self.shared.lock();
        let log = &mut ledger.core.admitted;
        while log
            .front()
            .is_some_and(|oldest| now.duration_since(*oldest) >= self.window)
        {
            log.pop_front();
        }
        ledger.holds.prune(now);
        ledger
    }

    fn has_room(&self, ledger: &Ledger<EventLog>) -> bool {
        ledger.core.admitted.len() + ledger.holds.len() < self.capacity
    }

    /// When a denied caller should look again: the oldest entry ageing out,
    /// or a pending reservation expiring, whichever is sooner.
    fn retry_at(&self, ledger: &Ledger<EventLog>, now: Instant) -> Instant {
        let slot = ledger
            .core
            .admitted
            .front()
            .map_or(now + self.window, |oldest| *oldest + self.window);
        ledger
            .holds
            .next_expiry()
            .map_or(slot, |expiry| expiry.min(slot))
    }

    async fn admit<C>(&self, deadline: Option<Instant>, cancel: C) -> Result<(), LimitError>
    where
        C: Future<Output = ()>,
    {
        let mut cancel = pin!(cancel);
        loop {
            let wake = {
                let now = Instant::now();
                let mut ledger = self.refresh(now);
                if self.has_room(&ledger) {
                    ledger.core.admitted.push_back(now);
                    ledger.counters.admit();
                    trace!(strategy = STRATEGY, "admitted");
                    return Ok(());
                }
                self.retry_at(&ledger, now)
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
                if self.has_room(&ledger) {
                    let ticket = ledger.holds.issue(ttl, now);
                    trace!(strategy = STRATEGY, pending = ledger.holds.len(), "reserved");
                    return Ok(Reservation::new(ticket, Owner::SlidingWindow(self.clone())));
                }
                self.retry_at(&ledger, now)
            };

            if let Err(err) = pause(wake, deadline, &mut cancel).await {
                self.shared.lock().counters.deny();
                debug!(strategy = STRATEGY, %err, "gave up waiting for a reservation");
                return Err(err);
            }
        }
    }

    /// A consumed reservation is logged as a real event at the moment of consumption.
    pub(crate) fn commit(&self, ticket: &mut Ticket) -> Result<(), ReservationError> {
        let now = Instant::now();
        let mut ledger = self.refresh(now);
        ledger.settle(ticket, now)?;
        ledger.core.admitted.push_back(now);
        ledger.counters.admit();
        trace!(strategy = STRATEGY, "reservation consumed");
        Ok(())
    }
}

impl Limiter for SlidingWindow {
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
        let now = Instant::now();
        let mut ledger = self.refresh(now);
        if self.has_room(&ledger) {
            ledger.core.admitted.push_back(now);
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
        ledger.core.admitted.clear();
        debug!(strategy = STRATEGY, canceled, "cleared");
    }

    fn stats(&self) -> Stats {
        let now = Instant::now();
        let ledger = self.refresh(now);
        let next_allowed = ledger
            .core
            .admitted
            .front()
            .map_or(now, |oldest| *oldest + self.window);
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
