use std::future::Future;
use std::future::pending;
use std::num::NonZeroUsize;
use std::pin::Pin;
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

const STRATEGY: &str = "leaky_bucket";

/// A Leaky Bucket (as a queue) implementation.
///
/// Events join a queue of at most `queue_bound` entries (pending reservations
/// included) and leave it one at a time, at most once every
/// `window / capacity`. Joining a full queue is rejected immediately with
/// [`LimitError::QueueFull`]; nothing waits for queue space.
///
/// [`allow`](Limiter::allow) never queues: it succeeds only when the queue is
/// empty and the leak timer has already elapsed.
#[derive(Debug, Clone)]
pub struct LeakyBucket {
    queue_bound: usize,
    leak_rate: Duration,
    pub(crate) shared: Shared<Queue>,
}

#[derive(Debug, Default)]
pub(crate) struct Queue {
    depth: usize,
    /// `None` until the first leak, and again after a clear: the next leak may happen immediately.
    last_leak: Option<Instant>,
}

/// A queue position owned by a waiter.
///
/// Dropping an armed slot gives the position back, whichever way the wait
/// ended. Slots taken before a clear are void, since the clear already
/// emptied the queue.
struct QueueSlot<'a> {
    limiter: &'a LeakyBucket,
    generation: u64,
    armed: bool,
}

impl QueueSlot<'_> {
    fn is_current(&self, ledger: &Ledger<Queue>) -> bool {
        self.generation == ledger.holds.generation()
    }
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut ledger = self.limiter.shared.lock();
            if self.is_current(&ledger) {
                ledger.core.depth = ledger.core.depth.saturating_sub(1);
            }
        }
    }
}

impl LeakyBucket {
    /// # Panics
    ///
    /// Panics if `window` is zero.
    pub fn new(capacity: NonZeroUsize, window: Duration, queue_bound: NonZeroUsize) -> Self {
        assert!(!window.is_zero(), "window must be greater than zero");
        Self {
            queue_bound: queue_bound.get(),
            leak_rate: interval(window, capacity),
            shared: Ledger::shared(Queue::default()),
        }
    }

    pub fn queue_bound(&self) -> usize {
        self.queue_bound
    }

    /// The minimum spacing between two leaks.
    pub fn leak_rate(&self) -> Duration {
        self.leak_rate
    }

    fn refresh(&self, now: Instant) -> MutexGuard<'_, Ledger<Queue>> {
        let mut ledger = self.shared.lock();
        ledger.holds.prune(now);
        ledger
    }

    fn is_full(&self, ledger: &Ledger<Queue>) -> bool {
        ledger.core.depth + ledger.holds.len() >= self.queue_bound
    }

    fn can_leak(&self, queue: &Queue, now: Instant) -> bool {
        queue
            .last_leak
            .is_none_or(|last| now.duration_since(last) >= self.leak_rate)
    }

    fn next_leak(&self, queue: &Queue, now: Instant) -> Instant {
        queue.last_leak.map_or(now, |last| last + self.leak_rate)
    }

    /// Take a queue position, or count a denial if there is none.
    fn enqueue(&self) -> Result<QueueSlot<'_>, LimitError> {
        let mut ledger = self.refresh(Instant::now());
        if self.is_full(&ledger) {
            ledger.counters.deny();
            debug!(strategy = STRATEGY, depth = ledger.core.depth, "queue full");
            return Err(LimitError::QueueFull);
        }
        ledger.core.depth += 1;
        Ok(QueueSlot {
            limiter: self,
            generation: ledger.holds.generation(),
            armed: true,
        })
    }

    /// Wait until `slot` leaks out of the queue.
    ///
    /// On any other outcome the slot is dropped, which frees the position.
    async fn drain<C>(
        &self,
        mut slot: QueueSlot<'_>,
        deadline: Option<Instant>,
        cancel: &mut Pin<&mut C>,
    ) -> Result<(), LimitError>
    where
        C: Future<Output = ()>,
    {
        loop {
            let wake = {
                let now = Instant::now();
                let mut ledger = self.refresh(now);
                if self.can_leak(&ledger.core, now) {
                    if slot.is_current(&ledger) {
                        ledger.core.depth = ledger.core.depth.saturating_sub(1);
                    }
                    ledger.core.last_leak = Some(now);
                    ledger.counters.admit();
                    slot.armed = false;
                    trace!(strategy = STRATEGY, depth = ledger.core.depth, "leaked");
                    return Ok(());
                }
                self.next_leak(&ledger.core, now)
            };

            if let Err(err) = pause(wake, deadline, cancel).await {
                self.shared.lock().counters.deny();
                debug!(strategy = STRATEGY, %err, "left the queue before leaking");
                return Err(err);
            }
        }
    }

    async fn admit<C>(&self, deadline: Option<Instant>, cancel: C) -> Result<(), LimitError>
    where
        C: Future<Output = ()>,
    {
        let slot = self.enqueue()?;
        let mut cancel = pin!(cancel);
        self.drain(slot, deadline, &mut cancel).await
    }

    fn hold(&self, ttl: Option<Duration>) -> Result<Reservation, LimitError> {
        let now = Instant::now();
        let mut ledger = self.refresh(now);
        if self.is_full(&ledger) {
            ledger.counters.deny();
            debug!(strategy = STRATEGY, depth = ledger.core.depth, "queue full");
            return Err(LimitError::QueueFull);
        }
        let ticket = ledger.holds.issue(ttl, now);
        trace!(strategy = STRATEGY, pending = ledger.holds.len(), "reserved");
        Ok(Reservation::new(ticket, Owner::LeakyBucket(self.clone())))
    }

    /// Move a reservation into the queue and wait for it to leak, giving up
    /// when the reservation expires.
    pub(crate) async fn commit(&self, ticket: &mut Ticket) -> Result<(), ReservationError> {
        let slot = {
            let now = Instant::now();
            let mut ledger = self.refresh(now);
            ledger.settle(ticket, now)?;
            ledger.core.depth += 1;
            QueueSlot {
                limiter: self,
                generation: ledger.holds.generation(),
                armed: true,
            }
        };

        let mut never = pin!(pending::<()>());
        self.drain(slot, ticket.expires_at(), &mut never)
            .await
            .map_err(|_| ReservationError::ExpiredWhileWaiting)
    }
}

impl Limiter for LeakyBucket {
    async fn wait(&self) {
        if let Err(err) = self.admit(None, pending()).await {
            debug!(strategy = STRATEGY, %err, "wait rejected");
        }
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
        if ledger.core.depth == 0 && self.can_leak(&ledger.core, now) {
            ledger.core.last_leak = Some(now);
            ledger.counters.admit();
            true
        } else {
            ledger.counters.deny();
            debug!(strategy = STRATEGY, depth = ledger.core.depth, "denied");
            false
        }
    }

    fn clear(&self) {
        let mut ledger = self.shared.lock();
        let canceled = ledger.holds.cancel_all();
        ledger.core = Queue::default();
        debug!(strategy = STRATEGY, canceled, "cleared");
    }

    fn stats(&self) -> Stats {
        let now = Instant::now();
        let ledger = self.refresh(now);
        let next_allowed = if ledger.core.depth > 0 {
            self.next_leak(&ledger.core, now)
        } else {
            now
        };
        ledger.counters.snapshot(next_allowed)
    }

    async fn reserve(&self, ttl: Option<Duration>) -> Result<Reservation, LimitError> {
        self.hold(ttl)
    }

    /// Reservations never wait for queue space, so `timeout` is not used.
    async fn reserve_timeout(
        &self,
        _timeout: Duration,
        ttl: Option<Duration>,
    ) -> Result<Reservation, LimitError> {
        self.hold(ttl)
    }

    /// Reservations never wait for queue space, so `cancel` is never polled.
    async fn reserve_cancellable<C>(
        &self,
        _cancel: C,
        ttl: Option<Duration>,
    ) -> Result<Reservation, LimitError>
    where
        C: Future<Output = ()> + Send,
    {
        self.hold(ttl)
    }
}

#[cfg(test)]
mod tests {
    use more_asserts::assert_ge;
    use more_asserts::assert_lt;

    use super::*;

    fn bucket(capacity: usize, millis: u64, queue_bound: usize) -> LeakyBucket {
        LeakyBucket::new(
            NonZeroUsize::new(capacity).unwrap(),
            Duration::from_millis(millis),
            NonZeroUsize::new(queue_bound).unwrap(),
        )
    }

    fn depth(rl: &LeakyBucket) -> usize {
        rl.shared.lock().core.depth
    }

    #[tokio::test(start_paused = true)]
    async fn it_spaces_waiters_by_the_leak_rate() {
        // 5 requests per second
        let rl = bucket(5, 1000, 100);
        let start = Instant::now();

        rl.wait().await;
        // First request leaks straight away
        assert_eq!(start.elapsed(), Duration::ZERO);

        for _ in 0..3 {
            rl.wait().await;
        }
        assert_ge!(start.elapsed(), Duration::from_millis(600));
        assert_eq!(rl.stats().allowed, 4);
        assert_eq!(depth(&rl), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn allow_does_not_queue() {
        let rl = bucket(5, 1000, 100);

        assert!(rl.allow());
        // Too soon after the first leak
        assert!(!rl.allow());

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(rl.allow());

        let stats = rl.stats();
        assert_eq!(stats.allowed, 2);
        assert_eq!(stats.denied, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn allow_is_denied_while_events_are_queued() {
        let rl = bucket(5, 1000, 100);
        assert!(rl.allow());

        let waiter = tokio::spawn({
            let rl = rl.clone();
            async move { rl.wait().await }
        });
        tokio::task::yield_now().await;
        assert_eq!(depth(&rl), 1);

        // The leak timer has elapsed, but the queued waiter comes first
        tokio::time::advance(Duration::from_millis(200)).await;
        waiter.await.unwrap();
        assert_eq!(depth(&rl), 0);
        assert!(!rl.allow(), "the waiter just leaked, resetting the timer");
    }

    #[tokio::test(start_paused = true)]
    async fn it_rejects_immediately_when_the_queue_is_full() {
        let rl = bucket(1, 1000, 2);
        assert!(rl.allow());

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let rl = rl.clone();
                tokio::spawn(async move { rl.wait_timeout(Duration::from_secs(5)).await })
            })
            .collect();
        tokio::task::yield_now().await;
        assert_eq!(depth(&rl), 2);

        let start = Instant::now();
        assert_eq!(
            rl.wait_timeout(Duration::from_secs(5)).await,
            Err(LimitError::QueueFull)
        );
        assert_eq!(start.elapsed(), Duration::ZERO);

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), Ok(()));
        }
        assert_ge!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn a_timed_out_waiter_gives_its_slot_back() {
        let rl = bucket(1, 1000, 1);
        assert!(rl.allow());

        assert_eq!(
            rl.wait_timeout(Duration::from_millis(100)).await,
            Err(LimitError::Timeout)
        );
        assert_eq!(depth(&rl), 0);
        assert_eq!(rl.stats().denied, 1);

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let waiter = tokio::spawn({
            let rl = rl.clone();
            async move {
                rl.wait_cancellable(async {
                    let _ = rx.await;
                })
                .await
            }
        });
        tokio::task::yield_now().await;
        assert_eq!(depth(&rl), 1);

        tx.send(()).unwrap();
        assert_eq!(waiter.await.unwrap(), Err(LimitError::Canceled));
        assert_eq!(depth(&rl), 0);
        assert_eq!(rl.stats().denied, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_a_wait_gives_its_slot_back() {
        let rl = bucket(1, 1000, 1);
        assert!(rl.allow());

        let outcome = tokio::time::timeout(Duration::from_millis(10), rl.wait()).await;
        assert!(outcome.is_err());
        assert_eq!(depth(&rl), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reservations_fill_the_queue_then_leak_in_turn() {
        // 3 requests per second, max queue of 3
        let rl = bucket(3, 1000, 3);
        let start = Instant::now();

        let mut reservations = vec![];
        for _ in 0..3 {
            reservations.push(rl.reserve(None).await.unwrap());
        }
        assert_eq!(start.elapsed(), Duration::ZERO);

        let fourth = rl
            .reserve_cancellable(tokio::time::sleep(Duration::from_millis(100)), None)
            .await;
        assert_eq!(fourth.unwrap_err(), LimitError::QueueFull);

        // First consumption is immediate, the others wait for the leak rate
        for reservation in &mut reservations {
            assert_eq!(reservation.consume().await, Ok(()));
        }
        assert_ge!(start.elapsed(), Duration::from_millis(666));

        let stats = rl.stats();
        assert_eq!(stats.allowed, 3);
        assert_eq!(stats.denied, 1);
        assert_eq!(depth(&rl), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn a_reservation_can_expire_in_the_queue() {
        let rl = bucket(1, 1000, 2);
        assert!(rl.allow());

        let mut reservation = rl.reserve(Some(Duration::from_millis(300))).await.unwrap();
        let start = Instant::now();
        assert_eq!(
            reservation.consume().await,
            Err(ReservationError::ExpiredWhileWaiting)
        );
        assert_eq!(start.elapsed(), Duration::from_millis(300));

        // The expired item no longer occupies the queue
        assert_eq!(depth(&rl), 0);
        assert_eq!(rl.stats().denied, 1);
        assert_eq!(
            reservation.consume().await,
            Err(ReservationError::AlreadyConsumed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn a_reservation_leaking_as_it_expires_is_admitted() {
        let rl = bucket(1, 300, 2);
        assert!(rl.allow());

        let mut reservation = rl.reserve(Some(Duration::from_millis(300))).await.unwrap();
        let start = Instant::now();
        assert_eq!(reservation.consume().await, Ok(()));
        assert_eq!(start.elapsed(), Duration::from_millis(300));

        let stats = rl.stats();
        assert_eq!(stats.allowed, 2);
        assert_eq!(stats.denied, 0);
        assert_eq!(depth(&rl), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn a_reservation_expired_before_consume_never_queues() {
        let rl = bucket(1, 1000, 2);

        let mut reservation = rl.reserve(Some(Duration::from_millis(100))).await.unwrap();
        tokio::time::advance(Duration::from_millis(100)).await;

        assert_eq!(reservation.consume().await, Err(ReservationError::Expired));
        assert_eq!(depth(&rl), 0);

        let stats = rl.stats();
        assert_eq!(stats.allowed, 0);
        assert_eq!(stats.denied, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_a_consume_gives_its_slot_back() {
        let rl = bucket(1, 1000, 2);
        assert!(rl.allow());

        let mut reservation = rl.reserve(None).await.unwrap();
        let outcome =
            tokio::time::timeout(Duration::from_millis(100), reservation.consume()).await;
        assert!(outcome.is_err());

        assert_eq!(depth(&rl), 0);
        // Abandoning the wait is not a denial
        let stats = rl.stats();
        assert_eq!(stats.allowed, 1);
        assert_eq!(stats.denied, 0);

        // The whole queue is available again
        let _first = rl.reserve(None).await.unwrap();
        let _second = rl.reserve(None).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn clear_voids_queued_slots() {
        let rl = bucket(1, 1000, 4);
        assert!(rl.allow());

        let stale = tokio::spawn({
            let rl = rl.clone();
            async move { rl.wait_timeout(Duration::from_millis(100)).await }
        });
        let mut reservation = rl.reserve(None).await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(depth(&rl), 1);

        rl.clear();
        assert_eq!(depth(&rl), 0);
        assert_eq!(rl.stats().next_allowed, Instant::now());
        assert_eq!(reservation.consume().await, Err(ReservationError::Canceled));

        // Restart the leak timer and queue a fresh waiter behind it
        assert!(rl.allow());
        let fresh = tokio::spawn({
            let rl = rl.clone();
            async move { rl.wait_timeout(Duration::from_secs(5)).await }
        });
        tokio::task::yield_now().await;
        assert_eq!(depth(&rl), 1);

        // The stale waiter's slot belonged to the cleared queue
        assert_eq!(stale.await.unwrap(), Err(LimitError::Timeout));
        assert_eq!(depth(&rl), 1);

        assert_eq!(fresh.await.unwrap(), Ok(()));
        assert_eq!(depth(&rl), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stats_report_the_next_leak_while_queued() {
        let rl = bucket(4, 1000, 10);
        assert!(rl.allow());
        let leaked_at = Instant::now();
        assert_eq!(rl.stats().next_allowed, Instant::now());

        let waiter = tokio::spawn({
            let rl = rl.clone();
            async move { rl.wait().await }
        });
        tokio::task::yield_now().await;

        let next = rl.stats().next_allowed;
        assert_eq!(next, leaked_at + Duration::from_millis(250));
        assert_lt!(Instant::now(), next);
        waiter.await.unwrap();
    }
}
