use tokio::time::Instant;
use tracing::trace;

use crate::LeakyBucket;
use crate::ReservationError;
use crate::SlidingWindow;
use crate::TokenBucket;
use crate::ledger::Status;
use crate::ledger::Ticket;

/// A slot held against a limiter's capacity until it is consumed or canceled.
///
/// While pending, a reservation counts against its limiter exactly like an
/// admitted event. It leaves pending exactly once: [`consume`](Self::consume)
/// turns it into a real event, [`cancel`](Self::cancel) (or dropping it) gives
/// the slot back, and [`Limiter::clear`](crate::Limiter::clear) cancels it from
/// the limiter's side. A reservation with a TTL is also invalidated once the
/// TTL runs out.
#[derive(Debug)]
pub struct Reservation {
    ticket: Ticket,
    owner: Owner,
}

#[derive(Debug)]
pub(crate) enum Owner {
    SlidingWindow(SlidingWindow),
    TokenBucket(TokenBucket),
    LeakyBucket(LeakyBucket),
}

impl Reservation {
    pub(crate) fn new(ticket: Ticket, owner: Owner) -> Self {
        Self { ticket, owner }
    }

    /// Use the reservation.
    ///
    /// For the sliding window and token bucket this completes immediately. For
    /// the leaky bucket the reservation joins the queue and this waits until
    /// it leaks, giving up with [`ReservationError::ExpiredWhileWaiting`] if
    /// the reservation's TTL runs out first.
    ///
    /// # Errors
    ///
    /// Returns [`ReservationError`] if the reservation was already consumed,
    /// was canceled, or has expired.
    pub async fn consume(&mut self) -> Result<(), ReservationError> {
        match &self.owner {
            Owner::SlidingWindow(limiter) => limiter.commit(&mut self.ticket),
            Owner::TokenBucket(limiter) => limiter.commit(&mut self.ticket),
            Owner::LeakyBucket(limiter) => limiter.commit(&mut self.ticket).await,
        }
    }

    /// Release the reservation without using it. Does nothing once consumed.
    pub fn cancel(&mut self) {
        if self.ticket.status() != Status::Pending {
            return;
        }
        let released = match &self.owner {
            Owner::SlidingWindow(limiter) => limiter.shared.lock().holds.release(&mut self.ticket),
            Owner::TokenBucket(limiter) => limiter.shared.lock().holds.release(&mut self.ticket),
            Owner::LeakyBucket(limiter) => limiter.shared.lock().holds.release(&mut self.ticket),
        };
        trace!(released, "reservation canceled");
    }

    /// When the reservation stops being valid, if it was issued with a TTL.
    pub fn expires_at(&self) -> Option<Instant> {
        self.ticket.expires_at()
    }

    /// `true` until this handle has consumed or canceled the reservation.
    pub fn is_pending(&self) -> bool {
        self.ticket.status() == Status::Pending
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.cancel();
    }
}
