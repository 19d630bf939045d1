use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::ReservationError;
use crate::stats::Counters;

/// Limiter state shared between a limiter's clones and its reservations.
pub(crate) type Shared<T> = Arc<Mutex<Ledger<T>>>;

/// Everything one limiter instance guards with its single lock: the
/// strategy-specific state, the pending reservations and the counters.
#[derive(Debug)]
pub(crate) struct Ledger<T> {
    pub(crate) core: T,
    pub(crate) holds: Holds,
    pub(crate) counters: Counters,
}

impl<T> Ledger<T> {
    pub(crate) fn shared(core: T) -> Shared<T> {
        Arc::new(Mutex::new(Self {
            core,
            holds: Holds::default(),
            counters: Counters::default(),
        }))
    }

    /// Turn a pending reservation into a real event, or explain why it can't be.
    ///
    /// The caller records the admission itself; an expiry is counted as a denial here.
    pub(crate) fn settle(&mut self, ticket: &mut Ticket, now: Instant) -> Result<(), ReservationError> {
        let outcome = self.holds.settle(ticket, now);
        if outcome == Err(ReservationError::Expired) {
            self.counters.deny();
        }
        outcome
    }
}

/// The interval at which one unit of capacity is regenerated.
pub(crate) fn interval(window: Duration, capacity: NonZeroUsize) -> Duration {
    let nanos = window.as_nanos() / capacity.get() as u128;
    Duration::from_nanos(nanos.clamp(1, u64::MAX as u128) as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    Pending,
    Consumed,
    Canceled,
    Expired,
}

/// The identity a [`Reservation`](crate::Reservation) carries into its limiter.
#[derive(Debug)]
pub(crate) struct Ticket {
    id: u64,
    generation: u64,
    expires_at: Option<Instant>,
    status: Status,
}

impl Ticket {
    pub(crate) fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    pub(crate) fn status(&self) -> Status {
        self.status
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Pending reservations, keyed by ticket id.
///
/// Every clear starts a new generation; tickets from an older generation are canceled.
#[derive(Debug, Default)]
pub(crate) struct Holds {
    pending: HashMap<u64, Option<Instant>>,
    next_id: u64,
    generation: u64,
}

impl Holds {
    pub(crate) fn issue(&mut self, ttl: Option<Duration>, now: Instant) -> Ticket {
        let id = self.next_id;
        self.next_id += 1;
        let expires_at = ttl.map(|ttl| now + ttl);
        self.pending.insert(id, expires_at);
        Ticket {
            id,
            generation: self.generation,
            expires_at,
            status: Status::Pending,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Forget holds whose TTL has run out. They stop counting against capacity.
    pub(crate) fn prune(&mut self, now: Instant) {
        self.pending
            .retain(|_, expires_at| !expires_at.is_some_and(|at| now >= at));
    }

    /// The earliest instant at which a pending hold expires, freeing capacity.
    pub(crate) fn next_expiry(&self) -> Option<Instant> {
        self.pending.values().flatten().min().copied()
    }

    fn settle(&mut self, ticket: &mut Ticket, now: Instant) -> Result<(), ReservationError> {
        match ticket.status {
            Status::Pending => {}
            Status::Consumed => return Err(ReservationError::AlreadyConsumed),
            Status::Canceled => return Err(ReservationError::Canceled),
            // Already reported (and counted) once
            Status::Expired => return Err(ReservationError::Expired),
        }

        if ticket.generation != self.generation {
            ticket.status = Status::Canceled;
            return Err(ReservationError::Canceled);
        }

        self.pending.remove(&ticket.id);
        if ticket.is_expired(now) {
            ticket.status = Status::Expired;
            return Err(ReservationError::Expired);
        }

        ticket.status = Status::Consumed;
        Ok(())
    }

    /// Give a pending hold back. Has no effect once the ticket has left pending.
    pub(crate) fn release(&mut self, ticket: &mut Ticket) -> bool {
        if ticket.status != Status::Pending {
            return false;
        }
        ticket.status = Status::Canceled;
        ticket.generation == self.generation && self.pending.remove(&ticket.id).is_some()
    }

    /// Cancel every pending hold, returning how many there were.
    pub(crate) fn cancel_all(&mut self) -> usize {
        let canceled = self.pending.len();
        self.pending.clear();
        self.generation += 1;
        canceled
    }
}
