use tokio::time::Instant;

/// A point-in-time snapshot of a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Events admitted since the limiter was created. Not reset by `clear`.
    pub allowed: u64,
    /// Events denied since the limiter was created, including waits that
    /// timed out or were canceled. Not reset by `clear`.
    pub denied: u64,
    /// The earliest instant at which the next event is expected to be admitted.
    pub next_allowed: Instant,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) allowed: u64,
    pub(crate) denied: u64,
}

impl Counters {
    pub(crate) fn admit(&mut self) {
        self.allowed += 1;
    }

    pub(crate) fn deny(&mut self) {
        self.denied += 1;
    }

    pub(crate) fn snapshot(&self, next_allowed: Instant) -> Stats {
        Stats {
            allowed: self.allowed,
            denied: self.denied,
            next_allowed,
        }
    }
}
