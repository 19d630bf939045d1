/// Reasons a wait or a reservation request did not admit an event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LimitError {
    /// The deadline passed before capacity became available.
    #[error("timed out waiting for rate limit capacity")]
    Timeout,

    /// The caller's cancellation future resolved while waiting.
    #[error("wait for rate limit capacity was canceled")]
    Canceled,

    /// The leaky bucket queue is full.
    ///
    /// This is an immediate rejection; retrying the same call straight away
    /// will fail again until the queue drains.
    #[error("max allowed queue reached")]
    QueueFull,
}

/// Reasons a [`Reservation`](crate::Reservation) could not be consumed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReservationError {
    #[error("reservation already consumed")]
    AlreadyConsumed,

    /// Canceled by its holder or invalidated by [`Limiter::clear`](crate::Limiter::clear).
    #[error("reservation was canceled")]
    Canceled,

    #[error("reservation expired")]
    Expired,

    /// Leaky bucket only: the reservation was queued but its TTL ran out
    /// before the queue leaked it.
    #[error("reservation expired while waiting to leak")]
    ExpiredWhileWaiting,
}

/// Errors produced when building a limiter from a [`LimiterConfig`](crate::LimiterConfig).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("window must be greater than zero")]
    ZeroWindow,
}
