//! Declarative limiter construction.

use std::future::Future;
use std::num::NonZeroUsize;
use std::time::Duration;

use crate::ConfigError;
use crate::LeakyBucket;
use crate::LimitError;
use crate::Limiter;
use crate::Reservation;
use crate::SlidingWindow;
use crate::Stats;
use crate::TokenBucket;

/// Which strategy to build, and its parameters.
///
/// With the `serde` feature this (de)serializes as a map tagged by `strategy`,
/// with windows written as human-readable durations:
///
/// ```yaml
/// strategy: leaky_bucket
/// capacity: 10
/// window: 1s
/// queue_bound: 20
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "strategy", rename_all = "snake_case"))]
pub enum LimiterConfig {
    SlidingWindow {
        capacity: NonZeroUsize,
        #[cfg_attr(feature = "serde", serde(with = "humantime_duration"))]
        window: Duration,
    },
    TokenBucket {
        capacity: NonZeroUsize,
        #[cfg_attr(feature = "serde", serde(with = "humantime_duration"))]
        window: Duration,
    },
    LeakyBucket {
        capacity: NonZeroUsize,
        #[cfg_attr(feature = "serde", serde(with = "humantime_duration"))]
        window: Duration,
        queue_bound: NonZeroUsize,
    },
}

impl LimiterConfig {
    pub fn window(&self) -> Duration {
        match self {
            Self::SlidingWindow { window, .. }
            | Self::TokenBucket { window, .. }
            | Self::LeakyBucket { window, .. } => *window,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window().is_zero() {
            return Err(ConfigError::ZeroWindow);
        }
        Ok(())
    }

    /// Validate the configuration and build the limiter it describes.
    pub fn build(&self) -> Result<AnyLimiter, ConfigError> {
        self.validate()?;
        let limiter = match *self {
            Self::SlidingWindow { capacity, window } => {
                AnyLimiter::SlidingWindow(SlidingWindow::new(capacity, window))
            }
            Self::TokenBucket { capacity, window } => {
                AnyLimiter::TokenBucket(TokenBucket::new(capacity, window))
            }
            Self::LeakyBucket {
                capacity,
                window,
                queue_bound,
            } => AnyLimiter::LeakyBucket(LeakyBucket::new(capacity, window, queue_bound)),
        };
        tracing::debug!(config = ?self, "built limiter");
        Ok(limiter)
    }
}

/// Any of the built-in strategies, chosen at runtime.
#[derive(Debug, Clone)]
pub enum AnyLimiter {
    SlidingWindow(SlidingWindow),
    TokenBucket(TokenBucket),
    LeakyBucket(LeakyBucket),
}

impl From<SlidingWindow> for AnyLimiter {
    fn from(limiter: SlidingWindow) -> Self {
        Self::SlidingWindow(limiter)
    }
}

impl From<TokenBucket> for AnyLimiter {
    fn from(limiter: TokenBucket) -> Self {
        Self::TokenBucket(limiter)
    }
}

impl From<LeakyBucket> for AnyLimiter {
    fn from(limiter: LeakyBucket) -> Self {
        Self::LeakyBucket(limiter)
    }
}

impl Limiter for AnyLimiter {
    async fn wait(&self) {
        match self {
            Self::SlidingWindow(l) => l.wait().await,
            Self::TokenBucket(l) => l.wait().await,
            Self::LeakyBucket(l) => l.wait().await,
        }
    }

    async fn wait_timeout(&self, timeout: Duration) -> Result<(), LimitError> {
        match self {
            Self::SlidingWindow(l) => l.wait_timeout(timeout).await,
            Self::TokenBucket(l) => l.wait_timeout(timeout).await,
            Self::LeakyBucket(l) => l.wait_timeout(timeout).await,
        }
    }

    async fn wait_cancellable<C>(&self, cancel: C) -> Result<(), LimitError>
    where
        C: Future<Output = ()> + Send,
    {
        match self {
            Self::SlidingWindow(l) => l.wait_cancellable(cancel).await,
            Self::TokenBucket(l) => l.wait_cancellable(cancel).await,
            Self::LeakyBucket(l) => l.wait_cancellable(cancel).await,
        }
    }

    fn allow(&self) -> bool {
        match self {
            Self::SlidingWindow(l) => l.allow(),
            Self::TokenBucket(l) => l.allow(),
            Self::LeakyBucket(l) => l.allow(),
        }
    }

    fn clear(&self) {
        match self {
            Self::SlidingWindow(l) => l.clear(),
            Self::TokenBucket(l) => l.clear(),
            Self::LeakyBucket(l) => l.clear(),
        }
    }

    fn stats(&self) -> Stats {
        match self {
            Self::SlidingWindow(l) => l.stats(),
            Self::TokenBucket(l) => l.stats(),
            Self::LeakyBucket(l) => l.stats(),
        }
    }

    async fn reserve(&self, ttl: Option<Duration>) -> Result<Reservation, LimitError> {
        match self {
            Self::SlidingWindow(l) => l.reserve(ttl).await,
            Self::TokenBucket(l) => l.reserve(ttl).await,
            Self::LeakyBucket(l) => l.reserve(ttl).await,
        }
    }

    async fn reserve_timeout(
        &self,
        timeout: Duration,
        ttl: Option<Duration>,
    ) -> Result<Reservation, LimitError> {
        match self {
            Self::SlidingWindow(l) => l.reserve_timeout(timeout, ttl).await,
            Self::TokenBucket(l) => l.reserve_timeout(timeout, ttl).await,
            Self::LeakyBucket(l) => l.reserve_timeout(timeout, ttl).await,
        }
    }

    async fn reserve_cancellable<C>(
        &self,
        cancel: C,
        ttl: Option<Duration>,
    ) -> Result<Reservation, LimitError>
    where
        C: Future<Output = ()> + Send,
    {
        match self {
            Self::SlidingWindow(l) => l.reserve_cancellable(cancel, ttl).await,
            Self::TokenBucket(l) => l.reserve_cancellable(cancel, ttl).await,
            Self::LeakyBucket(l) => l.reserve_cancellable(cancel, ttl).await,
        }
    }
}

#[cfg(feature = "serde")]
mod humantime_duration {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub(super) fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&humantime::format_duration(*duration))
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}
