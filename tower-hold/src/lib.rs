//! # Tower Hold
//!
//! `tower-hold` puts a [`hold_limit::Limiter`] in front of any
//! [Tower](https://github.com/tower-rs/tower) service.
//!
//! Every request is admitted by the limiter before the inner service sees it:
//!
//! 1. **Fail fast**: with [`LimitLayer::with_fail_fast`] a request that cannot be
//!    admitted right now is rejected with `HoldError::RateLimited`, carrying the
//!    time until the limiter expects to have room.
//! 2. **Bounded waits**: with [`LimitLayer::with_timeout`] a request waits for
//!    admission and fails with `HoldError::Timeout` if that takes too long.
//! 3. **Load shedding**: a leaky bucket with a full queue rejects with
//!    `HoldError::Overloaded` without waiting.
//!
//! All services produced by clones of one layer share the same limiter.
//!
//! ## Feature Flags
//!
//! - `axum`: Enables `IntoResponse` for [`HoldError`], mapping it to HTTP status
//!   codes (408, 503, 429, 500).

mod error;
mod layer;
mod service;

#[cfg(test)]
mod tests;

pub use error::HoldError;
pub use layer::LimitLayer;
pub use service::LimitService;
