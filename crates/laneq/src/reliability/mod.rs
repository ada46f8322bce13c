//! Reliability primitives
//!
//! - [`RetryPolicy`] - attempts plus backoff attached to every job definition
//! - [`Backoff`] - fixed or exponential delay between attempts

mod retry;

pub use retry::{Backoff, BackoffKind, RetryPolicy, DEFAULT_ATTEMPTS, DEFAULT_BACKOFF_DELAY};
