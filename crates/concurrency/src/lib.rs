//! Concurrency primitives for merge jobs
//!
//! This crate provides the small building blocks the job coordinator is
//! assembled from:
//! - ChainLeases: one exclusive lease per chain, held while a job commits
//!   its relink or a caller restructures the chain
//! - CancelToken: shared cancellation flag with interruptible sleeps
//! - Throttle: bytes-per-second limiter for the copy loop
//! - Backoff / poll_until: bounded polling with fixed or exponential delay

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod cancel;
pub mod lease;
pub mod throttle;

pub use backoff::{poll_until, Backoff, WaitOptions};
pub use cancel::CancelToken;
pub use lease::{ChainLease, ChainLeases};
pub use throttle::Throttle;
