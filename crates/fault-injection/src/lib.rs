//! Fault injection primitives for the httpbin test server
//!
//! Holds the state behind simulated upstream failures. Handlers own nothing
//! mutable themselves; they are handed a shared `FaultCounter` and ask it for
//! the outcome of each attempt.
//!
//! Retry cycle with the default threshold of 3:
//! 1. attempts 1-3 fail, reporting 2, 1, 0 requests remaining
//! 2. attempt 4 succeeds and resets the counter to 3
//! 3. the cycle repeats forever

pub mod counter;

pub use counter::{Attempt, DEFAULT_FAILURES, FaultCounter, Outcome};
