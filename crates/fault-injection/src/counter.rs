//! Retry fault counter
//!
//! Emulates an upstream that fails a fixed number of times before it answers
//! successfully. The counter holds "requests remaining before success" and
//! moves through the cycle `threshold → … → 1 → 0 → threshold`:
//!
//! - remaining > 0: the attempt fails and the counter is decremented
//! - remaining == 0: the attempt succeeds and the counter is reset
//!
//! Each attempt is one compare-and-swap on an `AtomicU32`, so concurrent
//! callers observe a single total order of counter values: no two attempts
//! start from the same value and no caller sees a value outside
//! `[0, threshold]`.

use std::sync::atomic::{AtomicU32, Ordering};

use tracing::debug;

/// Failures served before each success when no threshold is configured.
pub const DEFAULT_FAILURES: u32 = 3;

/// Result of a single attempt against the counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The attempt is a simulated failure. `remaining` is the counter value
    /// after the decrement.
    Failed { remaining: u32 },
    /// The failure streak is exhausted; the counter was reset to the threshold.
    Succeeded,
}

/// One atomic step of the counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// Counter value this attempt started from.
    pub observed: u32,
    pub outcome: Outcome,
}

impl Attempt {
    /// Counter value left behind by this attempt.
    pub fn remaining(&self, threshold: u32) -> u32 {
        match self.outcome {
            Outcome::Failed { remaining } => remaining,
            Outcome::Succeeded => threshold,
        }
    }
}

/// Process-wide retry counter, shared by reference (usually behind `Arc`).
#[derive(Debug)]
pub struct FaultCounter {
    remaining: AtomicU32,
    threshold: u32,
}

impl FaultCounter {
    /// Create a counter that fails `threshold` times before each success.
    ///
    /// A threshold of 0 disables fault injection: every attempt succeeds.
    pub fn new(threshold: u32) -> Self {
        Self {
            remaining: AtomicU32::new(threshold),
            threshold,
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Current counter value. Only a snapshot: other callers may move it
    /// before the value is used.
    pub fn remaining(&self) -> u32 {
        self.remaining.load(Ordering::Acquire)
    }

    /// Apply one check-then-decrement-or-reset step atomically.
    pub fn attempt(&self) -> Attempt {
        let threshold = self.threshold;
        let step = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(if current == 0 { threshold } else { current - 1 })
            });
        // The update closure never declines, so both arms carry the previous value.
        let (Ok(observed) | Err(observed)) = step;

        if observed == 0 {
            debug!(threshold, "failure streak exhausted, counter reset");
            Attempt {
                observed,
                outcome: Outcome::Succeeded,
            }
        } else {
            Attempt {
                observed,
                outcome: Outcome::Failed {
                    remaining: observed - 1,
                },
            }
        }
    }
}

impl Default for FaultCounter {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURES)
    }
}
