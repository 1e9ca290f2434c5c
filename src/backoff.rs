//! Compare-and-swap with per-thread exponential backoff.
//!
//! Every failed CAS on a hot list site bumps a thread-local failure counter;
//! past a small threshold the thread sleeps for `min(15 * failures, 10)²`
//! microseconds before retrying. Successes decay the counter again. With the
//! `backoff` feature disabled only the hit/miss counters are maintained.

#[cfg(feature = "backoff")]
use core::cmp;
use core::sync::atomic::Ordering::{AcqRel, Acquire};

use crate::marked::{AtomicMarkedPtr, MarkedPtr};

#[cfg(feature = "backoff")]
const EXP_THRESHOLD: u32 = 1;
#[cfg(feature = "backoff")]
const FACTOR: u32 = 15;
#[cfg(feature = "backoff")]
const CAP: u32 = 10;

////////////////////////////////////////////////////////////////////////////////////////////////////
// Backoff
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Per-thread CAS bookkeeping.
#[derive(Debug, Default)]
pub(crate) struct Backoff {
    failures: u32,
    hits: u64,
    misses: u64,
}

/***** impl inherent ******************************************************************************/

impl Backoff {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Performs a single CAS on `target`, throttling the calling thread after
    /// repeated failures.
    #[inline]
    pub fn cas<T>(
        &mut self,
        target: &AtomicMarkedPtr<T>,
        current: MarkedPtr<T>,
        new: MarkedPtr<T>,
    ) -> bool {
        if target.compare_exchange(current, new, AcqRel, Acquire).is_ok() {
            self.hits += 1;
            self.decay();
            true
        } else {
            self.misses += 1;
            self.throttle();
            false
        }
    }

    /// Returns the number of successful and failed CAS attempts.
    #[inline]
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "backoff")] {
        impl Backoff {
            #[inline]
            fn decay(&mut self) {
                self.failures = self.failures.saturating_sub(1);
            }

            #[inline]
            fn throttle(&mut self) {
                self.failures += 1;
                if self.failures > EXP_THRESHOLD {
                    let us = u64::from(cmp::min(FACTOR * self.failures, CAP));
                    std::thread::sleep(std::time::Duration::from_micros(us * us));
                }
            }
        }
    } else {
        impl Backoff {
            #[inline]
            fn decay(&mut self) {}

            #[inline]
            fn throttle(&mut self) {}
        }
    }
}
