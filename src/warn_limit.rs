//! Rate-limited warning helper.
//!
//! Each warning class gets a `(mutex, last_fire_time)` pair; `fire` returns
//! `true` (and should be followed by a `tracing::warn!`) iff at least
//! `threshold` has elapsed since the class last fired. Shared by the MSE
//! timestamp guard (per-`subscriptionName` warnings) and the ZZ decoder's
//! per-publish-error-class warnings.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct WarnLimiter {
    threshold: Duration,
    last_fired: Mutex<HashMap<String, Instant>>,
}

impl WarnLimiter {
    pub fn new(threshold: Duration) -> Self {
        WarnLimiter {
            threshold,
            last_fired: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if the caller should emit a warning for `class` now,
    /// and records that it did.
    ///
    /// The table is never pruned: old classes accumulate for the lifetime
    /// of the process. This mirrors the original's warning table exactly
    /// (see spec.md §9 open questions) rather than adding eviction the
    /// source never had.
    pub fn fire(&self, class: &str) -> bool {
        let now = Instant::now();
        let mut guard = self.last_fired.lock().expect("warn limiter mutex poisoned");
        match guard.get_mut(class) {
            Some(last) if now.duration_since(*last) < self.threshold => false,
            Some(last) => {
                *last = now;
                true
            }
            None => {
                guard.insert(class.to_owned(), now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once_then_suppresses_within_window() {
        let limiter = WarnLimiter::new(Duration::from_secs(3600));
        assert!(limiter.fire("rb-assoc"));
        assert!(!limiter.fire("rb-assoc"));
        assert!(!limiter.fire("rb-assoc"));
    }

    #[test]
    fn classes_are_independent() {
        let limiter = WarnLimiter::new(Duration::from_secs(3600));
        assert!(limiter.fire("a"));
        assert!(limiter.fire("b"));
        assert!(!limiter.fire("a"));
    }

    #[test]
    fn zero_threshold_always_fires() {
        let limiter = WarnLimiter::new(Duration::from_secs(0));
        assert!(limiter.fire("x"));
        assert!(limiter.fire("x"));
    }
}
