//! Fail-open bookkeeping for store outages.
//!
//! Each check type owns one [`DegradedMode`]. A store failure flips it on and
//! the request is admitted; the next successful call flips it off. Transitions
//! are logged once, not per request.

use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};
use metrics::{counter, gauge};

use crate::store::StoreError;

#[derive(Debug)]
pub struct DegradedMode {
    check: &'static str,
    degraded: AtomicBool,
}

impl DegradedMode {
    pub fn new(check: &'static str) -> Self {
        gauge!("admission_store_degraded", 0.0, "check" => check);
        Self {
            check,
            degraded: AtomicBool::new(false),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn record_failure(&self, err: &StoreError) {
        counter!("admission_store_errors_total", 1, "check" => self.check);
        if !self.degraded.swap(true, Ordering::AcqRel) {
            warn!(
                "{} store unavailable, admitting requests unchecked: {}",
                self.check, err
            );
            gauge!("admission_store_degraded", 1.0, "check" => self.check);
        } else {
            debug!("{} store still unavailable: {}", self.check, err);
        }
    }

    pub fn record_success(&self) {
        if self.degraded.swap(false, Ordering::AcqRel) {
            info!("{} store reachable again, leaving degraded mode", self.check);
            gauge!("admission_store_degraded", 0.0, "check" => self.check);
        }
    }

    /// Unwrap a store result, falling back to `fallback` on failure
    pub fn guard<T>(&self, result: Result<T, StoreError>, fallback: T) -> T {
        match result {
            Ok(value) => {
                self.record_success();
                value
            }
            Err(err) => {
                self.record_failure(&err);
                fallback
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        let mode = DegradedMode::new("rate_limit");
        assert!(!mode.is_degraded());

        let value = mode.guard(Err(StoreError::Unavailable("down".to_string())), 7);
        assert_eq!(value, 7);
        assert!(mode.is_degraded());

        mode.record_failure(&StoreError::Unavailable("still down".to_string()));
        assert!(mode.is_degraded());

        assert_eq!(mode.guard(Ok(3), 7), 3);
        assert!(!mode.is_degraded());
    }
}
