//! Grace degradation policy
//!
//! Tracks consecutive remote fetch failures per path. While a path's failure
//! count stays within the caller-supplied grace level, `open` may serve the
//! last-known local copy (flagged degraded) instead of failing. Any
//! successful fetch for the path returns it to strict mode.

use std::collections::HashMap;
use std::sync::Mutex;

/// Per-path consecutive failure counter
pub struct GracePolicy {
    failures: Mutex<HashMap<String, u32>>,
}

impl Default for GracePolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl GracePolicy {
    pub fn new() -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Count a fetch failure for `path`, returning the new consecutive count
    pub fn record_failure(&self, path: &str) -> u32 {
        let mut failures = self.failures.lock().unwrap();
        let count = failures.entry(path.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// A successful fetch returns the path to strict mode
    pub fn record_success(&self, path: &str) {
        self.failures.lock().unwrap().remove(path);
    }

    /// Whether serving stale content for `path` is currently permitted.
    /// `grace_level` is the number of consecutive failures tolerated; zero
    /// never degrades.
    pub fn permits(&self, path: &str, grace_level: u32) -> bool {
        if grace_level == 0 {
            return false;
        }
        let failures = self.failures.lock().unwrap();
        failures.get(path).copied().unwrap_or(0) <= grace_level
    }
}
