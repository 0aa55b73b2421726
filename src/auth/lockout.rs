use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::LockoutConfig;
use crate::lifecycle::Lifecycle;

/// Per-username failure count and lockout state (§4.11, §5 shared mutable
/// state note (b)).
#[derive(Clone, Debug)]
pub struct LockoutState {
    pub failures: u32,
    pub locked_at: Option<DateTime<Utc>>,
    pub last_attempt_at: DateTime<Utc>,
}

/// Keeps lockout counters for every username that has ever failed a login,
/// keyed by username behind a single mutex. A background ticker prunes
/// entries that have gone idle so the map doesn't grow unbounded.
pub struct LockoutTracker {
    entries: Mutex<HashMap<String, LockoutState>>,
    config: LockoutConfig,
}

impl LockoutTracker {
    pub fn new(config: LockoutConfig) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            config,
        })
    }

    /// Whether `username` is currently locked out. A lockout whose duration
    /// has elapsed auto-resets right here, on the next attempt, rather than
    /// waiting for the cleanup ticker.
    pub fn is_locked(&self, username: &str) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let Some(state) = entries.get_mut(username) else {
            return false;
        };
        let Some(locked_at) = state.locked_at else {
            return false;
        };

        let elapsed = Utc::now() - locked_at;
        if elapsed >= chrono::Duration::seconds(self.config.duration_seconds) {
            state.locked_at = None;
            state.failures = 0;
            false
        } else {
            true
        }
    }

    pub fn record_failure(&self, username: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let now = Utc::now();
        let state = entries.entry(username.to_string()).or_insert(LockoutState {
            failures: 0,
            locked_at: None,
            last_attempt_at: now,
        });
        state.last_attempt_at = now;
        state.failures += 1;
        if state.failures >= self.config.threshold {
            state.locked_at = Some(now);
        }
    }

    pub fn record_success(&self, username: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(username);
    }

    pub fn spawn_cleanup(self: &Arc<Self>, lifecycle: &Lifecycle, idle_after: Duration) {
        let tracker = self.clone();
        lifecycle.go("lockout-cleanup", move |done| async move {
            loop {
                tracker.cleanup_idle(idle_after);
                tokio::select! {
                    _ = done.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(300)) => {}
                }
            }
        });
    }

    fn cleanup_idle(&self, idle_after: Duration) {
        let cutoff = Utc::now() - chrono::Duration::from_std(idle_after).unwrap_or(chrono::Duration::zero());
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.retain(|_, state| state.locked_at.is_some() || state.last_attempt_at > cutoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LockoutConfig {
        LockoutConfig {
            threshold: 3,
            duration_seconds: 900,
        }
    }

    #[test]
    fn locks_out_after_threshold_failures() {
        let tracker = LockoutTracker::new(config());
        assert!(!tracker.is_locked("alice"));
        tracker.record_failure("alice");
        tracker.record_failure("alice");
        assert!(!tracker.is_locked("alice"));
        tracker.record_failure("alice");
        assert!(tracker.is_locked("alice"));
    }

    #[test]
    fn success_clears_the_counter() {
        let tracker = LockoutTracker::new(config());
        tracker.record_failure("alice");
        tracker.record_failure("alice");
        tracker.record_success("alice");
        assert!(!tracker.is_locked("alice"));
        tracker.record_failure("alice");
        tracker.record_failure("alice");
        assert!(!tracker.is_locked("alice"));
    }

    #[test]
    fn cleanup_prunes_idle_entries_but_keeps_locked_ones() {
        let tracker = LockoutTracker::new(config());
        tracker.record_failure("alice");
        tracker.record_failure("alice");
        tracker.record_failure("alice");
        assert!(tracker.is_locked("alice"));

        tracker.cleanup_idle(Duration::from_secs(0));
        assert!(tracker.is_locked("alice"));
    }
}
