//! Retry Coordination
//!
//! Failed loads are classified by [`RecordError::kind`] and either retried
//! with exponential backoff or surfaced immediately:
//!
//! | kind        | retried |
//! |-------------|---------|
//! | `Transient` | yes, up to `max_retries` |
//! | `NotFound`  | no |
//! | `Invalid`   | no |
//! | `Unknown`   | no |
//!
//! The delay before retry `n` (zero-based) is
//! `base_delay_ms * multiplier^n`, capped at `max_delay_ms`.

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::error::RecordError;

/// Backoff parameters for transient failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries attempted after the initial load. `0` disables retrying.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            multiplier: 2.0,
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn never() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before the retry following failed attempt `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let millis = (self.base_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(millis as u64)
    }

    /// Decide whether failed attempt number `attempt` (zero-based) should be
    /// followed by another.
    pub fn decide(&self, error: &RecordError, attempt: u32) -> RetryDecision {
        if !error.is_retryable() || attempt >= self.max_retries {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry {
            delay: self.delay_for(attempt),
        }
    }
}

/// A single cancellable retry timer.
///
/// Scheduling replaces (and aborts) any previously scheduled retry.
#[derive(Debug, Default)]
pub(crate) struct RetryTimer {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RetryTimer {
    /// Run `f` after `delay` on the current tokio runtime. Returns `false`
    /// when called outside a runtime, in which case nothing is scheduled.
    pub(crate) fn schedule<F>(&self, delay: Duration, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return false;
        };
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            f();
        });
        if let Some(previous) = self.task.lock().replace(task) {
            previous.abort();
        }
        true
    }

    pub(crate) fn cancel(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for RetryTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn transient_errors_back_off_exponentially() {
        let policy = RetryPolicy::default();
        let err = RecordError::Transient("offline".into());

        assert_eq!(
            policy.decide(&err, 0),
            RetryDecision::Retry {
                delay: Duration::from_millis(100)
            }
        );
        assert_eq!(
            policy.decide(&err, 3),
            RetryDecision::Retry {
                delay: Duration::from_millis(800)
            }
        );
        assert_eq!(policy.decide(&err, 5), RetryDecision::GiveUp);
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy {
            max_retries: 50,
            max_delay_ms: 1_000,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(20), Duration::from_millis(1_000));
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let policy = RetryPolicy::default();
        let not_found = RecordError::NotFound {
            table: "tasks",
            id: "X".into(),
        };
        assert_eq!(policy.decide(&not_found, 0), RetryDecision::GiveUp);
        assert_eq!(
            policy.decide(&RecordError::Unknown("boom".into()), 0),
            RetryDecision::GiveUp
        );
        assert_eq!(
            policy.decide(&RecordError::InvalidQuery("bad".into()), 0),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn never_gives_up_immediately() {
        let err = RecordError::Transient("offline".into());
        assert_eq!(RetryPolicy::never().decide(&err, 0), RetryDecision::GiveUp);
    }

    #[test]
    fn deserializes_with_defaults() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"max_retries": 2}"#).unwrap();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.base_delay_ms, 100);
    }

    #[test]
    fn timer_needs_a_runtime() {
        let timer = RetryTimer::default();
        assert!(!timer.schedule(Duration::from_millis(1), || {}));
        assert!(!timer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = RetryTimer::default();

        let fired_clone = fired.clone();
        assert!(timer.schedule(Duration::from_millis(50), move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(timer.is_pending());
        timer.cancel();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        let fired_clone = fired.clone();
        timer.schedule(Duration::from_millis(50), move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
