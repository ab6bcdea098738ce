//! Per-stage retry policy and the timeout wrapper around collaborator calls.

use std::any::Any;
use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;

use crate::error::{ErrorKind, StageError, StageResult};

/// Bounded exponential backoff. Immutable for the lifetime of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts allowed for one (run, stage), across invocations.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Error kinds worth another attempt.
    pub retryable: BTreeSet<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            retryable: ErrorKind::ALL
                .into_iter()
                .filter(|k| k.is_transient())
                .collect(),
        }
    }
}

impl RetryPolicy {
    /// One attempt, never retried.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_delays(mut self, base: Duration, multiplier: f64, max: Duration) -> Self {
        self.base_delay = base;
        self.multiplier = multiplier.max(1.0);
        self.max_delay = max;
        self
    }

    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        self.retryable.contains(&kind)
    }

    /// Delay before attempt `attempt + 1`, given `attempt` attempts so far.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exp);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Run `call` on its own thread and wait at most `timeout` for it.
///
/// A call that overruns is reported as `Timeout` and left to finish in the
/// background; its result is dropped. A panicking call becomes `Panicked`.
pub(crate) fn call_with_timeout<T, F>(timeout: Option<Duration>, call: F) -> StageResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> StageResult<T> + Send + 'static,
{
    let (tx, rx) = crossbeam_channel::bounded(1);
    std::thread::Builder::new()
        .name("kural-collaborator".to_string())
        .spawn(move || {
            let outcome = catch_unwind(AssertUnwindSafe(call));
            // The receiver is gone if the caller already timed out.
            let _ = tx.send(outcome);
        })
        .map_err(|e| {
            StageError::service_unavailable(format!("could not spawn collaborator thread: {e}"))
        })?;

    let received = match timeout {
        Some(limit) => rx.recv_timeout(limit),
        None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
    };
    match received {
        Ok(Ok(result)) => result,
        Ok(Err(payload)) => Err(StageError::new(
            ErrorKind::Panicked,
            format!("collaborator panicked: {}", panic_message(payload.as_ref())),
        )),
        Err(RecvTimeoutError::Timeout) => Err(StageError::new(
            ErrorKind::Timeout,
            format!(
                "collaborator call exceeded {:.1}s",
                timeout.unwrap_or_default().as_secs_f64()
            ),
        )),
        Err(RecvTimeoutError::Disconnected) => Err(StageError::new(
            ErrorKind::Panicked,
            "collaborator thread exited without a result",
        )),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_retries_transient_kinds_only() {
        let p = RetryPolicy::default();
        assert!(p.is_retryable(ErrorKind::ServiceUnavailable));
        assert!(p.is_retryable(ErrorKind::Timeout));
        assert!(!p.is_retryable(ErrorKind::AuthError));
        assert!(!p.is_retryable(ErrorKind::UnsupportedFormat));
    }

    #[test]
    fn backoff_grows_geometrically_and_caps() {
        let p = RetryPolicy::default().with_delays(
            Duration::from_millis(100),
            3.0,
            Duration::from_secs(1),
        );
        assert_eq!(p.delay_after(1), Duration::from_millis(100));
        assert_eq!(p.delay_after(2), Duration::from_millis(300));
        assert_eq!(p.delay_after(3), Duration::from_millis(900));
        assert_eq!(p.delay_after(4), Duration::from_secs(1));
        assert_eq!(p.delay_after(400), Duration::from_secs(1));
    }

    #[test]
    fn max_attempts_is_at_least_one() {
        assert_eq!(RetryPolicy::default().with_max_attempts(0).max_attempts, 1);
    }

    #[test]
    fn fast_call_returns_its_value() {
        let out = call_with_timeout(Some(Duration::from_secs(5)), || Ok(7));
        assert_eq!(out, Ok(7));
    }

    #[test]
    fn slow_call_times_out() {
        let err = call_with_timeout(Some(Duration::from_millis(20)), || {
            std::thread::sleep(Duration::from_millis(500));
            Ok(())
        })
        .expect_err("should time out");
        assert_eq!(err.kind, ErrorKind::Timeout);
    }

    #[test]
    fn panic_becomes_typed_failure() {
        let err = call_with_timeout::<(), _>(None, || panic!("boom"))
            .expect_err("should panic");
        assert_eq!(err.kind, ErrorKind::Panicked);
        assert!(err.message.contains("boom"));
    }
}
