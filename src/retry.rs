//! The retry coordinator: exponential backoff over a retryable-error
//! predicate.

use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{instrument, warn};

use crate::constant::{DATABASE_UNAVAILABLE_CODE, DEADLOCK_CODE};
use crate::error::Error;

/// Configuration for one retry loop. `max_retry_time` defaults to match
/// [`crate::config::Opts`]'s `max_transaction_retry_time`;
/// `initial_delay`/`multiplier`/`jitter_factor` are internal tuning
/// knobs not exposed on `Opts`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retry_time: Duration,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry_time: Duration::from_secs(30),
            initial_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            jitter_factor: 0.2,
        }
    }
}

/// What the retry loop does with a given address once it learns an
/// error happened against it, beyond simply deciding to retry:
/// `DatabaseUnavailable` additionally forgets the address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Fatal: propagate immediately.
    Fatal,
    /// Retryable, no further side effect.
    Retry,
    /// Retryable, and the routing table should forget the address that
    /// produced the error.
    RetryAndForget,
}

/// The retryable-error predicate, structured as a small classification
/// function so new transient codes can be added without touching the
/// retry loop itself.
pub fn classify(error: &Error) -> RetryAction {
    match error {
        Error::SessionExpired(_) | Error::ServiceUnavailable(_) => RetryAction::Retry,
        // Every Neo.TransientError.* code is retryable; DatabaseUnavailable
        // additionally drops the address from routing. Deadlock is
        // retryable too, despite looking like every other transient code.
        Error::TransientException { code, .. } if code == DATABASE_UNAVAILABLE_CODE => {
            RetryAction::RetryAndForget
        }
        Error::TransientException { .. } => RetryAction::Retry,
        _ => RetryAction::Fatal,
    }
}

/// Accumulates every retryable error seen across attempts so the final
/// failure (if any) can attach them as suppressed.
#[derive(Debug, Default)]
pub struct RetryHistory {
    suppressed: Vec<Error>,
}

impl RetryHistory {
    pub fn record(&mut self, error: Error) {
        self.suppressed.push(error);
    }

    pub fn suppressed(&self) -> &[Error] {
        &self.suppressed
    }
}

/// Executes `work`, classifies failures, sleeps with jittered
/// exponential backoff, and repeats until success, a fatal error, or the
/// time budget is exhausted.
///
/// The sleep happens via `tokio::time::sleep` on whatever executor
/// polls this future — never inline on an I/O worker. Callers driving
/// this from the blocking facade do so through a dedicated thread, not
/// the transport's event loop.
#[instrument(skip(work, policy))]
pub async fn retry_async<T, F, Fut>(policy: RetryPolicy, mut work: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, Error>>,
{
    let start = Instant::now();
    let mut delay = policy.initial_delay;
    let mut history = RetryHistory::default();

    loop {
        match work().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                let action = classify(&error);
                if action == RetryAction::Fatal {
                    return Err(attach_suppressed(error, history));
                }
                if start.elapsed() >= policy.max_retry_time {
                    return Err(attach_suppressed(error, history));
                }
                warn!(error = %error, delay_ms = delay.as_millis(), "retrying after transient failure");
                history.record(error);

                let jittered = jitter(delay, policy.jitter_factor);
                tokio::time::sleep(jittered).await;
                delay = delay.mul_f64(policy.multiplier).min(policy.max_delay);
            }
        }
    }
}

pub(crate) fn jitter(delay: Duration, factor: f64) -> Duration {
    if factor <= 0.0 {
        return delay;
    }
    let mut rng = rand::thread_rng();
    let offset = rng.gen_range(-factor..=factor);
    let scaled = (delay.as_secs_f64() * (1.0 + offset)).max(0.0);
    Duration::from_secs_f64(scaled)
}

/// Wraps the final error's message with a note describing the
/// retryable errors that preceded it, attaching them as suppressed
/// without introducing a second error variant.
pub(crate) fn attach_suppressed(last: Error, history: RetryHistory) -> Error {
    if history.suppressed().is_empty() {
        return last;
    }
    let suppressed_summary = history
        .suppressed()
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    match last {
        Error::ServiceUnavailable(msg) => Error::ServiceUnavailable(format!(
            "{msg} (after {} retryable attempt(s): {suppressed_summary})",
            history.suppressed().len()
        )),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn classifies_session_expired_and_service_unavailable_as_retryable() {
        assert_eq!(classify(&Error::SessionExpired("x".into())), RetryAction::Retry);
        assert_eq!(classify(&Error::ServiceUnavailable("x".into())), RetryAction::Retry);
    }

    #[test]
    fn classifies_database_unavailable_as_retry_and_forget() {
        let error = Error::TransientException {
            code: DATABASE_UNAVAILABLE_CODE.to_string(),
            message: "down".into(),
        };
        assert_eq!(classify(&error), RetryAction::RetryAndForget);
    }

    #[test]
    fn classifies_deadlock_as_plain_retry() {
        let error = Error::TransientException {
            code: DEADLOCK_CODE.to_string(),
            message: "deadlock".into(),
        };
        assert_eq!(classify(&error), RetryAction::Retry);
    }

    #[test]
    fn classifies_client_exception_as_fatal() {
        assert_eq!(classify(&Error::ClientException("bad query".into())), RetryAction::Fatal);
    }

    #[tokio::test]
    async fn retries_until_success_within_budget() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let policy = RetryPolicy {
            max_retry_time: Duration::from_secs(5),
            initial_delay: Duration::from_millis(1),
            multiplier: 1.0,
            max_delay: Duration::from_millis(5),
            jitter_factor: 0.0,
        };
        let attempts_clone = Arc::clone(&attempts);
        let result = retry_async(policy, move || {
            let attempts = Arc::clone(&attempts_clone);
            async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(Error::ServiceUnavailable("not yet".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_error_short_circuits_immediately() {
        let policy = RetryPolicy::default();
        let result: Result<(), Error> =
            retry_async(policy, || async { Err(Error::ClientException("syntax".into())) }).await;
        assert!(matches!(result.unwrap_err(), Error::ClientException(_)));
    }
}
