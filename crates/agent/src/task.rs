//! Task runner: retry, timeout and abort around a fallible async operation.
//!
//! Intermediate failed attempts are logged but never surface as memories;
//! only the final outcome is returned.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Why a task did not produce a value.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskFailure<E> {
    /// The last attempt returned an error.
    Failed(E),
    /// The last attempt exceeded the timeout.
    TimedOut(Duration),
    /// The cancellation token fired.
    Aborted,
}

#[derive(Debug, Clone)]
pub struct TaskRunner {
    backoff: Duration,
}

impl TaskRunner {
    pub fn new(backoff: Duration) -> Self {
        Self { backoff }
    }

    /// Run `attempt` until it succeeds, `should_retry` declines, or `cancel`
    /// fires. `attempt` receives the 1-based attempt number; `should_retry`
    /// receives the failure and the number of attempts made so far.
    pub async fn run<T, E, F, Fut>(
        &self,
        label: &str,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
        should_retry: impl Fn(&TaskFailure<E>, u32) -> bool,
        mut attempt: F,
    ) -> Result<T, TaskFailure<E>>
    where
        E: std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempts = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(TaskFailure::Aborted);
            }
            attempts += 1;

            let future = attempt(attempts);
            let outcome = tokio::select! {
                biased;
                outcome = with_timeout(timeout, future) => outcome,
                _ = cancel.cancelled() => return Err(TaskFailure::Aborted),
            };

            let failure = match outcome {
                Some(Ok(value)) => return Ok(value),
                _ if cancel.is_cancelled() => return Err(TaskFailure::Aborted),
                Some(Err(e)) => TaskFailure::Failed(e),
                None => TaskFailure::TimedOut(timeout.unwrap_or_default()),
            };

            if !should_retry(&failure, attempts) {
                return Err(failure);
            }

            match &failure {
                TaskFailure::Failed(e) => {
                    warn!(task = label, attempt = attempts, error = %e, "Attempt failed, retrying")
                }
                _ => warn!(task = label, attempt = attempts, "Attempt timed out, retrying"),
            }

            if !self.backoff.is_zero() {
                debug!(task = label, backoff_ms = self.backoff.as_millis() as u64, "Backing off");
                tokio::select! {
                    _ = tokio::time::sleep(self.backoff) => {}
                    _ = cancel.cancelled() => return Err(TaskFailure::Aborted),
                }
            }
        }
    }
}

impl Default for TaskRunner {
    fn default() -> Self {
        Self::new(Duration::from_millis(200))
    }
}

/// `None` when the timeout elapsed first.
async fn with_timeout<T>(timeout: Option<Duration>, future: impl Future<Output = T>) -> Option<T> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, future).await.ok(),
        None => Some(future.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn runner() -> TaskRunner {
        TaskRunner::new(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let result: Result<u32, TaskFailure<String>> = runner()
            .run("ok", None, &CancellationToken::new(), |_, _| true, |n| async move { Ok(n) })
            .await;
        assert_eq!(result, Ok(1));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = runner()
            .run(
                "flaky",
                None,
                &CancellationToken::new(),
                |_, attempts| attempts < 5,
                move |n| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async move { if n < 3 { Err(format!("fail {n}")) } else { Ok(n) } }
                },
            )
            .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_when_policy_declines() {
        let result: Result<(), _> = runner()
            .run(
                "broken",
                None,
                &CancellationToken::new(),
                |_, attempts| attempts < 2,
                |_| async { Err("nope".to_string()) },
            )
            .await;
        assert_eq!(result, Err(TaskFailure::Failed("nope".to_string())));
    }

    #[tokio::test]
    async fn times_out() {
        let result: Result<(), TaskFailure<String>> = runner()
            .run(
                "slow",
                Some(Duration::from_millis(10)),
                &CancellationToken::new(),
                |_, _| false,
                |_| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                },
            )
            .await;
        assert_eq!(result, Err(TaskFailure::TimedOut(Duration::from_millis(10))));
    }

    #[tokio::test]
    async fn cancellation_aborts_in_flight_attempt() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let result: Result<(), TaskFailure<String>> = runner()
            .run("long", None, &cancel, |_, _| true, |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert_eq!(result, Err(TaskFailure::Aborted));
    }

    #[tokio::test]
    async fn already_cancelled_never_attempts() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);
        let result: Result<(), TaskFailure<String>> = runner()
            .run("never", None, &cancel, |_, _| true, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert_eq!(result, Err(TaskFailure::Aborted));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
