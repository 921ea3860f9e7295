use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use crate::judge::FailureClass;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(8),
        }
    }
}

#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    Success { value: T, attempts: u32 },
    Failed {
        error: E,
        class: FailureClass,
        attempts: u32,
    },
}

impl RetryPolicy {
    /// Delay before the retry that follows failed attempt `attempt` (1-based):
    /// base, 2x base, 4x base, ... capped at `max_delay`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let multiplier = 2u32.saturating_pow(exponent);
        self.base_delay
            .saturating_mul(multiplier)
            .min(self.max_delay)
    }

    /// Runs `operation` until it succeeds, fails with a non-transient class, or
    /// the attempt budget is spent. A server-provided hint can lengthen the wait
    /// but never beyond `max_delay`.
    pub async fn run<T, E, F, Fut, C, H>(
        &self,
        mut operation: F,
        classify: C,
        retry_hint: H,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> FailureClass,
        H: Fn(&E) -> Option<Duration>,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1u32;

        loop {
            match operation(attempt).await {
                Ok(value) => {
                    return RetryOutcome::Success {
                        value,
                        attempts: attempt,
                    };
                }
                Err(error) => {
                    let class = classify(&error);
                    if class != FailureClass::Transient || attempt >= max_attempts {
                        return RetryOutcome::Failed {
                            error,
                            class,
                            attempts: attempt,
                        };
                    }

                    let mut delay = self.backoff_delay(attempt);
                    if let Some(hint) = retry_hint(&error) {
                        delay = delay.max(hint).min(self.max_delay);
                    }
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "transient judge failure, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(4));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(8));
        assert_eq!(policy.backoff_delay(10), Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_with_backoff_until_success() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let outcome = policy
            .run(
                |_| {
                    let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        if call < 3 {
                            Err("rate limited".to_string())
                        } else {
                            Ok("verdict")
                        }
                    }
                },
                |_| FailureClass::Transient,
                |_| None,
            )
            .await;

        match outcome {
            RetryOutcome::Success { value, attempts } => {
                assert_eq!(value, "verdict");
                assert_eq!(attempts, 3);
            }
            RetryOutcome::Failed { .. } => panic!("expected success"),
        }
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(6) && waited < Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_hint_extends_delay_up_to_cap() {
        let policy = RetryPolicy::default();
        let started = tokio::time::Instant::now();

        let outcome: RetryOutcome<(), String> = policy
            .run(
                |_| async { Err("slow down".to_string()) },
                |_| FailureClass::Transient,
                |_| Some(Duration::from_secs(30)),
            )
            .await;

        assert!(matches!(outcome, RetryOutcome::Failed { attempts: 3, .. }));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(16) && waited < Duration::from_secs(17));
    }

    #[tokio::test]
    async fn permanent_and_fatal_failures_stop_immediately() {
        let policy = RetryPolicy {
            base_delay: Duration::ZERO,
            ..RetryPolicy::default()
        };
        for class in [FailureClass::Permanent, FailureClass::Fatal] {
            let calls = AtomicU32::new(0);
            let outcome: RetryOutcome<(), String> = policy
                .run(
                    |_| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async { Err("denied".to_string()) }
                    },
                    |_| class,
                    |_| None,
                )
                .await;
            assert_eq!(calls.load(Ordering::SeqCst), 1);
            assert!(matches!(
                outcome,
                RetryOutcome::Failed { class: found, attempts: 1, .. } if found == class
            ));
        }
    }
}
