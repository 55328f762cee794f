//! Feedback Retry Loop
//!
//! Re-runs a failing attempt up to a fixed number of times, handing each
//! new attempt the error detail of the one before it. Attempts are strictly
//! sequential. A success or a non-retryable error ends the loop early.

use std::fmt::Display;
use std::future::Future;
use tracing::warn;

/// Default attempt limit
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Errors that know whether another attempt could help
pub trait Retryable {
    /// `false` ends the loop immediately
    fn is_retryable(&self) -> bool {
        true
    }
}

impl Retryable for String {}

/// Result of a retry loop
#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackOutcome<T, E> {
    /// Value from the successful attempt, if any
    pub result: Option<T>,
    /// Attempts made, including the successful one
    pub attempts: u32,
    /// Error from the last failed attempt; `None` after a success
    pub last_error: Option<E>,
}

impl<T, E> FeedbackOutcome<T, E> {
    /// Check if some attempt succeeded
    #[inline]
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.result.is_some()
    }

    /// Collapse into a `Result`, keeping only the last error
    ///
    /// # Errors
    /// The last error when no attempt succeeded.
    pub fn into_result(self) -> Result<T, Option<E>> {
        self.result.ok_or(self.last_error)
    }
}

/// Sequential retry driver
#[derive(Debug, Clone, Copy)]
pub struct FeedbackLoop {
    max_attempts: u32,
}

impl Default for FeedbackLoop {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl FeedbackLoop {
    /// Create a loop making at most `max_attempts` attempts (minimum one)
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Attempt limit
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `attempt` until it succeeds, fails non-retryably, or the limit
    /// is reached
    ///
    /// The closure receives the attempt number, counted from 1, and the
    /// rendered error of the previous attempt (`None` on the first).
    pub async fn run<T, E, F, Fut>(&self, mut attempt: F) -> FeedbackOutcome<T, E>
    where
        E: Retryable + Display,
        F: FnMut(u32, Option<String>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut feedback = None;
        let mut last_error = None;
        for number in 1..=self.max_attempts {
            match attempt(number, feedback.take()).await {
                Ok(value) => {
                    return FeedbackOutcome {
                        result: Some(value),
                        attempts: number,
                        last_error: None,
                    };
                }
                Err(e) => {
                    warn!(
                        attempt = number,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "Attempt failed"
                    );
                    let retryable = e.is_retryable();
                    feedback = Some(e.to_string());
                    last_error = Some(e);
                    if !retryable {
                        return FeedbackOutcome {
                            result: None,
                            attempts: number,
                            last_error,
                        };
                    }
                }
            }
        }
        FeedbackOutcome {
            result: None,
            attempts: self.max_attempts,
            last_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    struct Fatal;

    impl Display for Fatal {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("fatal")
        }
    }

    impl Retryable for Fatal {
        fn is_retryable(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt_with_feedback() {
        let mut seen = Vec::new();
        let outcome = FeedbackLoop::new(3)
            .run(|number, previous| {
                seen.push(previous);
                async move {
                    if number < 3 {
                        Err(format!("error {number}"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(outcome.result, Some("done"));
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.last_error.is_none());
        assert_eq!(
            seen,
            vec![None, Some("error 1".to_string()), Some("error 2".to_string())]
        );
    }

    #[tokio::test]
    async fn exhausts_attempts() {
        let calls = AtomicU32::new(0);
        let outcome: FeedbackOutcome<(), String> = FeedbackLoop::new(3)
            .run(|_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("nope".to_string()) }
            })
            .await;
        assert!(!outcome.succeeded());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.last_error.as_deref(), Some("nope"));
    }

    #[tokio::test]
    async fn non_retryable_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let outcome: FeedbackOutcome<(), Fatal> = FeedbackLoop::new(5)
            .run(|_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Fatal) }
            })
            .await;
        assert_eq!(outcome.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.last_error, Some(Fatal));
    }

    #[test]
    fn zero_attempts_is_clamped_to_one() {
        assert_eq!(FeedbackLoop::new(0).max_attempts(), 1);
    }

    fn run_blocking(max: u32, fail_first: u32) -> (FeedbackOutcome<u32, String>, u32) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let calls = AtomicU32::new(0);
        let outcome = runtime.block_on(FeedbackLoop::new(max).run(|number, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if number <= fail_first {
                    Err(format!("failure {number}"))
                } else {
                    Ok(number)
                }
            }
        }));
        (outcome, calls.load(Ordering::SeqCst))
    }

    proptest! {
        #[test]
        fn attempts_never_exceed_budget(max in 1u32..8, fail_first in 0u32..12) {
            let (outcome, calls) = run_blocking(max, fail_first);
            prop_assert_eq!(calls, outcome.attempts);
            prop_assert!(outcome.attempts <= max);
            if fail_first < max {
                prop_assert_eq!(outcome.result, Some(fail_first + 1));
                prop_assert_eq!(outcome.attempts, fail_first + 1);
                prop_assert!(outcome.last_error.is_none());
            } else {
                prop_assert!(outcome.result.is_none());
                prop_assert_eq!(outcome.attempts, max);
                prop_assert_eq!(outcome.last_error, Some(format!("failure {max}")));
            }
        }
    }
}
