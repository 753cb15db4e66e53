use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::warn;

use crate::{ApiError, FetchError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per request on transient failures, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Longest total wait for rate-limit resets per request before giving up.
    pub max_rate_limit_wait: Duration,
    /// Pause after a rate-limit signal that carries no reset time.
    pub rate_limit_fallback: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            max_rate_limit_wait: Duration::from_secs(15 * 60),
            rate_limit_fallback: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff after the given failed attempt, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// How long to pause for a rate limit resetting at `reset_at`.
    ///
    /// A reset that already passed still pauses for `initial_backoff`, so a
    /// skewed clock cannot spin on the API.
    pub fn rate_limit_wait(&self, reset_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Duration {
        match reset_at {
            Some(reset) => (reset - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .max(self.initial_backoff),
            None => self.rate_limit_fallback.min(self.max_rate_limit_wait),
        }
    }
}

/// Lifecycle of a single API request under the retry policy.
///
/// `attempt` counts transient failures only; `waited` is the time already
/// spent on rate-limit pauses, bounded by `max_rate_limit_wait`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestState<T> {
    Requesting {
        attempt: u32,
        waited: Duration,
    },
    BackingOff {
        attempt: u32,
        waited: Duration,
        delay: Duration,
    },
    RateLimited {
        attempt: u32,
        waited: Duration,
        wait: Duration,
    },
    Done(T),
    Failed(FetchError),
}

impl<T> RequestState<T> {
    pub fn start() -> Self {
        Self::Requesting {
            attempt: 1,
            waited: Duration::ZERO,
        }
    }

    /// Transition taken after attempt number `attempt` failed with `error`.
    pub fn after_error(
        policy: &RetryPolicy,
        attempt: u32,
        waited: Duration,
        error: ApiError,
        now: DateTime<Utc>,
    ) -> Self {
        match error {
            ApiError::Unauthorized(message) => Self::Failed(FetchError::Auth(message)),
            ApiError::NotFound(message) => Self::Failed(FetchError::NotFound(message)),
            ApiError::Other(message) => Self::Failed(FetchError::Unexpected(message)),
            ApiError::Transient(message) if attempt >= policy.max_attempts => {
                Self::Failed(FetchError::TransientNetwork {
                    attempts: attempt,
                    message,
                })
            }
            ApiError::Transient(_) => Self::BackingOff {
                attempt,
                waited,
                delay: policy.backoff(attempt),
            },
            ApiError::RateLimited { reset_at } => {
                let wait = policy.rate_limit_wait(reset_at, now);
                if waited.saturating_add(wait) > policy.max_rate_limit_wait {
                    Self::Failed(FetchError::RateLimit {
                        retry_after: Some(wait),
                    })
                } else {
                    Self::RateLimited {
                        attempt,
                        waited,
                        wait,
                    }
                }
            }
        }
    }
}

/// Pause shared by every in-flight request of a fetcher, so one rate-limit
/// signal holds back the whole request volume rather than a single call.
#[derive(Debug, Default)]
pub struct RateLimitGate {
    reopens_at: Mutex<Option<Instant>>,
}

impl RateLimitGate {
    pub fn close_for(&self, wait: Duration) {
        let until = Instant::now() + wait;
        let mut reopens_at = self.reopens_at.lock().unwrap_or_else(PoisonError::into_inner);
        *reopens_at = Some(reopens_at.map_or(until, |current| current.max(until)));
    }

    pub async fn wait_open(&self) {
        while let Some(deadline) = self.deadline() {
            if deadline <= Instant::now() {
                break;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }

    fn deadline(&self) -> Option<Instant> {
        *self.reopens_at.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drives one request through [`RequestState`] until it is done or failed.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    gate: &RateLimitGate,
    what: &str,
    mut request: F,
) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut state = RequestState::start();
    loop {
        state = match state {
            RequestState::Requesting { attempt, waited } => {
                gate.wait_open().await;
                match request().await {
                    Ok(value) => RequestState::Done(value),
                    Err(error) => {
                        RequestState::after_error(policy, attempt, waited, error, Utc::now())
                    }
                }
            }
            RequestState::BackingOff {
                attempt,
                waited,
                delay,
            } => {
                warn!("{what}: attempt {attempt} failed, retrying in {delay:?}");
                tokio::time::sleep(delay).await;
                RequestState::Requesting {
                    attempt: attempt + 1,
                    waited,
                }
            }
            RequestState::RateLimited {
                attempt,
                waited,
                wait,
            } => {
                warn!("{what}: rate limited, pausing requests for {wait:?}");
                gate.close_for(wait);
                RequestState::Requesting {
                    attempt,
                    waited: waited + wait,
                }
            }
            RequestState::Done(value) => return Ok(value),
            RequestState::Failed(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(250),
            max_rate_limit_wait: Duration::from_secs(60),
            rate_limit_fallback: Duration::from_secs(20),
        }
    }

    fn now() -> DateTime<Utc> {
        "2024-01-01T00:00:00Z".parse().unwrap()
    }

    fn rate_limited(reset_in_secs: Option<i64>) -> ApiError {
        ApiError::RateLimited {
            reset_at: reset_in_secs.map(|secs| now() + chrono::Duration::seconds(secs)),
        }
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let policy = policy();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(250));
        assert_eq!(policy.backoff(40), Duration::from_millis(250));
    }

    #[test]
    fn fatal_errors_fail_immediately() {
        let state = RequestState::<()>::after_error(
            &policy(),
            1,
            Duration::ZERO,
            ApiError::Unauthorized("bad token".to_string()),
            now(),
        );
        assert_eq!(
            state,
            RequestState::Failed(FetchError::Auth("bad token".to_string()))
        );

        let state = RequestState::<()>::after_error(
            &policy(),
            1,
            Duration::ZERO,
            ApiError::NotFound("x/y".to_string()),
            now(),
        );
        assert_eq!(
            state,
            RequestState::Failed(FetchError::NotFound("x/y".to_string()))
        );
    }

    #[test]
    fn transient_errors_back_off_until_attempts_run_out() {
        let error = || ApiError::Transient("timeout".to_string());

        assert_eq!(
            RequestState::<()>::after_error(&policy(), 1, Duration::ZERO, error(), now()),
            RequestState::BackingOff {
                attempt: 1,
                waited: Duration::ZERO,
                delay: Duration::from_millis(100)
            }
        );
        assert_eq!(
            RequestState::<()>::after_error(&policy(), 3, Duration::ZERO, error(), now()),
            RequestState::Failed(FetchError::TransientNetwork {
                attempts: 3,
                message: "timeout".to_string()
            })
        );
    }

    #[test]
    fn rate_limit_waits_for_reset_within_bound() {
        assert_eq!(
            RequestState::<()>::after_error(&policy(), 1, Duration::ZERO, rate_limited(Some(30)), now()),
            RequestState::RateLimited {
                attempt: 1,
                waited: Duration::ZERO,
                wait: Duration::from_secs(30)
            }
        );
    }

    #[test]
    fn rate_limit_does_not_use_up_transient_attempts() {
        let state = RequestState::<()>::after_error(
            &policy(),
            3,
            Duration::from_secs(10),
            rate_limited(Some(30)),
            now(),
        );
        assert_eq!(
            state,
            RequestState::RateLimited {
                attempt: 3,
                waited: Duration::from_secs(10),
                wait: Duration::from_secs(30)
            }
        );
    }

    #[test]
    fn rate_limit_beyond_bound_fails_with_hint() {
        assert_eq!(
            RequestState::<()>::after_error(&policy(), 1, Duration::ZERO, rate_limited(Some(600)), now()),
            RequestState::Failed(FetchError::RateLimit {
                retry_after: Some(Duration::from_secs(600))
            })
        );

        // The bound covers the total time waited by one request.
        assert_eq!(
            RequestState::<()>::after_error(
                &policy(),
                1,
                Duration::from_secs(45),
                rate_limited(Some(30)),
                now()
            ),
            RequestState::Failed(FetchError::RateLimit {
                retry_after: Some(Duration::from_secs(30))
            })
        );
    }

    #[test]
    fn unknown_reset_uses_fallback_wait() {
        assert_eq!(
            RequestState::<()>::after_error(&policy(), 1, Duration::ZERO, rate_limited(None), now()),
            RequestState::RateLimited {
                attempt: 1,
                waited: Duration::ZERO,
                wait: Duration::from_secs(20)
            }
        );

        let short = RetryPolicy {
            max_rate_limit_wait: Duration::from_secs(5),
            ..policy()
        };
        assert_eq!(
            short.rate_limit_wait(None, now()),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn rate_limit_reset_in_the_past_pauses_briefly() {
        assert_eq!(
            RequestState::<()>::after_error(&policy(), 2, Duration::ZERO, rate_limited(Some(-5)), now()),
            RequestState::RateLimited {
                attempt: 2,
                waited: Duration::ZERO,
                wait: Duration::from_millis(100)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = with_retry(&policy(), &RateLimitGate::default(), "test", || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ApiError::Transient("reset by peer".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn resumes_after_repeated_rate_limits() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();
        let result = with_retry(&policy(), &RateLimitGate::default(), "test", || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(ApiError::RateLimited {
                        reset_at: Some(Utc::now() + chrono::Duration::seconds(15)),
                    })
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(started.elapsed() >= Duration::from_secs(40));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_reset_fails_with_hint_once_budget_is_spent() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();
        let result: Result<(), _> = with_retry(&policy(), &RateLimitGate::default(), "test", || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ApiError::RateLimited { reset_at: None })
            }
        })
        .await;

        assert_eq!(
            result,
            Err(FetchError::RateLimit {
                retry_after: Some(Duration::from_secs(20))
            })
        );
        // Three 20s pauses fit into the 60s bound, the fourth signal gives up.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn does_not_retry_auth_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), _> = with_retry(&policy(), &RateLimitGate::default(), "test", || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ApiError::Unauthorized("expired".to_string()))
            }
        })
        .await;

        assert_eq!(result, Err(FetchError::Auth("expired".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_gate_holds_requests_back() {
        let gate = RateLimitGate::default();
        gate.close_for(Duration::from_secs(5));

        let started = Instant::now();
        gate.wait_open().await;
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn gate_keeps_the_latest_deadline() {
        let gate = RateLimitGate::default();
        gate.close_for(Duration::from_secs(10));
        gate.close_for(Duration::from_secs(2));

        let started = Instant::now();
        gate.wait_open().await;
        assert!(started.elapsed() >= Duration::from_secs(10));
    }
}
