//! HTTP plumbing shared by all source clients: retry with exponential
//! backoff + jitter, and a sliding-window rate limiter sized per provider.

use std::collections::VecDeque;
use std::time::Duration;

use rand::RngExt;
use tokio::time::Instant;

use crate::error::FetchError;

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 4_000,
        }
    }
}

fn retryable_status(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

/// Delay before the next attempt: `initial * 2^(attempt-1)` capped at the
/// policy max, plus uniform jitter. A parseable Retry-After header wins.
fn retry_delay(
    attempt: u32,
    policy: &RetryPolicy,
    retry_after: Option<&reqwest::header::HeaderValue>,
) -> Duration {
    if let Some(value) = retry_after.and_then(|v| v.to_str().ok()) {
        if let Ok(secs) = value.parse::<u64>() {
            return Duration::from_secs(secs.min(30));
        }
    }

    let exponent = 2u64.saturating_pow(attempt.saturating_sub(1));
    let base = policy
        .initial_backoff_ms
        .saturating_mul(exponent)
        .min(policy.max_backoff_ms);
    let jitter = rand::rng().random_range(0..250u64);
    Duration::from_millis(base.saturating_add(jitter))
}

/// Send a request, retrying transient failures (timeout, connect error,
/// 408/429/5xx) up to the policy's attempt ceiling. Non-retryable responses
/// are returned to the caller for classification — a 404 here is not an
/// error yet.
pub async fn send_with_retry(
    request: reqwest::RequestBuilder,
    policy: &RetryPolicy,
) -> Result<reqwest::Response, FetchError> {
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        let Some(cloned) = request.try_clone() else {
            return request.send().await.map_err(FetchError::Http);
        };

        match cloned.send().await {
            Ok(response) => {
                let status = response.status();
                if retryable_status(status) && attempt < attempts {
                    let delay = retry_delay(
                        attempt,
                        policy,
                        response.headers().get(reqwest::header::RETRY_AFTER),
                    );
                    log::warn!(
                        "retry {}/{} after status {} (sleep {:?})",
                        attempt,
                        attempts,
                        status,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                if retryable_status(status) {
                    // Final attempt still transient — surface as exhausted so
                    // the caller counts one failed unit without aborting.
                    return Err(FetchError::RetriesExhausted(format!(
                        "status {} after {} attempts",
                        status, attempts
                    )));
                }
                return Ok(response);
            }
            Err(err) => {
                let retryable_transport = err.is_timeout() || err.is_connect();
                if retryable_transport && attempt < attempts {
                    let delay = retry_delay(attempt, policy, None);
                    log::warn!(
                        "retry {}/{} after transport error: {} (sleep {:?})",
                        attempt,
                        attempts,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                if retryable_transport {
                    return Err(FetchError::RetriesExhausted(err.to_string()));
                }
                return Err(FetchError::Http(err));
            }
        }
    }

    Err(FetchError::RetriesExhausted(
        "request exhausted retries".to_string(),
    ))
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

/// Provider quota: at most `calls` within any `window`.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitProfile {
    pub calls: usize,
    pub window: Duration,
}

/// Sliding-window limiter over recent call instants.
///
/// `acquire()` sleeps until the oldest tracked call exits the window, then
/// records the new call. The call log is behind a parking_lot Mutex — held
/// only for bookkeeping, never across a sleep.
pub struct RateLimiter {
    profile: RateLimitProfile,
    calls: parking_lot::Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(profile: RateLimitProfile) -> Self {
        Self {
            profile,
            calls: parking_lot::Mutex::new(VecDeque::with_capacity(profile.calls)),
        }
    }

    /// Block (async) until a call slot is free, then claim it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut calls = self.calls.lock();
                let now = Instant::now();
                while let Some(front) = calls.front() {
                    if now.duration_since(*front) >= self.profile.window {
                        calls.pop_front();
                    } else {
                        break;
                    }
                }
                if calls.len() < self.profile.calls.max(1) {
                    calls.push_back(now);
                    return;
                }
                // Oldest call still inside the window decides the wait.
                match calls.front() {
                    Some(front) => self.profile.window.saturating_sub(now.duration_since(*front)),
                    None => Duration::ZERO,
                }
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_exponential_with_cap() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 500,
        };
        let d1 = retry_delay(1, &policy, None).as_millis() as u64;
        let d2 = retry_delay(2, &policy, None).as_millis() as u64;
        let d4 = retry_delay(4, &policy, None).as_millis() as u64;
        // base 100, 200, capped 500 — each plus up to 250ms jitter
        assert!((100..350).contains(&d1), "d1={d1}");
        assert!((200..450).contains(&d2), "d2={d2}");
        assert!((500..750).contains(&d4), "d4={d4}");
    }

    #[test]
    fn test_retry_delay_honors_retry_after() {
        let policy = RetryPolicy::default();
        let header = reqwest::header::HeaderValue::from_static("7");
        let d = retry_delay(1, &policy, Some(&header));
        assert_eq!(d, Duration::from_secs(7));
    }

    #[test]
    fn test_retryable_status_classification() {
        assert!(retryable_status(reqwest::StatusCode::TOO_MANY_REQUESTS));
        assert!(retryable_status(reqwest::StatusCode::BAD_GATEWAY));
        assert!(!retryable_status(reqwest::StatusCode::NOT_FOUND));
        assert!(!retryable_status(reqwest::StatusCode::OK));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_blocks_when_window_full() {
        let limiter = RateLimiter::new(RateLimitProfile {
            calls: 2,
            window: Duration::from_secs(1),
        });

        limiter.acquire().await;
        limiter.acquire().await;

        // Third acquire must wait for the window to roll.
        let start = Instant::now();
        limiter.acquire().await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(900), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_frees_slots_as_window_slides() {
        let limiter = RateLimiter::new(RateLimitProfile {
            calls: 1,
            window: Duration::from_millis(100),
        });
        limiter.acquire().await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        // Slot expired — no further wait needed.
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(10));
    }
}
