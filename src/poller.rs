//! Backoff poller for the remote-poll client.
//!
//! Repeatedly fetches the status of one ask until a terminal decision
//! appears or the wall-clock deadline passes. Waits are `tokio::time::sleep`
//! futures, so dropping the poll future (e.g. on shutdown) cancels the
//! pending wake-up with it.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, warn};

use crate::errors::{LetsPingError, Result};
use crate::models::{Decision, Status};

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Upper bound (exclusive) of the uniform jitter added to every wait.
    pub jitter_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            multiplier: 1.5,
            max_delay_ms: 10_000,
            jitter_ms: 200,
        }
    }
}

/// Exponential delay schedule: non-decreasing, capped at `max_delay_ms`.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    delay_ms: f64,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let delay_ms = (config.initial_delay_ms.min(config.max_delay_ms)) as f64;
        Self { config, delay_ms }
    }

    /// Delay for the upcoming wait, without jitter.
    pub fn current(&self) -> Duration {
        Duration::from_millis(self.delay_ms as u64)
    }

    /// Returns the next wait (delay + jitter) and advances the schedule.
    pub fn next_wait(&mut self) -> Duration {
        let jitter = if self.config.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..self.config.jitter_ms)
        } else {
            0
        };
        let wait = Duration::from_millis(self.delay_ms as u64 + jitter);
        self.delay_ms = (self.delay_ms * self.config.multiplier).min(self.config.max_delay_ms as f64);
        wait
    }
}

/// Polls `fetch` until the ask identified by `request_id` is approved or
/// rejected.
///
/// NotFound / RateLimited fetch failures are swallowed; any other failure is
/// returned immediately. A remote TIMEOUT status, or reaching `timeout`
/// locally, yields [`LetsPingError::Timeout`]. Both the waits and the
/// in-flight fetch are bounded by the deadline, so the timeout fires within
/// one polling interval even against a slow status endpoint.
pub async fn poll_until_decided<F, Fut>(
    request_id: &str,
    timeout: Duration,
    config: &BackoffConfig,
    mut fetch: F,
) -> Result<Decision>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Decision>>,
{
    let start = Instant::now();
    let deadline = start + timeout;
    let mut backoff = Backoff::new(config.clone());
    let mut attempt: u32 = 0;

    while Instant::now() < deadline {
        attempt += 1;
        let fetched = match timeout_at(deadline, fetch()).await {
            Ok(result) => result,
            Err(_) => {
                debug!(request_id = %request_id, attempt, "deadline reached during status fetch");
                break;
            }
        };
        match fetched {
            Ok(decision) => match decision.status {
                Status::Approved | Status::Rejected => {
                    debug!(
                        request_id = %request_id,
                        status = %decision.status,
                        attempt,
                        "decision received"
                    );
                    return Ok(decision);
                }
                Status::Timeout => {
                    return Err(LetsPingError::Timeout {
                        id: request_id.to_string(),
                    })
                }
                Status::Pending => {}
            },
            Err(e) if e.is_transient() => {
                debug!(request_id = %request_id, attempt, "transient poll error: {}", e);
            }
            Err(e) => {
                warn!(request_id = %request_id, attempt, "poll failed: {}", e);
                return Err(e);
            }
        }

        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let wait = backoff.next_wait().min(deadline - now);
        sleep(wait).await;
    }

    Err(LetsPingError::Timeout {
        id: request_id.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn decision(status: Status) -> Decision {
        Decision {
            status,
            ..Decision::pending("req_test")
        }
    }

    #[test]
    fn test_delay_sequence_is_non_decreasing_and_capped() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        let expected = [1000u64, 1500, 2250, 3375, 5062, 7593, 10_000, 10_000, 10_000];
        let mut last = Duration::ZERO;
        for base in expected {
            assert_eq!(backoff.current(), Duration::from_millis(base));
            let wait = backoff.next_wait();
            assert!(wait >= Duration::from_millis(base));
            assert!(wait < Duration::from_millis(base + 200));
            assert!(backoff.current() >= Duration::from_millis(base));
            assert!(backoff.current() <= Duration::from_millis(10_000));
            last = last.max(backoff.current());
        }
        assert_eq!(last, Duration::from_millis(10_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_approved_on_third_fetch() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = poll_until_decided(
            "req_test",
            Duration::from_secs(60),
            &BackoffConfig::default(),
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    let status = if n >= 3 { Status::Approved } else { Status::Pending };
                    Ok::<_, LetsPingError>(decision(status))
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(result.status, Status::Approved);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_is_terminal() {
        let result = poll_until_decided(
            "req_test",
            Duration::from_secs(5),
            &BackoffConfig::default(),
            || async { Ok::<_, LetsPingError>(decision(Status::Rejected)) },
        )
        .await
        .unwrap();
        assert_eq!(result.status, Status::Rejected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_pending_times_out_within_one_interval() {
        let timeout = Duration::from_secs(30);
        let start = Instant::now();
        let err = poll_until_decided(
            "req_slow",
            timeout,
            &BackoffConfig::default(),
            || async { Ok::<_, LetsPingError>(decision(Status::Pending)) },
        )
        .await
        .unwrap_err();

        let elapsed = start.elapsed();
        assert!(matches!(err, LetsPingError::Timeout { ref id } if id == "req_slow"));
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(10_200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_fetch_does_not_outlive_deadline() {
        let timeout = Duration::from_secs(5);
        let start = Instant::now();
        let err = poll_until_decided(
            "req_hung",
            timeout,
            &BackoffConfig::default(),
            || async {
                sleep(Duration::from_secs(30)).await;
                Ok::<_, LetsPingError>(decision(Status::Approved))
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, LetsPingError::Timeout { ref id } if id == "req_hung"));
        let elapsed = start.elapsed();
        assert!(elapsed >= timeout);
        assert!(elapsed < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_swallowed() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = poll_until_decided(
            "req_test",
            Duration::from_secs(60),
            &BackoffConfig::default(),
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    match n {
                        1 => Err(LetsPingError::NotFound { id: "req_test".into() }),
                        2 => Err(LetsPingError::RateLimited),
                        _ => Ok(decision(Status::Approved)),
                    }
                }
            },
        )
        .await
        .unwrap();
        assert!(result.is_approved());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_propagates_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let err = poll_until_decided(
            "req_test",
            Duration::from_secs(60),
            &BackoffConfig::default(),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<Decision, _>(LetsPingError::Authentication) }
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LetsPingError::Authentication));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_timeout_status_fails_fast() {
        let err = poll_until_decided(
            "req_expired",
            Duration::from_secs(60),
            &BackoffConfig::default(),
            || async { Ok::<_, LetsPingError>(decision(Status::Timeout)) },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LetsPingError::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_the_poll_stops_fetching() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let backoff = BackoffConfig::default();
        let poll = poll_until_decided(
            "req_test",
            Duration::from_secs(3600),
            &backoff,
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, LetsPingError>(decision(Status::Pending)) }
            },
        );

        let cancelled = tokio::time::timeout(Duration::from_secs(5), poll).await;
        assert!(cancelled.is_err());
        let seen = calls.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(calls.load(Ordering::SeqCst), seen);
    }
}
