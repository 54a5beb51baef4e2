// Retry logic with exponential backoff and jitter
//
// Used by the control client (reconnect loop) and the session manager
// (join retries). Delays double from `base` up to `cap`, and each delay is
// scaled by a random factor in [0.5, 1.5) so many devices reconnecting to the
// same server spread out.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, Result};

/// Exponential backoff state for one retry loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
            attempt: 0,
        }
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt, without jitter.
    pub fn nominal_delay(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(16));
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Advance and return the jittered delay for the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let nominal = self.nominal_delay();
        self.attempt = self.attempt.saturating_add(1);
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(nominal.as_secs_f64() * jitter).min(self.cap)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Sleep for `delay` unless `cancel` fires first.
///
/// Returns `Err(Cancelled)` when the token was cancelled.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(AgentError::Cancelled),
        _ = sleep(delay) => Ok(()),
    }
}

/// Run `op` until it succeeds, a non-transient error occurs, `max_attempts`
/// is exhausted (0 = unlimited) or `cancel` fires.
pub async fn retry_transient<F, Fut, T>(
    backoff: &mut Backoff,
    max_attempts: u32,
    operation: &str,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            outcome = op() => outcome,
        };
        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => {
                if max_attempts > 0 && attempt >= max_attempts {
                    tracing::error!(operation, attempt, error = %e, "Giving up after max attempts");
                    return Err(e);
                }
                let delay = backoff.next_delay();
                tracing::warn!(
                    operation,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Operation failed, retrying"
                );
                sleep_or_cancel(delay, cancel).await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_nominal_delay_doubles_until_cap() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(b.nominal_delay().as_secs());
            b.next_delay();
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn test_jittered_delay_stays_in_bounds() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));
        for _ in 0..50 {
            let nominal = b.nominal_delay();
            let d = b.next_delay();
            assert!(d >= nominal / 2);
            assert!(d <= Duration::from_secs(1));
        }
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut b = Backoff::new(Duration::from_millis(10), Duration::from_secs(1));
        b.next_delay();
        b.next_delay();
        assert_eq!(b.attempt(), 2);
        b.reset();
        assert_eq!(b.attempt(), 0);
        assert_eq!(b.nominal_delay(), Duration::from_millis(10));
    }

    #[test]
    fn test_huge_attempt_count_does_not_overflow() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        for _ in 0..200 {
            b.next_delay();
        }
        assert_eq!(b.nominal_delay(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_retry_stops_on_permanent_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut b = Backoff::new(Duration::from_millis(1), Duration::from_millis(2));
        let token = CancellationToken::new();
        let c = calls.clone();
        let res: Result<()> = retry_transient(&mut b, 0, "test", &token, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(AgentError::Auth("nope".into()))
            }
        })
        .await;
        assert_eq!(res, Err(AgentError::Auth("nope".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut b = Backoff::new(Duration::from_millis(1), Duration::from_millis(2));
        let token = CancellationToken::new();
        let c = calls.clone();
        let res = retry_transient(&mut b, 0, "test", &token, || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(AgentError::Network("down".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(res, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_respects_attempt_limit() {
        let mut b = Backoff::new(Duration::from_millis(1), Duration::from_millis(2));
        let token = CancellationToken::new();
        let res: Result<()> = retry_transient(&mut b, 2, "test", &token, || async {
            Err(AgentError::Timeout("slow".into()))
        })
        .await;
        assert!(matches!(res, Err(AgentError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_retry_cancelled_during_backoff() {
        let mut b = Backoff::new(Duration::from_secs(30), Duration::from_secs(60));
        let token = CancellationToken::new();
        let t = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            t.cancel();
        });
        let res: Result<()> = retry_transient(&mut b, 0, "test", &token, || async {
            Err(AgentError::Network("down".into()))
        })
        .await;
        assert_eq!(res, Err(AgentError::Cancelled));
    }
}
