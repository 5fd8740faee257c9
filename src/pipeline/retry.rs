//! Retry with exponential backoff for outbound network calls.
//!
//! Shared by the fetcher and the geocoder so both follow one policy: only
//! transient failures ([`FetchError::is_transient`]) are retried, with delays of
//! `backoff_ms · 2^(attempt-1)`. With a 500 ms base and 3 retries the wait
//! sequence is 500 ms → 1 s → 2 s.

use crate::error::FetchError;
use std::future::Future;
use tokio::time::{sleep, Duration};
use tracing::warn;

/// Retry policy knobs, copied out of [`crate::config::PipelineConfig`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(self.backoff_ms.saturating_mul(2u64.saturating_pow(attempt - 1)))
        }
    }
}

/// Run `op` until it succeeds, fails terminally, or retries run out.
///
/// Returns the final result together with the number of retries used.
pub async fn with_backoff<T, F, Fut>(
    label: &str,
    policy: RetryPolicy,
    mut op: F,
) -> (Result<T, FetchError>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut attempt = 0;
    loop {
        if attempt > 0 {
            let backoff = policy.delay_for(attempt);
            warn!(
                "{}: retry {}/{} after {}ms",
                label,
                attempt,
                policy.max_retries,
                backoff.as_millis()
            );
            sleep(backoff).await;
        }

        match op().await {
            Ok(value) => return (Ok(value), attempt),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                warn!("{}: attempt {} failed: {}", label, attempt + 1, e);
                attempt += 1;
            }
            Err(e) => return (Err(e), attempt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            backoff_ms: 1,
        }
    }

    #[test]
    fn delays_double() {
        let p = RetryPolicy {
            max_retries: 3,
            backoff_ms: 500,
        };
        assert_eq!(p.delay_for(1), Duration::from_millis(500));
        assert_eq!(p.delay_for(2), Duration::from_millis(1000));
        assert_eq!(p.delay_for(3), Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let (result, retries) = with_backoff("t", fast(), || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(FetchError::HttpStatus {
                    url: "u".into(),
                    status: 503,
                })
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let (result, retries): (Result<(), _>, _) = with_backoff("t", fast(), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(FetchError::HttpStatus {
                url: "u".into(),
                status: 404,
            })
        })
        .await;
        assert!(result.is_err());
        assert_eq!(retries, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let (result, retries): (Result<(), _>, _) = with_backoff("t", fast(), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(FetchError::Timeout {
                url: "u".into(),
                secs: 1,
            })
        })
        .await;
        assert!(matches!(result, Err(FetchError::Timeout { .. })));
        assert_eq!(retries, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
