use std::fmt::Display;
use std::future::Future;

use rand::Rng;
use tokio::time::{sleep, Duration};
use tracing::warn;

use crate::error::MarketDataError;

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            jitter_factor: 0.3,
        }
    }
}

impl RetryConfig {
    /// Exponential backoff clamped to `max_delay_ms`, then ±`jitter_factor`.
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64 * 2.0_f64.powi(attempt as i32);
        let clamped = base.min(self.max_delay_ms as f64);
        let spread = clamped * self.jitter_factor;
        let jitter = if spread > 0.0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };
        Duration::from_millis((clamped + jitter).max(0.0) as u64)
    }
}

/// Runs `operation` until it succeeds, the attempts are used up, or
/// `retry_if` rejects an error. Returns the last error.
pub async fn retry_async<F, Fut, T, E, P>(
    config: &RetryConfig,
    what: &str,
    retry_if: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: Fn(&E) -> bool,
{
    let attempts = config.attempts.max(1);
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt + 1 < attempts && retry_if(&e) => {
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    target: "binance_api",
                    "{what} attempt {}/{attempts} failed: {e}; retrying in {delay:?}",
                    attempt + 1
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Status codes worth another attempt.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

/// Transport failures and throttling are retried; malformed payloads are not.
pub fn is_retryable(err: &MarketDataError) -> bool {
    match err {
        MarketDataError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
        MarketDataError::Status { status, .. } => is_retryable_status(*status),
        MarketDataError::Timeout(_) | MarketDataError::Stream(_) => true,
        MarketDataError::Malformed(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast() -> RetryConfig {
        RetryConfig { attempts: 3, base_delay_ms: 1, max_delay_ms: 2, jitter_factor: 0.0 }
    }

    #[test]
    fn test_delay_doubles_then_clamps() {
        let cfg = RetryConfig { attempts: 5, base_delay_ms: 100, max_delay_ms: 1000, jitter_factor: 0.0 };
        assert_eq!(cfg.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(cfg.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(cfg.delay_for_attempt(3), Duration::from_millis(800));
        assert_eq!(cfg.delay_for_attempt(4), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_eventual_success_counts_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let out: Result<u32, String> = retry_async(&fast(), "test call", |_| true, || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst);
                if n < 2 { Err("not yet".to_string()) } else { Ok(n) }
            }
        })
        .await;
        assert_eq!(out, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let out: Result<(), String> = retry_async(&fast(), "test call", |_| true, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("down".to_string())
            }
        })
        .await;
        assert_eq!(out, Err("down".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let out: Result<(), MarketDataError> = retry_async(&fast(), "test call", is_retryable, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(MarketDataError::malformed("not an array"))
            }
        })
        .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_malformed_is_not_retryable() {
        assert!(!is_retryable(&MarketDataError::malformed("x")));
        assert!(is_retryable(&MarketDataError::Status { status: 429, body: String::new() }));
        assert!(!is_retryable(&MarketDataError::Status { status: 400, body: String::new() }));
    }
}
