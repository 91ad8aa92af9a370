//! Exponential backoff for transport calls.

use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::transport::TransportError;

/// Delays to wait between attempts.
///
/// Yields one delay fewer than `max_attempts`; unbounded when `max_attempts`
/// is `None`.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
    multiplier: u32,
    remaining: Option<u32>,
}

impl Backoff {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            next: config.initial_backoff.min(config.max_backoff),
            max: config.max_backoff,
            multiplier: config.multiplier.max(1),
            remaining: config.max_attempts.map(|n| n.saturating_sub(1)),
        }
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return None;
            }
            *remaining -= 1;
        }
        let delay = self.next;
        self.next = self.next.saturating_mul(self.multiplier).min(self.max);
        Some(delay)
    }
}

/// Run `op`, retrying `TransportError::Unavailable` with backoff.
///
/// Other errors are returned immediately. When attempts run out the last
/// `Unavailable` error is returned.
pub async fn retry_with_backoff<T, F, Fut>(
    config: &RetryConfig,
    what: &str,
    mut op: F,
) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let mut delays = Backoff::new(config);
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(TransportError::Unavailable(reason)) => match delays.next() {
                Some(delay) => {
                    log::warn!("{what} failed (attempt {attempt}): {reason}; retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => return Err(TransportError::Unavailable(reason)),
            },
            Err(other) => return Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_sequence() {
        let config = RetryConfig {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            multiplier: 2,
            max_attempts: Some(6),
        };
        let delays: Vec<u64> = Backoff::new(&config).map(|d| d.as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn test_backoff_unbounded() {
        let config = RetryConfig {
            max_attempts: None,
            ..RetryConfig::for_testing()
        };
        assert_eq!(Backoff::new(&config).take(100).count(), 100);
    }

    #[test]
    fn test_single_attempt_has_no_delays() {
        let config = RetryConfig {
            max_attempts: Some(1),
            ..RetryConfig::for_testing()
        };
        assert_eq!(Backoff::new(&config).count(), 0);
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&RetryConfig::for_testing(), "fetch", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(TransportError::Unavailable("down".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(&RetryConfig::for_testing(), "fetch", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TransportError::Unavailable("down".into())) }
        })
        .await;
        assert!(matches!(result, Err(TransportError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_other_errors_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(&RetryConfig::for_testing(), "fetch", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TransportError::Closed) }
        })
        .await;
        assert!(matches!(result, Err(TransportError::Closed)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
