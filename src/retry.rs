// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, interval: Duration::from_secs(30) }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the policy
/// runs out of attempts. `op` receives the 1-based attempt number.
/// Only the last error is returned; intermediate failures are logged.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max => {
                warn!("{} failed (attempt {}/{}): {}, retrying in {}s",
                    label, attempt, max, e, policy.interval.as_secs());
                tokio::time::sleep(policy.interval).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick(max_attempts: u32) -> RetryPolicy {
        RetryPolicy { max_attempts, interval: Duration::ZERO }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry(&quick(3), "connect", |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 { Err(Error::Connection("refused".into())) } else { Ok(n) }
            }
        }).await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(&quick(2), "exec", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Command { code: 2, stderr: "boom".into() }) }
        }).await;
        assert!(matches!(result, Err(Error::Command { code: 2, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_stops_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(&quick(5), "backup", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Interrupted("unexpected control message".into())) }
        }).await;
        assert!(matches!(result, Err(Error::Interrupted(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempt_number_is_passed() {
        let mut seen = Vec::new();
        let _: Result<()> = retry(&quick(3), "probe", |attempt| {
            seen.push(attempt);
            async { Err(Error::Connection("timeout".into())) }
        }).await;
        assert_eq!(seen, vec![1, 2, 3]);
    }
}
