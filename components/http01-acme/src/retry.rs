use std::future::Future;
use std::time::Duration;

use crate::{AcmeError, AcmeResult, RetryPolicy};

pub(crate) struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            next: policy.initial_interval,
            max: policy.max_interval,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next.min(self.max);
        self.next = (self.next * 2).min(self.max);
        delay
    }
}

pub(crate) fn attempts(policy: &RetryPolicy) -> u32 {
    policy.max_attempts.max(1)
}

/// Runs `op` until it succeeds, fails terminally, or the policy runs out of
/// attempts. Only retriable errors are retried.
pub(crate) async fn with_retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> AcmeResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AcmeResult<T>>,
{
    let max_attempts = attempts(policy);
    let mut backoff = Backoff::new(policy);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retriable() => {
                if attempt >= max_attempts {
                    error!("{} failed after {} attempts, {}", what, attempt, e);
                    return Err(AcmeError::RetriesExhausted(format!("{}: {}", what, e)));
                }
                let delay = backoff.next_delay();
                warn!("{} failed, attempt {}/{}, retry in {:?}, {}", what, attempt, max_attempts, delay, e);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                error!("{} failed, {}", what, e);
                return Err(e);
            }
        }
    }
}
