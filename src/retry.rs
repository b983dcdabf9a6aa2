use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::warn;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    pub fn delay(&self, attempt: usize) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { initial, max } => {
                let factor = 2u32.saturating_pow(u32::try_from(attempt).unwrap_or(u32::MAX));
                initial.saturating_mul(factor).min(max)
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub backoff: Backoff,
    pub max_attempts: usize,
    pub deadline: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Backoff::Exponential {
                initial: Duration::from_millis(200),
                max: Duration::from_secs(2),
            },
            max_attempts: 5,
            deadline: None,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(delay: Duration, max_attempts: usize) -> Self {
        Self {
            backoff: Backoff::Fixed(delay),
            max_attempts,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Polls `f` until it yields a value, the attempt budget runs out or the
/// deadline passes. Errors from `f` abort immediately.
pub async fn poll_until<T, F, Fut>(description: &str, policy: RetryPolicy, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let started = Instant::now();
    for attempt in 0..policy.max_attempts.max(1) {
        if let Some(value) = f().await? {
            return Ok(value);
        }
        if let Some(deadline) = policy.deadline
            && started.elapsed() >= deadline
        {
            break;
        }
        sleep(policy.backoff.delay(attempt)).await;
    }

    Err(Error::RetryExhausted {
        description: description.to_string(),
        attempts: policy.max_attempts.max(1),
    })
}

/// Retries `f` on retryable errors only; every other error is returned as is.
pub async fn retry<T, F, Fut>(description: &str, policy: RetryPolicy, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let started = Instant::now();
    for attempt in 0..attempts {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < attempts => {
                if let Some(deadline) = policy.deadline
                    && started.elapsed() >= deadline
                {
                    return Err(err);
                }
                warn!(attempt = attempt + 1, error = %err, "{description} failed; retrying");
            }
            Err(err) => return Err(err),
        }
        sleep(policy.backoff.delay(attempt)).await;
    }

    Err(Error::RetryExhausted {
        description: description.to_string(),
        attempts,
    })
}
