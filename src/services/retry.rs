use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Bounded retry with exponential backoff (`base * 2^attempt`, capped).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

/// Result of an operation that failed under a [`RetryPolicy`].
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempt(s): {error}")]
    Exhausted { attempts: u32, error: E },

    #[error("non-retryable failure on attempt {attempts}: {error}")]
    Permanent { attempts: u32, error: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } | Self::Permanent { attempts, .. } => *attempts,
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { error, .. } | Self::Permanent { error, .. } => error,
        }
    }
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }

    /// A single attempt, never retried.
    pub const fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub const fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Whether every delay `run` can sleep is longer than the one before it,
    /// i.e. `max_delay` never flattens the tail of the schedule.
    pub fn delays_strictly_increase(&self) -> bool {
        if self.max_attempts <= 2 {
            return true;
        }
        if self.base_delay.is_zero() {
            return false;
        }
        2u32.checked_pow(self.max_attempts - 2)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .is_some_and(|last| last <= self.max_delay)
    }

    /// Delay after failed attempt `attempt` (0-based) before the next one.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with an error `is_retryable` rejects,
    /// or `max_attempts` is reached. Returns the value and the attempts used.
    pub async fn run<T, E, F, Fut, P>(
        &self,
        operation: &str,
        mut op: F,
        is_retryable: P,
    ) -> Result<(T, u32), RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            let error = match op(attempt).await {
                Ok(value) => return Ok((value, attempt + 1)),
                Err(error) => error,
            };

            let attempts = attempt + 1;
            if !is_retryable(&error) {
                return Err(RetryError::Permanent { attempts, error });
            }
            if attempts >= max_attempts {
                return Err(RetryError::Exhausted { attempts, error });
            }

            let delay = self.backoff(attempt);
            tracing::warn!(
                operation,
                attempt = attempts,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient failure, retrying after backoff"
            );
            sleep(delay).await;
            attempt += 1;
        }
    }
}
