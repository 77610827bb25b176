//! src/sim/retry.rs
//!
//! Bounded retries with a fixed backoff, for calls that fail on transport
//! hiccups rather than on the property under test.

use crate::{config::RetryConfig, error::Error, error::Result};
use std::{future::Future, time::Duration};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

/// The final result plus what the retries cost.
#[derive(Debug)]
pub struct Retried<T> {
    pub result: Result<T>,
    /// Total time spent sleeping between attempts.
    pub slept: Duration,
    /// One line per failed attempt that was retried.
    pub failures: Vec<String>,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff: Duration::from_millis(config.backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// Runs `attempt` until it succeeds or `max_attempts` is spent. A
    /// cancelled token ends the loop before the next attempt.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut attempt: F) -> Retried<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max = self.max_attempts.max(1);
        let mut slept = Duration::ZERO;
        let mut failures = Vec::new();
        let mut n = 1;
        let result = loop {
            match attempt(n).await {
                Ok(value) => break Ok(value),
                Err(e) if n >= max => break Err(e),
                Err(e) => {
                    tracing::warn!(attempt = n, max, error = %e, "Attempt failed, retrying");
                    failures.push(format!("attempt {n}/{max} failed ({e})"));
                    tokio::select! {
                        _ = cancel.cancelled() => break Err(Error::Cancelled),
                        _ = tokio::time::sleep(self.backoff) => slept += self.backoff,
                    }
                    n += 1;
                }
            }
        };
        Retried {
            result,
            slept,
            failures,
        }
    }
}
