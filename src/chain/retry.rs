//! Retry policies for node calls
//!
//! Each collaborator call kind carries its own policy value. Only idempotent
//! calls get more than one attempt.

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Which failures a policy retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOn {
    /// Transport, timeout and I/O failures only
    Transient,
    /// Any failure, including node-side rejections
    Any,
}

/// Bounded retry with a fixed delay between attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: usize,
    delay: Duration,
    retry_on: RetryOn,
}

impl RetryPolicy {
    /// Create a new retry policy
    pub fn new(max_attempts: usize, delay: Duration, retry_on: RetryOn) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            retry_on,
        }
    }

    /// A single attempt; the caller tries again next cycle
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO, RetryOn::Transient)
    }

    /// Fixed attempt count without delay, used for block submission
    pub fn fixed(max_attempts: usize) -> Self {
        Self::new(max_attempts, Duration::ZERO, RetryOn::Transient)
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Whether this policy retries `error`
    pub fn should_retry(&self, error: &Error) -> bool {
        match self.retry_on {
            RetryOn::Transient => error.is_retryable(),
            RetryOn::Any => true,
        }
    }

    /// Execute an operation with retry logic
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!("Operation succeeded on attempt {}", attempt);
                    }
                    return Ok(result);
                }
                Err(e) if attempt < self.max_attempts && self.should_retry(&e) => {
                    warn!(
                        "Operation failed on attempt {}/{}: {}",
                        attempt, self.max_attempts, e
                    );
                    if !self.delay.is_zero() {
                        tokio::time::sleep(self.delay).await;
                    }
                    attempt += 1;
                }
                Err(e) => {
                    if attempt > 1 {
                        warn!("Operation failed after {} attempts: {}", attempt, e);
                    }
                    return Err(e);
                }
            }
        }
    }
}
