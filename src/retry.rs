//! Backoff policy and the retry combinator.
//!
//! Two backoff shapes exist:
//!
//! - **Adaptive**: the wait depends on the error kind:
//!
//!   | Kind | Wait (seconds) |
//!   |------|----------------|
//!   | rate limit | `min(base^(attempt+2), max)` |
//!   | timeout | `min(base^(attempt+1), max)` |
//!   | network | `min(base*(attempt+1), max/2)` |
//!   | other | `min(base^attempt, max)` |
//!
//!   plus uniform jitter in `[0, 0.1 * wait]`.
//!
//! - **Fixed**: `min(factor^attempt, max)` plus uniform jitter in
//!   `[0, min(1, max)]`, used for lower-risk vector-store CRUD.
//!
//! [`retry`] re-invokes an async operation up to `max_attempts` times. The
//! error from the final attempt is returned unchanged; errors whose kind is
//! not in the policy's retryable set return immediately.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

use crate::analyzer::{context, ErrorAnalyzer};
use crate::error::{ErrorKind, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffKind {
    Adaptive,
    Fixed,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: f64,
    pub max_backoff: f64,
    pub backoff: BackoffKind,
    pub retry_on: Vec<ErrorKind>,
}

impl RetryPolicy {
    pub fn adaptive(max_attempts: u32, base: f64, max: f64, retry_on: &[ErrorKind]) -> Self {
        Self {
            max_attempts,
            base_backoff: base,
            max_backoff: max,
            backoff: BackoffKind::Adaptive,
            retry_on: retry_on.to_vec(),
        }
    }

    pub fn fixed(max_attempts: u32, factor: f64, retry_on: &[ErrorKind]) -> Self {
        Self {
            max_attempts,
            base_backoff: factor,
            max_backoff: 60.0,
            backoff: BackoffKind::Fixed,
            retry_on: retry_on.to_vec(),
        }
    }

    /// Heartbeat / connect against the vector store.
    pub fn store_connect() -> Self {
        Self::adaptive(
            5,
            2.0,
            60.0,
            &[
                ErrorKind::StoreConnection,
                ErrorKind::StoreTimeout,
                ErrorKind::Network,
                ErrorKind::Store,
            ],
        )
    }

    /// Collection CRUD against the vector store.
    pub fn store_operations() -> Self {
        Self::fixed(
            3,
            2.0,
            &[
                ErrorKind::StoreConnection,
                ErrorKind::StoreTimeout,
                ErrorKind::Network,
                ErrorKind::Store,
                ErrorKind::Unclassified,
            ],
        )
    }

    /// Calls into the embedding API.
    pub fn embedding() -> Self {
        Self::adaptive(
            5,
            1.5,
            30.0,
            &[
                ErrorKind::EmbeddingQuota,
                ErrorKind::EmbeddingRateLimit,
                ErrorKind::Network,
                ErrorKind::Unclassified,
            ],
        )
    }

    pub fn with_max_backoff(mut self, max_backoff: f64) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn is_retryable(&self, err: &SyncError) -> bool {
        let kind = err.kind();
        !kind.is_fatal() && self.retry_on.contains(&kind)
    }

    /// Jittered delay before the retry following zero-based `attempt`.
    pub fn delay_for(&self, err: &SyncError, attempt: u32) -> Duration {
        let secs = match self.backoff {
            BackoffKind::Adaptive => {
                let wait = base_wait(err.kind(), attempt, self.base_backoff, self.max_backoff);
                wait + jitter(wait * 0.1)
            }
            BackoffKind::Fixed => {
                let wait = self.base_backoff.powi(attempt as i32).min(self.max_backoff);
                wait + jitter(self.max_backoff.min(1.0))
            }
        };
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Un-jittered adaptive wait in seconds.
pub fn base_wait(kind: ErrorKind, attempt: u32, base: f64, max: f64) -> f64 {
    let attempt = attempt as i32;
    let wait = match kind {
        ErrorKind::EmbeddingRateLimit => base.powi(attempt + 2).min(max),
        ErrorKind::StoreTimeout => base.powi(attempt + 1).min(max),
        ErrorKind::Network => (base * f64::from(attempt + 1)).min(max / 2.0),
        _ => base.powi(attempt).min(max),
    };
    wait.max(0.0)
}

fn jitter(ceiling: f64) -> f64 {
    if ceiling <= 0.0 || !ceiling.is_finite() {
        return 0.0;
    }
    rand::thread_rng().gen_range(0.0..=ceiling)
}

/// Run `operation` under `policy`. Every failure is recorded with the analyzer.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    analyzer: &ErrorAnalyzer,
    operation: F,
) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    retry_with_hook(policy, label, analyzer, |_| {}, operation).await
}

/// [`retry`] with a hook run after each backoff sleep, before the next attempt.
pub async fn retry_with_hook<T, F, Fut, H>(
    policy: &RetryPolicy,
    label: &str,
    analyzer: &ErrorAnalyzer,
    mut on_retry: H,
    mut operation: F,
) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
    H: FnMut(&SyncError),
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt: u32 = 0;

    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        analyzer.record(
            &err,
            context([
                ("operation", label.to_string()),
                ("attempt", (attempt + 1).to_string()),
            ]),
        );

        if !policy.is_retryable(&err) {
            tracing::debug!(operation = label, kind = %err.kind(), "not retryable");
            return Err(err);
        }

        if attempt + 1 >= max_attempts {
            tracing::error!(
                operation = label,
                attempts = max_attempts,
                kind = %err.kind(),
                "max retry attempts reached: {}",
                err
            );
            return Err(err);
        }

        let delay = policy.delay_for(&err, attempt);
        tracing::warn!(
            operation = label,
            attempt = attempt + 1,
            max_attempts,
            kind = %err.kind(),
            wait_secs = delay.as_secs_f64(),
            "retrying: {}",
            err
        );
        tokio::time::sleep(delay).await;
        on_retry(&err);
        attempt += 1;
    }
}
