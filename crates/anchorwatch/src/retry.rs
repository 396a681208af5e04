//! Retry state and pluggable give-up policies for failed fetches.
//!
//! Each session owns one [RetryContext]. After every failed fetch the session records the
//! error and asks its [RetryPolicy] whether to give up; the policy may sleep (backoff) before
//! answering. Any successful fetch resets the context.

use crate::source::FetchError;
use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;

/// Consecutive-failure counter for one session.
#[derive(Debug, Clone, Default)]
pub struct RetryContext {
    retry_count: u32,
    last_error: Option<FetchError>,
}

impl RetryContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of consecutive failures since the last success.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn last_error(&self) -> Option<&FetchError> {
        self.last_error.as_ref()
    }

    pub fn on_error(&mut self, err: FetchError) {
        self.last_error = Some(err);
        self.retry_count = self.retry_count.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.retry_count = 0;
        self.last_error = None;
    }
}

/// Decides, once per failure, whether a session should stop retrying.
///
/// Implementations may suspend (sleep) before returning `false`; the session will not poll
/// again until the call completes. Only the calling session is delayed.
#[async_trait]
pub trait RetryPolicy: Send + Sync {
    async fn should_give_up(&self, ctx: &RetryContext) -> bool;
}

/// Fixed delay between attempts, giving up after `max_retries` consecutive failures.
/// The watcher's default policy.
#[derive(Debug, Clone)]
pub struct FixedBackoff {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl FixedBackoff {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }
}

impl Default for FixedBackoff {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl RetryPolicy for FixedBackoff {
    async fn should_give_up(&self, ctx: &RetryContext) -> bool {
        if ctx.retry_count() < self.max_retries {
            sleep(self.backoff).await;
            false
        } else {
            true
        }
    }
}

/// Doubling delay (`initial * 2^(n-1)`, capped at `max`) plus up to `jitter` of random slack.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub max_retries: u32,
    pub initial: Duration,
    pub max: Duration,
    pub jitter: Duration,
}

impl ExponentialBackoff {
    /// Delay before the next attempt after `retry_count` failures, without jitter.
    pub fn base_delay(&self, retry_count: u32) -> Duration {
        let exp = retry_count.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Base delay plus a random share of `jitter`. Saturates at `Duration::MAX`.
    pub fn delay(&self, retry_count: u32) -> Duration {
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
        };
        self.base_delay(retry_count).saturating_add(jitter)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter: Duration::from_millis(500),
        }
    }
}

#[async_trait]
impl RetryPolicy for ExponentialBackoff {
    async fn should_give_up(&self, ctx: &RetryContext) -> bool {
        if ctx.retry_count() >= self.max_retries {
            return true;
        }
        sleep(self.delay(ctx.retry_count())).await;
        false
    }
}

/// Gives up on the first failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailFast;

#[async_trait]
impl RetryPolicy for FailFast {
    async fn should_give_up(&self, _ctx: &RetryContext) -> bool {
        true
    }
}
