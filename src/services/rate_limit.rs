//! Pacing for generator calls within a single enrichment run.

use crate::config::JobConfig;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A wait was cut short by the run's cancellation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub min_interval: Duration,
    pub batch_size: usize,
    pub breather: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub max_retries: u32,
}

impl From<&JobConfig> for RateLimitPolicy {
    fn from(job: &JobConfig) -> Self {
        Self {
            min_interval: Duration::from_millis(job.min_request_interval_ms),
            batch_size: job.batch_size.max(1),
            breather: Duration::from_secs(job.breather_seconds),
            backoff_base: Duration::from_millis(job.backoff_base_ms),
            backoff_max: Duration::from_millis(job.backoff_max_ms),
            max_retries: job.max_rate_limit_retries,
        }
    }
}

impl RateLimitPolicy {
    /// Delay before retry number `attempt` (1-based).
    ///
    /// A provider hint wins when present; otherwise `base * 2^(attempt-1)`.
    /// Both are capped at `backoff_max`.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        let delay = suggested.unwrap_or_else(|| {
            let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
            self.backoff_base.saturating_mul(factor)
        });
        delay.min(self.backoff_max)
    }
}

/// Per-run limiter; never shared between runs.
#[derive(Debug)]
pub struct RateLimiter {
    policy: RateLimitPolicy,
    last_call: Option<Instant>,
    in_batch: usize,
    cancel: CancellationToken,
}

impl RateLimiter {
    #[must_use]
    pub const fn new(policy: RateLimitPolicy, cancel: CancellationToken) -> Self {
        Self {
            policy,
            last_call: None,
            in_batch: 0,
            cancel,
        }
    }

    #[must_use]
    pub const fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Waits until another generator call is allowed and reserves the slot.
    pub async fn acquire(&mut self) -> Result<(), Interrupted> {
        if let Some(last) = self.last_call {
            let ready_at = last + self.policy.min_interval;
            if ready_at > Instant::now() {
                self.sleep_until(ready_at).await?;
            }
        }
        self.last_call = Some(Instant::now());
        Ok(())
    }

    /// Counts a finished entity and pauses once a batch is complete.
    ///
    /// `more_pending` suppresses the pause after the final entity.
    pub async fn entity_finished(&mut self, more_pending: bool) -> Result<bool, Interrupted> {
        self.in_batch += 1;
        if self.in_batch < self.policy.batch_size {
            return Ok(false);
        }
        self.in_batch = 0;

        if more_pending && !self.policy.breather.is_zero() {
            self.sleep(self.policy.breather).await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Cancellable sleep.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        self.sleep_until(Instant::now() + duration).await
    }

    async fn sleep_until(&self, deadline: Instant) -> Result<(), Interrupted> {
        tokio::select! {
            () = self.cancel.cancelled() => Err(Interrupted),
            () = tokio::time::sleep_until(deadline) => Ok(()),
        }
    }
}
