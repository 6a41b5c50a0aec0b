use std::time::Duration;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Exponential backoff for transient agent and runtime failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: u32,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            multiplier: 2,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// No retries, no waiting.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff_ms: 0,
            multiplier: 1,
            max_backoff_ms: 0,
        }
    }

    /// Delay before retry `attempt` (1-based).
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1);
        self.initial_backoff_ms
            .saturating_mul(u64::from(self.multiplier).saturating_pow(exponent))
            .min(self.max_backoff_ms)
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms(attempt))
    }

    pub fn validate(&self) -> Result<()> {
        if self.multiplier == 0 {
            bail!("retry multiplier must be at least 1");
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            bail!(
                "initial_backoff_ms ({}) exceeds max_backoff_ms ({})",
                self.initial_backoff_ms,
                self.max_backoff_ms
            );
        }
        Ok(())
    }
}
