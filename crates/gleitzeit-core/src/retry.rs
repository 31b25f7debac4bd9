//! Per-task retry policy and backoff delay computation.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TaskError;
use crate::error::ErrorCode;

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    #[default]
    Exponential,
}

impl fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Fixed => "fixed",
            Self::Linear => "linear",
            Self::Exponential => "exponential",
        };
        f.write_str(s)
    }
}

impl FromStr for BackoffStrategy {
    type Err = BackoffStrategyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(Self::Fixed),
            "linear" => Ok(Self::Linear),
            "exponential" => Ok(Self::Exponential),
            other => Err(BackoffStrategyParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`BackoffStrategy`] string.
#[derive(Debug, Clone)]
pub struct BackoffStrategyParseError(pub String);

impl fmt::Display for BackoffStrategyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid backoff strategy: {:?}", self.0)
    }
}

impl std::error::Error for BackoffStrategyParseError {}

// ---------------------------------------------------------------------------

/// Retry rules for a single task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first. 1 means no retry.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub strategy: BackoffStrategy,
    /// Base delay in seconds.
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: f64,
    /// Cap on any computed delay, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_secs: Option<f64>,
    /// Multiply the delay by `U(0.5, 1.5)` when set.
    #[serde(default)]
    pub jitter: bool,
    /// Restrict retries to these codes. When absent, the code's own
    /// transient/permanent classification decides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_on: Option<Vec<ErrorCode>>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> f64 {
    1.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            strategy: BackoffStrategy::default(),
            base_delay_secs: default_base_delay(),
            max_delay_secs: None,
            jitter: false,
            retry_on: None,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Whether a failed attempt number `attempt` (1-indexed, the one that
    /// just failed) should be retried given `error`.
    pub fn should_retry(&self, error: &TaskError, attempt: u32) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        match &self.retry_on {
            Some(codes) => codes.contains(&error.code),
            None => error.is_retryable(),
        }
    }

    /// Delay before attempt `k` (1-indexed; `k >= 2`), without jitter.
    ///
    /// - fixed:       `min(max_delay, base)`
    /// - linear:      `min(max_delay, base * (k-1))`
    /// - exponential: `min(max_delay, base * 2^(k-2))`
    pub fn delay_before_attempt(&self, k: u32) -> Duration {
        let base = self.base_delay_secs.max(0.0);
        let raw = match self.strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base * k.saturating_sub(1) as f64,
            BackoffStrategy::Exponential => base * 2f64.powi(k.saturating_sub(2) as i32),
        };
        let capped = match self.max_delay_secs {
            Some(max) => raw.min(max.max(0.0)),
            None => raw,
        };
        Duration::from_secs_f64(capped)
    }

    /// Delay before attempt `k` with jitter applied when configured.
    pub fn jittered_delay_before_attempt(&self, k: u32) -> Duration {
        let delay = self.delay_before_attempt(k);
        if !self.jitter {
            return delay;
        }
        use rand::Rng;
        let factor: f64 = rand::rng().random_range(0.5..=1.5);
        delay.mul_f64(factor)
    }
}
