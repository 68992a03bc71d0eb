//! Retry policy shared by the HTTP collaborators.
//!
//! - HTTP 429 and 500/502/503/504 → retry
//! - Other non-success statuses → fail immediately
//! - Transport errors and timeouts → retry
//! - Backoff: `base * 2^(attempt-1)`, a numeric `Retry-After` header wins

use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;

/// Longest delay ever slept between two attempts.
const MAX_DELAY_SECS: f64 = 300.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_secs: f64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay_secs: f64) -> Self {
        Self {
            max_retries,
            base_delay_secs: base_delay_secs.max(0.0),
        }
    }

    /// Total number of attempts, first try included.
    pub fn attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Delay after the failed `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16) as i32;
        let secs = (self.base_delay_secs * 2f64.powi(exp)).min(MAX_DELAY_SECS);
        Duration::from_secs_f64(secs)
    }

    /// Delay after a transient status, honouring `Retry-After` in seconds.
    pub fn delay_for_response(&self, attempt: u32, headers: &HeaderMap) -> Duration {
        headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|secs| secs.is_finite())
            .map(|secs| Duration::from_secs_f64(secs.clamp(0.0, MAX_DELAY_SECS)))
            .unwrap_or_else(|| self.backoff(attempt))
    }
}

pub fn is_transient(status: StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 500 | 502 | 503 | 504)
}
