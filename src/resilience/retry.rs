//! # Retry Policy
//!
//! Classifies failures as retryable or terminal and computes the requeue
//! delay: an upstream retry-after hint when one was supplied (clamped to the
//! backoff cap), otherwise capped exponential backoff with full jitter.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::PipelineError;

/// Upstream statuses that always warrant a retry
const RETRYABLE_STATUSES: [u16; 3] = [408, 425, 429];

/// Backoff configuration plus classification rules
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_secs: u64,
    pub cap_secs: u64,
}

impl RetryPolicy {
    pub fn new(base_secs: u64, cap_secs: u64) -> Self {
        Self {
            base_secs,
            cap_secs,
        }
    }

    /// Whether the failure may succeed if the task is re-run.
    pub fn is_retryable(&self, error: &PipelineError) -> bool {
        match error {
            PipelineError::Upstream {
                retryable,
                status,
                message,
                ..
            } => {
                *retryable
                    || status.is_some_and(|s| RETRYABLE_STATUSES.contains(&s) || s >= 500)
                    || text_indicates_transient(message)
            }
            // Transport failures are presumed transient
            PipelineError::Blob { .. }
            | PipelineError::Table { .. }
            | PipelineError::Queue { .. }
            | PipelineError::MissingDependency { .. } => true,
            // Storage-boundary validation failures still go through the
            // generic requeue path: a flaky generator response may clear up.
            PipelineError::InvalidDate { .. } | PipelineError::InvalidRecord { .. } => true,
            PipelineError::InvalidMessage { .. } | PipelineError::Configuration { .. } => false,
        }
    }

    /// Exponential ceiling before jitter: `min(cap, base * 2^(attempt-1))`.
    /// Attempt 0 and 1 share the base delay.
    pub fn backoff_ceiling(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(63);
        self.base_secs
            .saturating_mul(1u64.checked_shl(exponent).unwrap_or(u64::MAX))
            .min(self.cap_secs)
    }

    /// Delay before the next attempt, or `None` when the error is terminal.
    /// An upstream retry-after hint wins over computed backoff.
    pub fn delay_for(&self, error: &PipelineError, attempt: u32) -> Option<Duration> {
        if !self.is_retryable(error) {
            return None;
        }
        if let PipelineError::Upstream {
            retry_after_secs: Some(hint),
            ..
        } = error
        {
            return Some(Duration::from_secs((*hint).min(self.cap_secs)));
        }
        let ceiling = self.backoff_ceiling(attempt);
        // Full jitter: uniform in [0, ceiling]
        Some(Duration::from_secs_f64(
            fastrand::f64() * ceiling as f64,
        ))
    }
}

/// Error text that signals a timeout or throttle condition
fn text_indicates_transient(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    ["timeout", "timed out", "throttl", "rate limit", "too many requests"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Parse a Retry-After header value: either delta-seconds or an HTTP-date.
/// Returns whole seconds from now, floored at zero.
pub fn parse_retry_after(value: &str) -> Option<u64> {
    let trimmed = value.trim();
    if let Ok(secs) = trimmed.parse::<f64>() {
        if secs.is_finite() && secs >= 0.0 {
            return Some(secs.ceil() as u64);
        }
        return Some(0);
    }
    let when = DateTime::parse_from_rfc2822(trimmed).ok()?;
    let delta = when.with_timezone(&Utc) - Utc::now();
    Some(delta.num_seconds().max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstream(status: Option<u16>, retryable: bool, message: &str) -> PipelineError {
        PipelineError::Upstream {
            message: message.to_string(),
            status,
            retryable,
            retry_after_secs: None,
        }
    }

    #[test]
    fn test_backoff_ceiling() {
        let policy = RetryPolicy::new(1, 60);
        assert_eq!(policy.backoff_ceiling(0), 1);
        assert_eq!(policy.backoff_ceiling(1), 1);
        assert_eq!(policy.backoff_ceiling(2), 2);
        assert_eq!(policy.backoff_ceiling(5), 16);
        assert_eq!(policy.backoff_ceiling(7), 60); // capped
        assert_eq!(policy.backoff_ceiling(200), 60); // no overflow
    }

    #[test]
    fn test_full_jitter_stays_in_range() {
        let policy = RetryPolicy::new(1, 60);
        let error = upstream(Some(503), false, "internal");
        for _ in 0..100 {
            let delay = policy.delay_for(&error, 5).unwrap();
            assert!(delay <= Duration::from_secs(16), "delay {delay:?} above ceiling");
        }
    }

    #[test]
    fn test_status_classification() {
        let policy = RetryPolicy::new(1, 60);
        assert!(policy.is_retryable(&upstream(Some(429), false, "x")));
        assert!(policy.is_retryable(&upstream(Some(408), false, "x")));
        assert!(policy.is_retryable(&upstream(Some(500), false, "x")));
        assert!(!policy.is_retryable(&upstream(Some(400), false, "bad request")));
        assert!(!policy.is_retryable(&upstream(None, false, "content policy refusal")));
    }

    #[test]
    fn test_text_classification() {
        let policy = RetryPolicy::new(1, 60);
        assert!(policy.is_retryable(&upstream(None, false, "request timed out")));
        assert!(policy.is_retryable(&upstream(None, false, "ThrottlingException")));
    }

    #[test]
    fn test_explicit_flag_wins() {
        let policy = RetryPolicy::new(1, 60);
        assert!(policy.is_retryable(&upstream(Some(400), true, "flagged retryable")));
    }

    #[test]
    fn test_retry_after_hint_clamped() {
        let policy = RetryPolicy::new(1, 60);
        let error = PipelineError::Upstream {
            message: "slow down".to_string(),
            status: Some(429),
            retryable: true,
            retry_after_secs: Some(3600),
        };
        assert_eq!(policy.delay_for(&error, 1), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_terminal_errors_get_no_delay() {
        let policy = RetryPolicy::new(1, 60);
        assert!(policy
            .delay_for(&PipelineError::invalid_message("nope"), 1)
            .is_none());
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("30"), Some(30));
        assert_eq!(parse_retry_after(" 1.5 "), Some(2));
        assert_eq!(parse_retry_after("-5"), Some(0));
        assert_eq!(parse_retry_after("garbage"), None);
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let future = (Utc::now() + chrono::Duration::seconds(90)).to_rfc2822();
        let parsed = parse_retry_after(&future).unwrap();
        assert!((85..=90).contains(&parsed), "got {parsed}");

        let past = (Utc::now() - chrono::Duration::seconds(90)).to_rfc2822();
        assert_eq!(parse_retry_after(&past), Some(0));
    }
}
