use std::time::Duration;

use tlcflow_core::config::RetrySection;

use crate::operator::TaskError;

/// Fixed-count, fixed-delay whole-task retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            delay: Duration::from_secs(60),
        }
    }
}

impl From<&RetrySection> for RetryPolicy {
    fn from(section: &RetrySection) -> Self {
        Self {
            retries: section.retries,
            delay: section.delay(),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            retries: 0,
            delay: Duration::ZERO,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Whether a failure on `attempt` (1-based) gets another try.
    pub fn should_retry(&self, attempt: u32, error: &TaskError) -> bool {
        attempt < self.max_attempts() && error.is_retryable()
    }
}
