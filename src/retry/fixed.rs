use super::{RetryPolicy, within_attempts};
use crate::error::DispatchError;
use std::time::Duration;

/// 固定延迟重试策略
#[derive(Debug, Clone)]
pub struct FixedRetryPolicy {
    max_attempts: Option<usize>,
    delay: Duration,
}

impl FixedRetryPolicy {
    pub fn new(max_attempts: Option<usize>, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

impl RetryPolicy for FixedRetryPolicy {
    fn should_retry(&self, attempt: usize, _error: &DispatchError) -> bool {
        within_attempts(self.max_attempts, attempt)
    }

    fn backoff_duration(&self, _attempt: usize) -> Duration {
        self.delay
    }

    fn max_attempts(&self) -> Option<usize> {
        self.max_attempts
    }
}
