use super::{RetryPolicy, within_attempts};
use crate::error::DispatchError;
use std::time::Duration;

/// 指数退避重试策略
///
/// 不区分错误类型：被包装的操作产生的任何错误都会重试
#[derive(Debug, Clone)]
pub struct ExponentialBackoffPolicy {
    max_attempts: Option<usize>,
    base_delay: Duration,
    max_delay: Duration,
}

impl ExponentialBackoffPolicy {
    pub fn new(max_attempts: Option<usize>, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// 默认策略：250ms 起步，翻倍增长，最长 10 秒，不限次数
    pub fn backoff_to_10_seconds_max() -> Self {
        Self::new(None, Duration::from_millis(250), Duration::from_secs(10))
    }
}

impl Default for ExponentialBackoffPolicy {
    fn default() -> Self {
        Self::backoff_to_10_seconds_max()
    }
}

impl RetryPolicy for ExponentialBackoffPolicy {
    fn should_retry(&self, attempt: usize, _error: &DispatchError) -> bool {
        within_attempts(self.max_attempts, attempt)
    }

    fn backoff_duration(&self, attempt: usize) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn max_attempts(&self) -> Option<usize> {
        self.max_attempts
    }
}
