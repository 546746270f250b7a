//! 重试策略模块
//!
//! 策略本身只回答"是否重试、等多久"，重订阅逻辑在 `operation` 中

pub mod exponential;
pub mod fixed;
pub mod operation;

pub use exponential::ExponentialBackoffPolicy;
pub use fixed::FixedRetryPolicy;
pub use operation::{retry_request, retry_stream};

use std::time::Duration;

use crate::error::DispatchError;

/// 重试策略 trait
///
/// `attempt` 为本轮已经进行过的重试次数，首次失败时为 0
pub trait RetryPolicy: Send + Sync {
    fn should_retry(&self, attempt: usize, error: &DispatchError) -> bool;
    fn backoff_duration(&self, attempt: usize) -> Duration;
    /// `None` 表示不限次数
    fn max_attempts(&self) -> Option<usize>;
}

fn within_attempts(max_attempts: Option<usize>, attempt: usize) -> bool {
    max_attempts.is_none_or(|max| attempt < max)
}
