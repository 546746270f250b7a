use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;
use crate::retry::{ExponentialBackoffPolicy, FixedRetryPolicy, RetryPolicy};

/// 服务客户端配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// 逻辑服务类型（如 "blotter", "analytics", "execution"）
    pub service_type: String,
    #[serde(default)]
    pub discovery: DiscoverySettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub dispatch: DispatchSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscoverySettings {
    /// 心跳主题名称
    pub status_topic: String,
    /// 心跳超时（毫秒），超过即视为实例断开
    pub heartbeat_timeout_ms: u64,
    /// 心跳主题失败后重新订阅前的等待（毫秒）
    pub resubscribe_delay_ms: u64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            status_topic: "status".to_string(),
            heartbeat_timeout_ms: 3000,
            resubscribe_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    Exponential,
    Fixed,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetrySettings {
    pub strategy: RetryStrategy,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// 0 表示不限次数
    pub max_attempts: usize,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            initial_delay_ms: 250,
            max_delay_ms: 10_000,
            max_attempts: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatchSettings {
    /// 请求/响应的默认截止时间（毫秒）
    pub request_timeout_ms: u64,
    /// 没有可用实例时是否等待
    pub wait_for_suitable_service: bool,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            wait_for_suitable_service: true,
        }
    }
}

impl ClientConfig {
    pub fn new(service_type: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
            discovery: DiscoverySettings::default(),
            retry: RetrySettings::default(),
            dispatch: DispatchSettings::default(),
        }
    }

    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_type.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "service_type required and should not be empty".to_string(),
            ));
        }
        if self.discovery.status_topic.is_empty() {
            return Err(ConfigError::Invalid("discovery.status_topic is empty".to_string()));
        }
        if self.discovery.heartbeat_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "discovery.heartbeat_timeout_ms must be positive".to_string(),
            ));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "retry.initial_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.initial_delay_ms, self.retry.max_delay_ms
            )));
        }
        if self.dispatch.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "dispatch.request_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.discovery.heartbeat_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_status_topic(mut self, topic: impl Into<String>) -> Self {
        self.discovery.status_topic = topic.into();
        self
    }

    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery.heartbeat_timeout_ms)
    }

    pub fn resubscribe_delay(&self) -> Duration {
        Duration::from_millis(self.discovery.resubscribe_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch.request_timeout_ms)
    }

    /// 根据配置构建重试策略
    pub fn retry_policy(&self) -> Box<dyn RetryPolicy> {
        let max_attempts = match self.retry.max_attempts {
            0 => None,
            n => Some(n),
        };
        let initial = Duration::from_millis(self.retry.initial_delay_ms);
        match self.retry.strategy {
            RetryStrategy::Exponential => Box::new(ExponentialBackoffPolicy::new(
                max_attempts,
                initial,
                Duration::from_millis(self.retry.max_delay_ms),
            )),
            RetryStrategy::Fixed => Box::new(FixedRetryPolicy::new(max_attempts, initial)),
        }
    }
}
