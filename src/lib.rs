//! Flare Service Client
//!
//! 客户端侧的服务发现与负载均衡调度：通过心跳跟踪某个服务类型的在线实例，
//! 心跳超时即判定实例断开，并把请求/响应和流式操作路由到负载最低的在线实例，
//! 失败的操作按退避策略重试。

pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod retry;
pub mod telemetry;
pub mod transport;

// Re-exports
pub use client::{ClientBuilder, ServiceClient, Timed};
pub use config::{ClientConfig, DiscoverySettings, DispatchSettings, RetrySettings, RetryStrategy};
pub use discovery::{
    AggregateServiceStatus, InstanceStatus, RegistrySnapshot, ServiceDiscovery, StatusHeartbeat,
};
pub use error::{
    ConfigError, ConnectionError, DiscoveryError, DispatchError, ErrorCategory, ErrorCode, Result,
};
pub use retry::{ExponentialBackoffPolicy, FixedRetryPolicy, RetryPolicy};
pub use transport::{Connection, ConnectionStatus, MemoryConnection};
