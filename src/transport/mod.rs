//! 连接抽象
//!
//! 服务客户端只依赖这里定义的 `Connection` trait：连接状态、主题订阅、请求/响应。
//! 线路层的帧格式、认证等由具体实现负责。

pub mod memory;

pub use memory::{MemoryConnection, ProcedureCall};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use crate::error::ConnectionError;

/// 主题消息流
pub type TopicStream = BoxStream<'static, Result<Value, ConnectionError>>;

/// 底层连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

impl ConnectionStatus {
    pub fn is_connected(self) -> bool {
        self == ConnectionStatus::Connected
    }
}

/// 共享连接
///
/// 所有服务客户端共用同一个连接实例
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// 连接状态，`watch` 语义：订阅时立即可读当前值
    fn connection_status(&self) -> watch::Receiver<ConnectionStatus>;

    /// 订阅主题，流的错误/结束遵循传输层语义
    fn subscribe_to_topic(&self, topic: &str) -> TopicStream;

    /// 调用远端过程，`reply_topic` 用于要求远端把后续结果推送到该主题
    async fn request_response(
        &self,
        procedure: &str,
        payload: Value,
        reply_topic: Option<&str>,
    ) -> Result<Value, ConnectionError>;
}
