//! 服务客户端错误类型
//!
//! 分三层：传输层 `ConnectionError`、发现层 `DiscoveryError`、调度层 `DispatchError`

use super::code::ErrorCode;
use thiserror::Error;

/// 底层连接错误
///
/// 需要 `Clone`：同一个错误会被注入到多条实例流中
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    /// 连接当前不可用
    #[error("connection is not connected")]
    NotConnected,

    /// 主题或连接被关闭
    #[error("connection closed: {0}")]
    Closed(String),

    /// 远端过程返回错误
    #[error("remote procedure '{procedure}' failed: {reason}")]
    Remote { procedure: String, reason: String },

    /// 远端过程不存在
    #[error("no such procedure: {0}")]
    NoSuchProcedure(String),

    /// 其它传输错误
    #[error("transport error: {0}")]
    Transport(String),
}

impl ConnectionError {
    /// 获取错误代码
    pub fn code(&self) -> ErrorCode {
        match self {
            ConnectionError::NotConnected => ErrorCode::NotConnected,
            ConnectionError::Closed(_) | ConnectionError::Transport(_) => {
                ErrorCode::ConnectionClosed
            }
            ConnectionError::Remote { .. } => ErrorCode::RemoteCallFailed,
            ConnectionError::NoSuchProcedure(_) => ErrorCode::ProcedureNotFound,
        }
    }
}

/// 服务发现错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DiscoveryError {
    /// 底层连接断开，当前发现周期内的所有实例流一起失败
    #[error("underlying connection disconnected")]
    ConnectionLost,

    /// 心跳主题订阅失败
    #[error("status topic failed: {0}")]
    StatusTopic(#[source] ConnectionError),

    /// 心跳消息格式错误
    #[error("malformed heartbeat: {0}")]
    MalformedHeartbeat(String),

    /// 参数错误
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl DiscoveryError {
    /// 获取错误代码
    pub fn code(&self) -> ErrorCode {
        match self {
            DiscoveryError::ConnectionLost => ErrorCode::ConnectionLost,
            DiscoveryError::StatusTopic(e) => e.code(),
            DiscoveryError::MalformedHeartbeat(_) => ErrorCode::MessageFormatError,
            DiscoveryError::InvalidArgument(_) => ErrorCode::InvalidParameter,
        }
    }
}

/// 调度错误（请求/响应、流式操作）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    /// 没有可用的已连接实例，且调用方选择不等待
    #[error("no service available for '{service_type}'")]
    NoServiceAvailable { service_type: String },

    /// 已选定的实例在操作过程中断开
    #[error("service instance '{service_id}' disconnected during {operation}")]
    InstanceDisconnected { service_id: String, operation: String },

    /// 远端调用或主题错误，原样透出
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// 载荷无法编码/解码，属于数据错误，不应重试
    #[error("malformed payload for '{operation}': {reason}")]
    MalformedPayload { operation: String, reason: String },

    /// 服务发现错误
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// 发现管道已关闭
    #[error("service discovery has shut down")]
    Shutdown,
}

impl DispatchError {
    /// 创建载荷错误
    pub fn malformed(operation: impl Into<String>, reason: impl ToString) -> Self {
        DispatchError::MalformedPayload {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// 获取错误代码
    pub fn code(&self) -> ErrorCode {
        match self {
            DispatchError::NoServiceAvailable { .. } => ErrorCode::ServiceUnavailable,
            DispatchError::InstanceDisconnected { .. } => ErrorCode::InstanceDisconnected,
            DispatchError::Connection(e) => e.code(),
            DispatchError::MalformedPayload { .. } => ErrorCode::MessageDecodeFailed,
            DispatchError::Discovery(e) => e.code(),
            DispatchError::Shutdown => ErrorCode::OperationCancelled,
        }
    }

    /// 判断是否为瞬时错误
    pub fn is_transient(&self) -> bool {
        self.code().is_transient()
    }
}

/// 配置错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::ConfigurationError
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_error_codes_follow_their_source() {
        let err = DispatchError::from(ConnectionError::Remote {
            procedure: "blotter-1.getTrades".into(),
            reason: "boom".into(),
        });
        assert_eq!(err.code(), ErrorCode::RemoteCallFailed);
        assert!(err.is_transient());

        let err = DispatchError::from(DiscoveryError::ConnectionLost);
        assert_eq!(err.code(), ErrorCode::ConnectionLost);

        let err = DispatchError::malformed("getTrades", "missing field `Trade`");
        assert_eq!(err.code(), ErrorCode::MessageDecodeFailed);
        assert!(!err.is_transient());
    }

    #[test]
    fn connection_errors_are_displayed_transparently() {
        let err = DispatchError::from(ConnectionError::NoSuchProcedure("a.b".into()));
        assert_eq!(err.to_string(), "no such procedure: a.b");
    }
}
