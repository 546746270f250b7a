//! 错误代码和错误类别定义
//!
//! 服务客户端只关心连接、发现、调度三类错误，代码段沿用 flare 的分段约定

use serde::{Deserialize, Serialize};
use std::fmt;

/// 错误代码枚举
///
/// 错误代码按类别分组，每个类别占用1000个代码范围：
/// - 1000-1999: 连接相关错误
/// - 3000-3999: 协议/载荷相关错误
/// - 6000-6999: 服务相关错误
/// - 9000-9999: 通用错误
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u32)]
pub enum ErrorCode {
    // ============================================================
    // 连接相关错误 (1000-1999)
    // ============================================================
    ConnectionClosed = 1002,
    NotConnected = 1005,
    ConnectionLost = 1007,
    RemoteCallFailed = 1008,
    ProcedureNotFound = 1009,

    // ============================================================
    // 协议相关错误 (3000-3999)
    // ============================================================
    MessageFormatError = 3003,
    MessageDecodeFailed = 3006,

    // ============================================================
    // 服务相关错误 (6000-6999)
    // ============================================================
    ServiceUnavailable = 6001,
    InstanceDisconnected = 6005,
    ConfigurationError = 6003,

    // ============================================================
    // 通用错误 (9000-9999)
    // ============================================================
    InvalidParameter = 9001,
    OperationCancelled = 9005,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl ErrorCode {
    /// 获取错误代码的数字值
    #[inline]
    pub fn as_u32(&self) -> u32 {
        *self as u32
    }

    /// 获取错误代码的英文标识符
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConnectionClosed => "CONNECTION_CLOSED",
            ErrorCode::NotConnected => "NOT_CONNECTED",
            ErrorCode::ConnectionLost => "CONNECTION_LOST",
            ErrorCode::RemoteCallFailed => "REMOTE_CALL_FAILED",
            ErrorCode::ProcedureNotFound => "PROCEDURE_NOT_FOUND",
            ErrorCode::MessageFormatError => "MESSAGE_FORMAT_ERROR",
            ErrorCode::MessageDecodeFailed => "MESSAGE_DECODE_FAILED",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::InstanceDisconnected => "INSTANCE_DISCONNECTED",
            ErrorCode::ConfigurationError => "CONFIGURATION_ERROR",
            ErrorCode::InvalidParameter => "INVALID_PARAMETER",
            ErrorCode::OperationCancelled => "OPERATION_CANCELLED",
        }
    }

    /// 获取错误代码的类别
    pub fn category(&self) -> ErrorCategory {
        match self.as_u32() {
            1000..=1999 => ErrorCategory::Connection,
            3000..=3999 => ErrorCategory::Protocol,
            6000..=6999 => ErrorCategory::Service,
            _ => ErrorCategory::General,
        }
    }

    /// 判断是否为瞬时错误
    ///
    /// 仅作为诊断信息使用；默认重试策略不区分错误类型
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorCode::ConnectionClosed
                | ErrorCode::NotConnected
                | ErrorCode::ConnectionLost
                | ErrorCode::RemoteCallFailed
                | ErrorCode::ServiceUnavailable
                | ErrorCode::InstanceDisconnected
        )
    }
}

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Connection,
    Protocol,
    Service,
    General,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Connection => write!(f, "CONNECTION"),
            ErrorCategory::Protocol => write!(f, "PROTOCOL"),
            ErrorCategory::Service => write!(f, "SERVICE"),
            ErrorCategory::General => write!(f, "GENERAL"),
        }
    }
}
