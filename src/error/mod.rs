//! 服务客户端错误处理模块
//!
//! 提供分层错误类型和错误代码分类

pub mod code;
pub mod service_error;

pub use code::{ErrorCategory, ErrorCode};
pub use service_error::{ConfigError, ConnectionError, DiscoveryError, DispatchError, Result};
