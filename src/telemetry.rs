//! 日志初始化

use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt};

/// 安装全局 fmt 日志订阅者
///
/// `RUST_LOG` 优先，未设置时使用 `default_filter`（如 `"flare_service_client=info"`）。
/// 已经存在全局订阅者时返回错误。
pub fn init_tracing(default_filter: &str) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
}
