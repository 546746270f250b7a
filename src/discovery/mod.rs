//! 服务发现与负载选择模块
//!
//! 通过心跳主题跟踪某个服务类型的在线实例，心跳超时即视为实例断开，
//! 并为每次操作选出负载最低的在线实例。
//!
//! 数据流：心跳主题 → 按实例分流 → 超时检测 → 变化过滤 → 注册表 → 快照广播

pub mod debounce;
pub mod distinct;
pub mod heartbeat;
pub mod instance;
pub mod pipeline;
pub mod registry;
pub mod selector;

pub use debounce::debounce_on_missed_heartbeat;
pub use distinct::distinct_until_changed;
pub use heartbeat::StatusHeartbeat;
pub use instance::{AggregateServiceStatus, InstanceStatus};
pub use pipeline::ServiceDiscovery;
pub use registry::{
    InstanceHandle, InstanceRegistry, InstanceStream, InstanceUpdate, RegistryBuilder, RegistrySnapshot,
};
pub use selector::select_min_load;
