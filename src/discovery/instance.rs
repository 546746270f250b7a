//! 服务实例状态定义

use serde::{Deserialize, Serialize};

use crate::error::DiscoveryError;

/// 服务实例在某一时刻的状态快照
///
/// 不可变值；同一 `service_id` 的新状态整体替换旧状态
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceStatus {
    /// 服务类型（如 "blotter", "analytics"）
    pub service_type: String,

    /// 实例 ID（唯一标识）
    pub service_id: String,

    /// 心跳时间戳；超时合成的状态为 NaN
    pub timestamp: f64,

    /// 实例负载；超时合成的状态为 NaN
    pub service_load: f64,

    /// 是否在线
    pub is_connected: bool,
}

impl InstanceStatus {
    /// 由心跳创建在线状态
    pub fn connected(
        service_type: impl Into<String>,
        service_id: impl Into<String>,
        timestamp: f64,
        service_load: f64,
    ) -> Result<Self, DiscoveryError> {
        let (service_type, service_id) = validate_ids(service_type.into(), service_id.into())?;
        Ok(Self {
            service_type,
            service_id,
            timestamp,
            service_load,
            is_connected: true,
        })
    }

    /// 心跳超时后合成的离线状态
    pub fn disconnected(
        service_type: impl Into<String>,
        service_id: impl Into<String>,
    ) -> Result<Self, DiscoveryError> {
        let (service_type, service_id) = validate_ids(service_type.into(), service_id.into())?;
        Ok(Self {
            service_type,
            service_id,
            timestamp: f64::NAN,
            service_load: f64::NAN,
            is_connected: false,
        })
    }

    /// 把已有状态转成离线状态，保留身份字段
    pub fn to_disconnected(&self) -> Self {
        Self {
            service_type: self.service_type.clone(),
            service_id: self.service_id.clone(),
            timestamp: f64::NAN,
            service_load: f64::NAN,
            is_connected: false,
        }
    }

    /// 判断两个状态是否"实质相同"：在线状态和负载都相同
    ///
    /// 两个 NaN 负载视为相同，连续的超时状态因此只保留第一个
    pub fn same_significant_state(&self, other: &InstanceStatus) -> bool {
        self.is_connected == other.is_connected
            && (self.service_load == other.service_load
                || (self.service_load.is_nan() && other.service_load.is_nan()))
    }
}

fn validate_ids(service_type: String, service_id: String) -> Result<(String, String), DiscoveryError> {
    if service_type.is_empty() {
        return Err(DiscoveryError::InvalidArgument(
            "serviceType must be a string and not empty".to_string(),
        ));
    }
    if service_id.is_empty() {
        return Err(DiscoveryError::InvalidArgument(
            "serviceId must be a string and not empty".to_string(),
        ));
    }
    Ok((service_type, service_id))
}

/// 某个服务类型的汇总状态
///
/// 只读视图，每次注册表变化时重新计算
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregateServiceStatus {
    pub service_type: String,
    /// 任一实例在线即为 true
    pub is_connected: bool,
    /// 各实例最新状态，按 service_id 排序
    pub instance_statuses: Vec<InstanceStatus>,
}

impl AggregateServiceStatus {
    pub fn empty(service_type: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
            is_connected: false,
            instance_statuses: Vec::new(),
        }
    }

    pub fn connected_count(&self) -> usize {
        self.instance_statuses.iter().filter(|s| s.is_connected).count()
    }
}
