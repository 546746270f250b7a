//! 心跳主题消息
//!
//! 线路格式：`{ "Type": <serviceType>, "Instance": <serviceId>, "Timestamp": <number>, "Load": <number> }`

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::instance::InstanceStatus;
use crate::error::DiscoveryError;

fn missing_timestamp() -> f64 {
    f64::NAN
}

/// `null` 时间戳按缺失处理；`to_value` 把 NaN 编码为 `null`
fn timestamp_or_nan<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

/// 实例心跳
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusHeartbeat {
    #[serde(rename = "Type")]
    pub service_type: String,

    #[serde(rename = "Instance")]
    pub instance: String,

    #[serde(
        rename = "Timestamp",
        alias = "TimeStamp",
        default = "missing_timestamp",
        deserialize_with = "timestamp_or_nan"
    )]
    pub timestamp: f64,

    #[serde(rename = "Load")]
    pub load: f64,
}

impl StatusHeartbeat {
    pub fn new(
        service_type: impl Into<String>,
        instance: impl Into<String>,
        timestamp: f64,
        load: f64,
    ) -> Self {
        Self {
            service_type: service_type.into(),
            instance: instance.into(),
            timestamp,
            load,
        }
    }

    /// 从主题消息解析
    pub fn from_value(value: &Value) -> Result<Self, DiscoveryError> {
        Self::deserialize(value).map_err(|e| DiscoveryError::MalformedHeartbeat(e.to_string()))
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "Type": self.service_type,
            "Instance": self.instance,
            "Timestamp": self.timestamp,
            "Load": self.load,
        })
    }

    /// 转为在线实例状态
    pub fn into_status(self) -> Result<InstanceStatus, DiscoveryError> {
        InstanceStatus::connected(self.service_type, self.instance, self.timestamp, self.load)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_the_status_topic_contract() {
        let heartbeat = StatusHeartbeat::from_value(&json!({
            "Type": "blotter",
            "Instance": "blotter.4821",
            "Timestamp": 1_500_000_000.0,
            "Load": 0.25
        }))
        .unwrap();

        let status = heartbeat.into_status().unwrap();
        assert_eq!(status.service_id, "blotter.4821");
        assert_eq!(status.service_load, 0.25);
        assert!(status.is_connected);
    }

    #[test]
    fn accepts_legacy_timestamp_spelling_and_missing_timestamp() {
        let legacy = StatusHeartbeat::from_value(&json!({
            "Type": "pricing", "Instance": "p1", "TimeStamp": 12.0, "Load": 1.0
        }))
        .unwrap();
        assert_eq!(legacy.timestamp, 12.0);

        let missing = StatusHeartbeat::from_value(&json!({
            "Type": "pricing", "Instance": "p1", "Load": 1.0
        }))
        .unwrap();
        assert!(missing.timestamp.is_nan());
    }

    #[test]
    fn null_timestamp_is_accepted() {
        let heartbeat = StatusHeartbeat::new("pricing", "p1", f64::NAN, 0.5);
        let encoded = heartbeat.to_value();
        assert_eq!(encoded["Timestamp"], Value::Null);

        let decoded = StatusHeartbeat::from_value(&encoded).unwrap();
        assert!(decoded.timestamp.is_nan());
        assert_eq!(decoded.load, 0.5);
        assert!(decoded.into_status().unwrap().is_connected);
    }

    #[test]
    fn malformed_messages_fail_fast() {
        let err = StatusHeartbeat::from_value(&json!({"Type": "pricing", "Load": "high"})).unwrap_err();
        assert!(matches!(err, DiscoveryError::MalformedHeartbeat(_)));
    }

    #[test]
    fn empty_instance_id_is_rejected() {
        let heartbeat = StatusHeartbeat::new("pricing", "", 0.0, 0.0);
        assert!(heartbeat.into_status().is_err());
    }
}
