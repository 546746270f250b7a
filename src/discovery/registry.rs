//! 实例注册表
//!
//! 注册表只在发现任务内部可变；对外发布的是不可变的 [`RegistrySnapshot`]。
//! 每条实例记录持有一个 `watch` 发送端，快照里携带对应的接收端，
//! 已选定实例的调用方据此继续观察该实例的后续状态。

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future;
use futures::stream::{self, BoxStream, SelectAll, StreamExt};
use tokio::sync::watch;
use tracing::debug;

use super::instance::{AggregateServiceStatus, InstanceStatus};
use crate::error::DiscoveryError;

/// 单个实例的状态流
pub type InstanceStream = BoxStream<'static, Result<InstanceStatus, DiscoveryError>>;

/// 实例记录推送给观察者的值
///
/// `watch` 只保留最新值；`disconnects` 记录实例累计断开的次数，
/// 观察者据此发现被后续心跳覆盖掉的断开
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceUpdate {
    pub status: InstanceStatus,
    pub disconnects: u64,
}

struct InstanceRecord {
    latest: InstanceStatus,
    disconnects: u64,
    sender: watch::Sender<InstanceUpdate>,
}

/// 快照中的单个实例
#[derive(Debug, Clone)]
pub struct InstanceHandle {
    /// 快照时刻的最新状态
    pub latest: InstanceStatus,
    /// 快照时刻的累计断开次数
    pub disconnects: u64,
    updates: watch::Receiver<InstanceUpdate>,
}

impl InstanceHandle {
    pub fn service_id(&self) -> &str {
        &self.latest.service_id
    }

    /// 快照之后的状态变化
    ///
    /// 接收端在快照时已标记为已读，只会看到之后的新值
    pub fn updates(&self) -> watch::Receiver<InstanceUpdate> {
        self.updates.clone()
    }
}

/// 注册表的不可变视图
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    epoch: u64,
    service_type: String,
    /// 按 service_id 排序
    instances: Vec<InstanceHandle>,
}

impl RegistrySnapshot {
    pub fn empty(service_type: impl Into<String>, epoch: u64) -> Self {
        Self {
            epoch,
            service_type: service_type.into(),
            instances: Vec::new(),
        }
    }

    /// 发现周期编号；每次连接恢复后递增
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub fn instances(&self) -> &[InstanceHandle] {
        &self.instances
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn get(&self, service_id: &str) -> Option<&InstanceHandle> {
        self.instances.iter().find(|h| h.service_id() == service_id)
    }

    /// 负载最低的在线实例
    ///
    /// 负载相同时取 service_id 最小者；实例已按 service_id 排序，
    /// `min_by` 遇到相等元素时保留先出现的一个
    pub fn least_loaded(&self) -> Option<&InstanceHandle> {
        self.instances
            .iter()
            .filter(|h| h.latest.is_connected)
            .min_by(|a, b| a.latest.service_load.total_cmp(&b.latest.service_load))
    }

    /// 汇总状态
    pub fn aggregate(&self) -> AggregateServiceStatus {
        let instance_statuses: Vec<InstanceStatus> =
            self.instances.iter().map(|h| h.latest.clone()).collect();
        AggregateServiceStatus {
            service_type: self.service_type.clone(),
            is_connected: instance_statuses.iter().any(|s| s.is_connected),
            instance_statuses,
        }
    }
}

/// 单个发现周期内的实例注册表
///
/// 记录只增不删；实例超时或断开后保留为离线状态
pub struct InstanceRegistry {
    service_type: String,
    epoch: u64,
    records: BTreeMap<String, InstanceRecord>,
}

impl InstanceRegistry {
    pub fn new(service_type: impl Into<String>, epoch: u64) -> Self {
        Self {
            service_type: service_type.into(),
            epoch,
            records: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// 写入实例的最新状态，新实例会创建记录
    pub fn apply(&mut self, status: InstanceStatus) {
        match self.records.get_mut(&status.service_id) {
            Some(record) => {
                if record.latest.is_connected && !status.is_connected {
                    record.disconnects += 1;
                }
                record.latest = status.clone();
                record.sender.send_replace(InstanceUpdate {
                    status,
                    disconnects: record.disconnects,
                });
            }
            None => {
                debug!(
                    service_type = %self.service_type,
                    service_id = %status.service_id,
                    epoch = self.epoch,
                    "New service instance discovered"
                );
                let disconnects = u64::from(!status.is_connected);
                let (sender, _) = watch::channel(InstanceUpdate {
                    status: status.clone(),
                    disconnects,
                });
                self.records.insert(
                    status.service_id.clone(),
                    InstanceRecord {
                        latest: status,
                        disconnects,
                        sender,
                    },
                );
            }
        }
    }

    /// 把实例标记为离线，返回状态是否发生变化
    pub fn retire(&mut self, service_id: &str) -> bool {
        match self.records.get(service_id) {
            Some(record) if record.latest.is_connected => {
                let offline = record.latest.to_disconnected();
                self.apply(offline);
                true
            }
            _ => false,
        }
    }

    /// 通知所有实例离线，用于发现周期结束时
    pub fn disconnect_all(&mut self) {
        let ids: Vec<String> = self.records.keys().cloned().collect();
        for id in ids {
            self.retire(&id);
        }
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        let instances = self
            .records
            .values()
            .map(|record| InstanceHandle {
                latest: record.latest.clone(),
                disconnects: record.disconnects,
                updates: record.sender.subscribe(),
            })
            .collect();
        Arc::new(RegistrySnapshot {
            epoch: self.epoch,
            service_type: self.service_type.clone(),
            instances,
        })
    }
}

enum InstanceEvent {
    Status(Result<InstanceStatus, DiscoveryError>),
    Completed,
}

/// 把动态增加的实例流折叠进注册表
///
/// 每次注册表变化产出一个新快照。任一实例流出错即整体失败；
/// 实例流自行结束只会让该实例离线。
pub struct RegistryBuilder {
    registry: InstanceRegistry,
    streams: SelectAll<BoxStream<'static, (String, InstanceEvent)>>,
    failed: bool,
}

impl RegistryBuilder {
    pub fn new(registry: InstanceRegistry) -> Self {
        Self {
            registry,
            streams: SelectAll::new(),
            failed: false,
        }
    }

    /// 加入一个实例流，`service_id` 用于识别该流的结束
    pub fn add_instance_stream(&mut self, service_id: impl Into<String>, stream: InstanceStream) {
        let service_id = service_id.into();
        let completed_id = service_id.clone();
        let tagged = stream
            .map(move |item| (service_id.clone(), InstanceEvent::Status(item)))
            .chain(stream::once(future::ready((
                completed_id,
                InstanceEvent::Completed,
            ))));
        self.streams.push(tagged.boxed());
    }

    /// 当前没有任何活动的实例流
    pub fn is_idle(&self) -> bool {
        self.failed || self.streams.is_empty()
    }

    /// 下一个快照
    ///
    /// 返回 `None` 表示所有实例流都已结束，或者已经失败过
    pub async fn next(&mut self) -> Option<Result<Arc<RegistrySnapshot>, DiscoveryError>> {
        if self.failed {
            return None;
        }
        loop {
            let (service_id, event) = self.streams.next().await?;
            match event {
                InstanceEvent::Status(Ok(status)) => {
                    self.registry.apply(status);
                    return Some(Ok(self.registry.snapshot()));
                }
                InstanceEvent::Status(Err(err)) => {
                    self.failed = true;
                    self.streams.clear();
                    return Some(Err(err));
                }
                InstanceEvent::Completed => {
                    debug!(service_id = %service_id, "Instance stream completed");
                    if self.registry.retire(&service_id) {
                        return Some(Ok(self.registry.snapshot()));
                    }
                }
            }
        }
    }

    /// 结束构建，交回注册表
    pub fn into_registry(self) -> InstanceRegistry {
        self.registry
    }
}
