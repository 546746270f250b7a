//! 服务发现管道
//!
//! 每个 [`ServiceDiscovery`] 对应一个后台任务，它是注册表的唯一写入者。
//! 任务按"发现周期"循环：
//!
//! 1. 等待连接可用
//! 2. 订阅心跳主题，按实例分流，每个实例流经过超时检测和变化过滤后折叠进注册表
//! 3. 连接断开或心跳主题失败时，通知所有实例离线，发布空快照，回到第 1 步
//!
//! 快照通过 `watch` 发布，新订阅者立即拿到最新值。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{BoxStream, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::{UnboundedReceiverStream, WatchStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::debounce::debounce_on_missed_heartbeat;
use super::distinct::distinct_until_changed;
use super::heartbeat::StatusHeartbeat;
use super::instance::{AggregateServiceStatus, InstanceStatus};
use super::registry::{InstanceRegistry, InstanceStream, RegistryBuilder, RegistrySnapshot};
use crate::config::ClientConfig;
use crate::error::{ConnectionError, DiscoveryError};
use crate::transport::{Connection, ConnectionStatus};

type InstanceFeed = mpsc::UnboundedSender<Result<InstanceStatus, DiscoveryError>>;

/// 最后一个句柄释放时停止后台任务
struct ShutdownGuard(CancellationToken);

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// 服务发现句柄
///
/// 可以自由克隆；所有克隆共享同一个后台任务和同一份快照。
#[derive(Clone)]
pub struct ServiceDiscovery {
    service_type: String,
    snapshots: watch::Receiver<Arc<RegistrySnapshot>>,
    shutdown: CancellationToken,
    _guard: Arc<ShutdownGuard>,
}

impl ServiceDiscovery {
    /// 启动服务发现任务
    ///
    /// 必须在 tokio 运行时内调用
    pub fn spawn(connection: Arc<dyn Connection>, config: &ClientConfig) -> Self {
        let service_type = config.service_type.clone();
        let (publisher, snapshots) =
            watch::channel(Arc::new(RegistrySnapshot::empty(service_type.clone(), 0)));
        let shutdown = CancellationToken::new();

        let worker = DiscoveryWorker {
            connection,
            service_type: service_type.clone(),
            status_topic: config.discovery.status_topic.clone(),
            heartbeat_timeout: config.heartbeat_timeout(),
            resubscribe_delay: config.resubscribe_delay(),
            publisher,
            epoch: 0,
        };
        tokio::spawn(worker.run(shutdown.clone()));

        Self {
            service_type,
            snapshots,
            _guard: Arc::new(ShutdownGuard(shutdown.clone())),
            shutdown,
        }
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    /// 当前快照
    pub fn current(&self) -> Arc<RegistrySnapshot> {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<RegistrySnapshot>> {
        self.snapshots.clone()
    }

    /// 快照流：先产出当前快照，之后每次注册表变化产出一次
    ///
    /// 后台任务停止后流结束
    pub fn snapshots(&self) -> BoxStream<'static, Arc<RegistrySnapshot>> {
        WatchStream::new(self.snapshots.clone()).boxed()
    }

    /// 汇总状态流
    pub fn service_status_stream(&self) -> BoxStream<'static, AggregateServiceStatus> {
        self.snapshots().map(|snapshot| snapshot.aggregate()).boxed()
    }

    /// 停止后台任务，所有克隆一起失效
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl std::fmt::Debug for ServiceDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.current();
        f.debug_struct("ServiceDiscovery")
            .field("service_type", &self.service_type)
            .field("epoch", &snapshot.epoch())
            .field("instances", &snapshot.instances().len())
            .finish()
    }
}

/// 一个发现周期的结束原因
enum EpochEnd {
    /// 连接断开
    ConnectionLost,
    /// 心跳主题失败或结束，连接仍然可用
    TopicFailed(DiscoveryError),
    /// 连接对象已释放，不会再恢复
    ConnectionGone,
}

struct DiscoveryWorker {
    connection: Arc<dyn Connection>,
    service_type: String,
    status_topic: String,
    heartbeat_timeout: Duration,
    resubscribe_delay: Duration,
    publisher: watch::Sender<Arc<RegistrySnapshot>>,
    epoch: u64,
}

impl DiscoveryWorker {
    async fn run(mut self, shutdown: CancellationToken) {
        info!(
            service_type = %self.service_type,
            status_topic = %self.status_topic,
            "Service discovery started"
        );
        let mut connectivity = self.connection.connection_status();

        loop {
            let end = tokio::select! {
                _ = shutdown.cancelled() => break,
                end = self.run_epoch(&mut connectivity) => end,
            };

            match end {
                EpochEnd::ConnectionLost => {
                    info!(
                        service_type = %self.service_type,
                        epoch = self.epoch,
                        "Connection lost, service registry reset"
                    );
                }
                EpochEnd::TopicFailed(err) => {
                    warn!(
                        service_type = %self.service_type,
                        epoch = self.epoch,
                        error = %err,
                        delay_ms = self.resubscribe_delay.as_millis() as u64,
                        "Status topic failed, resubscribing after delay"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.resubscribe_delay) => {}
                    }
                }
                EpochEnd::ConnectionGone => {
                    warn!(service_type = %self.service_type, "Connection dropped, discovery stopped");
                    break;
                }
            }
        }

        info!(service_type = %self.service_type, "Service discovery stopped");
    }

    async fn run_epoch(&mut self, connectivity: &mut watch::Receiver<ConnectionStatus>) -> EpochEnd {
        if connectivity.wait_for(|status| status.is_connected()).await.is_err() {
            return EpochEnd::ConnectionGone;
        }

        self.epoch += 1;
        info!(
            service_type = %self.service_type,
            epoch = self.epoch,
            "Connected, discovering service instances"
        );

        let mut topic = self.connection.subscribe_to_topic(&self.status_topic);
        let mut builder = RegistryBuilder::new(InstanceRegistry::new(&self.service_type, self.epoch));
        let mut feeds: HashMap<String, InstanceFeed> = HashMap::new();

        let (end, cause) = loop {
            tokio::select! {
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        break (EpochEnd::ConnectionGone, DiscoveryError::ConnectionLost);
                    }
                    if !connectivity.borrow_and_update().is_connected() {
                        break (EpochEnd::ConnectionLost, DiscoveryError::ConnectionLost);
                    }
                }
                message = topic.next() => match message {
                    Some(Ok(value)) => self.route(value, &mut feeds, &mut builder),
                    Some(Err(err)) => {
                        let end = if connectivity.borrow().is_connected() {
                            EpochEnd::TopicFailed(DiscoveryError::StatusTopic(err.clone()))
                        } else {
                            EpochEnd::ConnectionLost
                        };
                        break (end, DiscoveryError::StatusTopic(err));
                    }
                    None => {
                        let err = DiscoveryError::StatusTopic(ConnectionError::Closed(
                            format!("status topic '{}' completed", self.status_topic),
                        ));
                        break (EpochEnd::TopicFailed(err.clone()), err);
                    }
                },
                update = builder.next(), if !builder.is_idle() => match update {
                    Some(Ok(snapshot)) => {
                        self.publisher.send_replace(snapshot);
                    }
                    Some(Err(err)) => {
                        break (EpochEnd::TopicFailed(err.clone()), err);
                    }
                    None => {}
                },
            }
        };

        self.fail_epoch(builder, feeds, cause).await;
        end
    }

    /// 按实例分发心跳，首次出现的实例会创建新的实例流
    fn route(&self, message: Value, feeds: &mut HashMap<String, InstanceFeed>, builder: &mut RegistryBuilder) {
        let heartbeat = match StatusHeartbeat::from_value(&message) {
            Ok(heartbeat) => heartbeat,
            Err(err) => {
                warn!(service_type = %self.service_type, error = %err, "Skipping malformed heartbeat");
                return;
            }
        };
        if heartbeat.service_type != self.service_type {
            return;
        }
        let status = match heartbeat.into_status() {
            Ok(status) => status,
            Err(err) => {
                warn!(service_type = %self.service_type, error = %err, "Skipping malformed heartbeat");
                return;
            }
        };

        debug!(
            service_type = %self.service_type,
            service_id = %status.service_id,
            load = status.service_load,
            "Heartbeat received"
        );

        let feed = feeds.entry(status.service_id.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            builder.add_instance_stream(
                status.service_id.clone(),
                instance_stream(rx, status.to_disconnected(), self.heartbeat_timeout),
            );
            tx
        });
        // 实例流已结束时发送失败，忽略即可
        let _ = feed.send(Ok(status));
    }

    /// 把错误注入所有实例流，等注册表确认失败后重置为空快照
    async fn fail_epoch(
        &mut self,
        mut builder: RegistryBuilder,
        feeds: HashMap<String, InstanceFeed>,
        cause: DiscoveryError,
    ) {
        for feed in feeds.values() {
            let _ = feed.send(Err(cause.clone()));
        }
        drop(feeds);

        while let Some(update) = builder.next().await {
            if update.is_err() {
                break;
            }
        }

        let mut registry = builder.into_registry();
        debug!(
            service_type = %self.service_type,
            epoch = self.epoch,
            instances = registry.len(),
            "Notifying instances of epoch end"
        );
        registry.disconnect_all();
        drop(registry);

        self.publisher
            .send_replace(Arc::new(RegistrySnapshot::empty(&self.service_type, self.epoch)));
    }
}

/// 单个实例的状态流：心跳超时合成离线状态，随后过滤掉无变化的状态
fn instance_stream(
    rx: mpsc::UnboundedReceiver<Result<InstanceStatus, DiscoveryError>>,
    offline: InstanceStatus,
    heartbeat_timeout: Duration,
) -> InstanceStream {
    let debounced = debounce_on_missed_heartbeat(
        UnboundedReceiverStream::new(rx),
        heartbeat_timeout,
        move || offline.clone(),
    );
    distinct_until_changed(debounced, InstanceStatus::same_significant_state).boxed()
}
