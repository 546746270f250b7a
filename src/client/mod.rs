//! 服务客户端
//!
//! 面向业务代码的调度入口：每次操作都通过服务发现选出负载最低的在线实例，
//! 并把调用发往 `"<serviceId>.<operationName>"`。

mod streaming;
pub mod topic;

pub use topic::ephemeral_topic_name;

use std::sync::Arc;
use std::time::Duration;

use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ClientConfig, RetrySettings};
use crate::discovery::{AggregateServiceStatus, InstanceStatus, ServiceDiscovery, select_min_load};
use crate::error::{ConfigError, DispatchError, Result};
use crate::retry::{RetryPolicy, retry_request, retry_stream};
use crate::transport::Connection;

/// 带截止时间的请求结果
///
/// 超时不是错误，而是一种响应形态
#[derive(Debug, Clone, PartialEq)]
pub enum Timed<T> {
    Response(T),
    TimedOut { after: Duration },
}

impl<T> Timed<T> {
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Timed::TimedOut { .. })
    }

    pub fn into_response(self) -> Option<T> {
        match self {
            Timed::Response(value) => Some(value),
            Timed::TimedOut { .. } => None,
        }
    }
}

/// 服务客户端
///
/// 克隆成本很低，所有克隆共享同一个服务发现任务
#[derive(Clone)]
pub struct ServiceClient {
    service_type: String,
    connection: Arc<dyn Connection>,
    discovery: ServiceDiscovery,
    config: Arc<ClientConfig>,
    retry_policy: Arc<dyn RetryPolicy>,
}

impl ServiceClient {
    /// 创建客户端并启动服务发现
    ///
    /// 必须在 tokio 运行时内调用
    pub fn new(connection: Arc<dyn Connection>, config: ClientConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let discovery = ServiceDiscovery::spawn(connection.clone(), &config);
        let retry_policy: Arc<dyn RetryPolicy> = Arc::from(config.retry_policy());
        info!(service_type = %config.service_type, "Service client created");
        Ok(Self {
            service_type: config.service_type.clone(),
            connection,
            discovery,
            config: Arc::new(config),
            retry_policy,
        })
    }

    pub fn builder(service_type: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(service_type)
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn discovery(&self) -> &ServiceDiscovery {
        &self.discovery
    }

    /// 服务汇总状态：先产出当前状态，之后每次注册表变化产出一次
    pub fn service_status_stream(&self) -> BoxStream<'static, AggregateServiceStatus> {
        self.discovery.service_status_stream()
    }

    fn select_target(&self, wait_for_suitable_service: bool) -> BoxStream<'static, Result<InstanceStatus>> {
        select_min_load(self.discovery.snapshots(), wait_for_suitable_service)
    }

    /// 请求/响应
    ///
    /// 选中实例后只发一次调用。调用过程中该实例断开，操作以
    /// `InstanceDisconnected` 失败。丢弃 Future 即取消选择和调用。
    pub async fn request_response(
        &self,
        operation_name: &str,
        payload: Value,
        wait_for_suitable_service: bool,
    ) -> Result<Value> {
        let mut target = self.select_target(wait_for_suitable_service);
        let instance = match target.next().await {
            Some(Ok(instance)) => instance,
            Some(Err(err)) => {
                warn!(
                    service_type = %self.service_type,
                    operation = %operation_name,
                    error = %err,
                    "No target for request"
                );
                return Err(err);
            }
            None => return Err(DispatchError::Shutdown),
        };

        let procedure = format!("{}.{}", instance.service_id, operation_name);
        let operation_id = Uuid::new_v4();
        info!(
            service_type = %self.service_type,
            service_id = %instance.service_id,
            operation = %operation_name,
            operation_id = %operation_id,
            load = instance.service_load,
            "Dispatching request"
        );

        let call = self.connection.request_response(&procedure, payload, None);
        tokio::select! {
            biased;
            response = call => {
                debug!(operation_id = %operation_id, ok = response.is_ok(), "Request completed");
                response.map_err(DispatchError::from)
            }
            () = until_disconnected(target) => {
                warn!(
                    service_id = %instance.service_id,
                    operation = %operation_name,
                    operation_id = %operation_id,
                    "Service instance disconnected during request"
                );
                Err(DispatchError::InstanceDisconnected {
                    service_id: instance.service_id,
                    operation: operation_name.to_string(),
                })
            }
        }
    }

    /// 类型化的请求/响应，解码失败返回 `MalformedPayload`
    pub async fn request<Req, Resp>(&self, operation_name: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = encode(operation_name, request)?;
        let response = self
            .request_response(
                operation_name,
                payload,
                self.config.dispatch.wait_for_suitable_service,
            )
            .await?;
        decode(operation_name, response)
    }

    /// 带截止时间的请求/响应
    ///
    /// 总是等待可用实例；等待时间计入截止时间
    pub async fn request_response_within(
        &self,
        operation_name: &str,
        payload: Value,
        deadline: Duration,
    ) -> Result<Timed<Value>> {
        match tokio::time::timeout(deadline, self.request_response(operation_name, payload, true)).await {
            Ok(response) => response.map(Timed::Response),
            Err(_) => {
                warn!(
                    service_type = %self.service_type,
                    operation = %operation_name,
                    deadline_ms = deadline.as_millis() as u64,
                    "Request timed out"
                );
                Ok(Timed::TimedOut { after: deadline })
            }
        }
    }

    /// 使用配置中的默认截止时间
    pub async fn request_response_timed(&self, operation_name: &str, payload: Value) -> Result<Timed<Value>> {
        self.request_response_within(operation_name, payload, self.config.request_timeout())
            .await
    }

    /// 流式操作
    ///
    /// 先订阅临时结果主题，再调用远端过程并把主题名作为回复主题。
    /// 主题结束、出错，或已选实例断开时流结束；丢弃流即取消所有订阅。
    pub fn stream_operation(
        &self,
        operation_name: &str,
        payload: Value,
    ) -> BoxStream<'static, Result<Value>> {
        let client = self.clone();
        let operation = operation_name.to_string();
        stream::once(async move { client.open_stream(operation, payload).await })
            .flatten()
            .boxed()
    }

    async fn open_stream(self, operation: String, payload: Value) -> BoxStream<'static, Result<Value>> {
        let mut target = self.select_target(true);
        let instance = match target.next().await {
            Some(Ok(instance)) => instance,
            Some(Err(err)) => return stream::once(future::ready(Err(err))).boxed(),
            None => return stream::once(future::ready(Err(DispatchError::Shutdown))).boxed(),
        };

        let topic_name = ephemeral_topic_name(&self.service_type);
        let topic = self.connection.subscribe_to_topic(&topic_name);

        let procedure = format!("{}.{}", instance.service_id, operation);
        info!(
            service_type = %self.service_type,
            service_id = %instance.service_id,
            operation = %operation,
            topic = %topic_name,
            load = instance.service_load,
            "Starting stream operation"
        );

        let connection = self.connection.clone();
        let ack = Box::pin(async move {
            connection
                .request_response(&procedure, payload, Some(&topic_name))
                .await
        });

        streaming::operation_events(topic, ack, target, instance.service_id, operation)
    }

    /// 类型化的流式操作，每一项单独解码
    pub fn stream<Req, Resp>(&self, operation_name: &str, request: &Req) -> BoxStream<'static, Result<Resp>>
    where
        Req: Serialize,
        Resp: DeserializeOwned + Send + 'static,
    {
        match encode(operation_name, request) {
            Ok(payload) => decode_items(operation_name, self.stream_operation(operation_name, payload)),
            Err(err) => stream::once(future::ready(Err(err))).boxed(),
        }
    }

    /// 出错后按重试策略重新发起的流式操作
    pub fn retrying_stream_operation(
        &self,
        operation_name: &str,
        payload: Value,
    ) -> BoxStream<'static, Result<Value>> {
        let client = self.clone();
        let operation = operation_name.to_string();
        retry_stream(
            operation_name,
            self.retry_policy.clone(),
            move || client.stream_operation(&operation, payload.clone()),
        )
    }

    /// 类型化的重试流；解码在重试之外，数据错误不会触发重试
    pub fn retrying_stream<Req, Resp>(
        &self,
        operation_name: &str,
        request: &Req,
    ) -> BoxStream<'static, Result<Resp>>
    where
        Req: Serialize,
        Resp: DeserializeOwned + Send + 'static,
    {
        match encode(operation_name, request) {
            Ok(payload) => decode_items(
                operation_name,
                self.retrying_stream_operation(operation_name, payload),
            ),
            Err(err) => stream::once(future::ready(Err(err))).boxed(),
        }
    }

    /// 失败后按重试策略重新选择实例并重发的请求/响应
    pub async fn retrying_request_response(&self, operation_name: &str, payload: Value) -> Result<Value> {
        let wait = self.config.dispatch.wait_for_suitable_service;
        retry_request(operation_name, self.retry_policy.as_ref(), move || {
            self.request_response(operation_name, payload.clone(), wait)
        })
        .await
    }
}

impl std::fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceClient")
            .field("service_type", &self.service_type)
            .field("discovery", &self.discovery)
            .finish()
    }
}

/// 等待已选实例断开；状态流结束时永远挂起
async fn until_disconnected(mut updates: BoxStream<'static, Result<InstanceStatus>>) {
    while let Some(update) = updates.next().await {
        if matches!(update, Ok(ref status) if !status.is_connected) {
            return;
        }
    }
    future::pending::<()>().await
}

fn encode<T: Serialize>(operation_name: &str, value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| DispatchError::malformed(operation_name, e))
}

fn decode<T: DeserializeOwned>(operation_name: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| DispatchError::malformed(operation_name, e))
}

fn decode_items<T>(operation_name: &str, items: BoxStream<'static, Result<Value>>) -> BoxStream<'static, Result<T>>
where
    T: DeserializeOwned + Send + 'static,
{
    let operation = operation_name.to_string();
    items
        .map(move |item| item.and_then(|value| decode(&operation, value)))
        .boxed()
}

/// 客户端构建器
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    pub fn new(service_type: impl Into<String>) -> Self {
        Self {
            config: ClientConfig::new(service_type),
        }
    }

    pub fn from_config(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.with_heartbeat_timeout(timeout);
        self
    }

    pub fn status_topic(mut self, topic: impl Into<String>) -> Self {
        self.config = self.config.with_status_topic(topic);
        self
    }

    pub fn retry(mut self, retry: RetrySettings) -> Self {
        self.config = self.config.with_retry(retry);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.with_request_timeout(timeout);
        self
    }

    pub fn wait_for_suitable_service(mut self, wait: bool) -> Self {
        self.config.dispatch.wait_for_suitable_service = wait;
        self
    }

    pub fn build(self, connection: Arc<dyn Connection>) -> std::result::Result<ServiceClient, ConfigError> {
        ServiceClient::new(connection, self.config)
    }
}
