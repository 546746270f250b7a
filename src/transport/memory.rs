//! 进程内连接实现
//!
//! 主题通过 async-broadcast 扇出，远端过程是注册的闭包。用于本地联调和测试。

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_broadcast::{InactiveReceiver, Sender};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use super::{Connection, ConnectionStatus, TopicStream};
use crate::error::ConnectionError;

const TOPIC_CAPACITY: usize = 256;

type TopicItem = Result<Value, ConnectionError>;
type ProcedureHandler =
    Arc<dyn Fn(ProcedureCall) -> BoxFuture<'static, Result<Value, ConnectionError>> + Send + Sync>;

/// 一次远端过程调用的记录
#[derive(Debug, Clone, PartialEq)]
pub struct ProcedureCall {
    pub procedure: String,
    pub payload: Value,
    pub reply_topic: Option<String>,
}

struct Topic {
    sender: Sender<TopicItem>,
    // 保持通道打开，即使暂时没有订阅者
    _keep_open: InactiveReceiver<TopicItem>,
}

impl Topic {
    fn new() -> Self {
        let (mut sender, receiver) = async_broadcast::broadcast(TOPIC_CAPACITY);
        sender.set_overflow(true);
        sender.set_await_active(false);
        Self {
            sender,
            _keep_open: receiver.deactivate(),
        }
    }
}

struct Inner {
    status: watch::Sender<ConnectionStatus>,
    topics: Mutex<HashMap<String, Topic>>,
    procedures: Mutex<HashMap<String, ProcedureHandler>>,
    calls: Mutex<Vec<ProcedureCall>>,
}

/// 进程内连接
#[derive(Clone)]
pub struct MemoryConnection {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryConnection {
    /// 创建新的连接，初始状态为未连接
    pub fn new() -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            inner: Arc::new(Inner {
                status,
                topics: Mutex::new(HashMap::new()),
                procedures: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn connect(&self) {
        debug!("Memory connection connected");
        self.inner.status.send_replace(ConnectionStatus::Connected);
    }

    /// 断开连接
    ///
    /// 所有已打开的主题以 `Closed` 错误结束，和真实传输层掉线时一致
    pub fn disconnect(&self) {
        debug!("Memory connection disconnected");
        self.inner.status.send_replace(ConnectionStatus::Disconnected);
        let topics: Vec<(String, Topic)> = lock(&self.inner.topics).drain().collect();
        for (name, topic) in topics {
            let _ = topic
                .sender
                .try_broadcast(Err(ConnectionError::Closed(format!("topic '{name}' lost connection"))));
            topic.sender.close();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.status.borrow().is_connected()
    }

    /// 发布消息到主题，返回当前订阅者数量
    pub fn publish(&self, topic: &str, message: Value) -> usize {
        let mut topics = lock(&self.inner.topics);
        let topic = topics.entry(topic.to_string()).or_insert_with(Topic::new);
        let receivers = topic.sender.receiver_count();
        let _ = topic.sender.try_broadcast(Ok(message));
        receivers
    }

    /// 以错误结束主题
    pub fn fail_topic(&self, topic: &str, error: ConnectionError) {
        if let Some(topic) = lock(&self.inner.topics).remove(topic) {
            let _ = topic.sender.try_broadcast(Err(error));
            topic.sender.close();
        }
    }

    /// 正常结束主题
    pub fn close_topic(&self, topic: &str) {
        if let Some(topic) = lock(&self.inner.topics).remove(topic) {
            topic.sender.close();
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        lock(&self.inner.topics)
            .get(topic)
            .map(|t| t.sender.receiver_count())
            .unwrap_or(0)
    }

    /// 注册远端过程
    pub fn register_procedure<F, Fut>(&self, procedure: impl Into<String>, handler: F)
    where
        F: Fn(ProcedureCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ConnectionError>> + Send + 'static,
    {
        let handler: ProcedureHandler = Arc::new(move |call| handler(call).boxed());
        lock(&self.inner.procedures).insert(procedure.into(), handler);
    }

    /// 已发生的调用记录
    pub fn calls(&self) -> Vec<ProcedureCall> {
        lock(&self.inner.calls).clone()
    }
}

impl Default for MemoryConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("status", &*self.inner.status.borrow())
            .field("topics", &lock(&self.inner.topics).len())
            .finish()
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn connection_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    fn subscribe_to_topic(&self, topic: &str) -> TopicStream {
        let mut topics = lock(&self.inner.topics);
        let entry = topics.entry(topic.to_string()).or_insert_with(Topic::new);
        entry.sender.new_receiver().boxed()
    }

    async fn request_response(
        &self,
        procedure: &str,
        payload: Value,
        reply_topic: Option<&str>,
    ) -> Result<Value, ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }

        let call = ProcedureCall {
            procedure: procedure.to_string(),
            payload,
            reply_topic: reply_topic.map(str::to_string),
        };
        lock(&self.inner.calls).push(call.clone());

        let handler = lock(&self.inner.procedures).get(procedure).cloned();
        match handler {
            Some(handler) => handler(call).await,
            None => Err(ConnectionError::NoSuchProcedure(procedure.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn published_messages_reach_every_subscriber() {
        let connection = MemoryConnection::new();
        let mut first = connection.subscribe_to_topic("status");
        let mut second = connection.subscribe_to_topic("status");

        assert_eq!(connection.publish("status", json!({"Load": 1})), 2);

        assert_eq!(first.next().await, Some(Ok(json!({"Load": 1}))));
        assert_eq!(second.next().await, Some(Ok(json!({"Load": 1}))));
    }

    #[tokio::test]
    async fn late_subscribers_do_not_see_earlier_messages() {
        let connection = MemoryConnection::new();
        connection.publish("prices", json!(1));
        let mut late = connection.subscribe_to_topic("prices");
        connection.publish("prices", json!(2));
        connection.close_topic("prices");

        assert_eq!(late.next().await, Some(Ok(json!(2))));
        assert_eq!(late.next().await, None);
    }

    #[tokio::test]
    async fn procedures_require_connectivity() {
        let connection = MemoryConnection::new();
        connection.register_procedure("pricing-1.getPrice", |call| async move { Ok(call.payload) });

        let err = connection
            .request_response("pricing-1.getPrice", json!("EURUSD"), None)
            .await
            .unwrap_err();
        assert_eq!(err, ConnectionError::NotConnected);

        connection.connect();
        let response = connection
            .request_response("pricing-1.getPrice", json!("EURUSD"), Some("topic_pricing_x"))
            .await
            .unwrap();
        assert_eq!(response, json!("EURUSD"));
        assert_eq!(connection.calls()[0].reply_topic.as_deref(), Some("topic_pricing_x"));
    }

    #[tokio::test]
    async fn unknown_procedures_fail() {
        let connection = MemoryConnection::new();
        connection.connect();
        let err = connection
            .request_response("nobody.home", Value::Null, None)
            .await
            .unwrap_err();
        assert_eq!(err, ConnectionError::NoSuchProcedure("nobody.home".into()));
    }

    #[tokio::test]
    async fn disconnect_fails_open_topics() {
        let connection = MemoryConnection::new();
        connection.connect();
        let mut topic = connection.subscribe_to_topic("status");

        connection.disconnect();

        assert!(matches!(topic.next().await, Some(Err(ConnectionError::Closed(_)))));
        assert_eq!(topic.next().await, None);
        assert!(!connection.is_connected());
    }
}
