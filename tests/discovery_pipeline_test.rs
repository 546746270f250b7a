//! 服务发现管道集成测试
//!
//! 使用进程内连接和暂停的 tokio 时钟，不依赖外部服务。

use std::sync::Arc;
use std::time::Duration;

use flare_service_client::discovery::{AggregateServiceStatus, ServiceDiscovery, select_min_load};
use flare_service_client::{ClientConfig, ConnectionError, MemoryConnection, StatusHeartbeat};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::json;
use tokio::time::Instant;
use tokio_test::{assert_pending, assert_ready, task};

const STATUS_TOPIC: &str = "status";

fn heartbeat(connection: &MemoryConnection, service_type: &str, instance: &str, load: f64) {
    let message = StatusHeartbeat::new(service_type, instance, 1_700_000_000.0, load).to_value();
    connection.publish(STATUS_TOPIC, message);
}

async fn wait_for_subscriber(connection: &MemoryConnection, topic: &str) {
    while connection.subscriber_count(topic) == 0 {
        tokio::task::yield_now().await;
    }
}

/// 让后台任务处理完已发布的消息
async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

async fn wait_for_status(
    statuses: &mut BoxStream<'static, AggregateServiceStatus>,
    condition: impl Fn(&AggregateServiceStatus) -> bool,
) -> AggregateServiceStatus {
    loop {
        let status = statuses.next().await.expect("status stream ended");
        if condition(&status) {
            return status;
        }
    }
}

async fn connected_discovery(service_type: &str) -> (MemoryConnection, ServiceDiscovery) {
    let connection = MemoryConnection::new();
    let discovery = ServiceDiscovery::spawn(Arc::new(connection.clone()), &ClientConfig::new(service_type));
    connection.connect();
    wait_for_subscriber(&connection, STATUS_TOPIC).await;
    (connection, discovery)
}

#[tokio::test(start_paused = true)]
async fn initial_status_is_empty_and_disconnected() {
    let connection = MemoryConnection::new();
    let discovery = ServiceDiscovery::spawn(Arc::new(connection), &ClientConfig::new("blotter"));

    let status = discovery.service_status_stream().next().await.unwrap();
    assert_eq!(status, AggregateServiceStatus::empty("blotter"));
    assert_eq!(discovery.current().epoch(), 0);
}

#[tokio::test(start_paused = true)]
async fn connection_loss_resets_the_registry() {
    let (connection, discovery) = connected_discovery("blotter").await;
    let mut statuses = discovery.service_status_stream();

    heartbeat(&connection, "blotter", "blotter.A", 0.0);
    heartbeat(&connection, "blotter", "blotter.B", 0.0);
    let status = wait_for_status(&mut statuses, |s| s.instance_statuses.len() == 2).await;
    assert!(status.is_connected);
    assert_eq!(status.connected_count(), 2);

    connection.disconnect();
    let status = wait_for_status(&mut statuses, |s| s.instance_statuses.is_empty()).await;
    assert!(!status.is_connected);
}

#[tokio::test(start_paused = true)]
async fn reconnecting_starts_a_fresh_epoch() {
    let (connection, discovery) = connected_discovery("blotter").await;
    let mut statuses = discovery.service_status_stream();

    heartbeat(&connection, "blotter", "blotter.A", 0.2);
    wait_for_status(&mut statuses, |s| s.is_connected).await;
    assert_eq!(discovery.current().epoch(), 1);

    connection.disconnect();
    wait_for_status(&mut statuses, |s| s.instance_statuses.is_empty()).await;

    connection.connect();
    wait_for_subscriber(&connection, STATUS_TOPIC).await;
    heartbeat(&connection, "blotter", "blotter.C", 0.4);

    let status = wait_for_status(&mut statuses, |s| s.is_connected).await;
    assert_eq!(status.instance_statuses.len(), 1);
    assert_eq!(status.instance_statuses[0].service_id, "blotter.C");
    assert_eq!(discovery.current().epoch(), 2);
}

#[tokio::test(start_paused = true)]
async fn missed_heartbeats_disconnect_the_instance() {
    let (connection, discovery) = connected_discovery("analytics").await;
    let mut statuses = discovery.service_status_stream();

    heartbeat(&connection, "analytics", "analytics.1", 0.3);
    wait_for_status(&mut statuses, |s| s.is_connected).await;
    let last_heartbeat = Instant::now();

    let status = wait_for_status(&mut statuses, |s| !s.is_connected).await;
    assert_eq!(last_heartbeat.elapsed(), Duration::from_millis(3000));
    assert_eq!(status.instance_statuses.len(), 1);
    assert!(status.instance_statuses[0].service_load.is_nan());

    // 恢复心跳后实例重新上线，记录数不变
    heartbeat(&connection, "analytics", "analytics.1", 0.1);
    let status = wait_for_status(&mut statuses, |s| s.is_connected).await;
    assert_eq!(status.instance_statuses.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn duplicate_heartbeats_are_not_republished() {
    let (connection, discovery) = connected_discovery("blotter").await;

    heartbeat(&connection, "blotter", "blotter.1", 0.1);
    let mut pinned = task::spawn(select_min_load(discovery.snapshots(), true));
    let first = loop {
        settle().await;
        if let std::task::Poll::Ready(item) = pinned.poll_next() {
            break item.unwrap().unwrap();
        }
    };
    assert_eq!(first.service_load, 0.1);

    for _ in 0..4 {
        heartbeat(&connection, "blotter", "blotter.1", 0.1);
    }
    settle().await;
    assert_pending!(pinned.poll_next());

    heartbeat(&connection, "blotter", "blotter.1", 0.4);
    settle().await;
    let update = assert_ready!(pinned.poll_next()).unwrap().unwrap();
    assert_eq!(update.service_load, 0.4);
    assert_pending!(pinned.poll_next());
}

#[tokio::test(start_paused = true)]
async fn other_service_types_and_malformed_messages_are_ignored() {
    let (connection, discovery) = connected_discovery("blotter").await;
    let mut statuses = discovery.service_status_stream();

    heartbeat(&connection, "pricing", "pricing.1", 0.0);
    connection.publish(STATUS_TOPIC, json!({"Type": "blotter", "Load": "heavy"}));
    connection.publish(STATUS_TOPIC, json!("not even an object"));
    heartbeat(&connection, "blotter", "blotter.1", 0.5);

    let status = wait_for_status(&mut statuses, |s| s.is_connected).await;
    assert_eq!(status.instance_statuses.len(), 1);
    assert_eq!(status.instance_statuses[0].service_id, "blotter.1");
    // 格式错误的消息不会中断当前发现周期
    assert_eq!(discovery.current().epoch(), 1);
}

#[tokio::test(start_paused = true)]
async fn status_topic_failure_resubscribes_after_delay() {
    let (connection, discovery) = connected_discovery("blotter").await;
    let mut statuses = discovery.service_status_stream();

    heartbeat(&connection, "blotter", "blotter.1", 0.5);
    wait_for_status(&mut statuses, |s| s.is_connected).await;

    let failed_at = Instant::now();
    connection.fail_topic(STATUS_TOPIC, ConnectionError::Transport("broker restarted".into()));
    wait_for_status(&mut statuses, |s| s.instance_statuses.is_empty()).await;

    tokio::time::sleep(Duration::from_millis(1000)).await;
    wait_for_subscriber(&connection, STATUS_TOPIC).await;
    assert!(failed_at.elapsed() >= Duration::from_millis(1000));

    heartbeat(&connection, "blotter", "blotter.1", 0.5);
    wait_for_status(&mut statuses, |s| s.is_connected).await;
    assert_eq!(discovery.current().epoch(), 2);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_last_handle_stops_discovery() {
    let (connection, discovery) = connected_discovery("blotter").await;
    let clone = discovery.clone();

    drop(discovery);
    settle().await;
    assert_eq!(connection.subscriber_count(STATUS_TOPIC), 1);

    let mut snapshots = clone.snapshots();
    drop(clone);
    settle().await;
    assert_eq!(connection.subscriber_count(STATUS_TOPIC), 0);

    // 快照流在后台任务结束后终止
    assert!(snapshots.next().await.is_some());
    assert!(snapshots.next().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn explicit_shutdown_closes_every_subscription() {
    let connection = MemoryConnection::new();
    let discovery = ServiceDiscovery::spawn(Arc::new(connection), &ClientConfig::new("blotter"));
    let clone = discovery.clone();
    let mut snapshots = discovery.subscribe();
    assert!(!clone.is_shutdown());

    discovery.shutdown();
    assert!(clone.is_shutdown());

    // 后台任务退出后发布端释放
    assert!(snapshots.changed().await.is_err());
    assert_eq!(snapshots.borrow().epoch(), 0);
}
