//! 最低负载选择
//!
//! 在快照流上找到第一个可用的最低负载实例，然后固定在该实例上：
//! 先产出它的当前状态，再转发它之后的每次状态变化（包括断开）。

use std::sync::Arc;

use futures::future;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio_stream::wrappers::WatchStream;
use tracing::debug;

use super::instance::InstanceStatus;
use super::registry::{InstanceHandle, RegistrySnapshot};
use crate::error::DispatchError;

/// 选择负载最低的在线实例并持续跟踪它
///
/// - 没有候选且 `wait_if_none == false`：立即产出 `NoServiceAvailable` 后结束
/// - 没有候选且 `wait_if_none == true`：继续等待，不设超时
/// - 快照流在找到候选前结束：输出直接结束
pub fn select_min_load<S>(
    snapshots: S,
    wait_if_none: bool,
) -> BoxStream<'static, Result<InstanceStatus, DispatchError>>
where
    S: Stream<Item = Arc<RegistrySnapshot>> + Send + 'static,
{
    let chosen = async move {
        let mut snapshots = Box::pin(snapshots);
        while let Some(snapshot) = snapshots.next().await {
            match snapshot.least_loaded() {
                Some(handle) => return Some(Ok(handle.clone())),
                None if wait_if_none => {
                    debug!(
                        service_type = %snapshot.service_type(),
                        "No connected instance yet, waiting"
                    );
                }
                None => {
                    return Some(Err(DispatchError::NoServiceAvailable {
                        service_type: snapshot.service_type().to_string(),
                    }));
                }
            }
        }
        None
    };

    stream::once(chosen)
        .filter_map(future::ready)
        .flat_map(|chosen| match chosen {
            Ok(handle) => follow_instance(handle),
            Err(err) => stream::once(future::ready(Err(err))).boxed(),
        })
        .boxed()
}

fn follow_instance(handle: InstanceHandle) -> BoxStream<'static, Result<InstanceStatus, DispatchError>> {
    debug!(
        service_type = %handle.latest.service_type,
        service_id = %handle.service_id(),
        load = handle.latest.service_load,
        "Selected least loaded instance"
    );
    // watch 会合并连续的值；断开次数增加但最新状态已在线时，补发一次离线状态
    let updates = WatchStream::from_changes(handle.updates())
        .scan(handle.disconnects, |seen, update| {
            let missed_disconnect = update.disconnects > *seen && update.status.is_connected;
            *seen = update.disconnects;
            let mut statuses = Vec::with_capacity(2);
            if missed_disconnect {
                statuses.push(update.status.to_disconnected());
            }
            statuses.push(update.status);
            future::ready(Some(stream::iter(statuses)))
        })
        .flatten();
    stream::once(future::ready(Ok(handle.latest)))
        .chain(updates.map(Ok))
        .boxed()
}
