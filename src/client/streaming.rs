//! 流式操作的事件合并
//!
//! 同时观察三个来源：结果主题、远端调用的确认、已选实例的状态。
//! 主题数据原样转发；确认只在失败时起作用；实例断开即以错误结束。

use futures::future::{BoxFuture, FusedFuture, Fuse, FutureExt};
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use tracing::{debug, warn};

use crate::discovery::InstanceStatus;
use crate::error::{ConnectionError, DispatchError, Result};
use crate::transport::TopicStream;

pub(crate) type Ack = BoxFuture<'static, std::result::Result<Value, ConnectionError>>;

struct StreamingState {
    topic: TopicStream,
    ack: Fuse<Ack>,
    pinned: BoxStream<'static, Result<InstanceStatus>>,
    pinned_open: bool,
    service_id: String,
    operation: String,
    finished: bool,
}

pub(crate) fn operation_events(
    topic: TopicStream,
    ack: Ack,
    pinned: BoxStream<'static, Result<InstanceStatus>>,
    service_id: String,
    operation: String,
) -> BoxStream<'static, Result<Value>> {
    let state = StreamingState {
        topic,
        ack: ack.fuse(),
        pinned,
        pinned_open: true,
        service_id,
        operation,
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }
        loop {
            tokio::select! {
                biased;
                item = state.topic.next() => {
                    return match item {
                        Some(Ok(value)) => Some((Ok(value), state)),
                        Some(Err(err)) => {
                            state.finished = true;
                            Some((Err(DispatchError::Connection(err)), state))
                        }
                        None => {
                            debug!(operation = %state.operation, "Stream operation completed");
                            None
                        }
                    };
                }
                ack = &mut state.ack, if !state.ack.is_terminated() => match ack {
                    Ok(_) => {
                        debug!(
                            service_id = %state.service_id,
                            operation = %state.operation,
                            "Stream operation acknowledged"
                        );
                    }
                    Err(err) => {
                        warn!(
                            service_id = %state.service_id,
                            operation = %state.operation,
                            error = %err,
                            "Stream operation rejected"
                        );
                        state.finished = true;
                        return Some((Err(DispatchError::Connection(err)), state));
                    }
                },
                status = state.pinned.next(), if state.pinned_open => match status {
                    Some(Ok(status)) if !status.is_connected => {
                        warn!(
                            service_id = %state.service_id,
                            operation = %state.operation,
                            "Service instance disconnected during stream operation"
                        );
                        state.finished = true;
                        let err = DispatchError::InstanceDisconnected {
                            service_id: state.service_id.clone(),
                            operation: state.operation.clone(),
                        };
                        return Some((Err(err), state));
                    }
                    Some(_) => {}
                    None => state.pinned_open = false,
                },
            }
        }
    })
    .boxed()
}
