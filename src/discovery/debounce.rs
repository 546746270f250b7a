//! 心跳超时检测
//!
//! 把"沉默"转换成显式的离线事件：原样透传每个心跳，超过 `due_time` 没有任何输出时
//! 调用工厂生成一个合成项，然后重新计时。订阅后一直没有心跳同样会触发。

use std::pin::Pin;
use std::time::Duration;

use futures::stream::{self, Stream, StreamExt};
use tokio::time::{Instant, Sleep};

struct DebounceState<S, F> {
    source: Pin<Box<S>>,
    deadline: Option<Pin<Box<Sleep>>>,
    due_time: Duration,
    on_missed: F,
    finished: bool,
}

/// 为单个实例的心跳流加上超时语义
///
/// - 源流出错：错误透出后结束，计时器一并释放
/// - 源流结束：输出随之结束
///
/// 计时基于 tokio 时钟，测试中可用 `tokio::time::pause` 驱动。
pub fn debounce_on_missed_heartbeat<S, T, E, F>(
    source: S,
    due_time: Duration,
    on_missed: F,
) -> impl Stream<Item = Result<T, E>>
where
    S: Stream<Item = Result<T, E>>,
    F: FnMut() -> T,
{
    let state = DebounceState {
        source: Box::pin(source),
        deadline: None,
        due_time,
        on_missed,
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }
        let due_time = state.due_time;
        let deadline = state
            .deadline
            .get_or_insert_with(|| Box::pin(tokio::time::sleep(due_time)));

        tokio::select! {
            biased;
            item = state.source.next() => match item {
                Some(Ok(value)) => {
                    if let Some(deadline) = state.deadline.as_mut() {
                        deadline.as_mut().reset(Instant::now() + due_time);
                    }
                    Some((Ok(value), state))
                }
                Some(Err(err)) => {
                    state.finished = true;
                    state.deadline = None;
                    Some((Err(err), state))
                }
                None => None,
            },
            () = deadline.as_mut() => {
                let missed = (state.on_missed)();
                if let Some(deadline) = state.deadline.as_mut() {
                    deadline.as_mut().reset(Instant::now() + due_time);
                }
                Some((Ok(missed), state))
            }
        }
    })
}
