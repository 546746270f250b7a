//! 带退避的重订阅
//!
//! `retry_stream` 在流产生错误时按策略等待后重新创建流；
//! `retry_request` 对单次请求做同样的事情。调用方丢弃流/Future 即取消，
//! 包括正在进行的退避等待。

use std::future::Future;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use futures::Stream;
use tracing::{debug, warn};

use super::RetryPolicy;
use crate::error::DispatchError;

struct RetryState<F, T> {
    name: String,
    policy: Arc<dyn RetryPolicy>,
    factory: F,
    current: Option<BoxStream<'static, Result<T, DispatchError>>>,
    attempt: usize,
    finished: bool,
}

/// 用重试策略包装一个流工厂
///
/// 每次订阅（含重订阅）都会调用一次 `factory`。成功产出一项后重试计数归零。
/// 策略拒绝重试时，最后一个错误会被透出并结束流。
pub fn retry_stream<T, F, S>(
    name: impl Into<String>,
    policy: Arc<dyn RetryPolicy>,
    factory: F,
) -> BoxStream<'static, Result<T, DispatchError>>
where
    T: Send + 'static,
    F: FnMut() -> S + Send + 'static,
    S: Stream<Item = Result<T, DispatchError>> + Send + 'static,
{
    let state = RetryState {
        name: name.into(),
        policy,
        factory,
        current: None,
        attempt: 0,
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }
        loop {
            let current = state
                .current
                .get_or_insert_with(|| (state.factory)().boxed());

            match current.next().await {
                Some(Ok(item)) => {
                    state.attempt = 0;
                    return Some((Ok(item), state));
                }
                Some(Err(err)) => {
                    state.current = None;
                    if !state.policy.should_retry(state.attempt, &err) {
                        warn!(
                            operation = %state.name,
                            attempt = state.attempt,
                            error = %err,
                            "Retry policy exhausted, surfacing error"
                        );
                        state.finished = true;
                        return Some((Err(err), state));
                    }
                    let delay = state.policy.backoff_duration(state.attempt);
                    warn!(
                        operation = %state.name,
                        attempt = state.attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Operation failed, retrying after backoff"
                    );
                    state.attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                None => {
                    debug!(operation = %state.name, "Retried stream completed");
                    return None;
                }
            }
        }
    })
    .boxed()
}

/// 用重试策略包装一个请求
pub async fn retry_request<T, F, Fut>(
    name: &str,
    policy: &dyn RetryPolicy,
    mut request: F,
) -> Result<T, DispatchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DispatchError>>,
{
    let mut attempt = 0;
    loop {
        match request().await {
            Ok(value) => return Ok(value),
            Err(err) if policy.should_retry(attempt, &err) => {
                let delay = policy.backoff_duration(attempt);
                warn!(
                    operation = %name,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Request failed, retrying after backoff"
                );
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConnectionError;
    use crate::retry::{ExponentialBackoffPolicy, FixedRetryPolicy};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    fn remote_error() -> DispatchError {
        DispatchError::Connection(ConnectionError::Remote {
            procedure: "analytics-1.getAnalytics".into(),
            reason: "unavailable".into(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn stream_is_resubscribed_with_growing_backoff() {
        let subscriptions = Arc::new(AtomicUsize::new(0));
        let counter = subscriptions.clone();
        let start = Instant::now();

        let mut retried = retry_stream(
            "getAnalytics",
            Arc::new(ExponentialBackoffPolicy::backoff_to_10_seconds_max()),
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    stream::iter(vec![Err(remote_error())]).boxed()
                } else {
                    stream::iter(vec![Ok(n)]).boxed()
                }
            },
        );

        assert_eq!(retried.next().await, Some(Ok(2)));
        assert_eq!(subscriptions.load(Ordering::SeqCst), 3);
        // 250ms + 500ms
        assert_eq!(start.elapsed(), Duration::from_millis(750));
        assert_eq!(retried.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_policy_surfaces_the_last_error() {
        let mut retried = retry_stream(
            "getTrades",
            Arc::new(FixedRetryPolicy::new(Some(1), Duration::from_millis(10))),
            || stream::iter(vec![Err::<u32, _>(remote_error())]),
        );

        assert_eq!(retried.next().await, Some(Err(remote_error())));
        assert_eq!(retried.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_items_reset_the_attempt_counter() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let start = Instant::now();

        let retried = retry_stream(
            "prices",
            Arc::new(ExponentialBackoffPolicy::backoff_to_10_seconds_max()),
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                stream::iter(vec![Ok(n), Err(remote_error())])
            },
        );

        let items: Vec<_> = retried.take(3).collect().await;
        assert_eq!(items, vec![Ok(0), Ok(1), Ok(2)]);
        // 每次都在成功一项之后失败，所以退避始终是初始值
        assert_eq!(start.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn request_is_retried_until_success() {
        let calls = AtomicUsize::new(0);
        let policy = FixedRetryPolicy::new(None, Duration::from_secs(1));

        let result = retry_request("executeTrade", &policy, || {
            let calls = &calls;
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(remote_error())
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
