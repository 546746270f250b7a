//! 变化过滤
//!
//! 抑制连续的"实质相同"的值，首个值总是放行；错误原样透传

use futures::future;
use futures::stream::{Stream, StreamExt};

/// 抑制与上一个放行值相同的连续项
pub fn distinct_until_changed<S, T, E, F>(source: S, mut same: F) -> impl Stream<Item = Result<T, E>>
where
    S: Stream<Item = Result<T, E>>,
    T: Clone,
    F: FnMut(&T, &T) -> bool,
{
    let mut last: Option<T> = None;
    source.filter_map(move |item| {
        let passed = match item {
            Ok(value) => {
                if last.as_ref().is_some_and(|prev| same(prev, &value)) {
                    None
                } else {
                    last = Some(value.clone());
                    Some(Ok(value))
                }
            }
            Err(err) => Some(Err(err)),
        };
        future::ready(passed)
    })
}
