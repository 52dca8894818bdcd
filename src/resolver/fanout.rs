use std::future::Future;

use futures::future::join_all;

use crate::Result;

/// Runs `f(0)..f(n)` concurrently and returns every result in index order.
///
/// `n` is the number of physical connections behind a handle, so it is 1 or 2.
pub async fn fan_out_settled<T, F, Fut>(n: usize, f: F) -> Vec<Result<T>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    debug_assert!((1..=2).contains(&n), "fan-out over {n} connections");
    join_all((0..n).map(f)).await
}

/// Like [`fan_out_settled`], but fails with the lowest-indexed error once all units finish.
pub async fn fan_out<T, F, Fut>(n: usize, f: F) -> Result<Vec<T>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    fan_out_settled(n, f).await.into_iter().collect()
}
