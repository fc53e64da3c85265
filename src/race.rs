use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;

/// Runs all futures concurrently and returns the first success to settle.
///
/// If every future fails, the failure that settled last is returned. Returns
/// `None` when given no futures. Futures that are already ready when first
/// polled settle in the order supplied; after that, ties between futures woken
/// together are not ordered.
pub async fn first_success<I, F, T, E>(futures: I) -> Option<Result<T, E>>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T, E>>,
{
    let mut pending: FuturesUnordered<F> = futures.into_iter().collect();
    let mut last_err = None;
    while let Some(result) = pending.next().await {
        match result {
            Ok(v) => return Some(Ok(v)),
            Err(e) => last_err = Some(e),
        }
    }
    last_err.map(Err)
}
