//! First-success-or-all-failed combinator.

use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;

/// Drive every future concurrently and return the first `Ok`.
///
/// If all futures complete with `Err`, the errors are returned in completion
/// order. Futures still pending when a winner is found are dropped with the
/// returned future; wrap them in spawned tasks to let losers run to
/// completion on their own.
pub async fn first_ok<I, F, T, E>(futures: I) -> Result<T, Vec<E>>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T, E>>,
{
    let mut pending: FuturesUnordered<F> = futures.into_iter().collect();
    let mut errors = Vec::with_capacity(pending.len());

    while let Some(outcome) = pending.next().await {
        match outcome {
            Ok(value) => return Ok(value),
            Err(e) => errors.push(e),
        }
    }

    Err(errors)
}
