use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use std::ops::Range;
use thiserror::Error;
use tracing::{debug, warn};

/// The first failure observed in the batch that stopped [`run_batched`].
#[derive(Debug, Error)]
#[error("attempt {attempt} in batch {batch} failed: {error}")]
pub struct BatchFailure<E: std::error::Error + 'static> {
    pub batch: usize,
    pub attempt: usize,
    #[source]
    pub error: E,
}

/// Splits `total` attempts into consecutive batches of at most `limit`.
///
/// `total / limit` full batches come first, followed by one batch holding
/// the remainder when there is one.
pub fn batch_ranges(total: usize, limit: usize) -> Vec<Range<usize>> {
    let limit = limit.max(1);
    let full = total / limit;
    let remainder = total % limit;

    let mut ranges: Vec<Range<usize>> = (0..full).map(|b| b * limit..b * limit + limit).collect();
    if remainder > 0 {
        ranges.push(full * limit..total);
    }
    ranges
}

/// Runs `attempt(0)` through `attempt(total - 1)`, at most `limit` at a time.
///
/// Every attempt of a batch is started together and the batch is awaited as
/// a whole. A failing attempt does not cancel its siblings: the batch still
/// runs to completion and only then is the first observed failure returned.
/// No later batch is started after a failure.
pub async fn run_batched<F, Fut, E>(
    total: usize,
    limit: usize,
    attempt: F,
) -> Result<(), BatchFailure<E>>
where
    F: Fn(usize) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: std::error::Error + 'static,
{
    for (batch, range) in batch_ranges(total, limit).into_iter().enumerate() {
        debug!(batch, first = range.start, size = range.len(), "Starting batch");

        let mut running: FuturesUnordered<_> = range
            .map(|index| {
                let fut = attempt(index);
                async move { (index, fut.await) }
            })
            .collect();

        let mut first_failure = None;
        while let Some((index, result)) = running.next().await {
            if let Err(error) = result {
                warn!(batch, attempt = index, error = %error, "Attempt failed");
                if first_failure.is_none() {
                    first_failure = Some((index, error));
                }
            }
        }

        if let Some((attempt, error)) = first_failure {
            return Err(BatchFailure {
                batch,
                attempt,
                error,
            });
        }
    }

    Ok(())
}
