//! Endpoint retry loop shared by manifest and chunk downloads

use std::future::Future;
use std::sync::Arc;

use depot_pool::EndpointPool;
use depot_proto::{Endpoint, FetchOutcome};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::errors::{Result, SyncError};

/// Run one attempt against a freshly acquired endpoint.
///
/// Returns `Ok(None)` after a transient failure; the endpoint has then been
/// marked broken and the caller may try again.
pub(crate) async fn fetch_once<T, F, Fut>(
    pool: &EndpointPool,
    cancel: &CancellationToken,
    what: &str,
    attempt: F,
) -> Result<Option<T>>
where
    F: FnOnce(Arc<Endpoint>) -> Fut,
    Fut: Future<Output = FetchOutcome<T>>,
{
    let endpoint = pool.acquire(cancel).await?;

    let outcome = tokio::select! {
        _ = cancel.cancelled() => {
            pool.release(endpoint).await;
            return Err(SyncError::Cancelled);
        }
        outcome = attempt(endpoint.clone()) => outcome,
    };

    match outcome {
        FetchOutcome::Success(value) => {
            debug!("Fetched {} from {}", what, endpoint);
            pool.release(endpoint).await;
            Ok(Some(value))
        }
        FetchOutcome::TransientFailure(reason) => {
            warn!("Failed to fetch {} from {}: {}", what, endpoint, reason);
            pool.mark_broken(&endpoint).await;
            Ok(None)
        }
        FetchOutcome::FatalFailure(reason) => {
            error!("Aborting {} after {} answered: {}", what, endpoint, reason);
            pool.mark_broken(&endpoint).await;
            Err(reason.into())
        }
    }
}

/// Retry on fresh endpoints until success, cancellation, exhaustion or a fatal answer
pub(crate) async fn fetch_with_retry<T, F, Fut>(
    pool: &EndpointPool,
    cancel: &CancellationToken,
    what: &str,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut(Arc<Endpoint>) -> Fut,
    Fut: Future<Output = FetchOutcome<T>>,
{
    loop {
        if let Some(value) = fetch_once(pool, cancel, what, &mut attempt).await? {
            return Ok(value);
        }
    }
}
