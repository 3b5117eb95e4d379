//! Cancellation plumbing for suspend points
//!
//! Every operation that suspends on collaborator I/O races the pending
//! future against the caller's `CancellationToken`. Cancellation surfaces
//! as `RoamError::Cancelled`; completed store writes are not rolled back.

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::{RoamError, RoamResult};

/// Run a fallible future to completion unless the token fires first.
pub(crate) async fn guard<T, F>(cancel: &CancellationToken, fut: F) -> RoamResult<T>
where
    F: Future<Output = RoamResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RoamError::Cancelled),
        res = fut => res,
    }
}

/// Synchronous cancellation check between suspend points.
pub(crate) fn checkpoint(cancel: &CancellationToken) -> RoamResult<()> {
    if cancel.is_cancelled() {
        Err(RoamError::Cancelled)
    } else {
        Ok(())
    }
}
