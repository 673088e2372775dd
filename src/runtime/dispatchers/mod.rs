//! Concrete dispatchers: one [`WorkItemDispatcher`](super::WorkItemDispatcher) per work item kind.

mod activity;
mod entity;
mod orchestration;

pub use activity::{ActivityExecutionResult, TaskActivityDispatcher};
pub use entity::TaskEntityDispatcher;
pub use orchestration::{TaskOrchestrationDispatcher, TurnOutput, apply_actions};

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio_util::sync::CancellationToken;

use crate::error::DispatchError;
use crate::providers::ProviderError;

/// Maps a fetch result onto the dispatcher's error space.
pub(crate) fn fetch_result<T>(result: Result<Option<T>, ProviderError>, cancel: &CancellationToken) -> Result<Option<T>, DispatchError> {
    match result {
        Ok(item) => Ok(item),
        Err(_) if cancel.is_cancelled() => Err(DispatchError::Canceled),
        Err(e) => Err(DispatchError::Provider(e)),
    }
}

/// Runs user code, turning a panic into its message.
pub(crate) async fn catch_user_panic<F, T>(future: F) -> Result<T, String>
where
    F: Future<Output = T>,
{
    AssertUnwindSafe(future).catch_unwind().await.map_err(|payload| {
        payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string())
    })
}
