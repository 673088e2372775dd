//! Activity authoring surface.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;

use crate::codec::{CodecError, DataConverter, JsonDataConverter};
use crate::error::FailureDetails;
use crate::history::OrchestrationInstance;

/// What an activity knows about the invocation it serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskContext {
    pub orchestration_instance: OrchestrationInstance,
    /// Sequence id of the `TaskScheduled` event this invocation answers.
    pub task_scheduled_id: i32,
    pub name: String,
    pub version: String,
}

/// Failure returned by an activity. Delivered to the orchestration as `TaskFailed`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}: {}", .details.error_type, .details.error_message)]
pub struct ActivityFailure {
    pub details: FailureDetails,
}

impl ActivityFailure {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            details: FailureDetails::new(error_type, message),
        }
    }

    /// A failure that retry policies must not retry.
    pub fn non_retriable(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            details: FailureDetails::non_retriable(error_type, message),
        }
    }
}

impl From<CodecError> for ActivityFailure {
    fn from(e: CodecError) -> Self {
        ActivityFailure::non_retriable("SerializationException", e.to_string())
    }
}

impl From<FailureDetails> for ActivityFailure {
    fn from(details: FailureDetails) -> Self {
        Self { details }
    }
}

#[async_trait]
pub trait TaskActivity: Send + Sync {
    async fn run(&self, ctx: TaskContext, input: Option<String>) -> Result<Option<String>, ActivityFailure>;
}

/// Function wrapper that implements [`TaskActivity`].
pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(TaskContext, Option<String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<String>, ActivityFailure>> + Send + 'static;

#[async_trait]
impl<F, Fut> TaskActivity for FnActivity<F, Fut>
where
    F: Fn(TaskContext, Option<String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<String>, ActivityFailure>> + Send + 'static,
{
    async fn run(&self, ctx: TaskContext, input: Option<String>) -> Result<Option<String>, ActivityFailure> {
        (self.0)(ctx, input).await
    }
}

/// Decodes the input of a typed activity; an absent input decodes as JSON `null`.
pub fn decode_input<T: DeserializeOwned>(input: Option<&str>) -> Result<T, ActivityFailure> {
    Ok(JsonDataConverter.deserialize(input.unwrap_or("null"))?)
}

pub fn encode_output<T: Serialize>(output: &T) -> Result<Option<String>, ActivityFailure> {
    Ok(Some(JsonDataConverter.serialize(output)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fn_activity_passes_context_and_input() {
        let activity = FnActivity(|ctx: TaskContext, input: Option<String>| async move {
            Ok(Some(format!("{}:{}:{}", ctx.name, ctx.task_scheduled_id, input.unwrap_or_default())))
        });
        let ctx = TaskContext {
            orchestration_instance: OrchestrationInstance::new("i", "e"),
            task_scheduled_id: 4,
            name: "Greet".to_string(),
            version: String::new(),
        };
        let out = activity.run(ctx, Some("bob".to_string())).await.unwrap();
        assert_eq!(out.as_deref(), Some("Greet:4:bob"));
    }

    #[test]
    fn bad_typed_input_is_non_retriable() {
        let err = decode_input::<u32>(Some("\"x\"")).unwrap_err();
        assert!(err.details.is_non_retriable);
        assert_eq!(err.details.error_type, "SerializationException");
    }
}
