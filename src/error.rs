//! Failure records and error types.
//!
//! Three outcome channels are kept apart:
//! - [`ExecutionFault`]: fatal to the orchestration instance (non-determinism, panics). The
//!   executor turns it into a `Failed` completion action.
//! - [`ExecutionAborted`]: hands the work item back to the dispatcher, which abandons it.
//! - [`TaskError`] / [`FailureDetails`]: ordinary operation results delivered to callers.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::codec::CodecError;
use crate::providers::ProviderError;

/// Structured description of a failure, carried in history and in entity responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetails {
    #[serde(rename = "ErrorType")]
    pub error_type: String,
    #[serde(rename = "ErrorMessage")]
    pub error_message: String,
    #[serde(rename = "StackTrace", default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    #[serde(rename = "InnerFailure", default, skip_serializing_if = "Option::is_none")]
    pub inner_failure: Option<Box<FailureDetails>>,
    #[serde(rename = "IsNonRetriable", default)]
    pub is_non_retriable: bool,
}

impl FailureDetails {
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            error_message: error_message.into(),
            stack_trace: None,
            inner_failure: None,
            is_non_retriable: false,
        }
    }

    /// A failure that retry policies must not retry.
    pub fn non_retriable(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            is_non_retriable: true,
            ..Self::new(error_type, error_message)
        }
    }

    pub fn with_inner(mut self, inner: FailureDetails) -> Self {
        self.inner_failure = Some(Box::new(inner));
        self
    }

    /// True if this failure (or any inner failure) has the given error type.
    pub fn is_caused_by(&self, error_type: &str) -> bool {
        if self.error_type == error_type {
            return true;
        }
        self.inner_failure.as_ref().is_some_and(|inner| inner.is_caused_by(error_type))
    }
}

impl fmt::Display for FailureDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.error_message)
    }
}

/// Failure observed by orchestration code when awaiting a durable task.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskError {
    #[error("task '{name}' (id {task_scheduled_id}) failed: {reason}")]
    TaskFailed {
        task_scheduled_id: i32,
        name: String,
        reason: String,
        details: Option<String>,
        failure_details: Option<FailureDetails>,
    },
    #[error("sub-orchestration '{name}' (id {task_scheduled_id}) failed: {reason}")]
    SubOrchestrationFailed {
        task_scheduled_id: i32,
        name: String,
        reason: String,
        details: Option<String>,
        failure_details: Option<FailureDetails>,
    },
    #[error("entity operation failed: {0}")]
    EntityOperationFailed(FailureDetails),
    #[error("locking rules violation: {0}")]
    LockingRulesViolation(String),
    #[error("payload could not be decoded: {0}")]
    Codec(String),
    #[error("the durable task was canceled")]
    Canceled,
}

impl TaskError {
    pub fn failure_details(&self) -> Option<&FailureDetails> {
        match self {
            TaskError::TaskFailed { failure_details, .. }
            | TaskError::SubOrchestrationFailed { failure_details, .. } => failure_details.as_ref(),
            TaskError::EntityOperationFailed(details) => Some(details),
            _ => None,
        }
    }

    /// Failures explicitly marked non-retriable stop retry policies immediately.
    pub fn is_non_retriable(&self) -> bool {
        match self {
            TaskError::LockingRulesViolation(_) | TaskError::Canceled => true,
            other => other.failure_details().is_some_and(|d| d.is_non_retriable),
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            TaskError::TaskFailed { .. } => "TaskFailedException",
            TaskError::SubOrchestrationFailed { .. } => "SubOrchestrationFailedException",
            TaskError::EntityOperationFailed(_) => "EntityOperationFailedException",
            TaskError::LockingRulesViolation(_) => "LockingRulesViolationException",
            TaskError::Codec(_) => "SerializationException",
            TaskError::Canceled => "TaskCanceledException",
        }
    }
}

impl From<CodecError> for TaskError {
    fn from(e: CodecError) -> Self {
        TaskError::Codec(e.to_string())
    }
}

/// Error returned by orchestration code.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OrchestrationError {
    /// The orchestration failed; the instance completes with `Failed` status.
    #[error("{0}")]
    Failed(FailureDetails),
    /// The execution must be handed back to the backend without completing the instance.
    #[error("execution aborted: {0}")]
    Aborted(String),
}

impl OrchestrationError {
    pub fn failed(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        OrchestrationError::Failed(FailureDetails::new(error_type, message))
    }
}

impl From<TaskError> for OrchestrationError {
    fn from(e: TaskError) -> Self {
        let mut details = FailureDetails::new(e.error_type(), e.to_string());
        if let Some(inner) = e.failure_details() {
            details = details.with_inner(inner.clone());
        }
        OrchestrationError::Failed(details)
    }
}

impl From<CodecError> for OrchestrationError {
    fn from(e: CodecError) -> Self {
        OrchestrationError::failed("SerializationException", e.to_string())
    }
}

/// Fatal replay fault. Not retried: it signals a code change that broke determinism.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecutionFault {
    #[error("non-deterministic orchestration: {0}")]
    NonDeterminism(String),
    #[error("orchestration panicked: {0}")]
    Panicked(String),
}

impl ExecutionFault {
    pub fn to_failure_details(&self) -> FailureDetails {
        match self {
            ExecutionFault::NonDeterminism(msg) => {
                FailureDetails::non_retriable("NonDeterministicOrchestrationException", msg.clone())
            }
            ExecutionFault::Panicked(msg) => FailureDetails::non_retriable("OrchestrationPanic", msg.clone()),
        }
    }
}

/// Abort signal raised out of an orchestration execution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("orchestration execution aborted: {reason}")]
pub struct ExecutionAborted {
    pub reason: String,
}

/// Corrupt or incompatible entity scheduler state or message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}: {cause}")]
pub struct EntitySchedulerError {
    pub message: String,
    pub cause: String,
}

impl EntitySchedulerError {
    pub fn new(message: impl Into<String>, cause: impl fmt::Display) -> Self {
        Self {
            message: message.into(),
            cause: cause.to_string(),
        }
    }
}

/// Failure surfaced to the work item dispatcher by fetch or process callbacks.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    /// The fetch call timed out without a work item; treated as an idle poll.
    #[error("timed out waiting for a work item")]
    Timeout,
    #[error("dispatcher is shutting down")]
    Canceled,
    /// A handler for the work item is not registered. Always backs off a fixed interval.
    #[error("type missing: {0}")]
    TypeMissing(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    EntityScheduler(#[from] EntitySchedulerError),
    #[error(transparent)]
    Aborted(#[from] ExecutionAborted),
    #[error("invalid work item: {0}")]
    InvalidWorkItem(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("work item processing panicked: {0}")]
    ProcessingPanicked(String),
}
