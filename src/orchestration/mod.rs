//! Orchestration authoring surface and the replay engine that drives it.

pub mod actions;
pub mod context;
pub mod executor;
pub mod futures;
pub mod retry;

use crate::providers::EntityBackendProperties;

pub use actions::{OrchestrationCompleteAction, OrchestratorAction};
pub use context::{OpenTaskInfo, OpenTaskKind, OrchestrationContext};
pub use executor::{OrchestratorExecutionResult, TaskOrchestrationExecutor};
pub use futures::{CriticalSection, DurableFuture, EntityCallFuture, ExternalEventFuture, LockFuture, TimerHandle};
pub use retry::{DeterministicClock, RetryInterceptor, RetryOptions, RetryPredicate};

/// How an orchestration failure is recorded on its completion action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPropagationMode {
    /// The failure is serialized as JSON into the `details` field.
    SerializeExceptions,
    /// The failure is attached as structured [`crate::error::FailureDetails`].
    #[default]
    UseFailureDetails,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutorOptions {
    pub error_propagation_mode: ErrorPropagationMode,
    pub entity_properties: EntityBackendProperties,
}
