//! Durable task execution core.
//!
//! Orchestrations are ordinary async functions that are replayed from their history on every
//! turn; activities do the side-effecting work; entities are addressable, single-threaded
//! state holders that orchestrations can call, signal, and lock. A backend implementing
//! [`providers::OrchestrationService`] owns queues and storage, and a [`TaskHubWorker`] runs
//! the dispatchers against it.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use durable_task_core::{
//!     ActivityRegistry, OrchestrationRegistry, RuntimeOptions, TaskHubClient, TaskHubWorker,
//!     providers::in_memory::InMemoryOrchestrationService,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let service = Arc::new(InMemoryOrchestrationService::new());
//! let activities = ActivityRegistry::builder()
//!     .register("Greet", |_ctx, input| async move { Ok(Some(format!("Hello, {}!", input.unwrap_or_default()))) })
//!     .build();
//! let orchestrations = OrchestrationRegistry::builder()
//!     .register("HelloWorld", |ctx, input| async move {
//!         Ok(ctx.schedule_task("Greet", "", input).await?)
//!     })
//!     .build();
//!
//! let worker = TaskHubWorker::new(service.clone(), RuntimeOptions::default())
//!     .with_activities(activities)
//!     .with_orchestrations(orchestrations);
//! worker.start();
//!
//! let client = TaskHubClient::new(service);
//! let instance = client
//!     .create_orchestration_instance("HelloWorld", "", None, Some("Rust".to_string()))
//!     .await?;
//! let state = client
//!     .wait_for_orchestration(&instance.instance_id, Duration::from_secs(5))
//!     .await?;
//! println!("{:?}", state.and_then(|s| s.output));
//! worker.stop(false).await;
//! # Ok(())
//! # }
//! ```

pub mod activity;
pub mod client;
pub mod codec;
pub mod entities;
pub mod error;
pub mod history;
pub mod logging;
pub mod orchestration;
pub mod providers;
pub mod runtime;
pub mod runtime_state;

pub use activity::{ActivityFailure, FnActivity, TaskActivity, TaskContext};
pub use client::{ClientError, TaskHubClient};
pub use codec::{CodecError, DataConverter, JsonDataConverter};
pub use entities::{EntityContext, EntityId, FnEntity, TaskEntity};
pub use error::{
    DispatchError, EntitySchedulerError, ExecutionAborted, ExecutionFault, FailureDetails, OrchestrationError, TaskError,
};
pub use history::{
    EventKind, ExecutionStartedEvent, HistoryEvent, OrchestrationInstance, OrchestrationStatus, ParentInstance,
    TaskMessage,
};
pub use orchestration::{
    CriticalSection, ErrorPropagationMode, OrchestrationContext, RetryOptions, TaskOrchestrationExecutor,
};
pub use runtime::{
    ActivityRegistry, EntityRegistry, FnOrchestration, OrchestrationHandler, OrchestrationRegistry, RuntimeOptions,
    TaskHubWorker,
};
pub use runtime_state::OrchestrationRuntimeState;
