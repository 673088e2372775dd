//! Backend capability set consumed by the dispatchers and the client.
//!
//! A backend owns queues and storage. The runtime only asks it to hand out locked work
//! items, renew or abandon those locks, and atomically persist the outcome of a turn
//! together with the messages it produced.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{DispatchError, FailureDetails};
use crate::history::{OrchestrationInstance, OrchestrationStatus, TaskMessage};
use crate::runtime_state::OrchestrationRuntimeState;

pub mod error;
pub mod in_memory;

pub use error::ProviderError;

/// Extended session over a locked orchestration or entity work item.
///
/// While a session is held, the dispatcher keeps the instance state in memory and pulls
/// further messages for the same instance without re-fetching history.
#[async_trait]
pub trait OrchestrationSession: Send + Sync {
    /// Next batch of messages for the locked instance, or `None` once the session idles out.
    async fn fetch_new_orchestration_messages(
        &self,
        work_item: &TaskOrchestrationWorkItem,
    ) -> Result<Option<Vec<TaskMessage>>, ProviderError>;
}

/// Locked batch of new messages for one orchestration or entity instance.
#[derive(Clone)]
pub struct TaskOrchestrationWorkItem {
    pub instance_id: String,
    pub lock_token: String,
    pub orchestration_runtime_state: OrchestrationRuntimeState,
    pub new_messages: Vec<TaskMessage>,
    /// `None` means the lock never expires and needs no renewal.
    pub locked_until: Option<DateTime<Utc>>,
    pub session: Option<Arc<dyn OrchestrationSession>>,
}

impl fmt::Debug for TaskOrchestrationWorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskOrchestrationWorkItem")
            .field("instance_id", &self.instance_id)
            .field("lock_token", &self.lock_token)
            .field("new_messages", &self.new_messages.len())
            .field("locked_until", &self.locked_until)
            .field("has_session", &self.session.is_some())
            .finish()
    }
}

/// Locked activity invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskActivityWorkItem {
    pub id: String,
    pub task_message: TaskMessage,
    pub locked_until: Option<DateTime<Utc>>,
}

/// Everything a dispatcher hands back when completing an orchestration or entity work item.
#[derive(Debug, Clone, Default)]
pub struct OrchestrationWorkItemCompletion {
    /// History to persist as the instance's current execution.
    pub runtime_state: OrchestrationRuntimeState,
    /// Activity invocations.
    pub outbound_messages: Vec<TaskMessage>,
    /// Messages to other orchestrations and entities.
    pub orchestrator_messages: Vec<TaskMessage>,
    /// Delayed messages back to this instance.
    pub timer_messages: Vec<TaskMessage>,
    /// Start of the next generation when the instance continued as new. Informational: the
    /// new generation is already the content of `runtime_state`.
    pub continued_as_new_message: Option<TaskMessage>,
    pub custom_status: Option<String>,
}

/// Snapshot of an instance as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationState {
    pub orchestration_instance: OrchestrationInstance,
    pub name: String,
    pub version: String,
    pub status: OrchestrationStatus,
    pub input: Option<String>,
    pub output: Option<String>,
    pub custom_status: Option<String>,
    pub failure_details: Option<FailureDetails>,
    pub created_time: Option<DateTime<Utc>>,
    pub last_updated_time: DateTime<Utc>,
}

/// Entity knobs advertised by an entity-capable backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityBackendProperties {
    /// Messages from the same sender arriving within this window are reordered into send order.
    pub entity_message_reorder_window: Duration,
    /// `None` leaves batches unbounded.
    pub max_entity_operation_batch_size: Option<usize>,
    pub max_concurrent_task_entity_work_items: usize,
    pub entity_dispatcher_count: usize,
    /// Whether an entity with no state, no lock, and no queue may simply disappear.
    pub supports_implicit_entity_deletion: bool,
    /// Longest delay a scheduled signal may be delivered with; longer delays are capped.
    pub max_scheduled_delay: Option<Duration>,
}

impl Default for EntityBackendProperties {
    fn default() -> Self {
        Self {
            entity_message_reorder_window: Duration::from_secs(30),
            max_entity_operation_batch_size: None,
            max_concurrent_task_entity_work_items: 100,
            entity_dispatcher_count: 1,
            supports_implicit_entity_deletion: false,
            max_scheduled_delay: None,
        }
    }
}

impl EntityBackendProperties {
    /// Delivery time the backend can honor for a message scheduled at `scheduled`.
    pub fn capped_delivery_time(&self, now: DateTime<Utc>, scheduled: DateTime<Utc>) -> DateTime<Utc> {
        let Some(max) = self.max_scheduled_delay else {
            return scheduled;
        };
        match chrono::Duration::from_std(max) {
            Ok(max) if scheduled - now > max => now + max,
            _ => scheduled,
        }
    }
}

/// Core backend contract for orchestrations and activities.
#[async_trait]
pub trait OrchestrationService: Send + Sync {
    async fn lock_next_task_orchestration_work_item(
        &self,
        receive_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<TaskOrchestrationWorkItem>, ProviderError>;

    /// Extends the lock, returning the new expiry (`None` if the lock no longer exists).
    async fn renew_task_orchestration_work_item_lock(
        &self,
        work_item: &TaskOrchestrationWorkItem,
    ) -> Result<Option<DateTime<Utc>>, ProviderError>;

    async fn complete_task_orchestration_work_item(
        &self,
        work_item: &TaskOrchestrationWorkItem,
        completion: OrchestrationWorkItemCompletion,
    ) -> Result<(), ProviderError>;

    /// Returns the messages to the queue for redelivery.
    async fn abandon_task_orchestration_work_item(&self, work_item: &TaskOrchestrationWorkItem)
    -> Result<(), ProviderError>;

    /// Drops the instance lock. Called after every work item, completed or not.
    async fn release_task_orchestration_work_item(&self, work_item: &TaskOrchestrationWorkItem)
    -> Result<(), ProviderError>;

    async fn lock_next_task_activity_work_item(
        &self,
        receive_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<TaskActivityWorkItem>, ProviderError>;

    async fn renew_task_activity_work_item_lock(
        &self,
        work_item: &TaskActivityWorkItem,
    ) -> Result<Option<DateTime<Utc>>, ProviderError>;

    async fn complete_task_activity_work_item(
        &self,
        work_item: &TaskActivityWorkItem,
        response: TaskMessage,
    ) -> Result<(), ProviderError>;

    async fn abandon_task_activity_work_item(&self, work_item: &TaskActivityWorkItem) -> Result<(), ProviderError>;

    /// Backoff applied before the next fetch after a failed fetch.
    fn delay_in_seconds_after_on_fetch_exception(&self, _error: &DispatchError) -> u64 {
        1
    }

    /// Backoff applied after a failed processing attempt; `0` disables the cooldown.
    fn delay_in_seconds_after_on_process_exception(&self, _error: &DispatchError) -> u64 {
        0
    }

    fn max_concurrent_task_orchestration_work_items(&self) -> usize {
        100
    }

    fn task_orchestration_dispatcher_count(&self) -> usize {
        1
    }

    fn max_concurrent_task_activity_work_items(&self) -> usize {
        10
    }

    fn task_activity_dispatcher_count(&self) -> usize {
        1
    }
}

/// Backends that keep entity work on its own queue.
#[async_trait]
pub trait EntityOrchestrationService: OrchestrationService {
    fn entity_backend_properties(&self) -> EntityBackendProperties;

    async fn lock_next_entity_work_item(
        &self,
        receive_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<TaskOrchestrationWorkItem>, ProviderError>;
}

/// Control-plane operations used by [`crate::client::TaskHubClient`].
#[async_trait]
pub trait OrchestrationServiceClient: Send + Sync {
    /// Delivers an `ExecutionStarted` message. Fails if a running instance already owns the id.
    async fn create_task_orchestration(&self, creation_message: TaskMessage) -> Result<(), ProviderError>;

    async fn send_task_orchestration_message(&self, message: TaskMessage) -> Result<(), ProviderError>;

    async fn get_orchestration_state(&self, instance_id: &str) -> Result<Option<OrchestrationState>, ProviderError>;

    /// Waits until the instance reaches a terminal status or `timeout` elapses.
    async fn wait_for_orchestration(
        &self,
        instance_id: &str,
        timeout: Duration,
    ) -> Result<Option<OrchestrationState>, ProviderError>;
}
