use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::codec::{CodecError, DataConverter, JsonDataConverter};
use crate::entities::{EntityId, EntityMessage, EntityMessageEvent, RequestMessage, request_event_name};
use crate::history::{EventKind, ExecutionStartedEvent, HistoryEvent, OrchestrationInstance, TaskMessage};
use crate::logging::DISPATCHER_TARGET;
use crate::providers::{OrchestrationServiceClient, OrchestrationState, ProviderError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Thin client for control-plane operations.
///
/// The client only enqueues messages and reads state; it talks to running workers exclusively
/// through the shared backend.
#[derive(Clone)]
pub struct TaskHubClient {
    service: Arc<dyn OrchestrationServiceClient>,
}

impl TaskHubClient {
    pub fn new(service: Arc<dyn OrchestrationServiceClient>) -> Self {
        Self { service }
    }

    /// Starts a new orchestration instance. Without an explicit id, a random one is generated.
    pub async fn create_orchestration_instance(
        &self,
        name: impl Into<String>,
        version: impl Into<String>,
        instance_id: Option<String>,
        input: Option<String>,
    ) -> Result<OrchestrationInstance, ClientError> {
        self.create_orchestration_instance_with_tags(name, version, instance_id, input, BTreeMap::new())
            .await
    }

    pub async fn create_orchestration_instance_with_tags(
        &self,
        name: impl Into<String>,
        version: impl Into<String>,
        instance_id: Option<String>,
        input: Option<String>,
        tags: BTreeMap<String, String>,
    ) -> Result<OrchestrationInstance, ClientError> {
        let instance_id = instance_id.unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let instance = OrchestrationInstance::new_execution(instance_id);
        let name = name.into();
        let started = ExecutionStartedEvent {
            name: name.clone(),
            version: version.into(),
            input,
            orchestration_instance: instance.clone(),
            parent_instance: None,
            tags,
        };
        self.service
            .create_task_orchestration(TaskMessage::new(
                HistoryEvent::unsequenced(Utc::now(), EventKind::ExecutionStarted(started)),
                instance.clone(),
            ))
            .await?;
        debug!(
            target: DISPATCHER_TARGET,
            instance_id = %instance.instance_id,
            execution_id = %instance.execution_id,
            orchestration = %name,
            "orchestration instance created"
        );
        Ok(instance)
    }

    /// Starts an orchestration with a JSON-encoded input.
    pub async fn create_orchestration_instance_typed<In: Serialize>(
        &self,
        name: impl Into<String>,
        instance_id: Option<String>,
        input: &In,
    ) -> Result<OrchestrationInstance, ClientError> {
        let input = JsonDataConverter.serialize(input)?;
        self.create_orchestration_instance(name, "", instance_id, Some(input)).await
    }

    /// Raises an external event. An empty execution id targets the current execution.
    pub async fn raise_event(
        &self,
        instance: &OrchestrationInstance,
        event_name: impl Into<String>,
        event_data: Option<String>,
    ) -> Result<(), ClientError> {
        self.send(
            instance.clone(),
            EventKind::EventRaised {
                name: event_name.into(),
                input: event_data,
            },
        )
        .await
    }

    /// Sends a one-way operation to an entity, optionally delivered at `scheduled_time`.
    pub async fn signal_entity(
        &self,
        entity: &EntityId,
        operation: impl Into<String>,
        input: Option<String>,
        scheduled_time: Option<DateTime<Utc>>,
    ) -> Result<(), ClientError> {
        let now = Utc::now();
        let mut request = RequestMessage::operation(Uuid::new_v4(), operation, true, input);
        request.scheduled_time = scheduled_time;
        let message = EntityMessageEvent {
            event_name: request_event_name(scheduled_time),
            message: EntityMessage::Request(request),
            target: OrchestrationInstance::new(entity.instance_id(), ""),
        }
        .into_task_message(now)?;
        self.service.send_task_orchestration_message(message).await?;
        Ok(())
    }

    pub async fn suspend_instance(&self, instance_id: &str, reason: Option<String>) -> Result<(), ClientError> {
        self.send(
            OrchestrationInstance::new(instance_id, ""),
            EventKind::ExecutionSuspended { reason },
        )
        .await
    }

    pub async fn resume_instance(&self, instance_id: &str, reason: Option<String>) -> Result<(), ClientError> {
        self.send(OrchestrationInstance::new(instance_id, ""), EventKind::ExecutionResumed { reason })
            .await
    }

    /// Terminates a running instance; `output` becomes its recorded result.
    pub async fn terminate_instance(&self, instance_id: &str, output: Option<String>) -> Result<(), ClientError> {
        self.send(
            OrchestrationInstance::new(instance_id, ""),
            EventKind::ExecutionTerminated { input: output },
        )
        .await
    }

    pub async fn get_orchestration_state(&self, instance_id: &str) -> Result<Option<OrchestrationState>, ClientError> {
        Ok(self.service.get_orchestration_state(instance_id).await?)
    }

    /// Waits for the instance to reach a terminal status; `None` if `timeout` elapses first.
    pub async fn wait_for_orchestration(
        &self,
        instance_id: &str,
        timeout: Duration,
    ) -> Result<Option<OrchestrationState>, ClientError> {
        Ok(self.service.wait_for_orchestration(instance_id, timeout).await?)
    }

    async fn send(&self, instance: OrchestrationInstance, kind: EventKind) -> Result<(), ClientError> {
        self.service
            .send_task_orchestration_message(TaskMessage::new(HistoryEvent::unsequenced(Utc::now(), kind), instance))
            .await?;
        Ok(())
    }
}
