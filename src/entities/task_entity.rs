//! User-facing entity abstraction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::codec::{CodecError, DataConverter, JsonDataConverter};
use crate::entities::EntityId;
use crate::error::FailureDetails;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRequest {
    pub operation: String,
    pub id: Uuid,
    pub input: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OperationResult {
    pub result: Option<String>,
    pub error_message: Option<String>,
    pub failure_details: Option<FailureDetails>,
}

impl OperationResult {
    pub fn success(result: Option<String>) -> Self {
        Self {
            result,
            ..Default::default()
        }
    }

    pub fn failure(details: FailureDetails) -> Self {
        Self {
            result: None,
            error_message: Some(details.error_type.clone()),
            failure_details: Some(details),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error_message.is_some() || self.failure_details.is_some()
    }
}

/// Side effect requested by an entity operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationAction {
    SendSignal {
        instance_id: String,
        name: String,
        input: Option<String>,
        scheduled_time: Option<DateTime<Utc>>,
    },
    StartNewOrchestration {
        name: String,
        version: String,
        instance_id: String,
        input: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityBatchRequest {
    pub instance_id: String,
    pub entity_state: Option<String>,
    pub operations: Vec<OperationRequest>,
}

/// Result of executing a batch.
///
/// `results` may be shorter than the request; the missing tail is requeued and retried.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EntityBatchResult {
    pub results: Vec<OperationResult>,
    pub actions: Vec<OperationAction>,
    pub entity_state: Option<String>,
    pub failure_details: Option<FailureDetails>,
}

#[async_trait]
pub trait TaskEntity: Send + Sync {
    async fn execute_operation_batch(&self, request: EntityBatchRequest) -> EntityBatchResult;
}

/// Operation-scoped view handed to [`FnEntity`] handlers.
pub struct EntityContext {
    entity_id: EntityId,
    state: Option<String>,
    actions: Vec<OperationAction>,
    converter: JsonDataConverter,
}

impl EntityContext {
    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    pub fn has_state(&self) -> bool {
        self.state.is_some()
    }

    pub fn state(&self) -> Option<&str> {
        self.state.as_deref()
    }

    pub fn get_state<T: DeserializeOwned>(&self) -> Result<Option<T>, CodecError> {
        self.state.as_deref().map(|s| self.converter.deserialize(s)).transpose()
    }

    pub fn set_state(&mut self, state: impl Into<String>) {
        self.state = Some(state.into());
    }

    pub fn set_state_typed<T: Serialize>(&mut self, state: &T) -> Result<(), CodecError> {
        self.state = Some(self.converter.serialize(state)?);
        Ok(())
    }

    pub fn delete_state(&mut self) {
        self.state = None;
    }

    pub fn signal_entity(&mut self, target: &EntityId, operation: impl Into<String>, input: Option<String>) {
        self.actions.push(OperationAction::SendSignal {
            instance_id: target.instance_id(),
            name: operation.into(),
            input,
            scheduled_time: None,
        });
    }

    pub fn signal_entity_at(
        &mut self,
        target: &EntityId,
        operation: impl Into<String>,
        input: Option<String>,
        scheduled_time: DateTime<Utc>,
    ) {
        self.actions.push(OperationAction::SendSignal {
            instance_id: target.instance_id(),
            name: operation.into(),
            input,
            scheduled_time: Some(scheduled_time),
        });
    }

    /// Starts a new orchestration; returns its instance id.
    pub fn start_new_orchestration(
        &mut self,
        name: impl Into<String>,
        version: impl Into<String>,
        instance_id: Option<String>,
        input: Option<String>,
    ) -> String {
        let instance_id = instance_id.unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        self.actions.push(OperationAction::StartNewOrchestration {
            name: name.into(),
            version: version.into(),
            instance_id: instance_id.clone(),
            input,
        });
        instance_id
    }
}

/// Entity built from a synchronous per-operation handler.
///
/// A failing operation rolls back its own state changes and actions; earlier operations in the
/// same batch keep theirs.
pub struct FnEntity<F>(pub F)
where
    F: Fn(&mut EntityContext, &str, Option<&str>) -> Result<Option<String>, FailureDetails> + Send + Sync + 'static;

#[async_trait]
impl<F> TaskEntity for FnEntity<F>
where
    F: Fn(&mut EntityContext, &str, Option<&str>) -> Result<Option<String>, FailureDetails> + Send + Sync + 'static,
{
    async fn execute_operation_batch(&self, request: EntityBatchRequest) -> EntityBatchResult {
        let entity_id = match request.instance_id.parse::<EntityId>() {
            Ok(id) => id,
            Err(e) => {
                return EntityBatchResult {
                    entity_state: request.entity_state,
                    failure_details: Some(FailureDetails::non_retriable("InvalidEntityId", e.to_string())),
                    ..Default::default()
                };
            }
        };

        let mut ctx = EntityContext {
            entity_id,
            state: request.entity_state,
            actions: Vec::new(),
            converter: JsonDataConverter,
        };
        let mut results = Vec::with_capacity(request.operations.len());

        for op in &request.operations {
            let state_before = ctx.state.clone();
            let actions_before = ctx.actions.len();
            match (self.0)(&mut ctx, &op.operation, op.input.as_deref()) {
                Ok(result) => results.push(OperationResult::success(result)),
                Err(details) => {
                    ctx.state = state_before;
                    ctx.actions.truncate(actions_before);
                    results.push(OperationResult::failure(details));
                }
            }
        }

        EntityBatchResult {
            results,
            actions: ctx.actions,
            entity_state: ctx.state,
            failure_details: None,
        }
    }
}
