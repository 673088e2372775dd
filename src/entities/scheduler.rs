//! Per-batch entity scheduling.
//!
//! An entity execution is one batch. The scheduler rebuilds [`SchedulerState`] from the input of
//! the current execution, folds the new `EventRaised` messages into it, picks the work to run
//! now, and after the batch ran turns its outcome into outgoing messages plus the history of the
//! next execution (entities continue as new after every batch).

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::collections::VecDeque;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::entities::{
    CONTINUE_EVENT_NAME, EntityBatchRequest, EntityBatchResult, EntityId, EntityMessage, EntityMessageEvent,
    EntityStatus, OperationAction, OperationResult, ReleaseMessage, RequestMessage, ResponseMessage, SchedulerState,
    Work, is_release_event, is_request_event, request_event_name, response_event_name,
};
use crate::error::{EntitySchedulerError, FailureDetails};
use crate::history::{
    EventKind, ExecutionStartedEvent, HistoryEvent, OrchestrationInstance, ParentInstance, TaskMessage,
    UNSEQUENCED_EVENT_ID,
};
use crate::logging::ENTITIES_TARGET;
use crate::providers::EntityBackendProperties;
use crate::runtime_state::OrchestrationRuntimeState;

/// Requests due within this margin are treated as due now.
const SCHEDULED_DELIVERY_TOLERANCE_MS: i64 = 100;

/// Outcome of one batch, ready to hand to the backend.
#[derive(Debug, Clone, Default)]
pub struct EntityBatchOutcome {
    pub runtime_state: OrchestrationRuntimeState,
    pub orchestrator_messages: Vec<TaskMessage>,
    pub custom_status: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EntityScheduler {
    properties: EntityBackendProperties,
}

impl EntityScheduler {
    pub fn new(properties: EntityBackendProperties) -> Self {
        Self { properties }
    }

    pub fn properties(&self) -> &EntityBackendProperties {
        &self.properties
    }

    /// Rebuilds the scheduler state and selects the work for this batch.
    pub fn determine_work(
        &self,
        runtime_state: &OrchestrationRuntimeState,
        now: DateTime<Utc>,
    ) -> Result<(SchedulerState, Work), EntitySchedulerError> {
        let mut state = match runtime_state.input() {
            Some(serialized) => serde_json::from_str::<SchedulerState>(serialized).map_err(|e| {
                EntitySchedulerError::new(
                    "Failed to deserialize entity scheduler state - may be corrupted or wrong version.",
                    e,
                )
            })?,
            None => SchedulerState::default(),
        };
        let mut work = Work::default();
        let mut lock_holder_messages: VecDeque<RequestMessage> = VecDeque::new();
        let window = self.properties.entity_message_reorder_window;
        let tolerance = chrono::Duration::milliseconds(SCHEDULED_DELIVERY_TOLERANCE_MS);

        for event in runtime_state.events() {
            let EventKind::EventRaised { name, input } = &event.kind else {
                continue;
            };

            if is_request_event(name) {
                let request: RequestMessage = serde_json::from_str(input.as_deref().unwrap_or_default())
                    .map_err(|e| {
                        EntitySchedulerError::new(
                            "Failed to deserialize incoming request message - may be corrupted or wrong version.",
                            e,
                        )
                    })?;

                let delivered = match request.scheduled_time {
                    Some(due) if due - now > tolerance => {
                        work.add_message_to_be_rescheduled(request);
                        continue;
                    }
                    // scheduled messages carry no ordering guarantee
                    Some(_) => vec![request],
                    None => state.message_sorter.receive_in_order(request, window, now),
                };

                for message in delivered {
                    let from_holder = state.locked_by.is_some() && state.locked_by == message.parent_instance_id;
                    if from_holder {
                        lock_holder_messages.push_back(message);
                    } else {
                        state.enqueue(message);
                    }
                }
            } else if is_release_event(name) {
                let release: ReleaseMessage = serde_json::from_str(input.as_deref().unwrap_or_default())
                    .map_err(|e| {
                        EntitySchedulerError::new(
                            "Failed to deserialize lock release message - may be corrupted or wrong version.",
                            e,
                        )
                    })?;
                if state.locked_by.as_deref() == Some(release.parent_instance_id.as_str()) {
                    debug!(target: ENTITIES_TARGET, holder = %release.parent_instance_id, "entity lock released");
                    state.locked_by = None;
                }
            } else {
                // self-continue
                state.suspended = false;
            }
        }

        state.put_back(lock_holder_messages);

        if !state.suspended {
            let max_batch = self.properties.max_entity_operation_batch_size;
            while state.may_dequeue() {
                if state.peek().is_some_and(RequestMessage::is_lock_request) {
                    if let Some(lock) = state.dequeue() {
                        work.add_lock_request(lock);
                    }
                    break;
                }
                if max_batch.is_some_and(|max| work.operation_count() >= max) {
                    work.to_be_continued(&mut state);
                    break;
                }
                if let Some(request) = state.dequeue() {
                    work.add_operation(request);
                }
            }
        }

        Ok((state, work))
    }

    pub fn batch_request(&self, instance_id: &str, state: &SchedulerState, work: &Work) -> EntityBatchRequest {
        EntityBatchRequest {
            instance_id: instance_id.to_string(),
            entity_state: state.entity_state.clone(),
            operations: work.operation_requests(),
        }
    }

    /// Applies a batch result and returns the messages it produced.
    ///
    /// Operations without a result are put back at the front of the queue and a self-continue
    /// is scheduled, unless the batch reported a failure, in which case they fail with it.
    pub fn apply_batch_result(
        &self,
        entity: &EntityId,
        state: &mut SchedulerState,
        work: &mut Work,
        mut result: EntityBatchResult,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskMessage>, EntitySchedulerError> {
        let instance_id = entity.instance_id();
        let mut events: Vec<EntityMessageEvent> = Vec::new();

        if result.results.len() < work.operation_count() {
            match &result.failure_details {
                Some(details) => {
                    warn!(
                        target: ENTITIES_TARGET,
                        instance_id = %instance_id,
                        error = %details,
                        "entity batch failed"
                    );
                    while result.results.len() < work.operation_count() {
                        result.results.push(OperationResult::failure(details.clone()));
                    }
                }
                None => {
                    debug!(
                        target: ENTITIES_TARGET,
                        instance_id = %instance_id,
                        completed = result.results.len(),
                        requested = work.operation_count(),
                        "partial entity batch, requeueing the rest"
                    );
                    let deferred = work.remove_deferred_work(result.results.len());
                    state.put_back(deferred);
                    work.to_be_continued(state);
                }
            }
        }

        state.entity_state = result.entity_state;

        for (request, outcome) in work.operations().iter().zip(result.results) {
            if request.is_signal {
                continue;
            }
            if let Some(event) = response_event(request, outcome) {
                events.push(event);
            }
        }

        let mut orchestration_starts = Vec::new();
        for action in result.actions {
            match action {
                OperationAction::SendSignal {
                    instance_id: target,
                    name,
                    input,
                    scheduled_time,
                } => events.push(self.signal_event(&instance_id, state, target, name, input, scheduled_time, now)),
                OperationAction::StartNewOrchestration {
                    name,
                    version,
                    instance_id: orchestration_id,
                    input,
                } => orchestration_starts.push(TaskMessage::new(
                    HistoryEvent::unsequenced(
                        now,
                        EventKind::ExecutionStarted(ExecutionStartedEvent {
                            name,
                            version,
                            input,
                            orchestration_instance: OrchestrationInstance::new_execution(orchestration_id.clone()),
                            parent_instance: Some(ParentInstance {
                                name: entity.name().to_string(),
                                version: String::new(),
                                orchestration_instance: OrchestrationInstance::new(instance_id.clone(), ""),
                                task_scheduled_id: UNSEQUENCED_EVENT_ID,
                            }),
                            tags: BTreeMap::new(),
                        }),
                    ),
                    OrchestrationInstance::new_execution(orchestration_id),
                )),
            }
        }

        if let Some(lock_request) = work.take_lock_request() {
            events.push(process_lock_request(state, lock_request));
        }

        for early in work.to_be_rescheduled() {
            let due = early.scheduled_time.unwrap_or(now);
            events.push(EntityMessageEvent {
                event_name: request_event_name(Some(self.properties.capped_delivery_time(now, due))),
                message: EntityMessage::Request(early.clone()),
                target: OrchestrationInstance::new(instance_id.clone(), ""),
            });
        }

        if work.suspend_and_continue() {
            events.push(EntityMessageEvent {
                event_name: CONTINUE_EVENT_NAME.to_string(),
                message: EntityMessage::Continue,
                target: OrchestrationInstance::new(instance_id.clone(), ""),
            });
        }

        let mut messages = Vec::with_capacity(events.len() + orchestration_starts.len());
        for event in events {
            messages.push(
                event
                    .into_task_message(now)
                    .map_err(|e| EntitySchedulerError::new("Failed to serialize outgoing entity message.", e))?,
            );
        }
        messages.extend(orchestration_starts);
        Ok(messages)
    }

    /// History of the next execution, or an empty state when the entity can be deleted.
    pub fn next_generation(
        &self,
        entity: &EntityId,
        state: &SchedulerState,
        now: DateTime<Utc>,
    ) -> Result<EntityBatchOutcome, EntitySchedulerError> {
        let status = EntityStatus {
            entity_exists: state.entity_exists(),
            backlog_queue_size: state.queue.len(),
            locked_by: state.locked_by.clone(),
        };
        let custom_status = serde_json::to_string(&status)
            .map_err(|e| EntitySchedulerError::new("Failed to serialize entity status.", e))?;

        if self.properties.supports_implicit_entity_deletion && state.is_empty() && !state.suspended {
            debug!(target: ENTITIES_TARGET, instance_id = %entity, "entity is empty, deleting");
            return Ok(EntityBatchOutcome {
                runtime_state: OrchestrationRuntimeState::default(),
                orchestrator_messages: Vec::new(),
                custom_status: None,
            });
        }

        let serialized = serde_json::to_string(state)
            .map_err(|e| EntitySchedulerError::new("Failed to serialize entity scheduler state.", e))?;
        let mut runtime_state = OrchestrationRuntimeState::default();
        runtime_state.add_event(HistoryEvent::orchestrator_started(now));
        runtime_state.add_event(HistoryEvent::unsequenced(
            now,
            EventKind::ExecutionStarted(ExecutionStartedEvent {
                name: entity.name().to_string(),
                version: String::new(),
                input: Some(serialized),
                orchestration_instance: OrchestrationInstance::new_execution(entity.instance_id()),
                parent_instance: None,
                tags: BTreeMap::new(),
            }),
        ));
        runtime_state.add_event(HistoryEvent::unsequenced(now, EventKind::OrchestratorCompleted));

        Ok(EntityBatchOutcome {
            runtime_state,
            orchestrator_messages: Vec::new(),
            custom_status: Some(custom_status),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn signal_event(
        &self,
        sender: &str,
        state: &mut SchedulerState,
        target: String,
        operation: String,
        input: Option<String>,
        scheduled_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> EntityMessageEvent {
        let mut request = RequestMessage::operation(Uuid::new_v4(), operation, true, input);
        request.parent_instance_id = Some(sender.to_string());
        request.scheduled_time = scheduled_time;

        let event_name = match scheduled_time {
            Some(due) => request_event_name(Some(self.properties.capped_delivery_time(now, due))),
            None => {
                state.message_sorter.label_outgoing_message(
                    &mut request,
                    &target,
                    now,
                    self.properties.entity_message_reorder_window,
                );
                request_event_name(None)
            }
        };
        EntityMessageEvent {
            event_name,
            message: EntityMessage::Request(request),
            target: OrchestrationInstance::new(target, ""),
        }
    }
}

fn response_event(request: &RequestMessage, outcome: OperationResult) -> Option<EntityMessageEvent> {
    let parent = request.parent_instance_id.clone()?;
    Some(EntityMessageEvent {
        event_name: response_event_name(&request.id),
        message: EntityMessage::Response(ResponseMessage {
            result: outcome.result,
            error_message: outcome.error_message,
            failure_details: outcome.failure_details,
        }),
        target: OrchestrationInstance::new(parent, request.parent_execution_id.clone().unwrap_or_default()),
    })
}

/// Locks this entity for the requester, then forwards the request along the lock set or, at
/// the end of the chain, acknowledges the acquisition to the requester.
fn process_lock_request(state: &mut SchedulerState, mut request: RequestMessage) -> EntityMessageEvent {
    let parent = request.parent_instance_id.clone().unwrap_or_default();
    let parent_execution = request.parent_execution_id.clone().unwrap_or_default();
    debug!(target: ENTITIES_TARGET, holder = %parent, position = request.position, "entity locked");
    state.locked_by = Some(parent.clone());

    request.position += 1;
    let next = request
        .lock_set
        .as_ref()
        .and_then(|set| set.get(request.position))
        .map(EntityId::instance_id);

    match next {
        Some(next) => EntityMessageEvent {
            event_name: request_event_name(None),
            message: EntityMessage::Request(request),
            target: OrchestrationInstance::new(next, ""),
        },
        None => EntityMessageEvent {
            event_name: response_event_name(&request.id),
            message: EntityMessage::Response(ResponseMessage::lock_acquired()),
            target: OrchestrationInstance::new(parent, parent_execution),
        },
    }
}

/// Failure result used when no entity is registered for an entity name.
pub fn entity_type_not_found(entity: &EntityId) -> FailureDetails {
    FailureDetails::non_retriable(
        "EntityTypeNotFound",
        format!("No entity named '{}' is registered on this worker.", entity.name()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn scheduler(max_batch: Option<usize>) -> EntityScheduler {
        EntityScheduler::new(EntityBackendProperties {
            max_entity_operation_batch_size: max_batch,
            entity_message_reorder_window: Duration::ZERO,
            ..Default::default()
        })
    }

    fn raised(name: &str, payload: String) -> HistoryEvent {
        HistoryEvent::event_raised(Utc::now(), name, Some(payload))
    }

    fn call(op: &str, parent: &str) -> RequestMessage {
        let mut m = RequestMessage::operation(Uuid::new_v4(), op, false, None);
        m.parent_instance_id = Some(parent.to_string());
        m.parent_execution_id = Some("exec".to_string());
        m
    }

    fn state_with(events: Vec<HistoryEvent>) -> OrchestrationRuntimeState {
        let mut s = OrchestrationRuntimeState::default();
        for e in events {
            s.add_event(e);
        }
        s
    }

    #[test]
    fn batch_size_limit_schedules_continue() {
        let events = (0..5)
            .map(|i| raised("op", call(&format!("op{i}"), "o").to_json().unwrap()))
            .collect();
        let (state, work) = scheduler(Some(3)).determine_work(&state_with(events), Utc::now()).unwrap();
        assert_eq!(work.operation_count(), 3);
        assert!(work.suspend_and_continue());
        assert!(state.suspended);
        assert_eq!(state.queue.len(), 2);
    }

    #[test]
    fn suspended_state_does_no_work_until_continue() {
        let suspended = SchedulerState {
            suspended: true,
            queue: VecDeque::from(vec![call("a", "o")]),
            ..Default::default()
        };
        let started = HistoryEvent::unsequenced(
            Utc::now(),
            EventKind::ExecutionStarted(ExecutionStartedEvent {
                name: "counter".to_string(),
                version: String::new(),
                input: Some(serde_json::to_string(&suspended).unwrap()),
                orchestration_instance: OrchestrationInstance::new("@counter@1", "e"),
                parent_instance: None,
                tags: BTreeMap::new(),
            }),
        );
        let (_, work) = scheduler(None)
            .determine_work(&state_with(vec![started.clone()]), Utc::now())
            .unwrap();
        assert_eq!(work.operation_count(), 0);

        let cont = HistoryEvent::event_raised(Utc::now(), CONTINUE_EVENT_NAME, None);
        let (state, work) = scheduler(None)
            .determine_work(&state_with(vec![started, cont]), Utc::now())
            .unwrap();
        assert!(!state.suspended);
        assert_eq!(work.operation_count(), 1);
    }

    #[test]
    fn corrupt_state_is_an_error() {
        let started = HistoryEvent::unsequenced(
            Utc::now(),
            EventKind::ExecutionStarted(ExecutionStartedEvent {
                name: "counter".to_string(),
                version: String::new(),
                input: Some("{not json".to_string()),
                orchestration_instance: OrchestrationInstance::new("@counter@1", "e"),
                parent_instance: None,
                tags: BTreeMap::new(),
            }),
        );
        let err = scheduler(None)
            .determine_work(&state_with(vec![started]), Utc::now())
            .unwrap_err();
        assert!(err.message.contains("may be corrupted or wrong version"));

        let bad_request = raised("op", "[]".to_string());
        assert!(scheduler(None)
            .determine_work(&state_with(vec![bad_request]), Utc::now())
            .is_err());
    }

    #[test]
    fn lock_holder_messages_jump_the_queue() {
        let locked = SchedulerState {
            locked_by: Some("holder".to_string()),
            queue: VecDeque::from(vec![call("other-op", "other")]),
            ..Default::default()
        };
        let started = HistoryEvent::unsequenced(
            Utc::now(),
            EventKind::ExecutionStarted(ExecutionStartedEvent {
                name: "counter".to_string(),
                version: String::new(),
                input: Some(serde_json::to_string(&locked).unwrap()),
                orchestration_instance: OrchestrationInstance::new("@counter@1", "e"),
                parent_instance: None,
                tags: BTreeMap::new(),
            }),
        );
        let events = vec![started, raised("op", call("holder-op", "holder").to_json().unwrap())];
        let (state, work) = scheduler(None).determine_work(&state_with(events), Utc::now()).unwrap();
        assert_eq!(work.operation_count(), 1);
        assert_eq!(work.operations()[0].operation.as_deref(), Some("holder-op"));
        assert_eq!(state.queue.len(), 1);
    }

    #[test]
    fn batch_failure_fails_every_unfinished_call() {
        let entity = EntityId::new("missing", "1");
        let events = vec![
            raised("op", call("a", "o").to_json().unwrap()),
            raised("op", call("b", "o").to_json().unwrap()),
        ];
        let s = scheduler(None);
        let (mut state, mut work) = s.determine_work(&state_with(events), Utc::now()).unwrap();
        let result = EntityBatchResult {
            failure_details: Some(entity_type_not_found(&entity)),
            ..Default::default()
        };
        let messages = s
            .apply_batch_result(&entity, &mut state, &mut work, result, Utc::now())
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert!(!work.suspend_and_continue());
        for m in messages {
            let EventKind::EventRaised { input, .. } = m.event.kind else {
                panic!("expected event");
            };
            let response: ResponseMessage = serde_json::from_str(&input.unwrap()).unwrap();
            assert!(response.is_error_result());
        }
    }

    #[test]
    fn implicit_deletion_drops_empty_entities() {
        let entity = EntityId::new("counter", "1");
        let s = EntityScheduler::new(EntityBackendProperties {
            supports_implicit_entity_deletion: true,
            ..Default::default()
        });
        let outcome = s.next_generation(&entity, &SchedulerState::default(), Utc::now()).unwrap();
        assert!(outcome.runtime_state.events().next().is_none());

        let kept = SchedulerState {
            entity_state: Some("1".to_string()),
            ..Default::default()
        };
        let outcome = s.next_generation(&entity, &kept, Utc::now()).unwrap();
        assert_eq!(outcome.runtime_state.input(), Some(serde_json::to_string(&kept).unwrap().as_str()));
        let status: EntityStatus = serde_json::from_str(outcome.custom_status.as_deref().unwrap()).unwrap();
        assert!(status.entity_exists);
    }
}
