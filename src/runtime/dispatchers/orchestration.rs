//! Orchestration dispatcher: folds new messages into the instance history, replays the
//! orchestration, and turns the actions it produced into history plus outgoing messages.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::fetch_result;
use crate::entities::is_entity_instance;
use crate::error::DispatchError;
use crate::history::{
    EventKind, ExecutionStartedEvent, HistoryEvent, OrchestrationInstance, OrchestrationStatus, ParentInstance,
    TaskMessage,
};
use crate::logging::DISPATCHER_TARGET;
use crate::orchestration::{
    ExecutorOptions, OrchestrationCompleteAction, OrchestratorAction, OrchestratorExecutionResult,
    TaskOrchestrationExecutor,
};
use crate::providers::{
    EntityBackendProperties, OrchestrationService, OrchestrationWorkItemCompletion, TaskOrchestrationWorkItem,
};
use crate::runtime::lock_renewal::{spawn_lock_renewal_task, stop_lock_renewal};
use crate::runtime::{
    DispatchMiddlewareContext, DispatchMiddlewarePipeline, OrchestrationHandler, OrchestrationRegistry,
    RuntimeOptions, WorkItemDispatcher, or_backend,
};
use crate::runtime_state::OrchestrationRuntimeState;

/// History and messages produced by applying one execution's actions.
#[derive(Debug, Default)]
pub struct TurnOutput {
    pub outbound_messages: Vec<TaskMessage>,
    pub orchestrator_messages: Vec<TaskMessage>,
    pub timer_messages: Vec<TaskMessage>,
    /// History of the next generation when the execution continued as new.
    pub continued_as_new: Option<OrchestrationRuntimeState>,
    pub is_completed: bool,
}

/// Appends the history events for `actions` to `runtime_state` and collects the messages to send.
pub fn apply_actions(
    runtime_state: &mut OrchestrationRuntimeState,
    actions: &[OrchestratorAction],
    now: DateTime<Utc>,
) -> TurnOutput {
    let mut out = TurnOutput::default();
    let Some(started) = runtime_state.execution_started().cloned() else {
        return out;
    };
    let instance = started.orchestration_instance.clone();

    for action in actions {
        if out.is_completed {
            warn!(
                target: DISPATCHER_TARGET,
                instance_id = %instance.instance_id,
                action = action.kind_name(),
                "ignoring action produced after completion"
            );
            continue;
        }
        match action {
            OrchestratorAction::ScheduleTask { id, name, version, input } => {
                let event = HistoryEvent::new(
                    *id,
                    now,
                    EventKind::TaskScheduled {
                        name: name.clone(),
                        version: version.clone(),
                        input: input.clone(),
                    },
                );
                runtime_state.add_event(event.clone());
                out.outbound_messages.push(TaskMessage::new(event, instance.clone()));
            }
            OrchestratorAction::CreateTimer { id, fire_at } => {
                runtime_state.add_event(HistoryEvent::new(*id, now, EventKind::TimerCreated { fire_at: *fire_at }));
                out.timer_messages.push(TaskMessage::new(
                    HistoryEvent::unsequenced(
                        now,
                        EventKind::TimerFired {
                            timer_id: *id,
                            fire_at: *fire_at,
                        },
                    ),
                    instance.clone(),
                ));
            }
            OrchestratorAction::CreateSubOrchestration {
                id,
                name,
                version,
                instance_id,
                input,
            } => {
                runtime_state.add_event(HistoryEvent::new(
                    *id,
                    now,
                    EventKind::SubOrchestrationInstanceCreated {
                        name: name.clone(),
                        version: version.clone(),
                        instance_id: instance_id.clone(),
                        input: input.clone(),
                    },
                ));
                let child = OrchestrationInstance::new_execution(instance_id.clone());
                let child_started = ExecutionStartedEvent {
                    name: name.clone(),
                    version: version.clone(),
                    input: input.clone(),
                    orchestration_instance: child.clone(),
                    parent_instance: Some(ParentInstance {
                        name: started.name.clone(),
                        version: started.version.clone(),
                        orchestration_instance: instance.clone(),
                        task_scheduled_id: *id,
                    }),
                    tags: BTreeMap::new(),
                };
                out.orchestrator_messages.push(TaskMessage::new(
                    HistoryEvent::unsequenced(now, EventKind::ExecutionStarted(child_started)),
                    child,
                ));
            }
            OrchestratorAction::SendEvent {
                id,
                instance: target,
                event_name,
                event_data,
            } => {
                runtime_state.add_event(HistoryEvent::new(
                    *id,
                    now,
                    EventKind::EventSent {
                        instance_id: target.instance_id.clone(),
                        name: event_name.clone(),
                        input: event_data.clone(),
                    },
                ));
                out.orchestrator_messages.push(TaskMessage::new(
                    HistoryEvent::event_raised(now, event_name.clone(), event_data.clone()),
                    target.clone(),
                ));
            }
            OrchestratorAction::OrchestrationComplete(complete) => {
                out.is_completed = true;
                apply_completion(runtime_state, &started, complete, now, &mut out);
            }
        }
    }
    out
}

fn apply_completion(
    runtime_state: &mut OrchestrationRuntimeState,
    started: &ExecutionStartedEvent,
    complete: &OrchestrationCompleteAction,
    now: DateTime<Utc>,
    out: &mut TurnOutput,
) {
    let instance = &started.orchestration_instance;
    let recorded_result = match complete.status {
        OrchestrationStatus::Failed => complete.details.clone().or_else(|| complete.result.clone()),
        _ => complete.result.clone(),
    };
    runtime_state.add_event(HistoryEvent::new(
        complete.id,
        now,
        EventKind::ExecutionCompleted {
            status: complete.status,
            result: recorded_result,
            failure_details: complete.failure_details.clone(),
        },
    ));
    info!(
        target: DISPATCHER_TARGET,
        instance_id = %instance.instance_id,
        execution_id = %instance.execution_id,
        status = %complete.status,
        "orchestration execution completed"
    );

    if complete.status == OrchestrationStatus::ContinuedAsNew {
        let mut next = OrchestrationRuntimeState::default();
        next.add_event(HistoryEvent::orchestrator_started(now));
        next.add_event(HistoryEvent::unsequenced(
            now,
            EventKind::ExecutionStarted(ExecutionStartedEvent {
                name: started.name.clone(),
                version: complete.new_version.clone().unwrap_or_else(|| started.version.clone()),
                input: complete.result.clone(),
                orchestration_instance: OrchestrationInstance::new_execution(instance.instance_id.clone()),
                parent_instance: started.parent_instance.clone(),
                tags: started.tags.clone(),
            }),
        ));
        for event in &complete.carryover_events {
            next.add_event(event.clone());
        }
        out.continued_as_new = Some(next);
        return;
    }

    let Some(parent) = &started.parent_instance else {
        return;
    };
    if is_entity_instance(&parent.orchestration_instance.instance_id) {
        return;
    }
    let kind = match complete.status {
        OrchestrationStatus::Completed => EventKind::SubOrchestrationInstanceCompleted {
            task_scheduled_id: parent.task_scheduled_id,
            result: complete.result.clone(),
        },
        _ => EventKind::SubOrchestrationInstanceFailed {
            task_scheduled_id: parent.task_scheduled_id,
            reason: complete.result.clone(),
            details: complete.details.clone(),
            failure_details: complete.failure_details.clone(),
        },
    };
    out.orchestrator_messages.push(TaskMessage::new(
        HistoryEvent::unsequenced(now, kind),
        parent.orchestration_instance.clone(),
    ));
}

/// Adds the messages that apply to the current execution, preceded by `OrchestratorStarted`.
/// Returns how many were accepted.
fn reconcile_messages(runtime_state: &mut OrchestrationRuntimeState, messages: &[TaskMessage], now: DateTime<Utc>) -> usize {
    let mut accepted = 0;
    for message in messages {
        let event = &message.event;
        let keep = match &event.kind {
            EventKind::ExecutionStarted(_) => {
                if runtime_state.execution_started().is_none() {
                    true
                } else if runtime_state.is_running() {
                    warn!(
                        target: DISPATCHER_TARGET,
                        instance_id = %message.orchestration_instance.instance_id,
                        "dropping duplicate ExecutionStarted for a running instance"
                    );
                    false
                } else {
                    *runtime_state = OrchestrationRuntimeState::default();
                    accepted = 0;
                    true
                }
            }
            _ => match runtime_state.orchestration_instance() {
                None => {
                    warn!(
                        target: DISPATCHER_TARGET,
                        instance_id = %message.orchestration_instance.instance_id,
                        event = event.kind.type_name(),
                        "dropping message for an instance that was never started"
                    );
                    false
                }
                Some(current)
                    if !message.orchestration_instance.execution_id.is_empty()
                        && message.orchestration_instance.execution_id != current.execution_id =>
                {
                    debug!(
                        target: DISPATCHER_TARGET,
                        instance_id = %current.instance_id,
                        execution_id = %message.orchestration_instance.execution_id,
                        event = event.kind.type_name(),
                        "dropping message for a previous execution"
                    );
                    false
                }
                Some(_) if !runtime_state.is_running() => {
                    warn!(
                        target: DISPATCHER_TARGET,
                        instance_id = %message.orchestration_instance.instance_id,
                        event = event.kind.type_name(),
                        "dropping message for a completed instance"
                    );
                    false
                }
                Some(_) => true,
            },
        };
        if keep {
            if accepted == 0 {
                runtime_state.add_event(HistoryEvent::orchestrator_started(now));
            }
            runtime_state.add_event(event.clone());
            accepted += 1;
        }
    }
    accepted
}

pub struct TaskOrchestrationDispatcher {
    dispatcher: WorkItemDispatcher<TaskOrchestrationWorkItem>,
}

#[derive(Clone)]
struct OrchestrationWorker {
    service: Arc<dyn OrchestrationService>,
    orchestrations: OrchestrationRegistry,
    pipeline: DispatchMiddlewarePipeline,
    executor_options: ExecutorOptions,
}

impl TaskOrchestrationDispatcher {
    pub fn new(
        service: Arc<dyn OrchestrationService>,
        orchestrations: OrchestrationRegistry,
        pipeline: DispatchMiddlewarePipeline,
        options: &RuntimeOptions,
        entity_properties: EntityBackendProperties,
    ) -> Self {
        let worker = OrchestrationWorker {
            service: service.clone(),
            orchestrations,
            pipeline,
            executor_options: ExecutorOptions {
                error_propagation_mode: options.error_propagation_mode,
                entity_properties,
            },
        };

        let fetch_service = service.clone();
        let abort_service = service.clone();
        let release_service = service.clone();
        let fetch_delay_service = service.clone();
        let process_delay_service = service.clone();
        let dispatcher = WorkItemDispatcher::builder(
            "TaskOrchestrationDispatcher",
            |item: &TaskOrchestrationWorkItem| item.instance_id.clone(),
            move |timeout, cancel: CancellationToken| {
                let service = fetch_service.clone();
                async move {
                    fetch_result(service.lock_next_task_orchestration_work_item(timeout, &cancel).await, &cancel)
                }
            },
            move |item: TaskOrchestrationWorkItem| {
                let worker = worker.clone();
                async move { worker.process(item).await }
            },
        )
        .abort_work_item(move |item: TaskOrchestrationWorkItem| {
            let service = abort_service.clone();
            async move { service.abandon_task_orchestration_work_item(&item).await.map_err(DispatchError::from) }
        })
        .safe_release_work_item(move |item: TaskOrchestrationWorkItem| {
            let service = release_service.clone();
            async move { service.release_task_orchestration_work_item(&item).await.map_err(DispatchError::from) }
        })
        .fetch_exception_delay(move |e| fetch_delay_service.delay_in_seconds_after_on_fetch_exception(e))
        .process_exception_delay(move |e| process_delay_service.delay_in_seconds_after_on_process_exception(e))
        .dispatcher_count(or_backend(
            options.orchestration_dispatcher_count,
            service.task_orchestration_dispatcher_count(),
        ))
        .max_concurrent_work_items(or_backend(
            options.max_concurrent_orchestrations,
            service.max_concurrent_task_orchestration_work_items(),
        ))
        .receive_timeout(options.receive_timeout)
        .build();

        Self { dispatcher }
    }

    pub fn start(&self) {
        self.dispatcher.start();
    }

    pub async fn stop(&self, forced: bool) {
        self.dispatcher.stop(forced).await;
    }

    pub fn dispatcher(&self) -> &WorkItemDispatcher<TaskOrchestrationWorkItem> {
        &self.dispatcher
    }
}

impl OrchestrationWorker {
    async fn process(&self, item: TaskOrchestrationWorkItem) -> Result<(), DispatchError> {
        let renewal_cancel = CancellationToken::new();
        let renewal = item.locked_until.map(|locked_until| {
            let service = self.service.clone();
            let locked_item = item.clone();
            spawn_lock_renewal_task(
                item.instance_id.clone(),
                locked_until,
                move || {
                    let service = service.clone();
                    let locked_item = locked_item.clone();
                    async move { service.renew_task_orchestration_work_item_lock(&locked_item).await }
                },
                renewal_cancel.clone(),
            )
        });

        let completion = self.run_turn(&item).await;
        stop_lock_renewal(&item.instance_id, renewal, &renewal_cancel).await;

        self.service.complete_task_orchestration_work_item(&item, completion?).await?;
        Ok(())
    }

    async fn run_turn(&self, item: &TaskOrchestrationWorkItem) -> Result<OrchestrationWorkItemCompletion, DispatchError> {
        let now = Utc::now();
        let mut runtime_state = item.orchestration_runtime_state.clone();
        let accepted = reconcile_messages(&mut runtime_state, &item.new_messages, now);
        if accepted == 0 {
            debug!(
                target: DISPATCHER_TARGET,
                instance_id = %item.instance_id,
                dropped = item.new_messages.len(),
                "no applicable messages, consuming work item"
            );
            return Ok(OrchestrationWorkItemCompletion {
                runtime_state: item.orchestration_runtime_state.clone(),
                ..Default::default()
            });
        }

        let mut completion = OrchestrationWorkItemCompletion::default();
        loop {
            let (name, version) = match runtime_state.execution_started() {
                Some(started) => (started.name.clone(), started.version.clone()),
                None => {
                    return Err(DispatchError::InvalidWorkItem(format!(
                        "instance {} has no ExecutionStarted event",
                        item.instance_id
                    )));
                }
            };
            let handler = self
                .orchestrations
                .get(&name, &version)
                .ok_or_else(|| DispatchError::TypeMissing(format!("orchestration {name} version '{version}'")))?;

            let result = self.execute(&runtime_state, handler).await?;
            let turn = apply_actions(&mut runtime_state, &result.actions, now);
            completion.outbound_messages.extend(turn.outbound_messages);
            completion.orchestrator_messages.extend(turn.orchestrator_messages);
            completion.timer_messages.extend(turn.timer_messages);
            completion.custom_status = result.custom_status;

            match turn.continued_as_new {
                Some(next) => {
                    // timers of the finished generation can no longer fire into it
                    completion.timer_messages.clear();
                    completion.continued_as_new_message = next
                        .new_events()
                        .iter()
                        .find(|e| matches!(e.kind, EventKind::ExecutionStarted(_)))
                        .zip(next.orchestration_instance())
                        .map(|(event, instance)| TaskMessage::new(event.clone(), instance.clone()));
                    runtime_state = next;
                }
                None => {
                    runtime_state.add_event(HistoryEvent::unsequenced(now, EventKind::OrchestratorCompleted));
                    break;
                }
            }
        }

        completion.runtime_state = runtime_state;
        Ok(completion)
    }

    async fn execute(
        &self,
        runtime_state: &OrchestrationRuntimeState,
        handler: Arc<dyn OrchestrationHandler>,
    ) -> Result<OrchestratorExecutionResult, DispatchError> {
        let mut ctx = DispatchMiddlewareContext::new();
        ctx.set_property(runtime_state.clone());

        let options = self.executor_options.clone();
        let mut ctx = self
            .pipeline
            .run(ctx, move |mut ctx| {
                let handler = handler.clone();
                let options = options.clone();
                async move {
                    if ctx.has_property::<OrchestratorExecutionResult>() {
                        return Ok(ctx);
                    }
                    let runtime_state = ctx
                        .take_property::<OrchestrationRuntimeState>()
                        .ok_or_else(|| DispatchError::InvalidWorkItem("missing runtime state".to_string()))?;
                    let mut executor = TaskOrchestrationExecutor::new(runtime_state, handler, options);
                    let result = executor.execute()?;
                    ctx.set_property(result);
                    Ok::<_, DispatchError>(ctx)
                }
            })
            .await?;

        ctx.take_property::<OrchestratorExecutionResult>()
            .ok_or_else(|| DispatchError::InvalidWorkItem("orchestration execution produced no result".to_string()))
    }
}
