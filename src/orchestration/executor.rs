//! Replay driver for one orchestration execution.
//!
//! Past events are fed with `is_replaying` set, new events without it. After each event the
//! orchestration future is polled once with a no-op waker; it runs until every branch is
//! parked on an unresolved awaitable. Scheduled-action events are reconciled against the
//! actions the code produced under the same sequence id, and any disagreement faults the
//! execution.

use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, warn};

use crate::entities::response_event_name;
use crate::error::{ExecutionAborted, ExecutionFault, FailureDetails, OrchestrationError, TaskError};
use crate::history::{EventKind, HistoryEvent, OrchestrationInstance, OrchestrationStatus};
use crate::logging::REPLAY_TARGET;
use crate::orchestration::actions::{OrchestrationCompleteAction, OrchestratorAction};
use crate::orchestration::context::{Completion, OpenTaskInfo, OpenTaskKind, OrchestrationContext};
use crate::orchestration::{ErrorPropagationMode, ExecutorOptions};
use crate::runtime::OrchestrationHandler;
use crate::runtime_state::OrchestrationRuntimeState;

type Program = BoxFuture<'static, Result<Option<String>, OrchestrationError>>;

/// Actions produced by one execution pass, in sequence-id order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrchestratorExecutionResult {
    pub actions: Vec<OrchestratorAction>,
    pub custom_status: Option<String>,
}

pub struct TaskOrchestrationExecutor {
    runtime_state: OrchestrationRuntimeState,
    handler: Arc<dyn OrchestrationHandler>,
    options: ExecutorOptions,
    context: OrchestrationContext,
    program: Option<Program>,
    outcome: Option<Result<Option<String>, OrchestrationError>>,
    fault: Option<ExecutionFault>,
    aborted: Option<ExecutionAborted>,
    is_suspended: bool,
    suspended_events: VecDeque<HistoryEvent>,
    completion_emitted: bool,
}

impl TaskOrchestrationExecutor {
    pub fn new(
        runtime_state: OrchestrationRuntimeState,
        handler: Arc<dyn OrchestrationHandler>,
        options: ExecutorOptions,
    ) -> Self {
        let instance = runtime_state
            .orchestration_instance()
            .cloned()
            .unwrap_or_else(|| OrchestrationInstance::new(String::new(), String::new()));
        let context = OrchestrationContext::new(instance, options.entity_properties.clone());
        Self {
            runtime_state,
            handler,
            options,
            context,
            program: None,
            outcome: None,
            fault: None,
            aborted: None,
            is_suspended: false,
            suspended_events: VecDeque::new(),
            completion_emitted: false,
        }
    }

    pub fn context(&self) -> &OrchestrationContext {
        &self.context
    }

    /// Awaitables still waiting for a completion event, by sequence id.
    pub fn open_tasks(&self) -> Vec<(i32, OpenTaskInfo)> {
        let mut open: Vec<(i32, OpenTaskInfo)> = self
            .context
            .state()
            .open_tasks
            .iter()
            .map(|(id, info)| (*id, info.clone()))
            .collect();
        open.sort_by_key(|(id, _)| *id);
        open
    }

    /// True once a terminal action has been produced.
    pub fn is_completed(&self) -> bool {
        self.completion_emitted
    }

    /// Replays the past events and processes the new ones.
    pub fn execute(&mut self) -> Result<OrchestratorExecutionResult, ExecutionAborted> {
        let past = self.runtime_state.past_events().to_vec();
        let new = self.runtime_state.new_events().to_vec();
        self.execute_core(&past, &new)
    }

    /// Continues an in-memory execution with further events, as extended sessions do.
    /// Actions returned by earlier passes are assumed persisted and are not returned again.
    pub fn execute_new_events(&mut self, events: &[HistoryEvent]) -> Result<OrchestratorExecutionResult, ExecutionAborted> {
        self.context.state().actions.clear();
        for event in events {
            self.runtime_state.add_event(event.clone());
        }
        self.execute_core(&[], events)
    }

    fn execute_core(
        &mut self,
        past_events: &[HistoryEvent],
        new_events: &[HistoryEvent],
    ) -> Result<OrchestratorExecutionResult, ExecutionAborted> {
        self.context.state().is_replaying = true;
        for event in past_events {
            if self.halted() {
                break;
            }
            self.process_event(event);
        }

        self.context.state().is_replaying = false;
        for event in new_events {
            if self.halted() {
                break;
            }
            self.process_event(event);
        }

        self.finish()
    }

    fn halted(&self) -> bool {
        self.fault.is_some() || self.aborted.is_some()
    }

    fn process_event(&mut self, event: &HistoryEvent) {
        let bypasses_suspension = matches!(
            event.kind,
            EventKind::ExecutionResumed { .. }
                | EventKind::ExecutionTerminated { .. }
                | EventKind::OrchestratorStarted
                | EventKind::OrchestratorCompleted
        );
        if self.is_suspended && !bypasses_suspension {
            self.suspended_events.push_back(event.clone());
            return;
        }

        match &event.kind {
            EventKind::OrchestratorStarted => {
                self.context.state().current_utc = event.timestamp;
                return;
            }
            EventKind::OrchestratorCompleted | EventKind::ExecutionCompleted { .. } => return,
            EventKind::ExecutionStarted(started) => {
                {
                    let mut s = self.context.state();
                    s.set_instance(started.orchestration_instance.clone());
                    s.name = started.name.clone();
                    s.version = started.version.clone();
                    s.parent = started.parent_instance.clone();
                }
                let ctx = self.context.clone();
                let handler = self.handler.clone();
                let input = started.input.clone();
                self.program = Some(Box::pin(async move { handler.invoke(ctx, input).await }));
            }
            EventKind::ExecutionTerminated { input } => {
                self.terminate(input.clone());
                return;
            }
            EventKind::ExecutionSuspended { .. } => {
                self.is_suspended = true;
                return;
            }
            EventKind::ExecutionResumed { .. } => {
                self.is_suspended = false;
                let queued: Vec<HistoryEvent> = self.suspended_events.drain(..).collect();
                for queued_event in &queued {
                    if self.halted() {
                        break;
                    }
                    self.process_event(queued_event);
                }
                return;
            }
            EventKind::TaskScheduled { .. }
            | EventKind::TimerCreated { .. }
            | EventKind::SubOrchestrationInstanceCreated { .. }
            | EventKind::EventSent { .. } => self.match_scheduled_event(event),
            EventKind::TaskCompleted { task_scheduled_id, result } => {
                self.resolve(*task_scheduled_id, OpenTaskKind::Task, |_| Completion::Value(result.clone()))
            }
            EventKind::TaskFailed {
                task_scheduled_id,
                reason,
                details,
                failure_details,
            } => self.resolve(*task_scheduled_id, OpenTaskKind::Task, |info| {
                Completion::Failed(TaskError::TaskFailed {
                    task_scheduled_id: *task_scheduled_id,
                    name: info.name.clone(),
                    reason: reason.clone().unwrap_or_default(),
                    details: details.clone(),
                    failure_details: failure_details.clone(),
                })
            }),
            EventKind::SubOrchestrationInstanceCompleted { task_scheduled_id, result } => self.resolve(
                *task_scheduled_id,
                OpenTaskKind::SubOrchestration,
                |_| Completion::Value(result.clone()),
            ),
            EventKind::SubOrchestrationInstanceFailed {
                task_scheduled_id,
                reason,
                details,
                failure_details,
            } => self.resolve(*task_scheduled_id, OpenTaskKind::SubOrchestration, |info| {
                Completion::Failed(TaskError::SubOrchestrationFailed {
                    task_scheduled_id: *task_scheduled_id,
                    name: info.name.clone(),
                    reason: reason.clone().unwrap_or_default(),
                    details: details.clone(),
                    failure_details: failure_details.clone(),
                })
            }),
            EventKind::TimerFired { timer_id, .. } => {
                self.resolve(*timer_id, OpenTaskKind::Timer, |_| Completion::Value(None))
            }
            EventKind::EventRaised { name, input } => {
                if !self.handle_event_raised(event, name, input.clone()) {
                    return;
                }
            }
        }

        self.resume_program();
    }

    /// Returns false if the event was set aside for the next generation.
    fn handle_event_raised(&mut self, event: &HistoryEvent, name: &str, input: Option<String>) -> bool {
        let mut s = self.context.state();
        let carry_over = s
            .continue_as_new
            .as_ref()
            .is_some_and(|can| can.preserve_unprocessed_events);
        if carry_over {
            s.carryover_events.push(event.clone());
            return false;
        }
        if self.completion_emitted || self.outcome.is_some() {
            debug!(target: REPLAY_TARGET, event_name = %name, "dropping event raised after completion");
            return false;
        }

        let pending_section = s
            .entity_context
            .critical_section_id()
            .filter(|_| s.entity_context.is_lock_acquisition_pending());
        match pending_section {
            Some(section) if response_event_name(&section) == name => {
                let response = input
                    .as_deref()
                    .and_then(|payload| serde_json::from_str(payload).ok())
                    .unwrap_or_default();
                if !s.entity_context.complete_acquire(&response, section) {
                    debug!(target: REPLAY_TARGET, "ignoring lock acquisition response");
                }
            }
            _ => {
                if let Some(target) = s.pending_entity_calls.remove(name) {
                    s.entity_context.recover_lock_after_call(&target);
                }
            }
        }
        s.deliver_event(name, input);
        true
    }

    fn match_scheduled_event(&mut self, event: &HistoryEvent) {
        let id = event.event_id;
        let (event_desc, event_name) = match &event.kind {
            EventKind::TaskScheduled { name, .. } => ("an activity task", name.as_str()),
            EventKind::TimerCreated { .. } => ("a durable timer", ""),
            EventKind::SubOrchestrationInstanceCreated { name, .. } => ("a sub-orchestration", name.as_str()),
            EventKind::EventSent { name, .. } => ("an event", name.as_str()),
            _ => return,
        };

        let action = self.context.state().actions.remove(&id);
        let matched = match (&event.kind, &action) {
            (EventKind::TaskScheduled { name, .. }, Some(OrchestratorAction::ScheduleTask { name: n, .. })) => name == n,
            (EventKind::TimerCreated { .. }, Some(OrchestratorAction::CreateTimer { .. })) => true,
            (
                EventKind::SubOrchestrationInstanceCreated { name, .. },
                Some(OrchestratorAction::CreateSubOrchestration { name: n, .. }),
            ) => name == n,
            (EventKind::EventSent { name, .. }, Some(OrchestratorAction::SendEvent { event_name: n, .. })) => name == n,
            _ => false,
        };
        if matched {
            return;
        }

        let message = match action {
            None => format!(
                "A previous execution of this orchestration scheduled {event_desc} with sequence ID {id} and name \
                 '{event_name}', but the current replay execution hasn't (yet?) scheduled this task. Was a change \
                 made to the orchestrator code after this instance had already started running?"
            ),
            Some(other) => format!(
                "A previous execution of this orchestration scheduled {event_desc} with sequence ID {id} and name \
                 '{event_name}', but the current replay execution instead produced a {} action with this sequence \
                 ID. Was a change made to the orchestrator code after this instance had already started running?",
                other.kind_name()
            ),
        };
        self.set_fault(ExecutionFault::NonDeterminism(message));
    }

    fn resolve(&mut self, id: i32, expected: OpenTaskKind, completion: impl FnOnce(&OpenTaskInfo) -> Completion) {
        let mut s = self.context.state();
        let Some(info) = s.open_tasks.remove(&id) else {
            debug!(target: REPLAY_TARGET, sequence_id = id, "ignoring completion with no open task");
            return;
        };
        if info.kind != expected {
            drop(s);
            self.set_fault(ExecutionFault::NonDeterminism(format!(
                "A completion event of type {expected:?} was received for sequence ID {id}, but the orchestration \
                 scheduled a {:?} with this ID.",
                info.kind
            )));
            return;
        }
        let value = completion(&info);
        s.completions.insert(id, value);
    }

    fn resume_program(&mut self) {
        if self.halted() || self.outcome.is_some() || self.completion_emitted {
            return;
        }
        let Some(program) = self.program.as_mut() else {
            return;
        };

        let mut cx = Context::from_waker(futures::task::noop_waker_ref());
        match catch_unwind(AssertUnwindSafe(|| program.as_mut().poll(&mut cx))) {
            Ok(Poll::Pending) => {}
            Ok(Poll::Ready(result)) => {
                self.program = None;
                match result {
                    Err(OrchestrationError::Aborted(reason)) => {
                        self.aborted = Some(ExecutionAborted { reason });
                    }
                    other => self.outcome = Some(other),
                }
            }
            Err(payload) => {
                self.program = None;
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "orchestration panicked".to_string());
                self.set_fault(ExecutionFault::Panicked(message));
            }
        }
    }

    fn set_fault(&mut self, fault: ExecutionFault) {
        warn!(
            target: REPLAY_TARGET,
            instance_id = %self.context.instance_id(),
            error = %fault,
            "orchestration execution faulted"
        );
        if self.fault.is_none() {
            self.fault = Some(fault);
        }
    }

    fn terminate(&mut self, input: Option<String>) {
        if self.completion_emitted {
            return;
        }
        let mut s = self.context.state();
        if let Err(e) = s.release_locks() {
            warn!(target: REPLAY_TARGET, error = %e, "failed to release entity locks on termination");
        }
        let id = s.next_id();
        s.actions.insert(
            id,
            OrchestratorAction::OrchestrationComplete(OrchestrationCompleteAction::new(
                id,
                OrchestrationStatus::Terminated,
                input,
            )),
        );
        drop(s);
        self.program = None;
        self.completion_emitted = true;
    }

    fn finish(&mut self) -> Result<OrchestratorExecutionResult, ExecutionAborted> {
        if let Some(aborted) = self.aborted.take() {
            return Err(aborted);
        }

        if !self.completion_emitted {
            if let Some(fault) = self.fault.clone() {
                let mut s = self.context.state();
                s.actions.clear();
                let id = s.next_id();
                let action = self.failed_action(id, fault.to_failure_details());
                s.actions.insert(id, OrchestratorAction::OrchestrationComplete(action));
                self.completion_emitted = true;
            } else if let Some(outcome) = self.outcome.take() {
                self.complete(outcome);
            }
        }

        let s = self.context.state();
        Ok(OrchestratorExecutionResult {
            actions: s.actions.values().cloned().collect(),
            custom_status: s.custom_status.clone(),
        })
    }

    fn complete(&mut self, outcome: Result<Option<String>, OrchestrationError>) {
        let mut s = self.context.state();
        if let Err(e) = s.release_locks() {
            warn!(target: REPLAY_TARGET, error = %e, "failed to release entity locks on completion");
        }
        let id = s.next_id();
        let action = match outcome {
            Ok(output) => match s.continue_as_new.take() {
                Some(can) => {
                    let mut carryover = Vec::new();
                    if can.preserve_unprocessed_events {
                        let timestamp = s.current_utc;
                        carryover.extend(
                            s.take_unconsumed_events()
                                .into_iter()
                                .map(|(name, input)| HistoryEvent::event_raised(timestamp, name, input)),
                        );
                        carryover.append(&mut s.carryover_events);
                    }
                    let mut action =
                        OrchestrationCompleteAction::new(id, OrchestrationStatus::ContinuedAsNew, can.input);
                    action.new_version = can.version;
                    action.carryover_events = carryover;
                    action
                }
                None => OrchestrationCompleteAction::new(id, OrchestrationStatus::Completed, output),
            },
            Err(OrchestrationError::Failed(details)) => self.failed_action(id, details),
            // aborts never reach completion
            Err(OrchestrationError::Aborted(reason)) => {
                self.failed_action(id, FailureDetails::new("ExecutionAborted", reason))
            }
        };
        s.actions.insert(id, OrchestratorAction::OrchestrationComplete(action));
        self.completion_emitted = true;
    }

    fn failed_action(&self, id: i32, details: FailureDetails) -> OrchestrationCompleteAction {
        let mut action = OrchestrationCompleteAction::new(id, OrchestrationStatus::Failed, Some(details.error_message.clone()));
        match self.options.error_propagation_mode {
            ErrorPropagationMode::UseFailureDetails => action.failure_details = Some(details),
            ErrorPropagationMode::SerializeExceptions => action.details = serde_json::to_string(&details).ok(),
        }
        action
    }
}
