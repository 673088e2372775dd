#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use durable_task_core::history::{EventKind, ExecutionStartedEvent, HistoryEvent, OrchestrationInstance};
use durable_task_core::orchestration::{
    ExecutorOptions, OrchestrationCompleteAction, OrchestratorAction, TaskOrchestrationExecutor,
};
use durable_task_core::providers::in_memory::InMemoryOrchestrationService;
use durable_task_core::runtime::dispatchers::apply_actions;
use durable_task_core::{
    FnOrchestration, OrchestrationContext, OrchestrationError, OrchestrationHandler, OrchestrationRuntimeState,
};

pub const INSTANCE_ID: &str = "instance";
pub const EXECUTION_ID: &str = "exec-1";

/// Fixed start of logical time for replay tests.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub fn at(offset_secs: i64) -> DateTime<Utc> {
    t0() + chrono::Duration::seconds(offset_secs)
}

pub fn orchestration<F, Fut>(f: F) -> Arc<dyn OrchestrationHandler>
where
    F: Fn(OrchestrationContext, Option<String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<String>, OrchestrationError>> + Send + 'static,
{
    Arc::new(FnOrchestration(f))
}

pub fn started(name: &str, input: Option<&str>) -> HistoryEvent {
    HistoryEvent::unsequenced(
        t0(),
        EventKind::ExecutionStarted(ExecutionStartedEvent {
            name: name.to_string(),
            version: String::new(),
            input: input.map(str::to_string),
            orchestration_instance: OrchestrationInstance::new(INSTANCE_ID, EXECUTION_ID),
            parent_instance: None,
            tags: BTreeMap::new(),
        }),
    )
}

pub fn turn_started(time: DateTime<Utc>) -> HistoryEvent {
    HistoryEvent::orchestrator_started(time)
}

pub fn turn_completed() -> HistoryEvent {
    HistoryEvent::unsequenced(t0(), EventKind::OrchestratorCompleted)
}

pub fn task_scheduled(id: i32, name: &str) -> HistoryEvent {
    HistoryEvent::new(
        id,
        t0(),
        EventKind::TaskScheduled {
            name: name.to_string(),
            version: String::new(),
            input: None,
        },
    )
}

pub fn task_completed(id: i32, result: &str) -> HistoryEvent {
    HistoryEvent::unsequenced(
        t0(),
        EventKind::TaskCompleted {
            task_scheduled_id: id,
            result: Some(result.to_string()),
        },
    )
}

pub fn task_failed(id: i32, details: durable_task_core::FailureDetails) -> HistoryEvent {
    HistoryEvent::unsequenced(
        t0(),
        EventKind::TaskFailed {
            task_scheduled_id: id,
            reason: Some(details.error_message.clone()),
            details: None,
            failure_details: Some(details),
        },
    )
}

pub fn runtime_state(past: Vec<HistoryEvent>, new: Vec<HistoryEvent>) -> OrchestrationRuntimeState {
    let mut state = OrchestrationRuntimeState::new(past);
    for event in new {
        state.add_event(event);
    }
    state
}

pub fn executor(
    handler: Arc<dyn OrchestrationHandler>,
    past: Vec<HistoryEvent>,
    new: Vec<HistoryEvent>,
) -> TaskOrchestrationExecutor {
    TaskOrchestrationExecutor::new(runtime_state(past, new), handler, ExecutorOptions::default())
}

pub fn completion(actions: &[OrchestratorAction]) -> Option<&OrchestrationCompleteAction> {
    actions.iter().find_map(|a| match a {
        OrchestratorAction::OrchestrationComplete(c) => Some(c),
        _ => None,
    })
}

/// Result of running an orchestration to completion with [`drive`].
#[derive(Debug)]
pub struct Driven {
    pub history: Vec<HistoryEvent>,
    pub completion: OrchestrationCompleteAction,
}

impl Driven {
    pub fn timers(&self) -> Vec<DateTime<Utc>> {
        self.history
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::TimerCreated { fire_at } => Some(*fire_at),
                _ => None,
            })
            .collect()
    }

    pub fn scheduled_tasks(&self) -> usize {
        self.history
            .iter()
            .filter(|e| matches!(e.kind, EventKind::TaskScheduled { .. }))
            .count()
    }
}

/// Runs `handler` one turn at a time, replaying the whole history on every turn.
///
/// Each scheduled activity is answered by `respond` (attempt number, activity name); timers fire
/// at their due time, which also advances the logical clock.
pub fn drive(
    handler: Arc<dyn OrchestrationHandler>,
    input: Option<&str>,
    mut respond: impl FnMut(usize, &str) -> Result<String, durable_task_core::FailureDetails>,
) -> Driven {
    let mut history = vec![turn_started(t0()), started("Driven", input)];
    let mut pending: Vec<HistoryEvent> = Vec::new();
    let mut now = t0();
    let mut attempts = 0;

    for _ in 0..64 {
        let mut state = runtime_state(history.clone(), pending.drain(..).collect());
        let result = TaskOrchestrationExecutor::new(state.clone(), handler.clone(), ExecutorOptions::default())
            .execute()
            .unwrap();
        let out = apply_actions(&mut state, &result.actions, now);
        state.add_event(turn_completed());
        history = state.into_events();

        if let Some(done) = completion(&result.actions) {
            return Driven {
                history,
                completion: done.clone(),
            };
        }

        let mut next = Vec::new();
        for message in &out.outbound_messages {
            if let EventKind::TaskScheduled { name, .. } = &message.event.kind {
                attempts += 1;
                let id = message.event.event_id;
                next.push(match respond(attempts, name) {
                    Ok(result) => task_completed(id, &result),
                    Err(details) => task_failed(id, details),
                });
            }
        }
        for message in &out.timer_messages {
            if let EventKind::TimerFired { fire_at, .. } = message.event.kind {
                now = now.max(fire_at);
                next.push(message.event.clone());
            }
        }
        assert!(!next.is_empty(), "orchestration is stuck without a terminal action");
        pending.push(turn_started(now));
        pending.extend(next);
    }
    panic!("orchestration did not complete");
}

/// Polls `predicate` against an instance's history until it holds or `timeout` elapses.
pub async fn wait_for_history<F>(
    service: &InMemoryOrchestrationService,
    instance_id: &str,
    predicate: F,
    timeout: Duration,
) -> bool
where
    F: Fn(&[HistoryEvent]) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let history = service.instance_history(instance_id).await.unwrap_or_default();
        if predicate(&history) {
            return true;
        }
        if tokio::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
