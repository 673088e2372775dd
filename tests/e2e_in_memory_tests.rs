//! Worker, client, and in-memory backend running together.
#![allow(clippy::unwrap_used)]

mod common;

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use durable_task_core::history::{EventKind, HistoryEvent, OrchestrationStatus, TaskMessage};
use durable_task_core::providers::OrchestrationState;
use durable_task_core::providers::in_memory::InMemoryOrchestrationService;
use durable_task_core::runtime::dispatchers::ActivityExecutionResult;
use durable_task_core::runtime::{DispatchMiddleware, DispatchMiddlewareContext, Next};
use durable_task_core::{
    ActivityFailure, ActivityRegistry, DispatchError, EntityContext, EntityId, EntityRegistry, FailureDetails,
    OrchestrationRegistry, RuntimeOptions, TaskContext, TaskHubClient, TaskHubWorker, replay_safe_info,
};

const TIMEOUT: Duration = Duration::from_secs(10);

fn activities() -> ActivityRegistry {
    ActivityRegistry::builder()
        .register("Greet", |_ctx, input: Option<String>| async move {
            Ok(Some(format!("Hello, {}!", input.unwrap_or_default())))
        })
        .register("Fail", |_ctx, _input| async move {
            Err(ActivityFailure::non_retriable("Broken", "always fails"))
        })
        .register("Real", |_ctx, _input| async move { Ok(Some("real".to_string())) })
        .build()
}

fn entities() -> EntityRegistry {
    EntityRegistry::builder()
        .register("Counter", |ctx: &mut EntityContext, op: &str, input: Option<&str>| {
            let current: i64 = ctx
                .get_state()
                .map_err(|e| FailureDetails::new("Codec", e.to_string()))?
                .unwrap_or(0);
            match op {
                "add" => {
                    let delta: i64 = input
                        .unwrap_or("0")
                        .parse()
                        .map_err(|_| FailureDetails::new("BadInput", "not a number"))?;
                    ctx.set_state_typed(&(current + delta))
                        .map_err(|e| FailureDetails::new("Codec", e.to_string()))?;
                    Ok(None)
                }
                "get" => Ok(Some(current.to_string())),
                other => Err(FailureDetails::new("UnknownOperation", other)),
            }
        })
        .build()
}

fn orchestrations() -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register("Hello", |ctx, input| async move {
            replay_safe_info!(ctx, "greeting {}", input.as_deref().unwrap_or_default());
            Ok(ctx.schedule_task("Greet", "", input).await?)
        })
        .register("Parent", |ctx, input| async move {
            let child = ctx.create_sub_orchestration("Hello", "", None, input).await?;
            Ok(child.map(|c| format!("child said {c}")))
        })
        .register("Approval", |ctx, _input| async move {
            let decision = ctx.wait_for_external_event("decision").await;
            Ok(decision)
        })
        .register("Sleep", |ctx, _input| async move {
            let wake = ctx.current_utc_date_time() + chrono::Duration::milliseconds(200);
            ctx.create_timer(wake).await?;
            Ok(Some("awake".to_string()))
        })
        .register("Counting", |ctx, _input| async move {
            let counter = EntityId::new("counter", "shared");
            ctx.call_entity(&counter, "add", Some("5".to_string())).await?;
            ctx.call_entity(&counter, "add", Some("2".to_string())).await?;
            Ok(ctx.call_entity(&counter, "get", None).await?)
        })
        .register("Locked", |ctx, _input| async move {
            let counter = EntityId::new("counter", "locked");
            let section = ctx.lock_entities(&[counter.clone()]).await?;
            ctx.call_entity(&counter, "add", Some("1".to_string())).await?;
            let value = ctx.call_entity(&counter, "get", None).await?;
            section.release()?;
            Ok(value)
        })
        .register("Loop", |ctx, input| async move {
            let n: u32 = input.as_deref().unwrap_or("0").parse().unwrap_or(0);
            if n < 3 {
                ctx.continue_as_new(Some((n + 1).to_string()));
                return Ok(None);
            }
            Ok(Some(n.to_string()))
        })
        .register("CallsFail", |ctx, _input| async move { Ok(ctx.schedule_task("Fail", "", None).await?) })
        .register("CallsMissing", |ctx, _input| async move { Ok(ctx.schedule_task("Nope", "", None).await?) })
        .register("CallsReal", |ctx, _input| async move { Ok(ctx.schedule_task("Real", "", None).await?) })
        .build()
}

struct Harness {
    service: Arc<InMemoryOrchestrationService>,
    worker: TaskHubWorker,
    client: TaskHubClient,
}

impl Harness {
    fn start(worker: impl FnOnce(TaskHubWorker) -> TaskHubWorker) -> Self {
        let service = Arc::new(InMemoryOrchestrationService::new());
        let options = RuntimeOptions {
            receive_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let worker = worker(
            TaskHubWorker::new(service.clone(), options)
                .with_orchestrations(orchestrations())
                .with_activities(activities())
                .with_entities(entities()),
        );
        worker.start();
        let client = TaskHubClient::new(service.clone());
        Self { service, worker, client }
    }

    async fn run(&self, name: &str, input: Option<&str>) -> OrchestrationState {
        let instance = self
            .client
            .create_orchestration_instance(name, "", None, input.map(str::to_string))
            .await
            .unwrap();
        self.client
            .wait_for_orchestration(&instance.instance_id, TIMEOUT)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("{name} did not finish"))
    }

    async fn shutdown(self) {
        self.worker.stop(false).await;
    }
}

#[tokio::test]
async fn hello_world_completes() {
    let h = Harness::start(|w| w);
    let state = h.run("Hello", Some("Rust")).await;
    assert_eq!(state.status, OrchestrationStatus::Completed);
    assert_eq!(state.output.as_deref(), Some("Hello, Rust!"));
    assert_eq!(h.service.pending_activity_count().await, 0);
    h.shutdown().await;
}

#[tokio::test]
async fn sub_orchestration_result_reaches_parent() {
    let h = Harness::start(|w| w);
    let state = h.run("Parent", Some("child")).await;
    assert_eq!(state.status, OrchestrationStatus::Completed);
    assert_eq!(state.output.as_deref(), Some("child said Hello, child!"));
    h.shutdown().await;
}

#[tokio::test]
async fn external_event_is_delivered() {
    let h = Harness::start(|w| w);
    let instance = h
        .client
        .create_orchestration_instance("Approval", "", Some("approval-1".to_string()), None)
        .await
        .unwrap();
    h.client
        .raise_event(&instance, "decision", Some("approved".to_string()))
        .await
        .unwrap();
    let state = h.client.wait_for_orchestration("approval-1", TIMEOUT).await.unwrap().unwrap();
    assert_eq!(state.output.as_deref(), Some("approved"));
    h.shutdown().await;
}

#[tokio::test]
async fn durable_timer_fires() {
    let h = Harness::start(|w| w);
    let started = Utc::now();
    let state = h.run("Sleep", None).await;
    assert_eq!(state.output.as_deref(), Some("awake"));
    assert!(Utc::now() - started >= chrono::Duration::milliseconds(200));
    h.shutdown().await;
}

#[tokio::test]
async fn entity_calls_are_serialized_per_entity() {
    let h = Harness::start(|w| w);
    let state = h.run("Counting", None).await;
    assert_eq!(state.status, OrchestrationStatus::Completed);
    assert_eq!(state.output.as_deref(), Some("7"));
    h.shutdown().await;
}

#[tokio::test]
async fn critical_section_locks_and_releases_entity() {
    let h = Harness::start(|w| w);
    let state = h.run("Locked", None).await;
    assert_eq!(state.status, OrchestrationStatus::Completed);
    assert_eq!(state.output.as_deref(), Some("1"));

    let entity = EntityId::new("counter", "locked").instance_id();
    let unlocked = common::wait_for_history(
        &h.service,
        &entity,
        |history| {
            history.iter().any(|e| match &e.kind {
                EventKind::ExecutionStarted(started) => started
                    .input
                    .as_deref()
                    .is_some_and(|input| !input.contains("lockedBy")),
                _ => false,
            })
        },
        TIMEOUT,
    )
    .await;
    assert!(unlocked, "entity still locked after the critical section ended");
    h.shutdown().await;
}

#[tokio::test]
async fn client_signal_updates_entity_state() {
    let h = Harness::start(|w| w);
    let counter = EntityId::new("counter", "signalled");
    h.client.signal_entity(&counter, "add", Some("4".to_string()), None).await.unwrap();
    let updated = common::wait_for_history(
        &h.service,
        &counter.instance_id(),
        |history| {
            history.iter().any(|e| match &e.kind {
                EventKind::ExecutionStarted(started) => {
                    started.input.as_deref().is_some_and(|input| input.contains("\"state\":\"4\""))
                }
                _ => false,
            })
        },
        TIMEOUT,
    )
    .await;
    assert!(updated);
    h.shutdown().await;
}

#[tokio::test]
async fn continue_as_new_runs_to_the_final_generation() {
    let h = Harness::start(|w| w);
    let state = h.run("Loop", Some("0")).await;
    assert_eq!(state.status, OrchestrationStatus::Completed);
    assert_eq!(state.output.as_deref(), Some("3"));
    assert_eq!(state.input.as_deref(), Some("3"));
    h.shutdown().await;
}

#[tokio::test]
async fn activity_failure_fails_orchestration() {
    let h = Harness::start(|w| w);
    let state = h.run("CallsFail", None).await;
    assert_eq!(state.status, OrchestrationStatus::Failed);
    assert!(state.failure_details.unwrap().is_caused_by("Broken"));
    h.shutdown().await;
}

#[tokio::test]
async fn unregistered_activity_fails_without_retry() {
    let h = Harness::start(|w| w);
    let state = h.run("CallsMissing", None).await;
    assert_eq!(state.status, OrchestrationStatus::Failed);
    let details = state.failure_details.unwrap();
    assert!(details.is_caused_by("TypeMissingException"));
    h.shutdown().await;
}

#[tokio::test]
async fn terminate_stops_a_waiting_instance() {
    let h = Harness::start(|w| w);
    let instance = h
        .client
        .create_orchestration_instance("Approval", "", Some("to-terminate".to_string()), None)
        .await
        .unwrap();
    let waiting = common::wait_for_history(
        &h.service,
        &instance.instance_id,
        |history| history.iter().any(|e| matches!(e.kind, EventKind::OrchestratorCompleted)),
        TIMEOUT,
    )
    .await;
    assert!(waiting);
    h.client
        .terminate_instance(&instance.instance_id, Some("cancelled by operator".to_string()))
        .await
        .unwrap();
    let state = h.client.wait_for_orchestration(&instance.instance_id, TIMEOUT).await.unwrap().unwrap();
    assert_eq!(state.status, OrchestrationStatus::Terminated);
    assert_eq!(state.output.as_deref(), Some("cancelled by operator"));
    h.shutdown().await;
}

#[tokio::test]
async fn suspended_instance_waits_for_resume() {
    let h = Harness::start(|w| w);
    let instance = h
        .client
        .create_orchestration_instance("Approval", "", Some("suspend-me".to_string()), None)
        .await
        .unwrap();
    h.client.suspend_instance("suspend-me", None).await.unwrap();
    h.client
        .raise_event(&instance, "decision", Some("late".to_string()))
        .await
        .unwrap();

    let early = h.client.wait_for_orchestration("suspend-me", Duration::from_millis(300)).await.unwrap();
    assert!(early.is_none(), "suspended instance must not complete");

    h.client.resume_instance("suspend-me", None).await.unwrap();
    let state = h.client.wait_for_orchestration("suspend-me", TIMEOUT).await.unwrap().unwrap();
    assert_eq!(state.output.as_deref(), Some("late"));
    h.shutdown().await;
}

#[tokio::test]
async fn duplicate_instance_id_is_rejected_while_running() {
    let h = Harness::start(|w| w);
    h.client
        .create_orchestration_instance("Approval", "", Some("only-once".to_string()), None)
        .await
        .unwrap();
    let second = h
        .client
        .create_orchestration_instance("Approval", "", Some("only-once".to_string()), None)
        .await;
    assert!(second.is_err());
    h.shutdown().await;
}

/// Answers every `Real` activity without running it.
struct MockActivities;

#[async_trait]
impl DispatchMiddleware for MockActivities {
    async fn handle(
        &self,
        mut ctx: DispatchMiddlewareContext,
        next: Next<'_>,
    ) -> Result<DispatchMiddlewareContext, DispatchError> {
        let mocked = ctx.get_property::<TaskContext>().filter(|t| t.name == "Real").map(|t| {
            TaskMessage::new(
                HistoryEvent::unsequenced(
                    Utc::now(),
                    EventKind::TaskCompleted {
                        task_scheduled_id: t.task_scheduled_id,
                        result: Some("mocked".to_string()),
                    },
                ),
                t.orchestration_instance.clone(),
            )
        });
        if let Some(response) = mocked {
            ctx.set_property(ActivityExecutionResult { response });
        }
        next.run(ctx).await
    }
}

#[tokio::test]
async fn middleware_result_replaces_activity_execution() {
    let h = Harness::start(|w| w.add_activity_middleware(MockActivities));
    let state = h.run("CallsReal", None).await;
    assert_eq!(state.output.as_deref(), Some("mocked"));
    h.shutdown().await;
}
