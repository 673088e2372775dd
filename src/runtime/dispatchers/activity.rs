//! Activity dispatcher: runs one `TaskScheduled` invocation per work item and answers the
//! orchestration with `TaskCompleted` or `TaskFailed`.

use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{catch_user_panic, fetch_result};
use crate::activity::{ActivityFailure, TaskContext};
use crate::error::{DispatchError, FailureDetails};
use crate::history::{EventKind, HistoryEvent, TaskMessage};
use crate::logging::DISPATCHER_TARGET;
use crate::orchestration::ErrorPropagationMode;
use crate::providers::{OrchestrationService, TaskActivityWorkItem};
use crate::runtime::lock_renewal::{spawn_lock_renewal_task, stop_lock_renewal};
use crate::runtime::{ActivityRegistry, DispatchMiddlewareContext, DispatchMiddlewarePipeline, RuntimeOptions, WorkItemDispatcher, or_backend};

/// Response produced by an activity execution, stored in the middleware context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityExecutionResult {
    pub response: TaskMessage,
}

/// Input of the activity, stored in the middleware context alongside the [`TaskContext`].
#[derive(Debug, Clone)]
struct ActivityInput(Option<String>);

pub struct TaskActivityDispatcher {
    dispatcher: WorkItemDispatcher<TaskActivityWorkItem>,
}

#[derive(Clone)]
struct ActivityWorker {
    service: Arc<dyn OrchestrationService>,
    activities: ActivityRegistry,
    pipeline: DispatchMiddlewarePipeline,
    error_propagation_mode: ErrorPropagationMode,
}

impl TaskActivityDispatcher {
    pub fn new(
        service: Arc<dyn OrchestrationService>,
        activities: ActivityRegistry,
        pipeline: DispatchMiddlewarePipeline,
        options: &RuntimeOptions,
    ) -> Self {
        let worker = ActivityWorker {
            service: service.clone(),
            activities,
            pipeline,
            error_propagation_mode: options.error_propagation_mode,
        };

        let fetch_service = service.clone();
        let abort_service = service.clone();
        let fetch_delay_service = service.clone();
        let process_delay_service = service.clone();
        let dispatcher = WorkItemDispatcher::builder(
            "TaskActivityDispatcher",
            |item: &TaskActivityWorkItem| item.id.clone(),
            move |timeout, cancel: CancellationToken| {
                let service = fetch_service.clone();
                async move { fetch_result(service.lock_next_task_activity_work_item(timeout, &cancel).await, &cancel) }
            },
            move |item: TaskActivityWorkItem| {
                let worker = worker.clone();
                async move { worker.process(item).await }
            },
        )
        .abort_work_item(move |item: TaskActivityWorkItem| {
            let service = abort_service.clone();
            async move { service.abandon_task_activity_work_item(&item).await.map_err(DispatchError::from) }
        })
        .fetch_exception_delay(move |e| fetch_delay_service.delay_in_seconds_after_on_fetch_exception(e))
        .process_exception_delay(move |e| process_delay_service.delay_in_seconds_after_on_process_exception(e))
        .dispatcher_count(or_backend(options.activity_dispatcher_count, service.task_activity_dispatcher_count()))
        .max_concurrent_work_items(or_backend(
            options.max_concurrent_activities,
            service.max_concurrent_task_activity_work_items(),
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

    pub fn dispatcher(&self) -> &WorkItemDispatcher<TaskActivityWorkItem> {
        &self.dispatcher
    }
}

impl ActivityWorker {
    async fn process(&self, item: TaskActivityWorkItem) -> Result<(), DispatchError> {
        let scheduled = &item.task_message.event;
        let EventKind::TaskScheduled { name, version, input } = &scheduled.kind else {
            return Err(DispatchError::InvalidWorkItem(format!(
                "activity work item {} carries {} instead of TaskScheduled",
                item.id,
                scheduled.kind.type_name()
            )));
        };
        let task_context = TaskContext {
            orchestration_instance: item.task_message.orchestration_instance.clone(),
            task_scheduled_id: scheduled.event_id,
            name: name.clone(),
            version: version.clone(),
        };

        let renewal_cancel = CancellationToken::new();
        let renewal = item.locked_until.map(|locked_until| {
            let service = self.service.clone();
            let locked_item = item.clone();
            spawn_lock_renewal_task(
                item.id.clone(),
                locked_until,
                move || {
                    let service = service.clone();
                    let locked_item = locked_item.clone();
                    async move { service.renew_task_activity_work_item_lock(&locked_item).await }
                },
                renewal_cancel.clone(),
            )
        });

        let mut ctx = DispatchMiddlewareContext::new();
        ctx.set_property(item.clone());
        ctx.set_property(task_context);
        ctx.set_property(ActivityInput(input.clone()));

        let executed = self
            .pipeline
            .run(ctx, |ctx| {
                let worker = self.clone();
                async move { worker.execute(ctx).await }
            })
            .await;
        stop_lock_renewal(&item.id, renewal, &renewal_cancel).await;

        let response = match executed?.take_property::<ActivityExecutionResult>() {
            Some(result) => result.response,
            None => {
                return Err(DispatchError::InvalidWorkItem(format!(
                    "activity work item {} produced no response",
                    item.id
                )));
            }
        };
        self.service.complete_task_activity_work_item(&item, response).await?;
        Ok(())
    }

    async fn execute(&self, mut ctx: DispatchMiddlewareContext) -> Result<DispatchMiddlewareContext, DispatchError> {
        if ctx.has_property::<ActivityExecutionResult>() {
            return Ok(ctx);
        }
        let (Some(task_context), Some(ActivityInput(input))) =
            (ctx.take_property::<TaskContext>(), ctx.take_property::<ActivityInput>())
        else {
            return Err(DispatchError::InvalidWorkItem("activity context is incomplete".to_string()));
        };
        let instance = task_context.orchestration_instance.clone();
        let scheduled_id = task_context.task_scheduled_id;
        let name = task_context.name.clone();

        let outcome = match self.activities.get(&task_context.name, &task_context.version) {
            Some(activity) => {
                debug!(
                    target: DISPATCHER_TARGET,
                    instance_id = %instance.instance_id,
                    activity = %name,
                    task_scheduled_id = scheduled_id,
                    "executing activity"
                );
                match catch_user_panic(activity.run(task_context, input)).await {
                    Ok(result) => result,
                    Err(panic) => Err(ActivityFailure::new("ActivityPanic", panic)),
                }
            }
            None => Err(ActivityFailure::non_retriable(
                "TypeMissingException",
                format!(
                    "TaskActivity {} version '{}' was not found",
                    task_context.name, task_context.version
                ),
            )),
        };

        let kind = match outcome {
            Ok(result) => EventKind::TaskCompleted {
                task_scheduled_id: scheduled_id,
                result,
            },
            Err(failure) => {
                warn!(
                    target: DISPATCHER_TARGET,
                    instance_id = %instance.instance_id,
                    activity = %name,
                    task_scheduled_id = scheduled_id,
                    error = %failure,
                    "activity failed"
                );
                self.failed_event(scheduled_id, failure.details)
            }
        };
        ctx.set_property(ActivityExecutionResult {
            response: TaskMessage::new(HistoryEvent::unsequenced(Utc::now(), kind), instance),
        });
        Ok(ctx)
    }

    fn failed_event(&self, task_scheduled_id: i32, details: FailureDetails) -> EventKind {
        let reason = Some(details.error_message.clone());
        match self.error_propagation_mode {
            ErrorPropagationMode::UseFailureDetails => EventKind::TaskFailed {
                task_scheduled_id,
                reason,
                details: None,
                failure_details: Some(details),
            },
            ErrorPropagationMode::SerializeExceptions => EventKind::TaskFailed {
                task_scheduled_id,
                reason,
                details: serde_json::to_string(&details).ok(),
                failure_details: None,
            },
        }
    }
}
