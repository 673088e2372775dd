//! Entity dispatcher: one batch of entity operations per work item.
//!
//! With extended sessions enabled and a session offered by the backend, the dispatcher keeps
//! processing follow-up batches for the same entity until the session idles out. At most half
//! of the entity concurrency budget may be held by sessions at once.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{catch_user_panic, fetch_result};
use crate::entities::{
    EntityBatchRequest, EntityBatchResult, EntityId, EntityScheduler, OperationResult, entity_type_not_found,
};
use crate::error::{DispatchError, FailureDetails};
use crate::logging::ENTITIES_TARGET;
use crate::providers::{EntityOrchestrationService, OrchestrationWorkItemCompletion, TaskOrchestrationWorkItem};
use crate::runtime::lock_renewal::{spawn_lock_renewal_task, stop_lock_renewal};
use crate::runtime::{
    DispatchMiddlewareContext, DispatchMiddlewarePipeline, EntityRegistry, NonBlockingCountdownLock,
    RuntimeOptions, WorkItemDispatcher, or_backend,
};
use crate::runtime_state::OrchestrationRuntimeState;

pub struct TaskEntityDispatcher {
    dispatcher: WorkItemDispatcher<TaskOrchestrationWorkItem>,
}

#[derive(Clone)]
struct EntityWorker {
    service: Arc<dyn EntityOrchestrationService>,
    entities: EntityRegistry,
    pipeline: DispatchMiddlewarePipeline,
    scheduler: EntityScheduler,
    session_lock: Option<NonBlockingCountdownLock>,
}

impl TaskEntityDispatcher {
    pub fn new(
        service: Arc<dyn EntityOrchestrationService>,
        entities: EntityRegistry,
        pipeline: DispatchMiddlewarePipeline,
        options: &RuntimeOptions,
    ) -> Self {
        let properties = service.entity_backend_properties();
        let max_concurrent = or_backend(options.max_concurrent_entities, properties.max_concurrent_task_entity_work_items);
        let dispatcher_count = or_backend(options.entity_dispatcher_count, properties.entity_dispatcher_count);
        let worker = EntityWorker {
            service: service.clone(),
            entities,
            pipeline,
            scheduler: EntityScheduler::new(properties),
            session_lock: options
                .extended_sessions_enabled
                .then(|| NonBlockingCountdownLock::for_extended_sessions(max_concurrent)),
        };

        let fetch_service = service.clone();
        let abort_service = service.clone();
        let release_service = service.clone();
        let fetch_delay_service = service.clone();
        let process_delay_service = service.clone();
        let dispatcher = WorkItemDispatcher::builder(
            "TaskEntityDispatcher",
            |item: &TaskOrchestrationWorkItem| item.instance_id.clone(),
            move |timeout, cancel: CancellationToken| {
                let service = fetch_service.clone();
                async move { fetch_result(service.lock_next_entity_work_item(timeout, &cancel).await, &cancel) }
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
        .dispatcher_count(dispatcher_count)
        .max_concurrent_work_items(max_concurrent)
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

impl EntityWorker {
    async fn process(&self, item: TaskOrchestrationWorkItem) -> Result<(), DispatchError> {
        let entity: EntityId = item
            .instance_id
            .parse()
            .map_err(|e: crate::entities::EntityIdParseError| DispatchError::InvalidWorkItem(e.to_string()))?;

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

        let result = self.run_session(&entity, item).await;
        stop_lock_renewal(&entity.instance_id(), renewal, &renewal_cancel).await;
        result
    }

    async fn run_session(&self, entity: &EntityId, mut item: TaskOrchestrationWorkItem) -> Result<(), DispatchError> {
        let mut session_slot: Option<OwnedSemaphorePermit> = None;
        loop {
            let completion = self.run_batch(entity, &item).await?;
            let history = completion.runtime_state.clone();
            self.service.complete_task_orchestration_work_item(&item, completion).await?;

            let Some(session) = item.session.clone() else {
                return Ok(());
            };
            if session_slot.is_none() {
                session_slot = self.session_lock.as_ref().and_then(NonBlockingCountdownLock::try_acquire);
                if session_slot.is_none() {
                    return Ok(());
                }
            }
            match session.fetch_new_orchestration_messages(&item).await? {
                Some(messages) if !messages.is_empty() => {
                    trace!(
                        target: ENTITIES_TARGET,
                        instance_id = %item.instance_id,
                        messages = messages.len(),
                        "continuing extended session"
                    );
                    item.orchestration_runtime_state = OrchestrationRuntimeState::new(history.into_events());
                    item.new_messages = messages;
                }
                _ => return Ok(()),
            }
        }
    }

    async fn run_batch(
        &self,
        entity: &EntityId,
        item: &TaskOrchestrationWorkItem,
    ) -> Result<OrchestrationWorkItemCompletion, DispatchError> {
        let now = Utc::now();
        let mut runtime_state = item.orchestration_runtime_state.clone();
        for message in &item.new_messages {
            runtime_state.add_event(message.event.clone());
        }

        let (mut state, mut work) = self.scheduler.determine_work(&runtime_state, now)?;
        let result = if work.operation_count() > 0 {
            let request = self.scheduler.batch_request(&entity.instance_id(), &state, &work);
            self.execute(entity, request).await?
        } else {
            EntityBatchResult {
                entity_state: state.entity_state.clone(),
                ..Default::default()
            }
        };
        debug!(
            target: ENTITIES_TARGET,
            instance_id = %entity,
            operations = work.operation_count(),
            queued = state.queue.len(),
            "entity batch executed"
        );

        let messages = self.scheduler.apply_batch_result(entity, &mut state, &mut work, result, now)?;
        let outcome = self.scheduler.next_generation(entity, &state, now)?;
        Ok(OrchestrationWorkItemCompletion {
            runtime_state: outcome.runtime_state,
            orchestrator_messages: messages,
            custom_status: outcome.custom_status,
            ..Default::default()
        })
    }

    async fn execute(&self, entity: &EntityId, request: EntityBatchRequest) -> Result<EntityBatchResult, DispatchError> {
        let mut ctx = DispatchMiddlewareContext::new();
        ctx.set_property(request);

        let handler = self.entities.get_entity(entity.name());
        let entity = entity.clone();
        let mut ctx = self
            .pipeline
            .run(ctx, move |mut ctx| {
                let handler = handler.clone();
                let entity = entity.clone();
                async move {
                    if ctx.has_property::<EntityBatchResult>() {
                        return Ok(ctx);
                    }
                    let request = ctx
                        .take_property::<EntityBatchRequest>()
                        .ok_or_else(|| DispatchError::InvalidWorkItem("missing entity batch request".to_string()))?;
                    let result = match handler {
                        Some(handler) => {
                            let entity_state = request.entity_state.clone();
                            match catch_user_panic(handler.execute_operation_batch(request)).await {
                                Ok(result) => result,
                                Err(panic) => EntityBatchResult {
                                    entity_state,
                                    failure_details: Some(FailureDetails::new("EntityPanic", panic)),
                                    ..Default::default()
                                },
                            }
                        }
                        None => EntityBatchResult {
                            results: request
                                .operations
                                .iter()
                                .map(|_| OperationResult::failure(entity_type_not_found(&entity)))
                                .collect(),
                            entity_state: request.entity_state,
                            ..Default::default()
                        },
                    };
                    ctx.set_property(result);
                    Ok::<_, DispatchError>(ctx)
                }
            })
            .await?;

        ctx.take_property::<EntityBatchResult>()
            .ok_or_else(|| DispatchError::InvalidWorkItem("entity batch produced no result".to_string()))
    }
}
