//! Worker host: registries, dispatchers, and the loops that drive them.

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::info;

use crate::error::OrchestrationError;
use crate::logging::{DISPATCHER_TARGET, init_default_subscriber};
use crate::orchestration::{ErrorPropagationMode, OrchestrationContext};
use crate::providers::{EntityOrchestrationService, OrchestrationService};

pub mod concurrency;
pub mod dispatchers;
pub mod lock_renewal;
pub mod middleware;
pub mod registry;
pub mod work_item_dispatcher;

pub use concurrency::NonBlockingCountdownLock;
pub use dispatchers::{TaskActivityDispatcher, TaskEntityDispatcher, TaskOrchestrationDispatcher};
pub use middleware::{DispatchMiddleware, DispatchMiddlewareContext, DispatchMiddlewarePipeline, Next};
pub use registry::{
    ActivityRegistry, ActivityRegistryBuilder, EntityRegistry, EntityRegistryBuilder, OrchestrationRegistry,
    OrchestrationRegistryBuilder, Registry, RegistryBuilder, RegistryKey,
};
pub use work_item_dispatcher::{WorkItemDispatcher, WorkItemDispatcherBuilder};

/// Configuration options for the worker.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Fetch loops for orchestrations. `0` uses the backend's value.
    pub orchestration_dispatcher_count: usize,
    /// `0` uses the backend's value.
    pub max_concurrent_orchestrations: usize,
    pub activity_dispatcher_count: usize,
    pub max_concurrent_activities: usize,
    pub entity_dispatcher_count: usize,
    pub max_concurrent_entities: usize,
    /// How long a single fetch may wait for a work item.
    pub receive_timeout: Duration,
    pub error_propagation_mode: ErrorPropagationMode,
    /// Install a `tracing` fmt subscriber on start.
    pub install_default_subscriber: bool,
    /// Keep entity state in memory between batches while the backend offers a session.
    pub extended_sessions_enabled: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            orchestration_dispatcher_count: 0,
            max_concurrent_orchestrations: 0,
            activity_dispatcher_count: 0,
            max_concurrent_activities: 0,
            entity_dispatcher_count: 0,
            max_concurrent_entities: 0,
            receive_timeout: work_item_dispatcher::DEFAULT_RECEIVE_TIMEOUT,
            error_propagation_mode: ErrorPropagationMode::default(),
            install_default_subscriber: false,
            extended_sessions_enabled: false,
        }
    }
}

pub(crate) fn or_backend(configured: usize, backend: usize) -> usize {
    if configured == 0 { backend } else { configured }
}

/// Trait implemented by orchestration handlers that can be invoked by the runtime.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: Option<String>) -> Result<Option<String>, OrchestrationError>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, Option<String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<String>, OrchestrationError>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, Option<String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<String>, OrchestrationError>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: Option<String>) -> Result<Option<String>, OrchestrationError> {
        (self.0)(ctx, input).await
    }
}

struct RunningDispatchers {
    orchestrations: TaskOrchestrationDispatcher,
    activities: TaskActivityDispatcher,
    entities: TaskEntityDispatcher,
}

/// Hosts the orchestration, activity, and entity dispatchers against one backend.
pub struct TaskHubWorker {
    orchestration_service: Arc<dyn OrchestrationService>,
    entity_service: Arc<dyn EntityOrchestrationService>,
    options: RuntimeOptions,
    orchestrations: OrchestrationRegistry,
    activities: ActivityRegistry,
    entities: EntityRegistry,
    orchestration_pipeline: DispatchMiddlewarePipeline,
    activity_pipeline: DispatchMiddlewarePipeline,
    entity_pipeline: DispatchMiddlewarePipeline,
    started: AtomicBool,
    running: Mutex<Option<RunningDispatchers>>,
}

impl TaskHubWorker {
    pub fn new<S>(service: Arc<S>, options: RuntimeOptions) -> Self
    where
        S: EntityOrchestrationService + 'static,
    {
        Self {
            orchestration_service: service.clone(),
            entity_service: service,
            options,
            orchestrations: OrchestrationRegistry::default(),
            activities: ActivityRegistry::default(),
            entities: EntityRegistry::default(),
            orchestration_pipeline: DispatchMiddlewarePipeline::new(),
            activity_pipeline: DispatchMiddlewarePipeline::new(),
            entity_pipeline: DispatchMiddlewarePipeline::new(),
            started: AtomicBool::new(false),
            running: Mutex::new(None),
        }
    }

    pub fn with_orchestrations(mut self, registry: OrchestrationRegistry) -> Self {
        self.orchestrations = registry;
        self
    }

    pub fn with_activities(mut self, registry: ActivityRegistry) -> Self {
        self.activities = registry;
        self
    }

    pub fn with_entities(mut self, registry: EntityRegistry) -> Self {
        self.entities = registry;
        self
    }

    pub fn add_orchestration_middleware(mut self, middleware: impl DispatchMiddleware + 'static) -> Self {
        self.orchestration_pipeline.add(middleware);
        self
    }

    pub fn add_activity_middleware(mut self, middleware: impl DispatchMiddleware + 'static) -> Self {
        self.activity_pipeline.add(middleware);
        self
    }

    pub fn add_entity_middleware(mut self, middleware: impl DispatchMiddleware + 'static) -> Self {
        self.entity_pipeline.add(middleware);
        self
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Starts all dispatchers. Must be called inside a tokio runtime; repeated calls do nothing.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.options.install_default_subscriber {
            init_default_subscriber();
        }

        let dispatchers = RunningDispatchers {
            orchestrations: TaskOrchestrationDispatcher::new(
                self.orchestration_service.clone(),
                self.orchestrations.clone(),
                self.orchestration_pipeline.clone(),
                &self.options,
                self.entity_service.entity_backend_properties(),
            ),
            activities: TaskActivityDispatcher::new(
                self.orchestration_service.clone(),
                self.activities.clone(),
                self.activity_pipeline.clone(),
                &self.options,
            ),
            entities: TaskEntityDispatcher::new(
                self.entity_service.clone(),
                self.entities.clone(),
                self.entity_pipeline.clone(),
                &self.options,
            ),
        };
        dispatchers.orchestrations.start();
        dispatchers.activities.start();
        dispatchers.entities.start();
        info!(
            target: DISPATCHER_TARGET,
            orchestrations = self.orchestrations.len(),
            activities = self.activities.len(),
            entities = self.entities.len(),
            "task hub worker started"
        );
        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = Some(dispatchers);
    }

    /// Stops all dispatchers; see [`WorkItemDispatcher::stop`] for `forced`.
    pub async fn stop(&self, forced: bool) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(dispatchers) = running {
            tokio::join!(
                dispatchers.orchestrations.stop(forced),
                dispatchers.activities.stop(forced),
                dispatchers.entities.stop(forced),
            );
        }
        info!(target: DISPATCHER_TARGET, forced, "task hub worker stopped");
    }
}
