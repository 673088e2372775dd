//! In-process backend for tests and samples.
//!
//! Messages are queued per instance and become visible at their delivery time (`fire_at` for
//! timers, the encoded due time for scheduled entity requests). Locking an instance takes all
//! of its visible messages; they are returned to the queue on abandon, on release without
//! completion, and when the lock expires.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::{
    EntityBackendProperties, EntityOrchestrationService, OrchestrationService, OrchestrationServiceClient,
    OrchestrationSession, OrchestrationState, OrchestrationWorkItemCompletion, ProviderError, TaskActivityWorkItem,
    TaskOrchestrationWorkItem,
};
use crate::entities::{is_entity_instance, scheduled_time_from_event_name};
use crate::history::{EventKind, HistoryEvent, TaskMessage};
use crate::logging::DISPATCHER_TARGET;
use crate::runtime_state::OrchestrationRuntimeState;

/// How often blocked fetches re-check the queues.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct InMemoryOptions {
    pub lock_timeout: Duration,
    /// Offer extended sessions that idle out after this long. `None` disables sessions.
    pub session_idle_timeout: Option<Duration>,
    pub entity_properties: EntityBackendProperties,
}

impl Default for InMemoryOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(300),
            session_idle_timeout: None,
            entity_properties: EntityBackendProperties {
                entity_message_reorder_window: Duration::ZERO,
                supports_implicit_entity_deletion: true,
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    seq: u64,
    visible_at: DateTime<Utc>,
    message: TaskMessage,
}

#[derive(Debug, Clone)]
struct InstanceRecord {
    history: Vec<HistoryEvent>,
    custom_status: Option<String>,
    last_updated: DateTime<Utc>,
}

#[derive(Debug)]
struct InstanceLock {
    lock_token: String,
    locked_until: DateTime<Utc>,
    /// Messages handed out under this lock and not yet consumed by a completion.
    messages: Vec<QueuedMessage>,
}

#[derive(Debug, Default)]
struct Store {
    seq: u64,
    instances: HashMap<String, InstanceRecord>,
    pending: HashMap<String, Vec<QueuedMessage>>,
    locks: HashMap<String, InstanceLock>,
    activities: VecDeque<TaskActivityWorkItem>,
    locked_activities: HashMap<String, TaskActivityWorkItem>,
}

fn visible_at(message: &TaskMessage, now: DateTime<Utc>) -> DateTime<Utc> {
    match &message.event.kind {
        EventKind::TimerFired { fire_at, .. } => *fire_at,
        EventKind::EventRaised { name, .. } => scheduled_time_from_event_name(name).unwrap_or(now),
        _ => now,
    }
}

fn expiry(now: DateTime<Utc>, timeout: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::seconds(300))
}

impl Store {
    fn enqueue(&mut self, message: TaskMessage, now: DateTime<Utc>) {
        self.seq += 1;
        let queued = QueuedMessage {
            seq: self.seq,
            visible_at: visible_at(&message, now),
            message,
        };
        self.pending
            .entry(queued.message.orchestration_instance.instance_id.clone())
            .or_default()
            .push(queued);
    }

    fn requeue(&mut self, instance_id: &str, messages: Vec<QueuedMessage>) {
        if messages.is_empty() {
            return;
        }
        let queue = self.pending.entry(instance_id.to_string()).or_default();
        queue.extend(messages);
        queue.sort_by_key(|m| m.seq);
    }

    fn take_visible(&mut self, instance_id: &str, now: DateTime<Utc>) -> Vec<QueuedMessage> {
        let Some(queue) = self.pending.get_mut(instance_id) else {
            return Vec::new();
        };
        let (visible, waiting): (Vec<_>, Vec<_>) = queue.drain(..).partition(|m| m.visible_at <= now);
        *queue = waiting;
        if queue.is_empty() {
            self.pending.remove(instance_id);
        }
        visible
    }

    /// Unlocked instance of the requested kind with the oldest visible message.
    fn next_ready_instance(&self, entities: bool, now: DateTime<Utc>) -> Option<String> {
        self.pending
            .iter()
            .filter(|(id, _)| is_entity_instance(id) == entities && !self.locks.contains_key(*id))
            .filter_map(|(id, queue)| {
                queue
                    .iter()
                    .filter(|m| m.visible_at <= now)
                    .map(|m| m.seq)
                    .min()
                    .map(|seq| (seq, id))
            })
            .min()
            .map(|(_, id)| id.clone())
    }

    fn reclaim_expired_locks(&mut self, now: DateTime<Utc>) {
        let expired: Vec<String> = self
            .locks
            .iter()
            .filter(|(_, lock)| lock.locked_until < now)
            .map(|(id, _)| id.clone())
            .collect();
        for instance_id in expired {
            if let Some(lock) = self.locks.remove(&instance_id) {
                debug!(target: DISPATCHER_TARGET, instance_id = %instance_id, "instance lock expired");
                self.requeue(&instance_id, lock.messages);
            }
        }
    }

    fn check_lock(&self, work_item: &TaskOrchestrationWorkItem, operation: &str) -> Result<(), ProviderError> {
        match self.locks.get(&work_item.instance_id) {
            Some(lock) if lock.lock_token == work_item.lock_token => Ok(()),
            _ => Err(ProviderError::permanent(
                operation,
                format!("lock for instance {} is not held", work_item.instance_id),
            )),
        }
    }
}

struct Inner {
    options: InMemoryOptions,
    store: Mutex<Store>,
}

/// Backend keeping all state in process memory. Cloning shares the state.
#[derive(Clone)]
pub struct InMemoryOrchestrationService {
    inner: Arc<Inner>,
}

impl Default for InMemoryOrchestrationService {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryOrchestrationService {
    pub fn new() -> Self {
        Self::with_options(InMemoryOptions::default())
    }

    pub fn with_options(options: InMemoryOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                store: Mutex::new(Store::default()),
            }),
        }
    }

    /// Persisted history of an instance's current execution.
    pub async fn instance_history(&self, instance_id: &str) -> Option<Vec<HistoryEvent>> {
        let store = self.inner.store.lock().await;
        store.instances.get(instance_id).map(|r| r.history.clone())
    }

    /// Activity invocations waiting to be locked.
    pub async fn pending_activity_count(&self) -> usize {
        self.inner.store.lock().await.activities.len()
    }

    async fn try_lock_instance(&self, entities: bool) -> Option<TaskOrchestrationWorkItem> {
        let now = Utc::now();
        let mut store = self.inner.store.lock().await;
        store.reclaim_expired_locks(now);
        let instance_id = store.next_ready_instance(entities, now)?;
        let messages = store.take_visible(&instance_id, now);
        let lock_token = Uuid::new_v4().to_string();
        let locked_until = expiry(now, self.inner.options.lock_timeout);
        let history = store
            .instances
            .get(&instance_id)
            .map(|r| r.history.clone())
            .unwrap_or_default();

        let new_messages = messages.iter().map(|m| m.message.clone()).collect();
        store.locks.insert(
            instance_id.clone(),
            InstanceLock {
                lock_token: lock_token.clone(),
                locked_until,
                messages,
            },
        );

        let session = self.inner.options.session_idle_timeout.map(|idle_timeout| {
            Arc::new(InMemorySession {
                inner: Arc::clone(&self.inner),
                idle_timeout,
            }) as Arc<dyn OrchestrationSession>
        });
        Some(TaskOrchestrationWorkItem {
            instance_id,
            lock_token,
            orchestration_runtime_state: OrchestrationRuntimeState::new(history),
            new_messages,
            locked_until: Some(locked_until),
            session,
        })
    }

    async fn lock_instance(
        &self,
        entities: bool,
        receive_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<TaskOrchestrationWorkItem>, ProviderError> {
        let deadline = Instant::now() + receive_timeout;
        loop {
            if let Some(item) = self.try_lock_instance(entities).await {
                return Ok(Some(item));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    async fn try_lock_activity(&self) -> Option<TaskActivityWorkItem> {
        let now = Utc::now();
        let mut store = self.inner.store.lock().await;
        let expired: Vec<String> = store
            .locked_activities
            .iter()
            .filter(|(_, item)| item.locked_until.is_some_and(|until| until < now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(item) = store.locked_activities.remove(&id) {
                store.activities.push_front(item);
            }
        }

        let mut item = store.activities.pop_front()?;
        item.locked_until = Some(expiry(now, self.inner.options.lock_timeout));
        store.locked_activities.insert(item.id.clone(), item.clone());
        Some(item)
    }
}

struct InMemorySession {
    inner: Arc<Inner>,
    idle_timeout: Duration,
}

#[async_trait]
impl OrchestrationSession for InMemorySession {
    async fn fetch_new_orchestration_messages(
        &self,
        work_item: &TaskOrchestrationWorkItem,
    ) -> Result<Option<Vec<TaskMessage>>, ProviderError> {
        let deadline = Instant::now() + self.idle_timeout;
        loop {
            {
                let now = Utc::now();
                let mut store = self.inner.store.lock().await;
                if store.check_lock(work_item, "fetch_new_orchestration_messages").is_err() {
                    return Ok(None);
                }
                let taken = store.take_visible(&work_item.instance_id, now);
                if !taken.is_empty() {
                    let messages = taken.iter().map(|m| m.message.clone()).collect();
                    if let Some(lock) = store.locks.get_mut(&work_item.instance_id) {
                        lock.messages.extend(taken);
                    }
                    return Ok(Some(messages));
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl OrchestrationService for InMemoryOrchestrationService {
    async fn lock_next_task_orchestration_work_item(
        &self,
        receive_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<TaskOrchestrationWorkItem>, ProviderError> {
        self.lock_instance(false, receive_timeout, cancel).await
    }

    async fn renew_task_orchestration_work_item_lock(
        &self,
        work_item: &TaskOrchestrationWorkItem,
    ) -> Result<Option<DateTime<Utc>>, ProviderError> {
        let mut store = self.inner.store.lock().await;
        match store.locks.get_mut(&work_item.instance_id) {
            Some(lock) if lock.lock_token == work_item.lock_token => {
                lock.locked_until = expiry(Utc::now(), self.inner.options.lock_timeout);
                Ok(Some(lock.locked_until))
            }
            _ => Ok(None),
        }
    }

    async fn complete_task_orchestration_work_item(
        &self,
        work_item: &TaskOrchestrationWorkItem,
        completion: OrchestrationWorkItemCompletion,
    ) -> Result<(), ProviderError> {
        let now = Utc::now();
        let mut store = self.inner.store.lock().await;
        store.check_lock(work_item, "complete_task_orchestration_work_item")?;

        let history = completion.runtime_state.into_events();
        if history.is_empty() {
            store.instances.remove(&work_item.instance_id);
        } else {
            store.instances.insert(
                work_item.instance_id.clone(),
                InstanceRecord {
                    history,
                    custom_status: completion.custom_status,
                    last_updated: now,
                },
            );
        }

        for message in completion.outbound_messages {
            store.activities.push_back(TaskActivityWorkItem {
                id: Uuid::new_v4().to_string(),
                task_message: message,
                locked_until: None,
            });
        }
        for message in completion.orchestrator_messages.into_iter().chain(completion.timer_messages) {
            store.enqueue(message, now);
        }
        if let Some(lock) = store.locks.get_mut(&work_item.instance_id) {
            lock.messages.clear();
        }
        Ok(())
    }

    async fn abandon_task_orchestration_work_item(
        &self,
        work_item: &TaskOrchestrationWorkItem,
    ) -> Result<(), ProviderError> {
        let mut store = self.inner.store.lock().await;
        let messages = match store.locks.get_mut(&work_item.instance_id) {
            Some(lock) if lock.lock_token == work_item.lock_token => std::mem::take(&mut lock.messages),
            _ => return Ok(()),
        };
        store.requeue(&work_item.instance_id, messages);
        Ok(())
    }

    async fn release_task_orchestration_work_item(
        &self,
        work_item: &TaskOrchestrationWorkItem,
    ) -> Result<(), ProviderError> {
        let mut store = self.inner.store.lock().await;
        let held = matches!(
            store.locks.get(&work_item.instance_id),
            Some(lock) if lock.lock_token == work_item.lock_token
        );
        if held {
            if let Some(lock) = store.locks.remove(&work_item.instance_id) {
                store.requeue(&work_item.instance_id, lock.messages);
            }
        }
        Ok(())
    }

    async fn lock_next_task_activity_work_item(
        &self,
        receive_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<TaskActivityWorkItem>, ProviderError> {
        let deadline = Instant::now() + receive_timeout;
        loop {
            if let Some(item) = self.try_lock_activity().await {
                return Ok(Some(item));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    async fn renew_task_activity_work_item_lock(
        &self,
        work_item: &TaskActivityWorkItem,
    ) -> Result<Option<DateTime<Utc>>, ProviderError> {
        let mut store = self.inner.store.lock().await;
        match store.locked_activities.get_mut(&work_item.id) {
            Some(item) => {
                let until = expiry(Utc::now(), self.inner.options.lock_timeout);
                item.locked_until = Some(until);
                Ok(Some(until))
            }
            None => Ok(None),
        }
    }

    async fn complete_task_activity_work_item(
        &self,
        work_item: &TaskActivityWorkItem,
        response: TaskMessage,
    ) -> Result<(), ProviderError> {
        let mut store = self.inner.store.lock().await;
        if store.locked_activities.remove(&work_item.id).is_none() {
            return Err(ProviderError::permanent(
                "complete_task_activity_work_item",
                format!("activity work item {} is not locked", work_item.id),
            ));
        }
        store.enqueue(response, Utc::now());
        Ok(())
    }

    async fn abandon_task_activity_work_item(&self, work_item: &TaskActivityWorkItem) -> Result<(), ProviderError> {
        let mut store = self.inner.store.lock().await;
        if let Some(mut item) = store.locked_activities.remove(&work_item.id) {
            item.locked_until = None;
            store.activities.push_front(item);
        }
        Ok(())
    }
}

#[async_trait]
impl EntityOrchestrationService for InMemoryOrchestrationService {
    fn entity_backend_properties(&self) -> EntityBackendProperties {
        self.inner.options.entity_properties.clone()
    }

    async fn lock_next_entity_work_item(
        &self,
        receive_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<TaskOrchestrationWorkItem>, ProviderError> {
        self.lock_instance(true, receive_timeout, cancel).await
    }
}

fn snapshot(record: &InstanceRecord) -> Option<OrchestrationState> {
    let runtime_state = OrchestrationRuntimeState::new(record.history.clone());
    let started = runtime_state.execution_started()?;
    Some(OrchestrationState {
        orchestration_instance: started.orchestration_instance.clone(),
        name: started.name.clone(),
        version: started.version.clone(),
        status: runtime_state.status(),
        input: started.input.clone(),
        output: runtime_state.output().map(str::to_string),
        custom_status: record.custom_status.clone(),
        failure_details: runtime_state.failure_details().cloned(),
        created_time: runtime_state.created_time(),
        last_updated_time: record.last_updated,
    })
}

#[async_trait]
impl OrchestrationServiceClient for InMemoryOrchestrationService {
    async fn create_task_orchestration(&self, creation_message: TaskMessage) -> Result<(), ProviderError> {
        if !matches!(creation_message.event.kind, EventKind::ExecutionStarted(_)) {
            return Err(ProviderError::permanent(
                "create_task_orchestration",
                format!("expected ExecutionStarted, got {}", creation_message.event.kind.type_name()),
            ));
        }
        let instance_id = creation_message.orchestration_instance.instance_id.clone();
        let mut store = self.inner.store.lock().await;
        let running = store
            .instances
            .get(&instance_id)
            .and_then(snapshot)
            .is_some_and(|s| !s.status.is_terminal());
        let pending_start = store.pending.get(&instance_id).is_some_and(|queue| {
            queue
                .iter()
                .any(|m| matches!(m.message.event.kind, EventKind::ExecutionStarted(_)))
        });
        if running || pending_start {
            return Err(ProviderError::permanent(
                "create_task_orchestration",
                format!("an orchestration with instance id '{instance_id}' already exists"),
            ));
        }
        store.enqueue(creation_message, Utc::now());
        Ok(())
    }

    async fn send_task_orchestration_message(&self, message: TaskMessage) -> Result<(), ProviderError> {
        self.inner.store.lock().await.enqueue(message, Utc::now());
        Ok(())
    }

    async fn get_orchestration_state(&self, instance_id: &str) -> Result<Option<OrchestrationState>, ProviderError> {
        let store = self.inner.store.lock().await;
        Ok(store.instances.get(instance_id).and_then(snapshot))
    }

    /// Returns the state once it is terminal, or `None` if `timeout` elapses first.
    async fn wait_for_orchestration(
        &self,
        instance_id: &str,
        timeout: Duration,
    ) -> Result<Option<OrchestrationState>, ProviderError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(state) = self.get_orchestration_state(instance_id).await? {
                if state.status.is_terminal() {
                    return Ok(Some(state));
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}
