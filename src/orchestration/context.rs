//! The context handed to orchestration code.
//!
//! Every call that produces an awaitable takes the next sequence id from a single counter and
//! records an [`OrchestratorAction`] under it. The executor matches those actions against
//! history while replaying and resolves the awaitables as completion events arrive.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use crate::codec::{DataConverter, JsonDataConverter};
use crate::entities::{EntityId, EntityMessageEvent, OrchestrationEntityContext, response_event_name};
use crate::error::TaskError;
use crate::history::{HistoryEvent, OrchestrationInstance, ParentInstance};
use crate::orchestration::actions::OrchestratorAction;
use crate::orchestration::futures::{
    CriticalSection, DurableFuture, EntityCallFuture, ExternalEventFuture, LockFuture, TimerHandle,
};
use crate::orchestration::retry::{RetryInterceptor, RetryOptions};
use crate::providers::EntityBackendProperties;

/// Namespace for deterministic orchestration GUIDs.
const GUID_NAMESPACE: Uuid = Uuid::from_u128(0x9e952958_5e33_4daf_827f_2fa12937b875);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenTaskKind {
    Task,
    SubOrchestration,
    Timer,
}

/// An awaitable that has been scheduled and not yet resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenTaskInfo {
    pub name: String,
    pub version: String,
    pub kind: OpenTaskKind,
}

#[derive(Debug, Clone)]
pub(crate) enum Completion {
    Value(Option<String>),
    Failed(TaskError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ContinueAsNewRequest {
    pub(crate) version: Option<String>,
    pub(crate) input: Option<String>,
    pub(crate) preserve_unprocessed_events: bool,
}

pub(crate) struct ContextState {
    pub(crate) instance: OrchestrationInstance,
    pub(crate) name: String,
    pub(crate) version: String,
    pub(crate) parent: Option<ParentInstance>,
    id_counter: i32,
    pub(crate) actions: BTreeMap<i32, OrchestratorAction>,
    pub(crate) open_tasks: HashMap<i32, OpenTaskInfo>,
    pub(crate) completions: HashMap<i32, Completion>,
    pub(crate) current_utc: DateTime<Utc>,
    pub(crate) is_replaying: bool,
    pub(crate) continue_as_new: Option<ContinueAsNewRequest>,
    pub(crate) carryover_events: Vec<HistoryEvent>,
    pub(crate) custom_status: Option<String>,
    guid_counter: u64,
    next_waiter_id: u64,
    /// Waiters in registration order.
    external_waiters: Vec<(String, u64)>,
    /// Raised events nobody waited for yet, in arrival order.
    external_buffer: Vec<(String, Option<String>)>,
    pub(crate) external_delivered: HashMap<u64, Option<String>>,
    pub(crate) entity_context: OrchestrationEntityContext,
    /// Response event name of each outstanding entity call, mapped to its target.
    pub(crate) pending_entity_calls: HashMap<String, EntityId>,
    pub(crate) entity_properties: EntityBackendProperties,
}

impl ContextState {
    fn new(instance: OrchestrationInstance, entity_properties: EntityBackendProperties) -> Self {
        let entity_context = OrchestrationEntityContext::new(instance.instance_id.clone(), instance.execution_id.clone());
        Self {
            instance,
            name: String::new(),
            version: String::new(),
            parent: None,
            id_counter: 0,
            actions: BTreeMap::new(),
            open_tasks: HashMap::new(),
            completions: HashMap::new(),
            current_utc: DateTime::<Utc>::UNIX_EPOCH,
            is_replaying: false,
            continue_as_new: None,
            carryover_events: Vec::new(),
            custom_status: None,
            guid_counter: 0,
            next_waiter_id: 0,
            external_waiters: Vec::new(),
            external_buffer: Vec::new(),
            external_delivered: HashMap::new(),
            entity_context,
            pending_entity_calls: HashMap::new(),
            entity_properties,
        }
    }

    pub(crate) fn next_id(&mut self) -> i32 {
        let id = self.id_counter;
        self.id_counter += 1;
        id
    }

    fn new_guid(&mut self) -> Uuid {
        let name = format!(
            "{}_{}_{}",
            self.instance.instance_id,
            self.current_utc.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            self.guid_counter
        );
        self.guid_counter += 1;
        Uuid::new_v5(&GUID_NAMESPACE, name.as_bytes())
    }

    pub(crate) fn set_instance(&mut self, instance: OrchestrationInstance) {
        self.entity_context =
            OrchestrationEntityContext::new(instance.instance_id.clone(), instance.execution_id.clone());
        self.instance = instance;
    }

    fn register_waiter(&mut self, name: String) -> u64 {
        let waiter = self.next_waiter_id;
        self.next_waiter_id += 1;
        match self.external_buffer.iter().position(|(n, _)| *n == name) {
            Some(pos) => {
                let (_, input) = self.external_buffer.remove(pos);
                self.external_delivered.insert(waiter, input);
            }
            None => self.external_waiters.push((name, waiter)),
        }
        waiter
    }

    /// Hands a raised event to the oldest waiter for its name, or buffers it.
    pub(crate) fn deliver_event(&mut self, name: &str, input: Option<String>) {
        match self.external_waiters.iter().position(|(n, _)| n == name) {
            Some(pos) => {
                let (_, waiter) = self.external_waiters.remove(pos);
                self.external_delivered.insert(waiter, input);
            }
            None => self.external_buffer.push((name.to_string(), input)),
        }
    }

    /// Raised events that were never consumed, in arrival order.
    pub(crate) fn take_unconsumed_events(&mut self) -> Vec<(String, Option<String>)> {
        std::mem::take(&mut self.external_buffer)
    }

    pub(crate) fn push_entity_event(&mut self, event: EntityMessageEvent) -> Result<(), TaskError> {
        let event_data = event.message.to_json()?;
        let id = self.next_id();
        self.actions.insert(
            id,
            OrchestratorAction::SendEvent {
                id,
                instance: event.target,
                event_name: event.event_name,
                event_data,
            },
        );
        Ok(())
    }

    /// Emits release messages for a critical section that is still held.
    pub(crate) fn release_locks(&mut self) -> Result<(), TaskError> {
        for event in self.entity_context.emit_lock_release_messages() {
            self.push_entity_event(event)?;
        }
        Ok(())
    }
}

/// Handle used by orchestration code to schedule durable work.
///
/// Cloning is cheap; all clones share the execution's state.
#[derive(Clone)]
pub struct OrchestrationContext {
    pub(crate) inner: Arc<Mutex<ContextState>>,
}

impl OrchestrationContext {
    pub(crate) fn new(instance: OrchestrationInstance, entity_properties: EntityBackendProperties) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ContextState::new(instance, entity_properties))),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, ContextState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn instance_id(&self) -> String {
        self.state().instance.instance_id.clone()
    }

    pub fn execution_id(&self) -> String {
        self.state().instance.execution_id.clone()
    }

    pub fn orchestration_instance(&self) -> OrchestrationInstance {
        self.state().instance.clone()
    }

    pub fn name(&self) -> String {
        self.state().name.clone()
    }

    pub fn version(&self) -> String {
        self.state().version.clone()
    }

    pub fn parent_instance(&self) -> Option<ParentInstance> {
        self.state().parent.clone()
    }

    /// True while the context re-executes code against already-persisted history.
    pub fn is_replaying(&self) -> bool {
        self.state().is_replaying
    }

    /// Logical time: the timestamp of the latest `OrchestratorStarted` event.
    pub fn current_utc_date_time(&self) -> DateTime<Utc> {
        self.state().current_utc
    }

    /// A GUID that is identical on every replay.
    pub fn new_guid(&self) -> Uuid {
        self.state().new_guid()
    }

    pub fn set_custom_status(&self, status: Option<String>) {
        self.state().custom_status = status;
    }

    pub fn schedule_task(&self, name: impl Into<String>, version: impl Into<String>, input: Option<String>) -> DurableFuture {
        let (name, version) = (name.into(), version.into());
        let mut s = self.state();
        let id = s.next_id();
        s.actions.insert(
            id,
            OrchestratorAction::ScheduleTask {
                id,
                name: name.clone(),
                version: version.clone(),
                input,
            },
        );
        s.open_tasks.insert(
            id,
            OpenTaskInfo {
                name,
                version,
                kind: OpenTaskKind::Task,
            },
        );
        DurableFuture::pending(self.clone(), id)
    }

    /// Schedules an activity with a serialized input and decodes its output.
    pub fn schedule_task_typed<I, O>(
        &self,
        name: impl Into<String>,
        version: impl Into<String>,
        input: &I,
    ) -> impl Future<Output = Result<O, TaskError>> + Send + 'static
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        let scheduled = JsonDataConverter
            .serialize(input)
            .map(|encoded| self.schedule_task(name, version, Some(encoded)));
        async move { decode_output(scheduled?.await?) }
    }

    /// Schedules an activity and retries it according to `options`, using durable timers
    /// between attempts.
    pub fn schedule_task_with_retry(
        &self,
        name: impl Into<String>,
        version: impl Into<String>,
        input: Option<String>,
        options: RetryOptions,
    ) -> impl Future<Output = Result<Option<String>, TaskError>> + Send + 'static {
        let ctx = self.clone();
        let (name, version) = (name.into(), version.into());
        async move {
            RetryInterceptor::new(ctx.clone(), options)
                .invoke(|| ctx.schedule_task(name.clone(), version.clone(), input.clone()))
                .await
        }
    }

    /// Starts a sub-orchestration. Without an explicit instance id, one is derived from this
    /// execution and the sequence id.
    pub fn create_sub_orchestration(
        &self,
        name: impl Into<String>,
        version: impl Into<String>,
        instance_id: Option<String>,
        input: Option<String>,
    ) -> DurableFuture {
        let (name, version) = (name.into(), version.into());
        let mut s = self.state();
        if let Err(msg) = s.entity_context.validate_suborchestration_transition() {
            return DurableFuture::failed(TaskError::LockingRulesViolation(msg));
        }
        let id = s.next_id();
        let instance_id = instance_id.unwrap_or_else(|| format!("{}:{id}", s.instance.execution_id));
        s.actions.insert(
            id,
            OrchestratorAction::CreateSubOrchestration {
                id,
                name: name.clone(),
                version: version.clone(),
                instance_id,
                input,
            },
        );
        s.open_tasks.insert(
            id,
            OpenTaskInfo {
                name,
                version,
                kind: OpenTaskKind::SubOrchestration,
            },
        );
        DurableFuture::pending(self.clone(), id)
    }

    pub fn create_sub_orchestration_with_retry(
        &self,
        name: impl Into<String>,
        version: impl Into<String>,
        instance_id: Option<String>,
        input: Option<String>,
        options: RetryOptions,
    ) -> impl Future<Output = Result<Option<String>, TaskError>> + Send + 'static {
        let ctx = self.clone();
        let (name, version) = (name.into(), version.into());
        async move {
            RetryInterceptor::new(ctx.clone(), options)
                .invoke(|| ctx.create_sub_orchestration(name.clone(), version.clone(), instance_id.clone(), input.clone()))
                .await
        }
    }

    pub fn create_timer(&self, fire_at: DateTime<Utc>) -> TimerHandle {
        let mut s = self.state();
        let id = s.next_id();
        s.actions.insert(id, OrchestratorAction::CreateTimer { id, fire_at });
        s.open_tasks.insert(
            id,
            OpenTaskInfo {
                name: String::new(),
                version: String::new(),
                kind: OpenTaskKind::Timer,
            },
        );
        TimerHandle::new(self.clone(), id)
    }

    /// Raises an event on another instance. Fire and forget.
    pub fn send_event(&self, instance: OrchestrationInstance, event_name: impl Into<String>, event_data: Option<String>) {
        let mut s = self.state();
        let id = s.next_id();
        s.actions.insert(
            id,
            OrchestratorAction::SendEvent {
                id,
                instance,
                event_name: event_name.into(),
                event_data,
            },
        );
    }

    /// Waits for the next event raised with `name`. Waiters on the same name are served in the
    /// order they were created; events raised with no waiter are kept until one appears.
    pub fn wait_for_external_event(&self, name: impl Into<String>) -> ExternalEventFuture {
        let waiter = self.state().register_waiter(name.into());
        ExternalEventFuture::new(self.clone(), waiter)
    }

    pub fn continue_as_new(&self, input: Option<String>) {
        self.continue_as_new_with(None, input, true);
    }

    /// Restarts the instance with fresh history once the orchestration function returns.
    /// With `preserve_unprocessed_events`, raised events not yet consumed are carried into the
    /// next generation.
    pub fn continue_as_new_with(&self, version: Option<String>, input: Option<String>, preserve_unprocessed_events: bool) {
        self.state().continue_as_new = Some(ContinueAsNewRequest {
            version,
            input,
            preserve_unprocessed_events,
        });
    }

    /// Calls an entity operation and waits for its result.
    pub fn call_entity(&self, target: &EntityId, operation: &str, input: Option<String>) -> EntityCallFuture {
        let mut s = self.state();
        if let Err(msg) = s.entity_context.validate_operation_transition(target, false) {
            return EntityCallFuture::failed(TaskError::LockingRulesViolation(msg));
        }
        let request_id = s.new_guid();
        let (now, window) = (s.current_utc, s.entity_properties.entity_message_reorder_window);
        let event = s
            .entity_context
            .emit_request_message(target, operation, false, request_id, None, input, now, window);
        if let Err(e) = s.push_entity_event(event) {
            return EntityCallFuture::failed(e);
        }
        let response_name = response_event_name(&request_id);
        s.pending_entity_calls.insert(response_name.clone(), target.clone());
        let waiter = s.register_waiter(response_name);
        EntityCallFuture::pending(self.clone(), waiter)
    }

    /// Sends a one-way operation to an entity.
    pub fn signal_entity(&self, target: &EntityId, operation: &str, input: Option<String>) -> Result<(), TaskError> {
        self.signal(target, operation, input, None)
    }

    /// Sends a one-way operation to be delivered at `scheduled_time`.
    pub fn signal_entity_at(
        &self,
        target: &EntityId,
        operation: &str,
        input: Option<String>,
        scheduled_time: DateTime<Utc>,
    ) -> Result<(), TaskError> {
        self.signal(target, operation, input, Some(scheduled_time))
    }

    fn signal(
        &self,
        target: &EntityId,
        operation: &str,
        input: Option<String>,
        scheduled_time: Option<DateTime<Utc>>,
    ) -> Result<(), TaskError> {
        let mut s = self.state();
        s.entity_context
            .validate_operation_transition(target, true)
            .map_err(TaskError::LockingRulesViolation)?;
        let request_id = s.new_guid();
        let (now, window) = (s.current_utc, s.entity_properties.entity_message_reorder_window);
        let scheduled = scheduled_time.map(|t| (t, s.entity_properties.capped_delivery_time(now, t)));
        let event = s
            .entity_context
            .emit_request_message(target, operation, true, request_id, scheduled, input, now, window);
        s.push_entity_event(event)
    }

    /// Acquires locks on `entities` and enters a critical section once all are held.
    pub fn lock_entities(&self, entities: &[EntityId]) -> LockFuture {
        let mut s = self.state();
        let section_id = s.new_guid();
        let (now, window) = (s.current_utc, s.entity_properties.entity_message_reorder_window);
        let event = match s.entity_context.emit_acquire_message(section_id, entities, now, window) {
            Ok(event) => event,
            Err(msg) => return LockFuture::failed(TaskError::LockingRulesViolation(msg)),
        };
        if let Err(e) = s.push_entity_event(event) {
            return LockFuture::failed(e);
        }
        let waiter = s.register_waiter(response_event_name(&section_id));
        LockFuture::pending(self.clone(), waiter)
    }

    pub fn is_inside_critical_section(&self) -> bool {
        self.state().entity_context.is_inside_critical_section()
    }

    /// Locked entities that may be called right now.
    pub fn available_entities(&self) -> Vec<EntityId> {
        self.state().entity_context.available_entities().cloned().collect()
    }

    pub(crate) fn release_critical_section(&self) -> Result<(), TaskError> {
        self.state().release_locks()
    }

    pub(crate) fn critical_section(&self) -> CriticalSection {
        CriticalSection::new(self.clone())
    }
}

/// Decodes an awaited payload; an absent payload decodes as JSON `null`.
pub(crate) fn decode_output<O: DeserializeOwned>(raw: Option<String>) -> Result<O, TaskError> {
    Ok(JsonDataConverter.deserialize(raw.as_deref().unwrap_or("null"))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> OrchestrationContext {
        OrchestrationContext::new(OrchestrationInstance::new("orch", "e1"), EntityBackendProperties::default())
    }

    #[test]
    fn sequence_ids_are_shared_across_action_kinds() {
        let ctx = ctx();
        let _a = ctx.schedule_task("A", "", None);
        let _t = ctx.create_timer(Utc::now());
        ctx.send_event(OrchestrationInstance::new("other", ""), "ping", None);
        let _s = ctx.create_sub_orchestration("Child", "", None, None);

        let s = ctx.state();
        let ids: Vec<i32> = s.actions.keys().copied().collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert_eq!(s.open_tasks.len(), 3);
        match &s.actions[&3] {
            OrchestratorAction::CreateSubOrchestration { instance_id, .. } => assert_eq!(instance_id, "e1:3"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn guids_are_deterministic() {
        let a = ctx();
        let b = ctx();
        assert_eq!(a.new_guid(), b.new_guid());
        assert_ne!(a.new_guid(), a.new_guid());
    }

    #[test]
    fn external_events_are_buffered_until_waited_for() {
        let ctx = ctx();
        ctx.state().deliver_event("approve", Some("1".to_string()));
        ctx.state().deliver_event("approve", Some("2".to_string()));

        let first = ctx.wait_for_external_event("approve");
        let second = ctx.wait_for_external_event("approve");
        let third = ctx.wait_for_external_event("approve");
        ctx.state().deliver_event("approve", Some("3".to_string()));

        let s = ctx.state();
        assert_eq!(s.external_delivered.get(&first.waiter_id()), Some(&Some("1".to_string())));
        assert_eq!(s.external_delivered.get(&second.waiter_id()), Some(&Some("2".to_string())));
        assert_eq!(s.external_delivered.get(&third.waiter_id()), Some(&Some("3".to_string())));
    }

    #[test]
    fn suborchestration_is_rejected_inside_critical_section() {
        let ctx = ctx();
        let _lock = ctx.lock_entities(&[EntityId::new("account", "1")]);
        assert!(ctx.is_inside_critical_section());
        let before = ctx.state().actions.len();
        let _sub = ctx.create_sub_orchestration("Child", "", None, None);
        assert_eq!(ctx.state().actions.len(), before);
    }
}
