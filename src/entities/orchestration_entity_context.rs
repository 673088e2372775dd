//! Entity bookkeeping on the orchestration side: outgoing message labeling and the
//! critical-section state machine.
//!
//! A critical section goes through three states:
//! 1. pending: the lock request was sent, no entity may be called yet;
//! 2. held: every locked entity is available, and calling one takes it out of the available
//!    set until its response arrives;
//! 3. released: release messages went out and the state is cleared.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

use crate::entities::{
    EntityId, EntityMessage, EntityMessageEvent, MessageSorter, RELEASE_EVENT_NAME, ReleaseMessage, RequestMessage,
    ResponseMessage, request_event_name,
};
use crate::history::OrchestrationInstance;

#[derive(Debug, Clone, Default)]
pub struct OrchestrationEntityContext {
    instance_id: String,
    execution_id: String,
    message_sorter: MessageSorter,
    lock_acquisition_pending: bool,
    critical_section_id: Option<Uuid>,
    critical_section_locks: Vec<EntityId>,
    available_locks: BTreeSet<EntityId>,
}

impl OrchestrationEntityContext {
    pub fn new(instance_id: impl Into<String>, execution_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            execution_id: execution_id.into(),
            ..Default::default()
        }
    }

    pub fn is_inside_critical_section(&self) -> bool {
        self.critical_section_id.is_some()
    }

    pub fn is_lock_acquisition_pending(&self) -> bool {
        self.lock_acquisition_pending
    }

    pub fn critical_section_id(&self) -> Option<Uuid> {
        self.critical_section_id
    }

    pub fn critical_section_locks(&self) -> &[EntityId] {
        &self.critical_section_locks
    }

    /// Locked entities that can be called right now.
    pub fn available_entities(&self) -> impl Iterator<Item = &EntityId> {
        self.available_locks.iter()
    }

    pub fn validate_suborchestration_transition(&self) -> Result<(), String> {
        if self.is_inside_critical_section() {
            return Err("While holding locks, cannot call suborchestrators.".to_string());
        }
        Ok(())
    }

    /// Checks a call or signal against the critical-section rules. A permitted call takes
    /// `target` out of the available set.
    pub fn validate_operation_transition(&mut self, target: &EntityId, one_way: bool) -> Result<(), String> {
        if !self.is_inside_critical_section() {
            return Ok(());
        }
        if one_way {
            if self.critical_section_locks.contains(target) {
                return Err("Must not signal a locked entity from a critical section.".to_string());
            }
            return Ok(());
        }
        if self.available_locks.remove(target) {
            return Ok(());
        }
        let message = if self.lock_acquisition_pending {
            "Must await the completion of the lock request prior to calling any entity."
        } else if self.critical_section_locks.contains(target) {
            "Must not call an entity from a critical section while a prior call to the same entity is still pending."
        } else {
            "Must not call an entity from a critical section if it is not one of the locked entities."
        };
        Err(message.to_string())
    }

    pub fn validate_acquire_transition(&self) -> Result<(), String> {
        if self.is_inside_critical_section() {
            return Err("Must not enter another critical section from within a critical section.".to_string());
        }
        Ok(())
    }

    /// Makes `target` available again once the response to a call arrived.
    pub fn recover_lock_after_call(&mut self, target: &EntityId) {
        if self.is_inside_critical_section() && self.critical_section_locks.contains(target) {
            self.available_locks.insert(target.clone());
        }
    }

    /// Release messages for every locked entity. Leaves the critical section.
    pub fn emit_lock_release_messages(&mut self) -> Vec<EntityMessageEvent> {
        let Some(section) = self.critical_section_id.take() else {
            return Vec::new();
        };
        let events = self
            .critical_section_locks
            .iter()
            .map(|entity| EntityMessageEvent {
                event_name: RELEASE_EVENT_NAME.to_string(),
                message: EntityMessage::Release(ReleaseMessage {
                    parent_instance_id: self.instance_id.clone(),
                    id: section.to_string(),
                }),
                target: OrchestrationInstance::new(entity.instance_id(), ""),
            })
            .collect();
        self.critical_section_locks.clear();
        self.available_locks.clear();
        self.lock_acquisition_pending = false;
        events
    }

    /// Builds an operation request to `target`.
    ///
    /// `scheduled_time` is `(requested, capped)`: the message carries the requested time and the
    /// event name the capped one, so the entity reschedules if it receives the message early.
    /// Unscheduled messages are labeled for in-order delivery.
    #[allow(clippy::too_many_arguments)]
    pub fn emit_request_message(
        &mut self,
        target: &EntityId,
        operation: &str,
        one_way: bool,
        operation_id: Uuid,
        scheduled_time: Option<(DateTime<Utc>, DateTime<Utc>)>,
        input: Option<String>,
        now: DateTime<Utc>,
        reorder_window: Duration,
    ) -> EntityMessageEvent {
        let mut request = RequestMessage::operation(operation_id, operation, one_way, input);
        request.parent_instance_id = Some(self.instance_id.clone());
        request.parent_execution_id = Some(self.execution_id.clone());
        request.scheduled_time = scheduled_time.map(|(original, _)| original);

        let event_name = self.adjust_outgoing_message(target, &mut request, scheduled_time, now, reorder_window);
        EntityMessageEvent {
            event_name,
            message: EntityMessage::Request(request),
            target: OrchestrationInstance::new(target.instance_id(), ""),
        }
    }

    /// Enters a critical section over `entities` by sending the lock request to the first
    /// entity in lock order.
    pub fn emit_acquire_message(
        &mut self,
        lock_request_id: Uuid,
        entities: &[EntityId],
        now: DateTime<Utc>,
        reorder_window: Duration,
    ) -> Result<EntityMessageEvent, String> {
        self.validate_acquire_transition()?;
        let mut lock_set: Vec<EntityId> = entities.to_vec();
        lock_set.sort();
        lock_set.dedup();
        let Some(first) = lock_set.first().cloned() else {
            return Err("The list of entities to lock must not be empty.".to_string());
        };

        let mut request = RequestMessage::lock(lock_request_id, lock_set.clone());
        request.parent_instance_id = Some(self.instance_id.clone());
        request.parent_execution_id = Some(self.execution_id.clone());
        let event_name = self.adjust_outgoing_message(&first, &mut request, None, now, reorder_window);

        self.critical_section_id = Some(lock_request_id);
        self.critical_section_locks = lock_set;
        self.available_locks.clear();
        self.lock_acquisition_pending = true;

        Ok(EntityMessageEvent {
            event_name,
            message: EntityMessage::Request(request),
            target: OrchestrationInstance::new(first.instance_id(), ""),
        })
    }

    /// Applies the final lock-chain response. Returns `false` (and changes nothing) for a
    /// response that does not belong to a pending acquisition, such as a redelivered one.
    pub fn complete_acquire(&mut self, response: &ResponseMessage, critical_section_id: Uuid) -> bool {
        if !self.lock_acquisition_pending || self.critical_section_id != Some(critical_section_id) {
            return false;
        }
        if response.is_error_result() {
            return false;
        }
        self.available_locks = self.critical_section_locks.iter().cloned().collect();
        self.lock_acquisition_pending = false;
        true
    }

    fn adjust_outgoing_message(
        &mut self,
        target: &EntityId,
        request: &mut RequestMessage,
        scheduled_time: Option<(DateTime<Utc>, DateTime<Utc>)>,
        now: DateTime<Utc>,
        reorder_window: Duration,
    ) -> String {
        match scheduled_time {
            Some((_, capped)) => request_event_name(Some(capped)),
            None => {
                self.message_sorter
                    .label_outgoing_message(request, &target.instance_id(), now, reorder_window);
                request_event_name(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(30);

    fn ctx() -> OrchestrationEntityContext {
        OrchestrationEntityContext::new("orch", "exec-1")
    }

    fn request(event: &EntityMessageEvent) -> &RequestMessage {
        match &event.message {
            EntityMessage::Request(r) => r,
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn acquire_sorts_dedups_and_targets_first_entity() {
        let mut ctx = ctx();
        let id = Uuid::new_v4();
        let event = ctx
            .emit_acquire_message(
                id,
                &[EntityId::new("b", "1"), EntityId::new("a", "2"), EntityId::new("b", "1")],
                Utc::now(),
                WINDOW,
            )
            .unwrap();

        assert_eq!(event.target.instance_id, "@a@2");
        assert_eq!(event.event_name, "op");
        let req = request(&event);
        assert_eq!(req.position, 0);
        assert_eq!(
            req.lock_set.as_deref(),
            Some(&[EntityId::new("a", "2"), EntityId::new("b", "1")][..])
        );
        assert_eq!(req.parent_instance_id.as_deref(), Some("orch"));
        assert!(ctx.is_inside_critical_section());
        assert!(ctx.is_lock_acquisition_pending());
    }

    #[test]
    fn empty_lock_set_is_rejected() {
        let mut ctx = ctx();
        assert!(ctx.emit_acquire_message(Uuid::new_v4(), &[], Utc::now(), WINDOW).is_err());
        assert!(!ctx.is_inside_critical_section());
    }

    #[test]
    fn calls_inside_critical_section_follow_lock_rules() {
        let mut ctx = ctx();
        let a = EntityId::new("a", "1");
        let b = EntityId::new("b", "1");
        let outsider = EntityId::new("c", "1");
        let id = Uuid::new_v4();
        ctx.emit_acquire_message(id, &[a.clone(), b.clone()], Utc::now(), WINDOW).unwrap();

        let err = ctx.validate_operation_transition(&a, false).unwrap_err();
        assert!(err.contains("Must await the completion of the lock request"));

        assert!(ctx.complete_acquire(&ResponseMessage::lock_acquired(), id));
        assert_eq!(ctx.available_entities().count(), 2);

        ctx.validate_operation_transition(&a, false).unwrap();
        let err = ctx.validate_operation_transition(&a, false).unwrap_err();
        assert!(err.contains("prior call to the same entity is still pending"));
        let err = ctx.validate_operation_transition(&outsider, false).unwrap_err();
        assert!(err.contains("not one of the locked entities"));
        let err = ctx.validate_operation_transition(&b, true).unwrap_err();
        assert!(err.contains("Must not signal a locked entity"));
        ctx.validate_operation_transition(&outsider, true).unwrap();

        ctx.recover_lock_after_call(&a);
        ctx.validate_operation_transition(&a, false).unwrap();

        assert!(ctx.validate_suborchestration_transition().is_err());
        assert!(ctx.validate_acquire_transition().is_err());
    }

    #[test]
    fn duplicate_acquire_response_is_ignored() {
        let mut ctx = ctx();
        let a = EntityId::new("a", "1");
        let id = Uuid::new_v4();
        ctx.emit_acquire_message(id, &[a.clone()], Utc::now(), WINDOW).unwrap();
        assert!(ctx.complete_acquire(&ResponseMessage::lock_acquired(), id));
        ctx.validate_operation_transition(&a, false).unwrap();

        assert!(!ctx.complete_acquire(&ResponseMessage::lock_acquired(), id));
        assert_eq!(ctx.available_entities().count(), 0);
    }

    #[test]
    fn release_targets_every_lock_and_clears_section() {
        let mut ctx = ctx();
        let id = Uuid::new_v4();
        ctx.emit_acquire_message(id, &[EntityId::new("a", "1"), EntityId::new("b", "2")], Utc::now(), WINDOW)
            .unwrap();
        ctx.complete_acquire(&ResponseMessage::lock_acquired(), id);

        let releases = ctx.emit_lock_release_messages();
        assert_eq!(releases.len(), 2);
        assert!(releases.iter().all(|e| e.event_name == RELEASE_EVENT_NAME));
        match &releases[0].message {
            EntityMessage::Release(r) => {
                assert_eq!(r.parent_instance_id, "orch");
                assert_eq!(r.id, id.to_string());
            }
            other => panic!("expected release, got {other:?}"),
        }
        assert!(!ctx.is_inside_critical_section());
        assert!(ctx.emit_lock_release_messages().is_empty());
    }

    #[test]
    fn scheduled_requests_use_capped_event_name_and_skip_labeling() {
        let mut ctx = ctx();
        let now = Utc::now();
        let requested = now + chrono::Duration::hours(3);
        let capped = now + chrono::Duration::hours(1);
        let event = ctx.emit_request_message(
            &EntityId::new("a", "1"),
            "ping",
            true,
            Uuid::new_v4(),
            Some((requested, capped)),
            None,
            now,
            WINDOW,
        );
        assert_eq!(event.event_name, request_event_name(Some(capped)));
        let req = request(&event);
        assert_eq!(req.scheduled_time, Some(requested));
        assert!(req.timestamp.is_none());

        let plain = ctx.emit_request_message(&EntityId::new("a", "1"), "ping", true, Uuid::new_v4(), None, None, now, WINDOW);
        assert_eq!(plain.event_name, "op");
        assert!(request(&plain).timestamp.is_some());
    }
}
