//! The lock chain visits entities in their total order, one at a time.
#![allow(clippy::unwrap_used)]

use chrono::Utc;
use proptest::prelude::*;
use std::time::Duration;
use uuid::Uuid;

use durable_task_core::entities::{
    EntityBatchResult, EntityScheduler, OrchestrationEntityContext, ResponseMessage, response_event_name,
};
use durable_task_core::history::{EventKind, TaskMessage};
use durable_task_core::providers::EntityBackendProperties;
use durable_task_core::{EntityId, OrchestrationRuntimeState};

fn scheduler() -> EntityScheduler {
    EntityScheduler::new(EntityBackendProperties {
        entity_message_reorder_window: Duration::ZERO,
        ..Default::default()
    })
}

/// Delivers `message` to its entity, runs one empty batch, and returns what the entity sent on.
fn deliver(s: &EntityScheduler, message: &TaskMessage) -> (EntityId, Option<String>, Vec<TaskMessage>) {
    let entity: EntityId = message.orchestration_instance.instance_id.parse().unwrap();
    let mut history = OrchestrationRuntimeState::default();
    history.add_event(message.event.clone());
    let now = Utc::now();
    let (mut state, mut work) = s.determine_work(&history, now).unwrap();
    assert!(work.lock_request().is_some());
    let sent = s
        .apply_batch_result(&entity, &mut state, &mut work, EntityBatchResult::default(), now)
        .unwrap();
    (entity, state.locked_by, sent)
}

fn entity_ids() -> impl Strategy<Value = Vec<EntityId>> {
    prop::collection::vec(
        (prop::sample::select(vec!["Account", "inventory", "ledger", "B"]), 0u8..6),
        1..8,
    )
    .prop_map(|pairs| pairs.into_iter().map(|(name, key)| EntityId::new(name, key.to_string())).collect())
}

proptest! {
    #[test]
    fn chain_visits_each_entity_once_in_sorted_order(requested in entity_ids()) {
        let s = scheduler();
        let mut orchestration = OrchestrationEntityContext::new("orch", "exec");
        let section = Uuid::new_v4();
        let acquire = orchestration
            .emit_acquire_message(section, &requested, Utc::now(), Duration::ZERO)
            .unwrap()
            .into_task_message(Utc::now())
            .unwrap();

        let mut expected = requested.clone();
        expected.sort();
        expected.dedup();

        let mut visited = Vec::new();
        let mut in_flight = acquire;
        let final_response = loop {
            let (entity, locked_by, sent) = deliver(&s, &in_flight);
            prop_assert_eq!(locked_by.as_deref(), Some("orch"));
            visited.push(entity);
            prop_assert_eq!(sent.len(), 1);
            let next = sent.into_iter().next().unwrap();
            if next.orchestration_instance.instance_id == "orch" {
                break next;
            }
            in_flight = next;
        };

        prop_assert_eq!(&visited, &expected);
        let EventKind::EventRaised { name, input } = &final_response.event.kind else {
            panic!("expected a response event");
        };
        prop_assert_eq!(name, &response_event_name(&section));
        let response: ResponseMessage = serde_json::from_str(input.as_deref().unwrap()).unwrap();
        prop_assert!(response.is_lock_acquisition());
        prop_assert!(orchestration.complete_acquire(&response, section));
        prop_assert!(!orchestration.complete_acquire(&response, section));
        prop_assert_eq!(orchestration.available_entities().count(), expected.len());
    }
}

#[test]
fn entity_order_is_by_name_then_key() {
    let mut ids = vec![
        EntityId::new("b", "1"),
        EntityId::new("a", "2"),
        EntityId::new("a", "10"),
        EntityId::new("A", "1"),
    ];
    ids.sort();
    let rendered: Vec<String> = ids.iter().map(EntityId::instance_id).collect();
    assert_eq!(rendered, vec!["@a@1", "@a@10", "@a@2", "@b@1"]);
}
