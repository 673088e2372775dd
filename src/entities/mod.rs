//! Durable entities: addressing, the entity message protocol, per-entity scheduling, and the
//! cross-entity locking protocol used by orchestrations.

mod entity_id;
mod message_sorter;
mod messages;
mod orchestration_entity_context;
mod scheduler;
mod scheduler_state;
mod task_entity;
mod work;

pub use entity_id::{EntityId, EntityIdParseError, is_entity_instance};
pub use message_sorter::{MIN_INTERVAL_BETWEEN_COLLECTIONS, MessageSorter};
pub use messages::{
    CONTINUE_EVENT_NAME, EntityMessage, EntityMessageEvent, EntityStatus, RELEASE_EVENT_NAME, REQUEST_EVENT_NAME,
    ReleaseMessage, RequestMessage, ResponseMessage, is_release_event, is_request_event, request_event_name,
    response_event_name, scheduled_time_from_event_name,
};
pub use orchestration_entity_context::OrchestrationEntityContext;
pub use scheduler::{EntityBatchOutcome, EntityScheduler, entity_type_not_found};
pub use scheduler_state::SchedulerState;
pub use task_entity::{
    EntityBatchRequest, EntityBatchResult, EntityContext, FnEntity, OperationAction, OperationRequest, OperationResult,
    TaskEntity,
};
pub use work::Work;
