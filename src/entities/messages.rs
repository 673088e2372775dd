//! Entity wire protocol.
//!
//! Entity traffic rides on `EventRaised` history events. The event name says what the payload
//! is: `op` (or `op@<due time>`) for requests, `release` for lock releases, `continue` for the
//! self-continue signal, and the request id for responses sent back to callers.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::CodecError;
use crate::entities::EntityId;
use crate::error::FailureDetails;
use crate::history::{HistoryEvent, OrchestrationInstance, TaskMessage};

pub const REQUEST_EVENT_NAME: &str = "op";
pub const RELEASE_EVENT_NAME: &str = "release";
pub const CONTINUE_EVENT_NAME: &str = "continue";

/// Event name for a request, carrying its delivery time when scheduled.
pub fn request_event_name(scheduled_time: Option<DateTime<Utc>>) -> String {
    match scheduled_time {
        None => REQUEST_EVENT_NAME.to_string(),
        Some(t) => format!("{REQUEST_EVENT_NAME}@{}", t.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
    }
}

pub fn response_event_name(request_id: &Uuid) -> String {
    request_id.to_string()
}

pub fn is_request_event(name: &str) -> bool {
    name.starts_with(REQUEST_EVENT_NAME)
}

pub fn is_release_event(name: &str) -> bool {
    name == RELEASE_EVENT_NAME
}

/// Delivery time encoded in a scheduled request's event name.
pub fn scheduled_time_from_event_name(name: &str) -> Option<DateTime<Utc>> {
    let raw = name.strip_prefix(REQUEST_EVENT_NAME)?.strip_prefix('@')?;
    DateTime::parse_from_rfc3339(raw).ok().map(|t| t.with_timezone(&Utc))
}

/// Operation or lock request sent to an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMessage {
    #[serde(rename = "op", default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(rename = "signal", default)]
    pub is_signal: bool,
    #[serde(rename = "input", default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(rename = "id")]
    pub id: Uuid,
    #[serde(rename = "parent", default, skip_serializing_if = "Option::is_none")]
    pub parent_instance_id: Option<String>,
    #[serde(rename = "parentExecution", default, skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<String>,
    #[serde(rename = "due", default, skip_serializing_if = "Option::is_none")]
    pub scheduled_time: Option<DateTime<Utc>>,
    /// Ordering label assigned by the sender's message sorter.
    #[serde(rename = "timestamp", default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Label of the previous message from the same sender to the same entity.
    #[serde(rename = "predecessor", default, skip_serializing_if = "Option::is_none")]
    pub predecessor: Option<DateTime<Utc>>,
    #[serde(rename = "lockset", default, skip_serializing_if = "Option::is_none")]
    pub lock_set: Option<Vec<EntityId>>,
    #[serde(rename = "pos", default)]
    pub position: usize,
}

impl RequestMessage {
    pub fn operation(id: Uuid, operation: impl Into<String>, is_signal: bool, input: Option<String>) -> Self {
        Self {
            operation: Some(operation.into()),
            is_signal,
            input,
            id,
            parent_instance_id: None,
            parent_execution_id: None,
            scheduled_time: None,
            timestamp: None,
            predecessor: None,
            lock_set: None,
            position: 0,
        }
    }

    /// Lock request for `lock_set`, which must already be sorted and duplicate-free.
    pub fn lock(id: Uuid, lock_set: Vec<EntityId>) -> Self {
        Self {
            operation: None,
            is_signal: false,
            input: None,
            id,
            parent_instance_id: None,
            parent_execution_id: None,
            scheduled_time: None,
            timestamp: None,
            predecessor: None,
            lock_set: Some(lock_set),
            position: 0,
        }
    }

    pub fn is_lock_request(&self) -> bool {
        self.lock_set.is_some()
    }

    pub fn to_json(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Outcome of an entity call, or the final acknowledgement of a lock chain.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResponseMessage {
    #[serde(rename = "result", default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(rename = "exceptionType", default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(rename = "failureDetails", default, skip_serializing_if = "Option::is_none")]
    pub failure_details: Option<FailureDetails>,
}

impl ResponseMessage {
    pub const LOCK_ACQUISITION_COMPLETION: &'static str = "Lock Acquisition Completed";

    pub fn lock_acquired() -> Self {
        Self {
            result: Some(Self::LOCK_ACQUISITION_COMPLETION.to_string()),
            ..Default::default()
        }
    }

    pub fn is_error_result(&self) -> bool {
        self.error_message.is_some() || self.failure_details.is_some()
    }

    pub fn is_lock_acquisition(&self) -> bool {
        self.result.as_deref() == Some(Self::LOCK_ACQUISITION_COMPLETION)
    }
}

/// Lock release sent by the holder when it leaves its critical section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseMessage {
    #[serde(rename = "parent")]
    pub parent_instance_id: String,
    #[serde(rename = "id")]
    pub id: String,
}

/// Summary written as the custom status of an entity instance after each batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityStatus {
    #[serde(rename = "entityExists")]
    pub entity_exists: bool,
    #[serde(rename = "queueSize")]
    pub backlog_queue_size: usize,
    #[serde(rename = "lockedBy", default, skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,
}

/// Payload carried by an outgoing entity event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityMessage {
    Request(RequestMessage),
    Release(ReleaseMessage),
    Response(ResponseMessage),
    /// Self-continue signal; carries no payload.
    Continue,
}

impl EntityMessage {
    pub fn to_json(&self) -> Result<Option<String>, CodecError> {
        Ok(match self {
            EntityMessage::Request(m) => Some(serde_json::to_string(m)?),
            EntityMessage::Release(m) => Some(serde_json::to_string(m)?),
            EntityMessage::Response(m) => Some(serde_json::to_string(m)?),
            EntityMessage::Continue => None,
        })
    }
}

/// An entity message ready to be sent as an `EventRaised` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityMessageEvent {
    pub event_name: String,
    pub message: EntityMessage,
    pub target: OrchestrationInstance,
}

impl EntityMessageEvent {
    /// The `EventRaised` message delivering this event to its target.
    pub fn into_task_message(self, timestamp: DateTime<Utc>) -> Result<TaskMessage, CodecError> {
        let input = self.message.to_json()?;
        Ok(TaskMessage::new(
            HistoryEvent::event_raised(timestamp, self.event_name, input),
            self.target,
        ))
    }
}
