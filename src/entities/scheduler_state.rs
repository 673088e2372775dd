use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::entities::{MessageSorter, RequestMessage};

/// Persisted scheduling state of one entity.
///
/// Carried from batch to batch as the input of the entity's next execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "SchedulerStateRecord", into = "SchedulerStateRecord")]
pub struct SchedulerState {
    pub entity_state: Option<String>,
    pub queue: VecDeque<RequestMessage>,
    /// Instance id of the orchestration holding this entity's lock.
    pub locked_by: Option<String>,
    /// Set while a self-continue is outstanding; no work is dequeued until it arrives.
    pub suspended: bool,
    pub message_sorter: MessageSorter,
}

#[derive(Serialize, Deserialize)]
struct SchedulerStateRecord {
    #[serde(rename = "exists", default)]
    exists: bool,
    #[serde(rename = "state", default, skip_serializing_if = "Option::is_none")]
    state: Option<String>,
    #[serde(rename = "queue", default, skip_serializing_if = "VecDeque::is_empty")]
    queue: VecDeque<RequestMessage>,
    #[serde(rename = "lockedBy", default, skip_serializing_if = "Option::is_none")]
    locked_by: Option<String>,
    #[serde(rename = "suspended", default)]
    suspended: bool,
    #[serde(rename = "sorter", default)]
    sorter: MessageSorter,
}

impl From<SchedulerStateRecord> for SchedulerState {
    fn from(r: SchedulerStateRecord) -> Self {
        Self {
            entity_state: r.state,
            queue: r.queue,
            locked_by: r.locked_by,
            suspended: r.suspended,
            message_sorter: r.sorter,
        }
    }
}

impl From<SchedulerState> for SchedulerStateRecord {
    fn from(s: SchedulerState) -> Self {
        Self {
            exists: s.entity_exists(),
            state: s.entity_state,
            queue: s.queue,
            locked_by: s.locked_by,
            suspended: s.suspended,
            sorter: s.message_sorter,
        }
    }
}

impl SchedulerState {
    pub fn entity_exists(&self) -> bool {
        self.entity_state.is_some()
    }

    /// No state, no queued or buffered work, and no lock holder.
    pub fn is_empty(&self) -> bool {
        !self.entity_exists()
            && self.queue.is_empty()
            && self.locked_by.is_none()
            && self.message_sorter.buffered_count() == 0
    }

    pub fn enqueue(&mut self, message: RequestMessage) {
        self.queue.push_back(message);
    }

    /// Puts `messages` back at the front of the queue, keeping their relative order.
    pub fn put_back(&mut self, messages: impl IntoIterator<Item = RequestMessage>) {
        let messages: Vec<RequestMessage> = messages.into_iter().collect();
        for message in messages.into_iter().rev() {
            self.queue.push_front(message);
        }
    }

    /// While locked, only the lock holder's messages may be dequeued.
    pub fn may_dequeue(&self) -> bool {
        match (self.queue.front(), &self.locked_by) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(next), Some(holder)) => next.parent_instance_id.as_deref() == Some(holder.as_str()),
        }
    }

    pub fn peek(&self) -> Option<&RequestMessage> {
        self.queue.front()
    }

    pub fn dequeue(&mut self) -> Option<RequestMessage> {
        self.queue.pop_front()
    }
}
