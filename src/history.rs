//! Persisted history model.
//!
//! History is append-only. Sequenced events (`TaskScheduled`, `TimerCreated`,
//! `SubOrchestrationInstanceCreated`, `EventSent`) carry the sequence id the orchestration
//! assigned when it produced the matching action; every other event uses `-1`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::FailureDetails;

/// Event id used by events that are not correlated to an orchestrator action.
pub const UNSEQUENCED_EVENT_ID: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrchestrationInstance {
    #[serde(rename = "InstanceId")]
    pub instance_id: String,
    #[serde(rename = "ExecutionId", default)]
    pub execution_id: String,
}

impl OrchestrationInstance {
    pub fn new(instance_id: impl Into<String>, execution_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            execution_id: execution_id.into(),
        }
    }

    /// Instance with a freshly generated execution id.
    pub fn new_execution(instance_id: impl Into<String>) -> Self {
        Self::new(instance_id, uuid::Uuid::new_v4().simple().to_string())
    }
}

impl fmt::Display for OrchestrationInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.instance_id, self.execution_id)
    }
}

/// Parent of a sub-orchestration, used to route its completion back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentInstance {
    pub name: String,
    pub version: String,
    pub orchestration_instance: OrchestrationInstance,
    pub task_scheduled_id: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrchestrationStatus {
    Running,
    Completed,
    ContinuedAsNew,
    Failed,
    Canceled,
    Terminated,
    Pending,
    Suspended,
}

impl OrchestrationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Completed
                | OrchestrationStatus::Failed
                | OrchestrationStatus::Canceled
                | OrchestrationStatus::Terminated
        )
    }
}

impl fmt::Display for OrchestrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrchestrationStatus::Running => "Running",
            OrchestrationStatus::Completed => "Completed",
            OrchestrationStatus::ContinuedAsNew => "ContinuedAsNew",
            OrchestrationStatus::Failed => "Failed",
            OrchestrationStatus::Canceled => "Canceled",
            OrchestrationStatus::Terminated => "Terminated",
            OrchestrationStatus::Pending => "Pending",
            OrchestrationStatus::Suspended => "Suspended",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStartedEvent {
    pub name: String,
    pub version: String,
    pub input: Option<String>,
    pub orchestration_instance: OrchestrationInstance,
    pub parent_instance: Option<ParentInstance>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

/// Closed set of history event kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "EventType")]
pub enum EventKind {
    OrchestratorStarted,
    OrchestratorCompleted,
    ExecutionStarted(ExecutionStartedEvent),
    ExecutionCompleted {
        status: OrchestrationStatus,
        result: Option<String>,
        failure_details: Option<FailureDetails>,
    },
    ExecutionTerminated {
        input: Option<String>,
    },
    ExecutionSuspended {
        reason: Option<String>,
    },
    ExecutionResumed {
        reason: Option<String>,
    },
    TaskScheduled {
        name: String,
        version: String,
        input: Option<String>,
    },
    TaskCompleted {
        task_scheduled_id: i32,
        result: Option<String>,
    },
    TaskFailed {
        task_scheduled_id: i32,
        reason: Option<String>,
        details: Option<String>,
        failure_details: Option<FailureDetails>,
    },
    SubOrchestrationInstanceCreated {
        name: String,
        version: String,
        instance_id: String,
        input: Option<String>,
    },
    SubOrchestrationInstanceCompleted {
        task_scheduled_id: i32,
        result: Option<String>,
    },
    SubOrchestrationInstanceFailed {
        task_scheduled_id: i32,
        reason: Option<String>,
        details: Option<String>,
        failure_details: Option<FailureDetails>,
    },
    TimerCreated {
        fire_at: DateTime<Utc>,
    },
    TimerFired {
        timer_id: i32,
        fire_at: DateTime<Utc>,
    },
    EventSent {
        instance_id: String,
        name: String,
        input: Option<String>,
    },
    EventRaised {
        name: String,
        input: Option<String>,
    },
}

impl EventKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            EventKind::OrchestratorStarted => "OrchestratorStarted",
            EventKind::OrchestratorCompleted => "OrchestratorCompleted",
            EventKind::ExecutionStarted(_) => "ExecutionStarted",
            EventKind::ExecutionCompleted { .. } => "ExecutionCompleted",
            EventKind::ExecutionTerminated { .. } => "ExecutionTerminated",
            EventKind::ExecutionSuspended { .. } => "ExecutionSuspended",
            EventKind::ExecutionResumed { .. } => "ExecutionResumed",
            EventKind::TaskScheduled { .. } => "TaskScheduled",
            EventKind::TaskCompleted { .. } => "TaskCompleted",
            EventKind::TaskFailed { .. } => "TaskFailed",
            EventKind::SubOrchestrationInstanceCreated { .. } => "SubOrchestrationInstanceCreated",
            EventKind::SubOrchestrationInstanceCompleted { .. } => "SubOrchestrationInstanceCompleted",
            EventKind::SubOrchestrationInstanceFailed { .. } => "SubOrchestrationInstanceFailed",
            EventKind::TimerCreated { .. } => "TimerCreated",
            EventKind::TimerFired { .. } => "TimerFired",
            EventKind::EventSent { .. } => "EventSent",
            EventKind::EventRaised { .. } => "EventRaised",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEvent {
    #[serde(rename = "EventId")]
    pub event_id: i32,
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl HistoryEvent {
    pub fn new(event_id: i32, timestamp: DateTime<Utc>, kind: EventKind) -> Self {
        Self {
            event_id,
            timestamp,
            kind,
        }
    }

    /// An unsequenced event stamped with `timestamp`.
    pub fn unsequenced(timestamp: DateTime<Utc>, kind: EventKind) -> Self {
        Self::new(UNSEQUENCED_EVENT_ID, timestamp, kind)
    }

    pub fn orchestrator_started(timestamp: DateTime<Utc>) -> Self {
        Self::unsequenced(timestamp, EventKind::OrchestratorStarted)
    }

    pub fn event_raised(timestamp: DateTime<Utc>, name: impl Into<String>, input: Option<String>) -> Self {
        Self::unsequenced(
            timestamp,
            EventKind::EventRaised {
                name: name.into(),
                input,
            },
        )
    }
}

/// A history event addressed to an orchestration or entity instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub event: HistoryEvent,
    pub orchestration_instance: OrchestrationInstance,
}

impl TaskMessage {
    pub fn new(event: HistoryEvent, orchestration_instance: OrchestrationInstance) -> Self {
        Self {
            event,
            orchestration_instance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_kind_tag() {
        let ev = HistoryEvent::new(
            4,
            Utc::now(),
            EventKind::TaskScheduled {
                name: "Greet".to_string(),
                version: String::new(),
                input: Some("\"x\"".to_string()),
            },
        );
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["EventType"], "TaskScheduled");
        assert_eq!(json["EventId"], 4);
        let back: HistoryEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn terminal_statuses() {
        assert!(OrchestrationStatus::Completed.is_terminal());
        assert!(OrchestrationStatus::Terminated.is_terminal());
        assert!(!OrchestrationStatus::ContinuedAsNew.is_terminal());
        assert!(!OrchestrationStatus::Suspended.is_terminal());
    }
}
