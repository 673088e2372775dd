use crate::error::FailureDetails;
use crate::history::{HistoryEvent, OrchestrationInstance, OrchestrationStatus};
use chrono::{DateTime, Utc};

/// Intent produced by orchestration code during one turn, keyed by sequence id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorAction {
    ScheduleTask {
        id: i32,
        name: String,
        version: String,
        input: Option<String>,
    },
    CreateTimer {
        id: i32,
        fire_at: DateTime<Utc>,
    },
    CreateSubOrchestration {
        id: i32,
        name: String,
        version: String,
        instance_id: String,
        input: Option<String>,
    },
    SendEvent {
        id: i32,
        instance: OrchestrationInstance,
        event_name: String,
        event_data: Option<String>,
    },
    OrchestrationComplete(OrchestrationCompleteAction),
}

impl OrchestratorAction {
    pub fn id(&self) -> i32 {
        match self {
            OrchestratorAction::ScheduleTask { id, .. }
            | OrchestratorAction::CreateTimer { id, .. }
            | OrchestratorAction::CreateSubOrchestration { id, .. }
            | OrchestratorAction::SendEvent { id, .. } => *id,
            OrchestratorAction::OrchestrationComplete(c) => c.id,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            OrchestratorAction::ScheduleTask { .. } => "ScheduleTask",
            OrchestratorAction::CreateTimer { .. } => "CreateTimer",
            OrchestratorAction::CreateSubOrchestration { .. } => "CreateSubOrchestration",
            OrchestratorAction::SendEvent { .. } => "SendEvent",
            OrchestratorAction::OrchestrationComplete(_) => "OrchestrationComplete",
        }
    }
}

/// Terminal action of an execution.
///
/// `ContinuedAsNew` carries the next generation's input in `result`, its version in
/// `new_version`, and the events to replay into it in `carryover_events`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestrationCompleteAction {
    pub id: i32,
    pub status: OrchestrationStatus,
    pub result: Option<String>,
    pub details: Option<String>,
    pub failure_details: Option<FailureDetails>,
    pub new_version: Option<String>,
    pub carryover_events: Vec<HistoryEvent>,
}

impl OrchestrationCompleteAction {
    pub fn new(id: i32, status: OrchestrationStatus, result: Option<String>) -> Self {
        Self {
            id,
            status,
            result,
            details: None,
            failure_details: None,
            new_version: None,
            carryover_events: Vec::new(),
        }
    }
}
