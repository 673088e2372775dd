//! In-memory view of one orchestration execution's history.

use chrono::{DateTime, Utc};

use crate::error::FailureDetails;
use crate::history::{
    EventKind, ExecutionStartedEvent, HistoryEvent, OrchestrationInstance, OrchestrationStatus, ParentInstance,
};

/// History of the current execution, split into already-persisted and new events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrchestrationRuntimeState {
    past_events: Vec<HistoryEvent>,
    new_events: Vec<HistoryEvent>,
}

impl OrchestrationRuntimeState {
    pub fn new(past_events: Vec<HistoryEvent>) -> Self {
        Self {
            past_events,
            new_events: Vec::new(),
        }
    }

    pub fn add_event(&mut self, event: HistoryEvent) {
        self.new_events.push(event);
    }

    pub fn past_events(&self) -> &[HistoryEvent] {
        &self.past_events
    }

    pub fn new_events(&self) -> &[HistoryEvent] {
        &self.new_events
    }

    /// All events, past first.
    pub fn events(&self) -> impl DoubleEndedIterator<Item = &HistoryEvent> {
        self.past_events.iter().chain(self.new_events.iter())
    }

    /// Consumes the state and returns the full history.
    pub fn into_events(self) -> Vec<HistoryEvent> {
        let mut all = self.past_events;
        all.extend(self.new_events);
        all
    }

    /// The last `ExecutionStarted` event, if any.
    pub fn execution_started(&self) -> Option<&ExecutionStartedEvent> {
        self.events().rev().find_map(|e| match &e.kind {
            EventKind::ExecutionStarted(started) => Some(started),
            _ => None,
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.execution_started().map(|s| s.name.as_str())
    }

    pub fn version(&self) -> Option<&str> {
        self.execution_started().map(|s| s.version.as_str())
    }

    pub fn input(&self) -> Option<&str> {
        self.execution_started().and_then(|s| s.input.as_deref())
    }

    pub fn orchestration_instance(&self) -> Option<&OrchestrationInstance> {
        self.execution_started().map(|s| &s.orchestration_instance)
    }

    pub fn parent_instance(&self) -> Option<&ParentInstance> {
        self.execution_started().and_then(|s| s.parent_instance.as_ref())
    }

    pub fn created_time(&self) -> Option<DateTime<Utc>> {
        self.events()
            .find(|e| matches!(e.kind, EventKind::ExecutionStarted(_)))
            .map(|e| e.timestamp)
    }

    fn completion(&self) -> Option<&HistoryEvent> {
        self.events()
            .rev()
            .find(|e| matches!(e.kind, EventKind::ExecutionCompleted { .. }))
    }

    pub fn completed_time(&self) -> Option<DateTime<Utc>> {
        self.completion().map(|e| e.timestamp)
    }

    pub fn status(&self) -> OrchestrationStatus {
        if let Some(HistoryEvent {
            kind: EventKind::ExecutionCompleted { status, .. },
            ..
        }) = self.completion()
        {
            return *status;
        }
        if self.execution_started().is_none() {
            return OrchestrationStatus::Pending;
        }
        let suspended = self.events().fold(false, |acc, e| match e.kind {
            EventKind::ExecutionSuspended { .. } => true,
            EventKind::ExecutionResumed { .. } => false,
            _ => acc,
        });
        if suspended {
            OrchestrationStatus::Suspended
        } else {
            OrchestrationStatus::Running
        }
    }

    pub fn output(&self) -> Option<&str> {
        match self.completion().map(|e| &e.kind) {
            Some(EventKind::ExecutionCompleted { result, .. }) => result.as_deref(),
            _ => None,
        }
    }

    pub fn failure_details(&self) -> Option<&FailureDetails> {
        match self.completion().map(|e| &e.kind) {
            Some(EventKind::ExecutionCompleted { failure_details, .. }) => failure_details.as_ref(),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.status(),
            OrchestrationStatus::Running | OrchestrationStatus::Suspended
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn started() -> HistoryEvent {
        started_with("42")
    }

    fn started_with(input: &str) -> HistoryEvent {
        HistoryEvent::unsequenced(
            Utc::now(),
            EventKind::ExecutionStarted(ExecutionStartedEvent {
                name: "Orch".to_string(),
                version: "1".to_string(),
                input: Some(input.to_string()),
                orchestration_instance: OrchestrationInstance::new("i", "e"),
                parent_instance: None,
                tags: BTreeMap::new(),
            }),
        )
    }

    #[test]
    fn status_follows_history() {
        let mut state = OrchestrationRuntimeState::new(vec![]);
        assert_eq!(state.status(), OrchestrationStatus::Pending);

        state.add_event(started());
        assert_eq!(state.status(), OrchestrationStatus::Running);
        assert_eq!(state.name(), Some("Orch"));
        assert_eq!(state.input(), Some("42"));

        state.add_event(HistoryEvent::unsequenced(
            Utc::now(),
            EventKind::ExecutionSuspended { reason: None },
        ));
        assert_eq!(state.status(), OrchestrationStatus::Suspended);
        assert!(state.is_running());

        state.add_event(HistoryEvent::unsequenced(
            Utc::now(),
            EventKind::ExecutionCompleted {
                status: OrchestrationStatus::Completed,
                result: Some("\"done\"".to_string()),
                failure_details: None,
            },
        ));
        assert_eq!(state.status(), OrchestrationStatus::Completed);
        assert_eq!(state.output(), Some("\"done\""));
        assert!(!state.is_running());
        assert_eq!(state.into_events().len(), 3);
    }

    #[test]
    fn latest_started_and_completion_win_across_past_and_new_events() {
        let failed = |msg: &str| {
            HistoryEvent::unsequenced(
                Utc::now(),
                EventKind::ExecutionCompleted {
                    status: OrchestrationStatus::Failed,
                    result: None,
                    failure_details: Some(FailureDetails::new("Boom", msg)),
                },
            )
        };
        let mut state = OrchestrationRuntimeState::new(vec![started_with("first"), failed("old")]);
        state.add_event(started_with("second"));
        state.add_event(failed("new"));

        assert_eq!(state.input(), Some("second"));
        assert_eq!(state.status(), OrchestrationStatus::Failed);
        assert_eq!(
            state.failure_details().map(|d| d.error_message.as_str()),
            Some("new")
        );
        assert_eq!(state.events().rev().count(), 4);
    }
}
