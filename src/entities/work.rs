use crate::entities::{OperationRequest, RequestMessage, SchedulerState};

/// The work selected for one entity batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Work {
    operations: Vec<RequestMessage>,
    lock_request: Option<RequestMessage>,
    to_be_rescheduled: Vec<RequestMessage>,
    suspend_and_continue: bool,
}

impl Work {
    pub fn add_operation(&mut self, request: RequestMessage) {
        self.operations.push(request);
    }

    pub fn add_lock_request(&mut self, request: RequestMessage) {
        debug_assert!(self.lock_request.is_none());
        self.lock_request = Some(request);
    }

    /// Records a scheduled message that arrived before its due time.
    pub fn add_message_to_be_rescheduled(&mut self, request: RequestMessage) {
        self.to_be_rescheduled.push(request);
    }

    /// Suspends the scheduler until a self-continue message arrives.
    pub fn to_be_continued(&mut self, scheduler_state: &mut SchedulerState) {
        if !scheduler_state.suspended {
            self.suspend_and_continue = true;
            scheduler_state.suspended = true;
        }
    }

    /// Splits off every operation from `index` on, plus the lock request, for requeueing.
    pub fn remove_deferred_work(&mut self, index: usize) -> Vec<RequestMessage> {
        let index = index.min(self.operations.len());
        let mut deferred: Vec<RequestMessage> = self.operations.drain(index..).collect();
        if let Some(lock) = self.lock_request.take() {
            deferred.push(lock);
        }
        deferred
    }

    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }

    pub fn operations(&self) -> &[RequestMessage] {
        &self.operations
    }

    pub fn lock_request(&self) -> Option<&RequestMessage> {
        self.lock_request.as_ref()
    }

    pub fn take_lock_request(&mut self) -> Option<RequestMessage> {
        self.lock_request.take()
    }

    pub fn to_be_rescheduled(&self) -> &[RequestMessage] {
        &self.to_be_rescheduled
    }

    pub fn suspend_and_continue(&self) -> bool {
        self.suspend_and_continue
    }

    pub fn operation_requests(&self) -> Vec<OperationRequest> {
        self.operations
            .iter()
            .map(|m| OperationRequest {
                operation: m.operation.clone().unwrap_or_default(),
                id: m.id,
                input: m.input.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::EntityId;
    use uuid::Uuid;

    #[test]
    fn deferred_work_includes_tail_and_lock_request() {
        let mut work = Work::default();
        for name in ["a", "b", "c"] {
            work.add_operation(RequestMessage::operation(Uuid::new_v4(), name, true, None));
        }
        work.add_lock_request(RequestMessage::lock(Uuid::new_v4(), vec![EntityId::new("e", "1")]));

        let deferred = work.remove_deferred_work(1);
        assert_eq!(work.operation_count(), 1);
        assert!(work.lock_request().is_none());
        assert_eq!(deferred.len(), 3);
        assert!(deferred[2].is_lock_request());
    }

    #[test]
    fn to_be_continued_suspends_once() {
        let mut work = Work::default();
        let mut state = SchedulerState::default();
        work.to_be_continued(&mut state);
        assert!(state.suspended);
        assert!(work.suspend_and_continue());

        let mut second = Work::default();
        second.to_be_continued(&mut state);
        assert!(!second.suspend_and_continue());
    }
}
