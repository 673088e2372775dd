//! Awaitables returned by [`OrchestrationContext`].
//!
//! None of these register a waker. The executor polls the orchestration once after every
//! history event, so a future only needs to check whether its slot has been resolved.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::entities::ResponseMessage;
use crate::error::{FailureDetails, TaskError};
use crate::orchestration::context::{Completion, OrchestrationContext};

/// Resolves when the task, sub-orchestration, or timer scheduled under `id` completes.
pub struct DurableFuture {
    state: DurableState,
}

enum DurableState {
    Pending { ctx: OrchestrationContext, id: i32 },
    Failed(Option<TaskError>),
}

impl DurableFuture {
    pub(crate) fn pending(ctx: OrchestrationContext, id: i32) -> Self {
        Self {
            state: DurableState::Pending { ctx, id },
        }
    }

    pub(crate) fn failed(error: TaskError) -> Self {
        Self {
            state: DurableState::Failed(Some(error)),
        }
    }

    /// Sequence id of the scheduled action, if one was scheduled.
    pub fn sequence_id(&self) -> Option<i32> {
        match &self.state {
            DurableState::Pending { id, .. } => Some(*id),
            DurableState::Failed(_) => None,
        }
    }
}

impl Future for DurableFuture {
    type Output = Result<Option<String>, TaskError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            DurableState::Pending { ctx, id } => match ctx.state().completions.remove(id) {
                Some(Completion::Value(v)) => Poll::Ready(Ok(v)),
                Some(Completion::Failed(e)) => Poll::Ready(Err(e)),
                None => Poll::Pending,
            },
            DurableState::Failed(err) => Poll::Ready(Err(err.take().unwrap_or(TaskError::Canceled))),
        }
    }
}

/// A durable timer. Resolves with `Ok(())` when it fires, or `Err(TaskError::Canceled)` after
/// [`TimerHandle::cancel`].
pub struct TimerHandle {
    ctx: OrchestrationContext,
    id: i32,
}

impl TimerHandle {
    pub(crate) fn new(ctx: OrchestrationContext, id: i32) -> Self {
        Self { ctx, id }
    }

    pub fn sequence_id(&self) -> i32 {
        self.id
    }

    /// Stops waiting for the timer. The timer itself stays in history.
    pub fn cancel(&self) {
        let mut s = self.ctx.state();
        if s.open_tasks.remove(&self.id).is_some() {
            s.completions.insert(self.id, Completion::Failed(TaskError::Canceled));
        }
    }
}

impl Future for TimerHandle {
    type Output = Result<(), TaskError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.ctx.state().completions.remove(&self.id) {
            Some(Completion::Value(_)) => Poll::Ready(Ok(())),
            Some(Completion::Failed(e)) => Poll::Ready(Err(e)),
            None => Poll::Pending,
        }
    }
}

/// Resolves with the payload of the raised event assigned to this waiter.
pub struct ExternalEventFuture {
    ctx: OrchestrationContext,
    waiter: u64,
}

impl ExternalEventFuture {
    pub(crate) fn new(ctx: OrchestrationContext, waiter: u64) -> Self {
        Self { ctx, waiter }
    }

    pub fn waiter_id(&self) -> u64 {
        self.waiter
    }
}

impl Future for ExternalEventFuture {
    type Output = Option<String>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.ctx.state().external_delivered.remove(&self.waiter) {
            Some(input) => Poll::Ready(input),
            None => Poll::Pending,
        }
    }
}

fn parse_response(payload: Option<String>) -> Result<ResponseMessage, TaskError> {
    serde_json::from_str(payload.as_deref().unwrap_or_default()).map_err(|e| TaskError::Codec(e.to_string()))
}

fn response_failure(response: ResponseMessage) -> TaskError {
    let details = response.failure_details.unwrap_or_else(|| {
        FailureDetails::new(
            response.error_message.unwrap_or_else(|| "EntityOperationFailed".to_string()),
            response.result.unwrap_or_default(),
        )
    });
    TaskError::EntityOperationFailed(details)
}

/// Resolves with the result of an entity call.
pub struct EntityCallFuture {
    waiter: Result<ExternalEventFuture, Option<TaskError>>,
}

impl EntityCallFuture {
    pub(crate) fn pending(ctx: OrchestrationContext, waiter: u64) -> Self {
        Self {
            waiter: Ok(ExternalEventFuture::new(ctx, waiter)),
        }
    }

    pub(crate) fn failed(error: TaskError) -> Self {
        Self { waiter: Err(Some(error)) }
    }
}

impl Future for EntityCallFuture {
    type Output = Result<Option<String>, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.waiter {
            Ok(waiter) => match Pin::new(waiter).poll(cx) {
                Poll::Ready(payload) => Poll::Ready(parse_response(payload).and_then(|response| {
                    if response.is_error_result() {
                        Err(response_failure(response))
                    } else {
                        Ok(response.result)
                    }
                })),
                Poll::Pending => Poll::Pending,
            },
            Err(err) => Poll::Ready(Err(err.take().unwrap_or(TaskError::Canceled))),
        }
    }
}

/// Resolves once every requested entity is locked.
pub struct LockFuture {
    ctx: Option<OrchestrationContext>,
    waiter: Result<ExternalEventFuture, Option<TaskError>>,
}

impl LockFuture {
    pub(crate) fn pending(ctx: OrchestrationContext, waiter: u64) -> Self {
        Self {
            ctx: Some(ctx.clone()),
            waiter: Ok(ExternalEventFuture::new(ctx, waiter)),
        }
    }

    pub(crate) fn failed(error: TaskError) -> Self {
        Self {
            ctx: None,
            waiter: Err(Some(error)),
        }
    }
}

impl Future for LockFuture {
    type Output = Result<CriticalSection, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.waiter {
            Ok(waiter) => match Pin::new(waiter).poll(cx) {
                Poll::Ready(payload) => {
                    let response = match parse_response(payload) {
                        Ok(r) => r,
                        Err(e) => return Poll::Ready(Err(e)),
                    };
                    if response.is_error_result() {
                        return Poll::Ready(Err(response_failure(response)));
                    }
                    match this.ctx.take() {
                        Some(ctx) => Poll::Ready(Ok(ctx.critical_section())),
                        None => Poll::Ready(Err(TaskError::Canceled)),
                    }
                }
                Poll::Pending => Poll::Pending,
            },
            Err(err) => Poll::Ready(Err(err.take().unwrap_or(TaskError::Canceled))),
        }
    }
}

/// Held locks. Released by [`CriticalSection::release`], or automatically when the
/// orchestration completes.
pub struct CriticalSection {
    ctx: OrchestrationContext,
}

impl CriticalSection {
    pub(crate) fn new(ctx: OrchestrationContext) -> Self {
        Self { ctx }
    }

    pub fn release(self) -> Result<(), TaskError> {
        self.ctx.release_critical_section()
    }
}
