/// Backend error with retry classification.
///
/// Backends return this error type to indicate whether an operation may succeed on retry.
/// Dispatchers feed it to the backend's backoff policy and abandon the work item.
///
/// **Retryable**: busy store, lost connection, lock contention, timeouts.
///
/// **Permanent**: missing instance, stale lock token, corrupt record, duplicate creation.
///
/// ```rust
/// use durable_task_core::providers::ProviderError;
///
/// let busy = ProviderError::retryable("lock_next_task_activity_work_item", "store is busy");
/// assert!(busy.is_retryable());
///
/// let stale = ProviderError::permanent("complete_task_activity_work_item", "lock token is unknown");
/// assert!(!stale.is_retryable());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    /// Backend operation that failed (e.g. "complete_task_orchestration_work_item")
    pub operation: String,
    pub message: String,
    pub retryable: bool,
}

impl ProviderError {
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for ProviderError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_classification() {
        let retryable = ProviderError::retryable("lock_next_entity_work_item", "store is busy");
        assert!(retryable.is_retryable());
        assert_eq!(retryable.operation, "lock_next_entity_work_item");

        let permanent = ProviderError::permanent("create_task_orchestration", "instance already exists");
        assert!(!permanent.is_retryable());

        let display = format!("{permanent}");
        assert!(display.contains("create_task_orchestration"));
        assert!(display.contains("already exists"));

        let _err: Box<dyn std::error::Error> = Box::new(permanent);
    }

    #[test]
    fn test_provider_error_equality() {
        let err1 = ProviderError::retryable("op", "msg");
        let err2 = ProviderError::retryable("op", "msg");
        let err3 = ProviderError::permanent("op", "msg");

        assert_eq!(err1, err2);
        assert_ne!(err1, err3);
    }
}
