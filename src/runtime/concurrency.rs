use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Counting semaphore whose acquire never waits: it either takes a slot or reports failure.
///
/// The entity dispatcher uses one to cap how many work items may hold an extended session at
/// once, so long-lived sessions cannot take over the whole concurrency budget.
#[derive(Debug, Clone)]
pub struct NonBlockingCountdownLock {
    slots: Arc<Semaphore>,
    capacity: usize,
}

impl NonBlockingCountdownLock {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Lock sized to half of `max_concurrent_work_items`, rounded up.
    pub fn for_extended_sessions(max_concurrent_work_items: usize) -> Self {
        Self::new(max_concurrent_work_items.div_ceil(2))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Takes a slot if one is free. The slot is returned when the permit drops.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.slots).try_acquire_owned().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_half_rounded_up() {
        assert_eq!(NonBlockingCountdownLock::for_extended_sessions(5).capacity(), 3);
        assert_eq!(NonBlockingCountdownLock::for_extended_sessions(4).capacity(), 2);
        assert_eq!(NonBlockingCountdownLock::for_extended_sessions(0).capacity(), 0);
        assert!(NonBlockingCountdownLock::for_extended_sessions(0).try_acquire().is_none());
    }

    #[test]
    fn acquire_fails_when_exhausted_and_recovers_on_drop() {
        let lock = NonBlockingCountdownLock::new(2);
        let a = lock.try_acquire();
        let b = lock.try_acquire();
        assert!(a.is_some() && b.is_some());
        assert!(lock.try_acquire().is_none());
        drop(a);
        assert_eq!(lock.available(), 1);
        assert!(lock.try_acquire().is_some());
    }

    #[test]
    fn clones_share_slots() {
        let lock = NonBlockingCountdownLock::new(1);
        let other = lock.clone();
        let held = lock.try_acquire();
        assert!(held.is_some());
        assert!(other.try_acquire().is_none());
        drop(held);
        assert!(other.try_acquire().is_some());
    }
}
