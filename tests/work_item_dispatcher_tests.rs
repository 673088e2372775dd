//! Fetch/process loop behavior under a paused clock.
#![allow(clippy::unwrap_used)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use durable_task_core::DispatchError;
use durable_task_core::runtime::WorkItemDispatcher;
use durable_task_core::runtime::work_item_dispatcher::{COUNT_DOWN_TO_ZERO, TYPE_MISSING_BACKOFF_SECS};

/// Work queue shared between the fetch callback and the test.
#[derive(Clone, Default)]
struct Queue {
    items: Arc<Mutex<VecDeque<u32>>>,
    fetched_at: Arc<Mutex<Vec<(u32, Instant)>>>,
}

impl Queue {
    fn with_items(n: u32) -> Self {
        let q = Queue::default();
        q.items.lock().unwrap().extend(0..n);
        q
    }

    async fn fetch(&self, timeout: Duration, cancel: CancellationToken) -> Result<Option<u32>, DispatchError> {
        let next = self.items.lock().unwrap().pop_front();
        match next {
            Some(item) => {
                self.fetched_at.lock().unwrap().push((item, Instant::now()));
                Ok(Some(item))
            }
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(DispatchError::Canceled),
                    _ = tokio::time::sleep(timeout) => Ok(None),
                }
            }
        }
    }

    fn gaps(&self) -> Vec<Duration> {
        let fetched = self.fetched_at.lock().unwrap();
        fetched.windows(2).map(|w| w[1].1 - w[0].1).collect()
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(start_paused = true)]
async fn concurrency_cap_is_never_exceeded() {
    let queue = Queue::with_items(20);
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    let fetch_queue = queue.clone();
    let (f, p, d) = (in_flight.clone(), peak.clone(), done.clone());
    let dispatcher = WorkItemDispatcher::builder(
        "capped",
        |item: &u32| item.to_string(),
        move |timeout, cancel| {
            let q = fetch_queue.clone();
            async move { q.fetch(timeout, cancel).await }
        },
        move |_item: u32| {
            let (f, p, d) = (f.clone(), p.clone(), d.clone());
            async move {
                let now = f.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                f.fetch_sub(1, Ordering::SeqCst);
                d.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        },
    )
    .dispatcher_count(4)
    .max_concurrent_work_items(3)
    .receive_timeout(Duration::from_millis(50))
    .build();

    dispatcher.start();
    wait_until(|| done.load(Ordering::SeqCst) == 20).await;
    dispatcher.stop(false).await;

    assert!(peak.load(Ordering::SeqCst) <= 3, "peak {}", peak.load(Ordering::SeqCst));
    assert_eq!(peak.load(Ordering::SeqCst), 3);
    assert_eq!(dispatcher.concurrent_work_items(), 0);
}

#[tokio::test(start_paused = true)]
async fn failure_delay_holds_until_enough_successes() {
    let queue = Queue::with_items(12);
    let done = Arc::new(AtomicUsize::new(0));
    let fetch_queue = queue.clone();
    let d = done.clone();
    let dispatcher = WorkItemDispatcher::builder(
        "backoff",
        |item: &u32| item.to_string(),
        move |timeout, cancel| {
            let q = fetch_queue.clone();
            async move { q.fetch(timeout, cancel).await }
        },
        move |item: u32| {
            let d = d.clone();
            async move {
                d.fetch_add(1, Ordering::SeqCst);
                if item == 0 {
                    Err(DispatchError::InvalidWorkItem("poison".to_string()))
                } else {
                    Ok(())
                }
            }
        },
    )
    .process_exception_delay(|_| 3)
    .receive_timeout(Duration::from_millis(50))
    .build();

    dispatcher.start();
    wait_until(|| done.load(Ordering::SeqCst) == 12).await;
    dispatcher.stop(false).await;

    let gaps = queue.gaps();
    let delayed = gaps.iter().filter(|g| **g >= Duration::from_secs(3)).count();
    assert!(delayed >= COUNT_DOWN_TO_ZERO as usize - 1, "gaps {gaps:?}");
    assert!(delayed <= COUNT_DOWN_TO_ZERO as usize + 1, "gaps {gaps:?}");
    assert!(*gaps.last().unwrap() < Duration::from_secs(1), "cooldown never lifted: {gaps:?}");
    assert_eq!(dispatcher.current_delay_secs(), 0);
}

#[tokio::test(start_paused = true)]
async fn missing_type_aborts_and_backs_off() {
    let queue = Queue::with_items(2);
    let aborted = Arc::new(Mutex::new(Vec::new()));
    let released = Arc::new(AtomicUsize::new(0));
    let fetch_queue = queue.clone();
    let (a, r) = (aborted.clone(), released.clone());
    let dispatcher = WorkItemDispatcher::builder(
        "typed",
        |item: &u32| item.to_string(),
        move |timeout, cancel| {
            let q = fetch_queue.clone();
            async move { q.fetch(timeout, cancel).await }
        },
        |item: u32| async move {
            if item == 0 {
                Err(DispatchError::TypeMissing("Unknown".to_string()))
            } else {
                Ok(())
            }
        },
    )
    .abort_work_item(move |item: u32| {
        let a = a.clone();
        async move {
            a.lock().unwrap().push(item);
            Ok(())
        }
    })
    .safe_release_work_item(move |_item: u32| {
        let r = r.clone();
        async move {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
    .receive_timeout(Duration::from_millis(50))
    .build();

    dispatcher.start();
    wait_until(|| released.load(Ordering::SeqCst) == 2).await;
    dispatcher.stop(false).await;

    assert_eq!(*aborted.lock().unwrap(), vec![0]);
    assert_eq!(queue.fetched_at.lock().unwrap().len(), 2);
    // one success is not enough to lift the cooldown
    assert_eq!(dispatcher.current_delay_secs(), TYPE_MISSING_BACKOFF_SECS);
}

#[tokio::test(start_paused = true)]
async fn panicking_work_item_is_aborted_and_loop_survives() {
    let queue = Queue::with_items(3);
    let aborted = Arc::new(AtomicUsize::new(0));
    let succeeded = Arc::new(AtomicUsize::new(0));
    let fetch_queue = queue.clone();
    let (a, s) = (aborted.clone(), succeeded.clone());
    let dispatcher = WorkItemDispatcher::builder(
        "panicky",
        |item: &u32| item.to_string(),
        move |timeout, cancel| {
            let q = fetch_queue.clone();
            async move { q.fetch(timeout, cancel).await }
        },
        move |item: u32| {
            let s = s.clone();
            async move {
                if item == 1 {
                    panic!("work item {item} exploded");
                }
                s.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        },
    )
    .abort_work_item(move |_item: u32| {
        let a = a.clone();
        async move {
            a.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
    .receive_timeout(Duration::from_millis(50))
    .build();

    dispatcher.start();
    wait_until(|| succeeded.load(Ordering::SeqCst) == 2 && aborted.load(Ordering::SeqCst) == 1).await;
    dispatcher.stop(false).await;
    assert!(!dispatcher.is_started());
}

#[tokio::test(start_paused = true)]
async fn item_fetched_during_shutdown_is_released_unprocessed() {
    let processed = Arc::new(AtomicUsize::new(0));
    let released = Arc::new(AtomicUsize::new(0));
    let (p, r) = (processed.clone(), released.clone());
    let dispatcher = WorkItemDispatcher::builder(
        "draining",
        |item: &u32| item.to_string(),
        |_timeout, cancel: CancellationToken| async move {
            cancel.cancelled().await;
            Ok(Some(7u32))
        },
        move |_item: u32| {
            let p = p.clone();
            async move {
                p.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        },
    )
    .safe_release_work_item(move |_item: u32| {
        let r = r.clone();
        async move {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
    .build();

    dispatcher.start();
    tokio::task::yield_now().await;
    dispatcher.stop(false).await;
    wait_until(|| released.load(Ordering::SeqCst) == 1).await;
    assert_eq!(processed.load(Ordering::SeqCst), 0);
}
