//! Generic fetch/process loop shared by the activity, orchestration, and entity dispatchers.
//!
//! Each of the `dispatcher_count` loops takes a concurrency slot, fetches one work item, and
//! hands it to a spawned task that owns the slot until processing and cleanup finish. A
//! failed processing attempt may impose a cooldown that every loop applies before fetching;
//! the cooldown only lifts after [`COUNT_DOWN_TO_ZERO`] later successes.

use futures::FutureExt;
use futures::future::BoxFuture;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::DispatchError;
use crate::logging::DISPATCHER_TARGET;

pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(30);
/// How long a loop waits for a free slot before re-checking for shutdown.
pub const SLOT_WAIT_INTERVAL: Duration = Duration::from_secs(5);
/// Successes needed after a failure before the cooldown is lifted.
pub const COUNT_DOWN_TO_ZERO: u32 = 5;
pub const TYPE_MISSING_BACKOFF_SECS: u64 = 10;
pub const STOP_POLL_RETRIES: u32 = 7;
pub const STOP_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub type WorkItemIdFn<T> = Arc<dyn Fn(&T) -> String + Send + Sync>;
pub type FetchFn<T> =
    Arc<dyn Fn(Duration, CancellationToken) -> BoxFuture<'static, Result<Option<T>, DispatchError>> + Send + Sync>;
pub type WorkItemFn<T> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<(), DispatchError>> + Send + Sync>;
pub type DelayFn = Arc<dyn Fn(&DispatchError) -> u64 + Send + Sync>;

#[derive(Debug, Default)]
struct Backoff {
    delay_override_secs: u64,
    count_down: u32,
}

struct DispatcherInner<T> {
    name: String,
    work_item_id: WorkItemIdFn<T>,
    fetch: FetchFn<T>,
    process: WorkItemFn<T>,
    abort: Option<WorkItemFn<T>>,
    safe_release: Option<WorkItemFn<T>>,
    fetch_exception_delay: Option<DelayFn>,
    process_exception_delay: Option<DelayFn>,
    dispatcher_count: usize,
    max_concurrent_work_items: usize,
    receive_timeout: Duration,
    slots: Arc<Semaphore>,
    started: AtomicBool,
    shutdown: Mutex<CancellationToken>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    active_fetchers: AtomicUsize,
    concurrent_work_items: AtomicUsize,
    backoff: Mutex<Backoff>,
}

/// Runs fetch/process loops for one kind of work item.
pub struct WorkItemDispatcher<T> {
    inner: Arc<DispatcherInner<T>>,
}

impl<T> Clone for WorkItemDispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

pub struct WorkItemDispatcherBuilder<T> {
    name: String,
    work_item_id: WorkItemIdFn<T>,
    fetch: FetchFn<T>,
    process: WorkItemFn<T>,
    abort: Option<WorkItemFn<T>>,
    safe_release: Option<WorkItemFn<T>>,
    fetch_exception_delay: Option<DelayFn>,
    process_exception_delay: Option<DelayFn>,
    dispatcher_count: usize,
    max_concurrent_work_items: usize,
    receive_timeout: Duration,
}

fn boxed_hook<T, F, Fut>(f: F) -> WorkItemFn<T>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), DispatchError>> + Send + 'static,
{
    Arc::new(move |item| f(item).boxed())
}

impl<T: Clone + Send + Sync + 'static> WorkItemDispatcher<T> {
    pub fn builder<I, F, FFut, P, PFut>(name: impl Into<String>, work_item_id: I, fetch: F, process: P) -> WorkItemDispatcherBuilder<T>
    where
        I: Fn(&T) -> String + Send + Sync + 'static,
        F: Fn(Duration, CancellationToken) -> FFut + Send + Sync + 'static,
        FFut: Future<Output = Result<Option<T>, DispatchError>> + Send + 'static,
        P: Fn(T) -> PFut + Send + Sync + 'static,
        PFut: Future<Output = Result<(), DispatchError>> + Send + 'static,
    {
        WorkItemDispatcherBuilder {
            name: name.into(),
            work_item_id: Arc::new(work_item_id),
            fetch: Arc::new(move |timeout, cancel| fetch(timeout, cancel).boxed()),
            process: boxed_hook(process),
            abort: None,
            safe_release: None,
            fetch_exception_delay: None,
            process_exception_delay: None,
            dispatcher_count: 1,
            max_concurrent_work_items: 1,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Loops currently inside a fetch call.
    pub fn active_fetchers(&self) -> usize {
        self.inner.active_fetchers.load(Ordering::SeqCst)
    }

    /// Work items being processed or cleaned up.
    pub fn concurrent_work_items(&self) -> usize {
        self.inner.concurrent_work_items.load(Ordering::SeqCst)
    }

    /// Cooldown currently applied before each fetch.
    pub fn current_delay_secs(&self) -> u64 {
        self.inner.backoff().delay_override_secs
    }

    /// Launches the fetch loops. Calling it on a started dispatcher does nothing.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let token = CancellationToken::new();
        *self.inner.shutdown.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();

        info!(
            target: DISPATCHER_TARGET,
            dispatcher = %self.inner.name,
            dispatcher_count = self.inner.dispatcher_count,
            max_concurrent_work_items = self.inner.max_concurrent_work_items,
            "starting work item dispatcher"
        );
        let mut loops = self.inner.loops.lock().unwrap_or_else(PoisonError::into_inner);
        for index in 0..self.inner.dispatcher_count {
            let inner = Arc::clone(&self.inner);
            let token = token.clone();
            loops.push(tokio::spawn(async move { inner.dispatch_loop(index, token).await }));
        }
    }

    /// Cancels every fetch. Unless `forced`, waits a bounded time for fetches and in-flight
    /// work items to drain; in-flight items are never interrupted.
    pub async fn stop(&self, forced: bool) {
        if !self.inner.started.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.lock().unwrap_or_else(PoisonError::into_inner).cancel();
        info!(target: DISPATCHER_TARGET, dispatcher = %self.inner.name, forced, "stopping work item dispatcher");
        if forced {
            return;
        }

        for _ in 0..STOP_POLL_RETRIES {
            if self.active_fetchers() == 0 && self.concurrent_work_items() == 0 {
                break;
            }
            debug!(
                target: DISPATCHER_TARGET,
                dispatcher = %self.inner.name,
                active_fetchers = self.active_fetchers(),
                concurrent_work_items = self.concurrent_work_items(),
                "waiting for dispatcher to drain"
            );
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
        self.inner.loops.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl<T: Clone + Send + Sync + 'static> WorkItemDispatcherBuilder<T> {
    /// Called with the work item after a failed processing attempt.
    pub fn abort_work_item<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DispatchError>> + Send + 'static,
    {
        self.abort = Some(boxed_hook(f));
        self
    }

    /// Called with every work item once it is done, and with items fetched during shutdown.
    pub fn safe_release_work_item<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DispatchError>> + Send + 'static,
    {
        self.safe_release = Some(boxed_hook(f));
        self
    }

    pub fn fetch_exception_delay(mut self, f: impl Fn(&DispatchError) -> u64 + Send + Sync + 'static) -> Self {
        self.fetch_exception_delay = Some(Arc::new(f));
        self
    }

    pub fn process_exception_delay(mut self, f: impl Fn(&DispatchError) -> u64 + Send + Sync + 'static) -> Self {
        self.process_exception_delay = Some(Arc::new(f));
        self
    }

    pub fn dispatcher_count(mut self, count: usize) -> Self {
        self.dispatcher_count = count.max(1);
        self
    }

    pub fn max_concurrent_work_items(mut self, max: usize) -> Self {
        self.max_concurrent_work_items = max.max(1);
        self
    }

    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn build(self) -> WorkItemDispatcher<T> {
        WorkItemDispatcher {
            inner: Arc::new(DispatcherInner {
                name: self.name,
                work_item_id: self.work_item_id,
                fetch: self.fetch,
                process: self.process,
                abort: self.abort,
                safe_release: self.safe_release,
                fetch_exception_delay: self.fetch_exception_delay,
                process_exception_delay: self.process_exception_delay,
                dispatcher_count: self.dispatcher_count,
                max_concurrent_work_items: self.max_concurrent_work_items,
                receive_timeout: self.receive_timeout,
                slots: Arc::new(Semaphore::new(self.max_concurrent_work_items)),
                started: AtomicBool::new(false),
                shutdown: Mutex::new(CancellationToken::new()),
                loops: Mutex::new(Vec::new()),
                active_fetchers: AtomicUsize::new(0),
                concurrent_work_items: AtomicUsize::new(0),
                backoff: Mutex::new(Backoff::default()),
            }),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> DispatcherInner<T> {
    fn backoff(&self) -> std::sync::MutexGuard<'_, Backoff> {
        self.backoff.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn adjust_delay_on_success(&self) {
        let mut backoff = self.backoff();
        if backoff.count_down > 0 {
            backoff.count_down -= 1;
        }
        if backoff.count_down == 0 {
            backoff.delay_override_secs = 0;
        }
    }

    fn adjust_delay_on_failure(&self, delay_secs: u64) {
        let mut backoff = self.backoff();
        backoff.delay_override_secs = backoff.delay_override_secs.max(delay_secs);
        backoff.count_down = COUNT_DOWN_TO_ZERO;
    }

    async fn dispatch_loop(self: Arc<Self>, index: usize, shutdown: CancellationToken) {
        debug!(target: DISPATCHER_TARGET, dispatcher = %self.name, index, "dispatch loop started");
        let mut fetch_delay_secs = 0u64;

        while !shutdown.is_cancelled() {
            let delay_secs = fetch_delay_secs.max(self.backoff().delay_override_secs);
            fetch_delay_secs = 0;
            if delay_secs > 0 {
                debug!(target: DISPATCHER_TARGET, dispatcher = %self.name, delay_secs, "delaying next fetch");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(delay_secs)) => {}
                }
            }

            let permit = match tokio::time::timeout(SLOT_WAIT_INTERVAL, Arc::clone(&self.slots).acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => break,
                Err(_) => {
                    debug!(
                        target: DISPATCHER_TARGET,
                        dispatcher = %self.name,
                        max_concurrent_work_items = self.max_concurrent_work_items,
                        "all concurrency slots busy"
                    );
                    continue;
                }
            };

            self.active_fetchers.fetch_add(1, Ordering::SeqCst);
            let fetched = (self.fetch)(self.receive_timeout, shutdown.clone()).await;
            self.active_fetchers.fetch_sub(1, Ordering::SeqCst);

            match fetched {
                Ok(Some(item)) => {
                    if shutdown.is_cancelled() {
                        self.release_unprocessed(item).await;
                        break;
                    }
                    self.schedule(item, permit);
                }
                Ok(None) | Err(DispatchError::Timeout) => {}
                Err(DispatchError::Canceled) if shutdown.is_cancelled() => break,
                Err(e) => {
                    if shutdown.is_cancelled() {
                        break;
                    }
                    fetch_delay_secs = self.fetch_exception_delay.as_ref().map_or(0, |f| f(&e));
                    warn!(
                        target: DISPATCHER_TARGET,
                        dispatcher = %self.name,
                        error = %e,
                        delay_secs = fetch_delay_secs,
                        "failed to fetch work item"
                    );
                }
            }
        }
        debug!(target: DISPATCHER_TARGET, dispatcher = %self.name, index, "dispatch loop exited");
    }

    async fn release_unprocessed(&self, item: T) {
        if let Some(release) = &self.safe_release {
            if let Err(e) = release(item).await {
                error!(target: DISPATCHER_TARGET, dispatcher = %self.name, error = %e, "safe release failed during shutdown");
            }
        }
    }

    fn schedule(self: &Arc<Self>, item: T, permit: OwnedSemaphorePermit) {
        let inner = Arc::clone(self);
        inner.concurrent_work_items.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            inner.process_work_item(item).await;
            drop(permit);
            inner.concurrent_work_items.fetch_sub(1, Ordering::SeqCst);
        });
    }

    async fn process_work_item(&self, item: T) {
        let work_item_id = (self.work_item_id)(&item);
        debug!(target: DISPATCHER_TARGET, dispatcher = %self.name, work_item_id = %work_item_id, "processing work item");

        let result = match AssertUnwindSafe((self.process)(item.clone())).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(DispatchError::ProcessingPanicked(message))
            }
        };

        let succeeded = match result {
            Ok(()) => {
                self.adjust_delay_on_success();
                true
            }
            Err(DispatchError::TypeMissing(type_name)) => {
                error!(
                    target: DISPATCHER_TARGET,
                    dispatcher = %self.name,
                    work_item_id = %work_item_id,
                    type_name = %type_name,
                    backoff_secs = TYPE_MISSING_BACKOFF_SECS,
                    "no handler registered for work item"
                );
                self.adjust_delay_on_failure(TYPE_MISSING_BACKOFF_SECS);
                false
            }
            Err(e) => {
                let delay_secs = self.process_exception_delay.as_ref().map_or(0, |f| f(&e));
                warn!(
                    target: DISPATCHER_TARGET,
                    dispatcher = %self.name,
                    work_item_id = %work_item_id,
                    error = %e,
                    delay_secs,
                    "failed to process work item"
                );
                if delay_secs > 0 {
                    self.adjust_delay_on_failure(delay_secs);
                }
                false
            }
        };

        if !succeeded {
            if let Some(abort) = &self.abort {
                if let Err(e) = abort(item.clone()).await {
                    error!(target: DISPATCHER_TARGET, dispatcher = %self.name, work_item_id = %work_item_id, error = %e, "abort failed");
                }
            }
        }
        if let Some(release) = &self.safe_release {
            if let Err(e) = release(item).await {
                error!(target: DISPATCHER_TARGET, dispatcher = %self.name, work_item_id = %work_item_id, error = %e, "safe release failed");
            }
        }
    }
}
