use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::logging::DISPATCHER_TARGET;
use crate::providers::ProviderError;

/// How often the renewal loop wakes to check whether renewal is due.
pub const RENEWAL_WAKE_INTERVAL: Duration = Duration::from_secs(5);
/// Renewal happens this many seconds before the lock expires.
pub const RENEWAL_LEAD_SECS: i64 = 30;
/// Renewal is never scheduled further out than this many seconds.
pub const RENEWAL_MAX_DELAY_SECS: i64 = 30;

/// Next renewal time for a lock that expires at `locked_until`.
pub fn renew_at(locked_until: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    let renew_at = locked_until - chrono::Duration::seconds(RENEWAL_LEAD_SECS);
    let latest = now + chrono::Duration::seconds(RENEWAL_MAX_DELAY_SECS);
    renew_at.min(latest)
}

/// Keeps a work item lock alive until `cancel` fires.
///
/// `renew` returns the new expiry, or `None` once the lock no longer exists, which ends the
/// loop. Renewal errors are traced and retried on the next wake-up.
pub fn spawn_lock_renewal_task<F, Fut>(
    work_item_id: String,
    locked_until: DateTime<Utc>,
    renew: F,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Option<DateTime<Utc>>, ProviderError>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut next = renew_at(locked_until, Utc::now());
        debug!(target: DISPATCHER_TARGET, work_item_id = %work_item_id, renew_at = %next, "lock renewal started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(RENEWAL_WAKE_INTERVAL) => {}
            }
            if Utc::now() < next {
                continue;
            }

            trace!(target: DISPATCHER_TARGET, work_item_id = %work_item_id, "renewing work item lock");
            match renew().await {
                Ok(Some(expiry)) => next = renew_at(expiry, Utc::now()),
                Ok(None) => {
                    debug!(target: DISPATCHER_TARGET, work_item_id = %work_item_id, "lock is gone, stopping renewal");
                    break;
                }
                Err(e) => {
                    warn!(target: DISPATCHER_TARGET, work_item_id = %work_item_id, error = %e, "failed to renew work item lock");
                }
            }
        }
        debug!(target: DISPATCHER_TARGET, work_item_id = %work_item_id, "lock renewal stopped");
    })
}

/// Cancels the renewal loop and waits for it to end. Returns false, after tracing the error,
/// if the loop panicked or was aborted.
pub async fn stop_lock_renewal(work_item_id: &str, renewal: Option<JoinHandle<()>>, cancel: &CancellationToken) -> bool {
    cancel.cancel();
    let Some(handle) = renewal else {
        return true;
    };
    match handle.await {
        Ok(()) => true,
        Err(e) => {
            warn!(
                target: DISPATCHER_TARGET,
                work_item_id = %work_item_id,
                panicked = e.is_panic(),
                error = %e,
                "lock renewal task failed"
            );
            false
        }
    }
}
