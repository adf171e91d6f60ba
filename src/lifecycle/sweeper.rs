//! Periodic background sweeps.
//!
//! # Responsibilities
//! - Run a cleanup closure on a fixed interval
//! - Exit promptly when the owning component is disposed

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;

use crate::lifecycle::CancellationToken;

/// Spawn `sweep` on a fixed interval until `cancel` fires.
///
/// Returns `None` when called outside a tokio runtime or with a zero
/// interval; callers can still sweep manually.
pub fn spawn_sweeper<F>(
    name: &'static str,
    interval: Duration,
    cancel: CancellationToken,
    sweep: F,
) -> Option<JoinHandle<()>>
where
    F: Fn() -> usize + Send + 'static,
{
    if interval.is_zero() {
        tracing::warn!(sweeper = name, "Zero cleanup interval, background sweep disabled");
        return None;
    }

    let handle = match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle,
        Err(_) => {
            tracing::debug!(sweeper = name, "No tokio runtime, background sweep disabled");
            return None;
        }
    };

    Some(handle.spawn(async move {
        tracing::debug!(sweeper = name, interval_secs = interval.as_secs(), "Sweeper starting");

        let mut ticker = time::interval(interval);
        // The first tick completes immediately; nothing is stale yet.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = sweep();
                    if removed > 0 {
                        tracing::debug!(sweeper = name, removed, "Expired entries swept");
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::debug!(sweeper = name, "Sweeper received cancellation, exiting loop");
                    break;
                }
            }
        }
    }))
}
