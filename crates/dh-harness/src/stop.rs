use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// StopSignal: explicit, idempotent cancellation
// ---------------------------------------------------------------------------

/// Cancellation flag for one task.
///
/// Cloned into the task handle, the supervisor and the lifecycle manager.
/// Triggering is idempotent and there is no way to un-trigger a signal.
///
/// ```ignore
/// let stop = StopSignal::new();
///
/// tokio::select! {
///     _ = stop.stopped() => { /* kill the container */ }
///     line = logs.recv_async() => { /* forward */ }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct StopSignal {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    /// Atomic flag for cheap polling.
    stopped: AtomicBool,
    /// Watch channel so async waiters wake on trigger.
    tx: watch::Sender<bool>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                stopped: AtomicBool::new(false),
                tx,
            }),
        }
    }

    /// Check if a stop has been requested (non-blocking).
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Request a stop. Later calls are no-ops.
    pub fn trigger(&self) {
        if self
            .inner
            .stopped
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            info!("stop requested");
            self.inner.tx.send_replace(true);
        } else {
            debug!("stop already requested");
        }
    }

    /// Resolve once a stop has been requested; immediately if it already was.
    pub async fn stopped(&self) {
        let mut rx = self.inner.tx.subscribe();
        // The sender lives as long as `self`, so this only returns on trigger.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
