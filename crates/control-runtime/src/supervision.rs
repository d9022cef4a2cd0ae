/// Supervision utilities for long-running operations
///
/// Provides timeout-based watchdogs so a control loop stuck mid-operation
/// (a confirmation that never settles, an actuator that never reports
/// stopped) is noticed and can be force-aborted instead of hanging.
use control_protocol::LineEvent;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// How often a watchdog task re-checks its cancellation flag.
/// Bounds how long a cancelled watchdog lingers before exiting.
const CHECK_INTERVAL_MS: u64 = 500;

/// Handle to a running watchdog.
///
/// When dropped or explicitly cancelled, the watchdog task will not send
/// its timeout event, preventing spurious timeouts after operations
/// complete. `is_expired` lets the owning loop poll whether the deadline
/// passed, so it can force-abort the stuck operation itself.
#[derive(Clone)]
pub struct TimeoutHandle {
    cancelled: Arc<AtomicBool>,
    expired: Arc<AtomicBool>,
}

impl TimeoutHandle {
    fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            expired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancel the watchdog, preventing it from firing
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Has the deadline passed without cancellation?
    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Drop for TimeoutHandle {
    fn drop(&mut self) {
        // Auto-cancel when handle is dropped
        self.cancel();
    }
}

/// Watchdog deadlines for supervised operations
#[derive(Debug, Clone)]
pub struct SupervisionConfig {
    /// Deadline for one complete actuation operation (dequeue → Free)
    pub operation_timeout_secs: u64,
    /// Deadline for an abort to resolve (Aborting → Free)
    pub abort_timeout_secs: u64,
    /// Deadline for a graceful executor stop to drain in-flight work
    pub stop_timeout_secs: u64,
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            operation_timeout_secs: 120, // slow actuators take ~90s full travel
            abort_timeout_secs: 10,      // stop commands settle within seconds
            stop_timeout_secs: 30,       // worst case: one full abort cycle
        }
    }
}

/// Spawn a watchdog that reports a timeout after the specified duration.
///
/// Returns a [`TimeoutHandle`] used to cancel the watchdog once the
/// operation completes. If the deadline passes first, the watchdog marks
/// the handle expired and sends one `LineEvent::OperationTimeout`.
pub fn spawn_watchdog(
    event_tx: mpsc::Sender<LineEvent>,
    operation: &str,
    timeout_secs: u64,
) -> TimeoutHandle {
    let operation = operation.to_string();
    let handle = TimeoutHandle::new();
    let task_handle = handle.clone();

    tokio::spawn(async move {
        // Wait for the deadline with periodic cancellation checks, so a
        // cancelled watchdog exits early instead of sleeping to term
        let total_ms = timeout_secs * 1000;
        let mut elapsed_ms = 0;

        while elapsed_ms < total_ms {
            if task_handle.is_cancelled() {
                return;
            }
            let remaining_ms = total_ms - elapsed_ms;
            let sleep_ms = remaining_ms.min(CHECK_INTERVAL_MS);
            tokio::time::sleep(tokio::time::Duration::from_millis(sleep_ms)).await;
            elapsed_ms += sleep_ms;
        }

        // Final check before reporting
        if !task_handle.is_cancelled() {
            task_handle.expired.store(true, Ordering::Release);
            tracing::warn!(operation = %operation, timeout_secs, "operation watchdog expired");
            let _ = event_tx.try_send(LineEvent::OperationTimeout { operation });
        }
    });

    handle
}
