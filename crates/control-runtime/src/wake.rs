use tokio::sync::Notify;

/// Single-slot wake signal for a control loop.
///
/// `set` may be called from any task or thread; `wait` is called only by
/// the owning loop, once per iteration. At most one wake is buffered:
/// setting the signal repeatedly before the loop next waits coalesces
/// into a single wake, which matches the loop's semantics (it re-evaluates
/// all pending work on every iteration anyway).
#[derive(Debug, Default)]
pub struct WakeSignal {
    notify: Notify,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self {
            notify: Notify::new(),
        }
    }

    /// Request an early wake. Never blocks.
    pub fn set(&self) {
        self.notify.notify_one();
    }

    /// Wait until the signal is set, consuming one buffered wake if present.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}
