use crate::wake::WakeSignal;
use control_protocol::{ControlError, LineEvent};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Periodic control loop body.
///
/// Implementors are independent, stateful components driven by a
/// [`StateExecutor`]: the executor repeatedly invokes `cycle`, then waits
/// on its wake signal bounded by `idle_timeout`. One executor task per
/// instance; the body is mutated only by that task.
///
/// # Lifecycle
///
/// 1. **cycle()** - called once per loop iteration
/// 2. **idle_timeout()** - bounds the wait after each cycle (re-read
///    every iteration, so implementors shorten it while responses are
///    outstanding)
/// 3. **busy()** - gates shutdown: the loop exits only once a stop was
///    requested and `busy()` is false, so in-flight device work can drain
/// 4. **shutdown()** - called once, after the loop exits
///
/// # Failure isolation
///
/// An error returned by `cycle` is logged and reported on the event
/// channel; the loop continues. One misbehaving device must not stop the
/// substrate.
///
/// The async methods return `Send` futures: the executor hands the whole
/// loop to `tokio::spawn`. Implementors may still write them as
/// `async fn`.
pub trait ControlLoop: Send + 'static {
    /// Loop name (used for logging and event attribution)
    fn name(&self) -> &'static str;

    /// Perform one unit of work
    fn cycle(&mut self) -> impl Future<Output = Result<(), ControlError>> + Send;

    /// Upper bound on the post-cycle wait
    fn idle_timeout(&self) -> Duration;

    /// True while work is in flight that a graceful stop must wait out
    fn busy(&self) -> bool {
        false
    }

    /// Clean up after the loop exits
    fn shutdown(&mut self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Owns the lifecycle of one [`ControlLoop`] task.
///
/// Created idle; `start` spawns the loop task, `stop` requests
/// termination and awaits the task. At most one loop task exists per
/// executor; `stop` is idempotent.
pub struct StateExecutor {
    stop_requested: Arc<AtomicBool>,
    wake: Arc<WakeSignal>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl StateExecutor {
    pub fn new(wake: Arc<WakeSignal>) -> Self {
        Self {
            stop_requested: Arc::new(AtomicBool::new(false)),
            wake,
            task: None,
        }
    }

    /// The wake signal shared with the loop body and external callers
    pub fn wake(&self) -> Arc<WakeSignal> {
        self.wake.clone()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Spawn the loop task.
    ///
    /// Fails with `AlreadyRunning` if a previous loop is still executing;
    /// callers treating start as idempotent may ignore that case.
    pub fn start<L: ControlLoop>(
        &mut self,
        body: L,
        event_tx: mpsc::Sender<LineEvent>,
    ) -> Result<(), ControlError> {
        if self.is_running() {
            return Err(ControlError::AlreadyRunning(body.name().to_string()));
        }
        self.stop_requested.store(false, Ordering::Release);
        let stop = self.stop_requested.clone();
        let wake = self.wake.clone();
        self.task = Some(tokio::spawn(run_loop(body, stop, wake, event_tx)));
        Ok(())
    }

    /// Request termination and wait for the loop task to exit.
    ///
    /// The loop finishes in-flight work first: it exits at the next
    /// iteration boundary where `busy()` is false.
    pub async fn stop(&mut self) {
        self.stop_requested.store(true, Ordering::Release);
        self.wake.set();
        if let Some(task) = self.task.take() {
            if task.await.is_err() {
                tracing::error!("control loop task panicked during shutdown");
            }
        }
    }
}

async fn run_loop<L: ControlLoop>(
    mut body: L,
    stop: Arc<AtomicBool>,
    wake: Arc<WakeSignal>,
    event_tx: mpsc::Sender<LineEvent>,
) {
    tracing::debug!(name = body.name(), "control loop started");

    loop {
        if let Err(e) = body.cycle().await {
            tracing::warn!(name = body.name(), error = %e, "cycle failed, continuing");
            let _ = event_tx.try_send(LineEvent::Error {
                message: format!("{}: {}", body.name(), e),
            });
        }

        if stop.load(Ordering::Acquire) && !body.busy() {
            break;
        }

        // Bounded idle wait; an external wake releases it early
        let _ = tokio::time::timeout(body.idle_timeout(), wake.wait()).await;

        if stop.load(Ordering::Acquire) && !body.busy() {
            break;
        }
    }

    body.shutdown().await;
    tracing::debug!(name = body.name(), "control loop stopped");
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::time::{sleep, Duration};

    struct CountingLoop {
        cycles: Arc<AtomicU32>,
        fail_first: u32,
        busy_until: u32,
        idle: Duration,
    }

    impl ControlLoop for CountingLoop {
        fn name(&self) -> &'static str {
            "CountingLoop"
        }

        async fn cycle(&mut self) -> Result<(), ControlError> {
            let n = self.cycles.fetch_add(1, Ordering::AcqRel) + 1;
            if n <= self.fail_first {
                return Err(ControlError::Other(format!("induced failure {n}")));
            }
            Ok(())
        }

        fn idle_timeout(&self) -> Duration {
            self.idle
        }

        fn busy(&self) -> bool {
            self.cycles.load(Ordering::Acquire) < self.busy_until
        }
    }

    fn counting_loop(cycles: Arc<AtomicU32>) -> CountingLoop {
        CountingLoop {
            cycles,
            fail_first: 0,
            busy_until: 0,
            idle: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_cycle_future_is_send() {
        fn require_send<F: Send>(future: F) -> F {
            future
        }
        // The loop body must yield Send futures or the executor cannot
        // hand it to tokio::spawn
        let mut body = counting_loop(Arc::new(AtomicU32::new(0)));
        drop(require_send(body.cycle()));
        drop(require_send(body.shutdown()));
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let cycles = Arc::new(AtomicU32::new(0));
        let (event_tx, _event_rx) = mpsc::channel(16);
        let mut exec = StateExecutor::new(Arc::new(WakeSignal::new()));

        assert!(!exec.is_running());
        exec.start(counting_loop(cycles.clone()), event_tx).unwrap();
        assert!(exec.is_running());

        sleep(Duration::from_millis(60)).await;
        exec.stop().await;
        assert!(!exec.is_running());

        let after_stop = cycles.load(Ordering::Acquire);
        assert!(after_stop >= 2, "expected several cycles, got {after_stop}");

        // No further cycles after stop
        sleep(Duration::from_millis(40)).await;
        assert_eq!(cycles.load(Ordering::Acquire), after_stop);
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let cycles = Arc::new(AtomicU32::new(0));
        let (event_tx, _event_rx) = mpsc::channel(16);
        let mut exec = StateExecutor::new(Arc::new(WakeSignal::new()));

        exec.start(counting_loop(cycles.clone()), event_tx.clone())
            .unwrap();
        let err = exec.start(counting_loop(cycles), event_tx).unwrap_err();
        match err {
            ControlError::AlreadyRunning(name) => assert_eq!(name, "CountingLoop"),
            _ => panic!("Wrong variant"),
        }
        exec.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let cycles = Arc::new(AtomicU32::new(0));
        let (event_tx, _event_rx) = mpsc::channel(16);
        let mut exec = StateExecutor::new(Arc::new(WakeSignal::new()));

        exec.start(counting_loop(cycles), event_tx).unwrap();
        exec.stop().await;
        exec.stop().await;
        assert!(!exec.is_running());
    }

    #[tokio::test]
    async fn test_cycle_error_does_not_stop_loop() {
        let cycles = Arc::new(AtomicU32::new(0));
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let mut exec = StateExecutor::new(Arc::new(WakeSignal::new()));

        let body = CountingLoop {
            cycles: cycles.clone(),
            fail_first: 2,
            busy_until: 0,
            idle: Duration::from_millis(5),
        };
        exec.start(body, event_tx).unwrap();
        sleep(Duration::from_millis(80)).await;
        exec.stop().await;

        // Loop survived the induced failures
        assert!(cycles.load(Ordering::Acquire) > 2);

        // And reported them
        let event = event_rx.try_recv().unwrap();
        match event {
            LineEvent::Error { message } => {
                assert!(message.contains("induced failure 1"));
            }
            _ => panic!("Wrong event type"),
        }
    }

    #[tokio::test]
    async fn test_wake_releases_idle_wait_early() {
        let cycles = Arc::new(AtomicU32::new(0));
        let (event_tx, _event_rx) = mpsc::channel(16);
        let wake = Arc::new(WakeSignal::new());
        let mut exec = StateExecutor::new(wake.clone());

        let body = CountingLoop {
            cycles: cycles.clone(),
            fail_first: 0,
            busy_until: 0,
            idle: Duration::from_secs(30),
        };
        exec.start(body, event_tx).unwrap();
        sleep(Duration::from_millis(20)).await;
        assert_eq!(cycles.load(Ordering::Acquire), 1);

        wake.set();
        sleep(Duration::from_millis(20)).await;
        assert_eq!(cycles.load(Ordering::Acquire), 2);

        exec.stop().await;
    }

    #[tokio::test]
    async fn test_stop_waits_for_busy_to_clear() {
        let cycles = Arc::new(AtomicU32::new(0));
        let (event_tx, _event_rx) = mpsc::channel(16);
        let mut exec = StateExecutor::new(Arc::new(WakeSignal::new()));

        // Busy until three cycles have run
        let body = CountingLoop {
            cycles: cycles.clone(),
            fail_first: 0,
            busy_until: 3,
            idle: Duration::from_millis(5),
        };
        exec.start(body, event_tx).unwrap();
        exec.stop().await;

        assert!(cycles.load(Ordering::Acquire) >= 3);
    }
}
