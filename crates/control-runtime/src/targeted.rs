use crate::wake::WakeSignal;
use control_protocol::ControlError;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Default interval between predicate checks in [`TargetedState::change_state_until`].
///
/// These transitions complete in tens to low-hundreds of milliseconds, so
/// a short fixed poll is deliberate; callers with slower devices pass
/// their own interval.
pub const DEFAULT_PREDICATE_POLL: Duration = Duration::from_millis(10);

struct Inner<S> {
    desired: S,
    actual: S,
    entered_at: Instant,
}

/// Desired/actual state pair layered over a control loop.
///
/// The owning loop reads `desired`, drives hardware toward it, and records
/// progress with `set_actual`. External callers mutate only through
/// `change_state`, which sets the desired state and wakes the loop; they
/// never touch the actual state. A stopwatch tracks time spent in the
/// current actual state, reset on every change.
pub struct TargetedState<S> {
    inner: Mutex<Inner<S>>,
    wake: Arc<WakeSignal>,
    poll_interval: Duration,
}

impl<S: Clone + PartialEq + Send> TargetedState<S> {
    pub fn new(initial: S, wake: Arc<WakeSignal>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                desired: initial.clone(),
                actual: initial,
                entered_at: Instant::now(),
            }),
            wake,
            poll_interval: DEFAULT_PREDICATE_POLL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner<S>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn desired(&self) -> S {
        self.lock().desired.clone()
    }

    pub fn actual(&self) -> S {
        self.lock().actual.clone()
    }

    /// Time elapsed since the actual state last changed
    pub fn time_in_state(&self) -> Duration {
        self.lock().entered_at.elapsed()
    }

    /// Record observed progress. Owning-loop use only; resets the
    /// stopwatch when the state actually changes.
    pub fn set_actual(&self, state: S) {
        let mut inner = self.lock();
        if inner.actual != state {
            inner.actual = state;
            inner.entered_at = Instant::now();
        }
    }

    /// Set the desired state and wake the loop. Safe from any task.
    pub fn change_state(&self, target: S) {
        self.lock().desired = target;
        self.wake.set();
    }

    /// Set the desired state, then block the caller until `predicate`
    /// holds, polling at the configured interval. `Timeout` on expiry.
    pub async fn change_state_until<F>(
        &self,
        target: S,
        timeout: Duration,
        predicate: F,
    ) -> Result<(), ControlError>
    where
        F: Fn(&S) -> bool,
    {
        self.change_state(target);
        let deadline = Instant::now() + timeout;
        loop {
            if predicate(&self.actual()) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ControlError::Timeout(format!(
                    "state change did not settle within {timeout:?} - \
                     target predicate never held. Check that the device loop is running."
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Convenience form: block until the actual state equals the target
    pub async fn change_state_and_wait(
        &self,
        target: S,
        timeout: Duration,
    ) -> Result<(), ControlError> {
        let want = target.clone();
        self.change_state_until(target, timeout, move |actual| *actual == want)
            .await
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum ValveState {
        Closed,
        Open,
    }

    #[tokio::test]
    async fn test_change_state_sets_desired_and_wakes() {
        let wake = Arc::new(WakeSignal::new());
        let target = TargetedState::new(ValveState::Closed, wake.clone());

        target.change_state(ValveState::Open);
        assert_eq!(target.desired(), ValveState::Open);
        assert_eq!(target.actual(), ValveState::Closed);

        // Wake was buffered for the loop
        tokio::time::timeout(Duration::from_millis(100), wake.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stopwatch_resets_on_actual_change() {
        let target = TargetedState::new(ValveState::Closed, Arc::new(WakeSignal::new()));

        sleep(Duration::from_millis(30)).await;
        assert!(target.time_in_state() >= Duration::from_millis(25));

        target.set_actual(ValveState::Open);
        assert!(target.time_in_state() < Duration::from_millis(20));

        // Setting the same state again must not reset the stopwatch
        sleep(Duration::from_millis(30)).await;
        target.set_actual(ValveState::Open);
        assert!(target.time_in_state() >= Duration::from_millis(25));
    }

    #[tokio::test]
    async fn test_change_state_and_wait_succeeds() {
        let target = Arc::new(TargetedState::new(
            ValveState::Closed,
            Arc::new(WakeSignal::new()),
        ));

        // Simulated device loop: applies the desired state after a delay
        let loop_side = target.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(30)).await;
            let desired = loop_side.desired();
            loop_side.set_actual(desired);
        });

        target
            .change_state_and_wait(ValveState::Open, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(target.actual(), ValveState::Open);
    }

    #[tokio::test]
    async fn test_change_state_until_times_out() {
        let target = TargetedState::new(ValveState::Closed, Arc::new(WakeSignal::new()));

        let err = target
            .change_state_and_wait(ValveState::Open, Duration::from_millis(50))
            .await
            .unwrap_err();
        match err {
            ControlError::Timeout(msg) => assert!(msg.contains("did not settle")),
            _ => panic!("Wrong variant"),
        }
        // Desired was still recorded for the loop to act on later
        assert_eq!(target.desired(), ValveState::Open);
    }
}
