//! Multi-step actuation over a shared multi-drop bus.
//!
//! An [`ActuatorController`] drives a set of actuators that share one bus
//! controller, running exactly one actuator's operation to completion (or
//! abort) before starting the next. Responses from the bus controller and
//! from an actuator's optional secondary RS-232 sub-device are timed
//! independently, each with its own bounded per-cycle wait.

use crate::constants;
use control_protocol::{ActuationState, ControlError, DeviceKey, LineEvent, LineTransport};
use control_runtime::{
    spawn_watchdog, ControlLoop, StateExecutor, SupervisionConfig, TimeoutHandle, WakeSignal,
};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

// Bus-controller wire vocabulary for the actuator family. Opaque short
// tokens; the trailing `r` requests a report.
const GO_COMMAND: &str = "g r";
const MOTION_POLL: &str = "m r";
const STOP_COMMAND: &str = "st r";
const SUBDEVICE_STOP: &str = "st";

// Motion-poll replies
const MOTION_MOVING: &str = "1";
const MOTION_STOPPED: &str = "0";
const MOTION_INHIBITED: &str = "inh";

/// One actuator drop on the shared bus
#[derive(Debug, Clone)]
pub struct Actuator {
    pub key: DeviceKey,
    /// Multi-drop channel used for isolation priming
    pub channel: u8,
    /// Dual-channel type: carries a secondary RS-232 sub-device with its
    /// own command/response timing
    pub has_subdevice: bool,
}

/// A named, parameterized motion request
#[derive(Debug, Clone)]
pub struct ActuationOperation {
    pub name: String,
    /// Configuration tokens confirmed against the controller's report
    /// (e.g. `["s100", "p2000"]`)
    pub settings: Vec<String>,
    /// Sub-device setup command, sent during confirmation (dual-channel
    /// actuators only)
    pub subdevice_setup: Option<String>,
    /// Secondary movement command issued alongside the go (dual-channel
    /// actuators only)
    pub subdevice_move: Option<String>,
}

/// Observer handle for one queued request. `is_active` goes false when
/// the operation finishes, aborts, or is drained from the queue by
/// [`ActuatorController::abort`] before starting.
#[derive(Clone)]
pub struct RequestHandle {
    active: Arc<AtomicBool>,
}

impl RequestHandle {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

struct ActuationRequest {
    actuator: Actuator,
    operation: ActuationOperation,
    active: Arc<AtomicBool>,
}

/// Tuning for one actuation controller. Defaults come from
/// [`constants::actuator`]; see there for rationale.
#[derive(Clone)]
pub struct ActuatorControllerConfig {
    /// Bounded wait for a controller-channel response
    pub controller_response_wait: Duration,
    /// Bounded wait for a sub-device response
    pub subdevice_response_wait: Duration,
    /// Gap between cycles while an operation is in flight
    pub active_cycle_gap: Duration,
    /// Wait between cycles when Free with an empty queue
    pub idle_timeout: Duration,
    pub supervision: SupervisionConfig,
}

impl Default for ActuatorControllerConfig {
    fn default() -> Self {
        Self {
            controller_response_wait: Duration::from_millis(
                constants::actuator::CONTROLLER_RESPONSE_WAIT_MS,
            ),
            subdevice_response_wait: Duration::from_millis(
                constants::actuator::SUBDEVICE_RESPONSE_WAIT_MS,
            ),
            active_cycle_gap: Duration::from_millis(constants::actuator::ACTIVE_CYCLE_GAP_MS),
            idle_timeout: Duration::from_millis(constants::actuator::IDLE_TIMEOUT_MS),
            supervision: SupervisionConfig::default(),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State visible outside the loop task
struct Shared {
    state: Mutex<ActuationState>,
    queue: Mutex<VecDeque<ActuationRequest>>,
    aborting: AtomicBool,
    operation_in_flight: AtomicBool,
}

/// Runs one actuator operation at a time over a shared bus controller
/// transport `T`, with sub-device traffic on transport `U`.
pub struct ActuatorController<T: LineTransport, U: LineTransport> {
    name: &'static str,
    config: ActuatorControllerConfig,
    bus: Arc<T>,
    subdevice: Arc<U>,
    shared: Arc<Shared>,
    wake: Arc<WakeSignal>,
    executor: StateExecutor,
}

impl<T: LineTransport, U: LineTransport> ActuatorController<T, U> {
    pub fn new(
        name: &'static str,
        bus: Arc<T>,
        subdevice: Arc<U>,
        config: ActuatorControllerConfig,
    ) -> Self {
        let wake = Arc::new(WakeSignal::new());
        let executor = StateExecutor::new(wake.clone());
        Self {
            name,
            config,
            bus,
            subdevice,
            shared: Arc::new(Shared {
                state: Mutex::new(ActuationState::Free),
                queue: Mutex::new(VecDeque::new()),
                aborting: AtomicBool::new(false),
                operation_in_flight: AtomicBool::new(false),
            }),
            wake,
            executor,
        }
    }

    /// Spawn the control loop. `controller_rx` and `subdevice_rx` are the
    /// two independently-timed inbound response channels.
    pub fn start(
        &mut self,
        controller_rx: mpsc::Receiver<String>,
        subdevice_rx: mpsc::Receiver<String>,
        event_tx: mpsc::Sender<LineEvent>,
    ) -> Result<(), ControlError> {
        let body = ActuatorLoop {
            name: self.name,
            config: self.config.clone(),
            bus: self.bus.clone(),
            subdevice: self.subdevice.clone(),
            shared: self.shared.clone(),
            controller_rx,
            subdevice_rx,
            state: ActuationState::Free,
            current: None,
            last_report: None,
            subdevice_ready: false,
            watchdog: None,
            event_tx: event_tx.clone(),
        };
        self.executor.start(body, event_tx)
    }

    /// Stop the loop once in-flight work resolves (an explicit `abort`
    /// shortens the wait). Bounded by the supervision stop deadline; on
    /// expiry the loop task is left to wind down on its own.
    pub async fn stop(&mut self) {
        let deadline = Duration::from_secs(self.config.supervision.stop_timeout_secs);
        if tokio::time::timeout(deadline, self.executor.stop())
            .await
            .is_err()
        {
            tracing::error!(
                controller = self.name,
                "stop deadline exceeded, abandoning loop task"
            );
        }
    }

    /// Enqueue an operation without blocking. The wake signal releases a
    /// waiting idle cycle immediately.
    pub fn request_service(
        &self,
        actuator: Actuator,
        operation: ActuationOperation,
    ) -> RequestHandle {
        let active = Arc::new(AtomicBool::new(true));
        tracing::info!(
            controller = self.name,
            actuator = %actuator.key,
            operation = %operation.name,
            "actuation requested"
        );
        lock(&self.shared.queue).push_back(ActuationRequest {
            actuator,
            operation,
            active: active.clone(),
        });
        self.wake.set();
        RequestHandle { active }
    }

    /// Abort: the in-flight actuator (if any) is routed through the
    /// `Aborting` branch; every queued, not-yet-started request is
    /// drained and deactivated immediately without waiting.
    pub fn abort(&self) {
        tracing::warn!(controller = self.name, "abort requested");
        self.shared.aborting.store(true, Ordering::Release);
        let drained: Vec<ActuationRequest> = lock(&self.shared.queue).drain(..).collect();
        for request in &drained {
            request.active.store(false, Ordering::Release);
        }
        if !drained.is_empty() {
            tracing::info!(
                controller = self.name,
                count = drained.len(),
                "queued requests drained by abort"
            );
        }
        self.wake.set();
    }

    pub fn state(&self) -> ActuationState {
        *lock(&self.shared.state)
    }

    pub fn queue_len(&self) -> usize {
        lock(&self.shared.queue).len()
    }

    pub fn busy(&self) -> bool {
        self.shared.operation_in_flight.load(Ordering::Acquire) || self.queue_len() > 0
    }

    pub fn wake(&self) -> Arc<WakeSignal> {
        self.wake.clone()
    }
}

struct ActuatorLoop<T: LineTransport, U: LineTransport> {
    name: &'static str,
    config: ActuatorControllerConfig,
    bus: Arc<T>,
    subdevice: Arc<U>,
    shared: Arc<Shared>,
    controller_rx: mpsc::Receiver<String>,
    subdevice_rx: mpsc::Receiver<String>,
    state: ActuationState,
    current: Option<ActuationRequest>,
    last_report: Option<String>,
    subdevice_ready: bool,
    watchdog: Option<TimeoutHandle>,
    event_tx: mpsc::Sender<LineEvent>,
}

impl<T: LineTransport, U: LineTransport> ActuatorLoop<T, U> {
    fn transition(&mut self, to: ActuationState) -> Result<(), ControlError> {
        if !self.state.can_transition_to(to) {
            return Err(ControlError::InvalidTransition(format!(
                "{:?} → {:?}",
                self.state, to
            )));
        }
        let from = self.state;
        self.state = to;
        *lock(&self.shared.state) = to;
        tracing::debug!(controller = self.name, ?from, ?to, "actuation transition");
        let _ = self.event_tx.try_send(LineEvent::ActuationStateChanged {
            controller: self.name.to_string(),
            from,
            to,
        });
        Ok(())
    }

    /// Issue at most one command per channel, then wait (bounded) on each
    /// channel a command was actually issued on. A timeout logs and
    /// returns `None` for that channel; the caller's state simply
    /// re-polls next cycle.
    async fn exchange(
        &mut self,
        controller_cmd: Option<&str>,
        subdevice_cmd: Option<&str>,
    ) -> Result<(Option<String>, Option<String>), ControlError> {
        let controller_expected = controller_cmd.is_some();
        let subdevice_expected = subdevice_cmd.is_some();

        if let Some(cmd) = controller_cmd {
            if !self.bus.send(cmd).await? {
                tracing::warn!(controller = self.name, cmd, "bus declined command");
            }
        }
        if let Some(cmd) = subdevice_cmd {
            if !self.subdevice.send(cmd).await? {
                tracing::warn!(controller = self.name, cmd, "sub-device declined command");
            }
        }

        let mut controller_resp = None;
        if controller_expected {
            match tokio::time::timeout(
                self.config.controller_response_wait,
                self.controller_rx.recv(),
            )
            .await
            {
                Ok(Some(line)) => controller_resp = Some(line),
                Ok(None) => tracing::warn!(controller = self.name, "controller channel closed"),
                Err(_) => tracing::debug!(
                    controller = self.name,
                    state = ?self.state,
                    "controller response timeout, re-polling next cycle"
                ),
            }
        }

        let mut subdevice_resp = None;
        if subdevice_expected {
            match tokio::time::timeout(
                self.config.subdevice_response_wait,
                self.subdevice_rx.recv(),
            )
            .await
            {
                Ok(Some(line)) => subdevice_resp = Some(line),
                Ok(None) => tracing::warn!(controller = self.name, "sub-device channel closed"),
                Err(_) => tracing::debug!(
                    controller = self.name,
                    state = ?self.state,
                    "sub-device response timeout, re-polling next cycle"
                ),
            }
        }

        Ok((controller_resp, subdevice_resp))
    }

    /// Return the machine to `Free`, releasing the current request
    fn finish(&mut self, success: bool) -> Result<(), ControlError> {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.cancel();
        }
        if let Some(request) = self.current.take() {
            request.active.store(false, Ordering::Release);
            tracing::info!(
                controller = self.name,
                actuator = %request.actuator.key,
                operation = %request.operation.name,
                success,
                "actuation finished"
            );
        }
        self.last_report = None;
        self.subdevice_ready = false;
        self.shared.operation_in_flight.store(false, Ordering::Release);
        self.transition(ActuationState::Free)
    }

    /// Route the machine into `Aborting` and re-arm the watchdog with the
    /// tighter abort deadline, so an unanswerable stop cannot hold the
    /// machine past it
    fn begin_abort(&mut self) -> Result<(), ControlError> {
        self.transition(ActuationState::Aborting)?;
        let operation = match self.current.as_ref() {
            Some(request) => format!("abort {}", request.actuator.key),
            None => "abort".to_string(),
        };
        self.watchdog = Some(spawn_watchdog(
            self.event_tx.clone(),
            &operation,
            self.config.supervision.abort_timeout_secs,
        ));
        Ok(())
    }

    fn dequeue_next(&mut self) -> Option<ActuationRequest> {
        let mut queue = lock(&self.shared.queue);
        while let Some(request) = queue.pop_front() {
            // Requests deactivated by an abort are dropped silently
            if request.active.load(Ordering::Acquire) {
                return Some(request);
            }
        }
        None
    }

    fn config_command(operation: &ActuationOperation) -> String {
        let mut text = operation.settings.join(" ");
        if !text.is_empty() {
            text.push(' ');
        }
        text.push_str("c r");
        text
    }

    fn report_matches(settings: &[String], report: Option<&str>) -> bool {
        let Some(report) = report else {
            return false;
        };
        let reported: HashSet<&str> = report.split_whitespace().collect();
        settings.iter().all(|s| reported.contains(s.as_str()))
    }
}

impl<T: LineTransport, U: LineTransport> ControlLoop for ActuatorLoop<T, U> {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn cycle(&mut self) -> Result<(), ControlError> {
        // An abort routes the in-flight machine through Aborting; queued
        // requests were already drained by the abort call itself
        if self.shared.aborting.swap(false, Ordering::AcqRel) && self.state.is_active() {
            self.begin_abort()?;
        }

        // Watchdog expiry: force a stuck operation into Aborting, and a
        // stuck abort back to Free
        if self.watchdog.as_ref().is_some_and(|w| w.is_expired()) {
            if self.state == ActuationState::Aborting {
                tracing::error!(controller = self.name, "abort overran watchdog, forcing Free");
                return self.finish(false);
            }
            if self.state.is_active() {
                tracing::error!(controller = self.name, "operation overran watchdog, aborting");
                // begin_abort replaces the expired watchdog; the abort
                // itself still runs under its own deadline
                self.begin_abort()?;
            }
        }

        match self.state {
            ActuationState::Free => {
                let Some(request) = self.dequeue_next() else {
                    return Ok(());
                };
                tracing::info!(
                    controller = self.name,
                    actuator = %request.actuator.key,
                    operation = %request.operation.name,
                    "starting actuation"
                );
                self.watchdog = Some(spawn_watchdog(
                    self.event_tx.clone(),
                    &format!(
                        "actuate {} {}",
                        request.actuator.key, request.operation.name
                    ),
                    self.config.supervision.operation_timeout_secs,
                ));
                self.last_report = None;
                self.subdevice_ready =
                    !request.actuator.has_subdevice || request.operation.subdevice_setup.is_none();
                let prime = format!("n{} 1 r", request.actuator.channel);
                self.current = Some(request);
                self.shared.operation_in_flight.store(true, Ordering::Release);

                // Channel-isolation priming before any configuration
                self.exchange(Some(&prime), None).await?;
                self.transition(ActuationState::Configuring)?;
            }

            ActuationState::Configuring => {
                let Some(operation) = self.current.as_ref().map(|r| r.operation.clone()) else {
                    // No request to configure for; unwind via Aborting
                    return self.begin_abort();
                };
                let cmd = Self::config_command(&operation);
                let (report, _) = self.exchange(Some(&cmd), None).await?;
                if let Some(report) = report {
                    self.last_report = Some(report);
                    self.transition(ActuationState::Confirming)?;
                }
                // Timeout: stay, resend next cycle
            }

            ActuationState::Confirming => {
                let Some(request) = self.current.as_ref() else {
                    return self.begin_abort();
                };
                let settings = request.operation.settings.clone();
                let setup = request.operation.subdevice_setup.clone();

                if !Self::report_matches(&settings, self.last_report.as_deref()) {
                    // Reported settings differ from desired: not an
                    // error, reconfigure
                    tracing::debug!(
                        controller = self.name,
                        report = self.last_report.as_deref().unwrap_or(""),
                        "settings mismatch, reconfiguring"
                    );
                    self.last_report = None;
                    self.transition(ActuationState::Configuring)?;
                } else if !self.subdevice_ready {
                    if let Some(setup_cmd) = setup {
                        let (_, sub_resp) = self.exchange(None, Some(&setup_cmd)).await?;
                        if sub_resp.is_some() {
                            self.subdevice_ready = true;
                        }
                    } else {
                        self.subdevice_ready = true;
                    }
                } else {
                    self.transition(ActuationState::Going)?;
                }
            }

            ActuationState::Going => {
                let sub_move = self.current.as_ref().and_then(|r| {
                    if r.actuator.has_subdevice {
                        r.operation.subdevice_move.clone()
                    } else {
                        None
                    }
                });
                self.exchange(Some(GO_COMMAND), sub_move.as_deref()).await?;
                self.transition(ActuationState::AwaitingMotion)?;
            }

            ActuationState::AwaitingMotion => {
                let (resp, _) = self.exchange(Some(MOTION_POLL), None).await?;
                match resp.as_deref() {
                    Some(MOTION_MOVING) | Some(MOTION_INHIBITED) => {
                        self.transition(ActuationState::AwaitingFinish)?;
                    }
                    // Not yet moving, or timeout: re-poll
                    _ => {}
                }
            }

            ActuationState::AwaitingFinish => {
                let (resp, _) = self.exchange(Some(MOTION_POLL), None).await?;
                if resp.as_deref() == Some(MOTION_STOPPED) {
                    self.finish(true)?;
                }
            }

            ActuationState::Aborting => {
                let sub_stop = self
                    .current
                    .as_ref()
                    .is_some_and(|r| r.actuator.has_subdevice)
                    .then_some(SUBDEVICE_STOP);
                let (resp, _) = self.exchange(Some(STOP_COMMAND), sub_stop).await?;
                if resp.is_some() {
                    self.finish(false)?;
                }
                // Timeout: resend stop next cycle, bounded by watchdog
            }
        }
        Ok(())
    }

    fn idle_timeout(&self) -> Duration {
        if self.state.is_active() || lock(&self.shared.queue).front().is_some() {
            self.config.active_cycle_gap
        } else {
            self.config.idle_timeout
        }
    }

    fn busy(&self) -> bool {
        self.state.is_active()
            || self.current.is_some()
            || !lock(&self.shared.queue).is_empty()
    }

    async fn shutdown(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.cancel();
        }
    }
}

impl ActuationOperation {
    /// Operation with no sub-device involvement
    pub fn simple(name: impl Into<String>, settings: Vec<String>) -> Self {
        Self {
            name: name.into(),
            settings,
            subdevice_setup: None,
            subdevice_move: None,
        }
    }
}
