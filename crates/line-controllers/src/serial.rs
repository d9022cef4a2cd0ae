//! Serial command/response correlation.
//!
//! A [`SerialController`] owns exactly one logical conversation with one
//! serial-attached device or bus: it serializes all outbound traffic,
//! pairs each command with the number of inbound lines it expects, tracks
//! consecutive timeouts, and exposes a single link-health signal.
//!
//! Two tasks per controller: the main control loop (command selection and
//! transmission) and a response drain task fed by the transport's inbound
//! line channel.

use crate::constants;
use control_protocol::{Command, ControlError, LineEvent, LineTransport};
use control_runtime::{ControlLoop, StateExecutor, WakeSignal};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Caller-supplied service selection and response validation.
///
/// Implemented by the registry layer. Invoked under the controller's
/// source lock from two tasks: `select_service` on the control loop,
/// `process_response` on the drain task. Neither may block.
pub trait CommandSource: Send + 'static {
    /// Produce the next command. `Command::idle()` means nothing to do.
    fn select_service(&mut self) -> Command;

    /// Validate and apply one inbound line. `index` is the zero-based
    /// position within the current command's expected response set.
    /// Returning `false` rejects the line: the controller flushes the
    /// delivery queue and leaves the outstanding count untouched.
    fn process_response(&mut self, line: &str, index: u32) -> bool;

    /// The current command's expectation was abandoned after a timeout.
    /// Sources that track the in-flight request re-offer it here so the
    /// next selection resends it.
    fn command_abandoned(&mut self) {}

    /// The transport link dropped; mark all dependent state stale.
    fn link_lost(&mut self) {}
}

/// Tuning for one serial conversation. Defaults come from
/// [`constants::serial`]; see there for rationale.
#[derive(Debug, Clone)]
pub struct SerialControllerConfig {
    /// Per-cycle wait while responses are outstanding
    pub response_timeout: Duration,
    /// Wait between cycles when nothing is outstanding
    pub idle_timeout: Duration,
    /// Split command text on spaces and send token by token
    pub split_tokens: bool,
    /// Delay between tokens of a split command; ignored unless
    /// `split_tokens` is set
    pub token_pacing: Option<Duration>,
    /// Consecutive timeouts before the link is reported unresponsive
    pub unresponsive_ceiling: u32,
}

impl Default for SerialControllerConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(constants::serial::RESPONSE_TIMEOUT_MS),
            idle_timeout: Duration::from_millis(constants::serial::IDLE_TIMEOUT_MS),
            split_tokens: false,
            token_pacing: Some(Duration::from_millis(constants::serial::TOKEN_PACING_MS)),
            unresponsive_ceiling: constants::serial::UNRESPONSIVE_CEILING,
        }
    }
}

/// Session counters shared between the control loop, the drain task, and
/// external observers. Only the counters cross task boundaries; command
/// content never does.
struct SessionState {
    /// Responses still owed for the current command; 0 means ready for
    /// a new command
    awaiting: AtomicU32,
    /// Declared expectation of the current command (for index computation)
    expected_total: AtomicU32,
    /// Cycles in a row that ended without any accepted response
    consecutive_timeouts: AtomicU32,
    /// An accepted response arrived since the last cycle looked
    response_seen: AtomicBool,
    /// The current command asked for immediate re-evaluation on completion
    hurry: AtomicBool,
    /// End of the current command's response window; None when nothing
    /// has been transmitted for the current expectation
    deadline: Mutex<Option<Instant>>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            awaiting: AtomicU32::new(0),
            expected_total: AtomicU32::new(0),
            consecutive_timeouts: AtomicU32::new(0),
            response_seen: AtomicBool::new(false),
            hurry: AtomicBool::new(false),
            deadline: Mutex::new(None),
        }
    }

    fn arm_deadline(&self, window: Duration) {
        *lock(&self.deadline) = Some(Instant::now() + window);
    }

    /// Time left in the response window; `None` when no window is armed
    fn window_remaining(&self) -> Option<Duration> {
        let deadline = *lock(&self.deadline);
        deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    fn clear_expectation(&self) {
        self.awaiting.store(0, Ordering::Release);
        self.expected_total.store(0, Ordering::Release);
        self.hurry.store(false, Ordering::Release);
        *lock(&self.deadline) = None;
    }
}

fn lock<S>(source: &Mutex<S>) -> MutexGuard<'_, S> {
    source.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One serialized conversation with one serial-attached device or bus.
pub struct SerialController<T: LineTransport, S: CommandSource> {
    name: &'static str,
    config: SerialControllerConfig,
    transport: Arc<T>,
    source: Arc<Mutex<S>>,
    session: Arc<SessionState>,
    wake: Arc<WakeSignal>,
    executor: StateExecutor,
    drain_task: Option<tokio::task::JoinHandle<()>>,
}

impl<T: LineTransport, S: CommandSource> SerialController<T, S> {
    pub fn new(
        name: &'static str,
        transport: Arc<T>,
        source: S,
        config: SerialControllerConfig,
    ) -> Self {
        Self::with_wake(name, transport, source, config, Arc::new(WakeSignal::new()))
    }

    /// Construct around an externally-created wake signal, for hosts that
    /// build the source (registry, service queue) before the controller
    /// and need both to share one signal.
    pub fn with_wake(
        name: &'static str,
        transport: Arc<T>,
        source: S,
        config: SerialControllerConfig,
        wake: Arc<WakeSignal>,
    ) -> Self {
        Self {
            name,
            config,
            transport,
            source: Arc::new(Mutex::new(source)),
            session: Arc::new(SessionState::new()),
            wake: wake.clone(),
            executor: StateExecutor::new(wake),
            drain_task: None,
        }
    }

    /// Spawn the control loop and the response drain task.
    ///
    /// `lines_rx` is the transport's inbound delivery channel, one
    /// complete line per message.
    pub fn start(
        &mut self,
        lines_rx: mpsc::Receiver<String>,
        event_tx: mpsc::Sender<LineEvent>,
    ) -> Result<(), ControlError> {
        let body = SerialLoop {
            name: self.name,
            config: self.config.clone(),
            transport: self.transport.clone(),
            source: self.source.clone(),
            session: self.session.clone(),
            event_tx: event_tx.clone(),
        };
        self.executor.start(body, event_tx.clone())?;

        self.drain_task = Some(tokio::spawn(drain_loop(
            self.name,
            lines_rx,
            self.source.clone(),
            self.session.clone(),
            self.wake.clone(),
            event_tx,
            self.config.unresponsive_ceiling,
        )));
        Ok(())
    }

    /// Stop both tasks. The control loop finishes its current command's
    /// correlation first; the drain task is torn down afterwards.
    pub async fn stop(&mut self) {
        self.executor.stop().await;
        if let Some(task) = self.drain_task.take() {
            task.abort();
            let _ = task.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.executor.is_running()
    }

    /// Wake signal handle for service-queue hookup
    pub fn wake(&self) -> Arc<WakeSignal> {
        self.wake.clone()
    }

    /// Shared source handle for host wiring (registration, queue access)
    pub fn source(&self) -> Arc<Mutex<S>> {
        self.source.clone()
    }

    pub fn awaiting_responses(&self) -> u32 {
        self.session.awaiting.load(Ordering::Acquire)
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.session.consecutive_timeouts.load(Ordering::Acquire)
    }

    /// Link health: true while the consecutive-timeout count stays below
    /// the configured ceiling. Callers suppress work on a dead link.
    pub fn responsive(&self) -> bool {
        self.consecutive_timeouts() < self.config.unresponsive_ceiling
    }

    /// The transport link dropped. Clears the current expectation and
    /// marks everything the source manages stale, so each device is
    /// re-initialized once the link returns.
    pub fn notify_link_lost(&self) {
        tracing::warn!(controller = self.name, "link lost, marking devices stale");
        self.session.clear_expectation();
        lock(&self.source).link_lost();
        self.wake.set();
    }
}

/// Control-loop body: timeout accounting, command selection, transmission.
struct SerialLoop<T: LineTransport, S: CommandSource> {
    name: &'static str,
    config: SerialControllerConfig,
    transport: Arc<T>,
    source: Arc<Mutex<S>>,
    session: Arc<SessionState>,
    event_tx: mpsc::Sender<LineEvent>,
}

impl<T: LineTransport, S: CommandSource> SerialLoop<T, S> {
    /// Record one cycle that ended with responses outstanding and none
    /// arriving. The expectation is abandoned so the next cycle can
    /// re-select; the source re-offers unserviced work, which is the
    /// effective resend.
    fn record_timeout(&self) {
        let count = self.session.consecutive_timeouts.fetch_add(1, Ordering::AcqRel) + 1;
        let abandoned = self.session.awaiting.load(Ordering::Acquire);
        self.session.clear_expectation();
        lock(&self.source).command_abandoned();
        tracing::warn!(
            controller = self.name,
            consecutive = count,
            abandoned_responses = abandoned,
            "response timeout"
        );
        if count == self.config.unresponsive_ceiling {
            tracing::error!(controller = self.name, "link unresponsive");
            let _ = self.event_tx.try_send(LineEvent::ResponsivenessChanged {
                controller: self.name.to_string(),
                responsive: false,
            });
        }
    }

    async fn transmit(&self, cmd: &Command) -> Result<bool, ControlError> {
        if self.config.split_tokens {
            let mut accepted = true;
            for token in cmd.tokens() {
                accepted &= self.transport.send(token).await?;
                if let Some(pacing) = self.config.token_pacing {
                    tokio::time::sleep(pacing).await;
                }
            }
            Ok(accepted)
        } else {
            Ok(self.transport.send(cmd.message()).await?)
        }
    }
}

impl<T: LineTransport, S: CommandSource> ControlLoop for SerialLoop<T, S> {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn cycle(&mut self) -> Result<(), ControlError> {
        // Settle the previous command before considering new work
        if self.session.awaiting.load(Ordering::Acquire) > 0 {
            if self.session.response_seen.swap(false, Ordering::AcqRel) {
                // Responses are trickling in; restart the window
                self.session.arm_deadline(self.config.response_timeout);
                return Ok(());
            }
            // A service-request wake releases the wait early; the
            // expectation holds until its window has actually closed
            if self
                .session
                .window_remaining()
                .is_some_and(|left| !left.is_zero())
            {
                return Ok(());
            }
            self.record_timeout();
        }

        let cmd = lock(&self.source).select_service();
        if cmd.is_idle() {
            return Ok(());
        }

        // Arm the expectation before the bytes go out so the drain task
        // can correlate a fast reply
        self.session.response_seen.store(false, Ordering::Release);
        self.session
            .expected_total
            .store(cmd.expected_responses(), Ordering::Release);
        self.session
            .awaiting
            .store(cmd.expected_responses(), Ordering::Release);
        self.session.hurry.store(cmd.hurry(), Ordering::Release);

        tracing::debug!(
            controller = self.name,
            command = cmd.message(),
            expected = cmd.expected_responses(),
            hurry = cmd.hurry(),
            "sending command"
        );

        match self.transmit(&cmd).await {
            Ok(true) => {
                // The window opens once the bytes are out, which also
                // covers token pacing
                self.session.arm_deadline(self.config.response_timeout);
                Ok(())
            }
            Ok(false) => {
                // Transport declined without a hard fault; same handling
                // as a timeout
                self.record_timeout();
                Ok(())
            }
            Err(e) => {
                self.session.clear_expectation();
                Err(e)
            }
        }
    }

    fn idle_timeout(&self) -> Duration {
        if self.session.awaiting.load(Ordering::Acquire) > 0 {
            // Wait out what is left of the response window; an early
            // wake re-enters it rather than shortening it
            self.session
                .window_remaining()
                .unwrap_or(self.config.response_timeout)
        } else {
            self.config.idle_timeout
        }
    }

    fn busy(&self) -> bool {
        // An unresponsive link cannot drain; never hold shutdown for it
        self.session.awaiting.load(Ordering::Acquire) > 0
            && self.session.consecutive_timeouts.load(Ordering::Acquire)
                < self.config.unresponsive_ceiling
    }
}

/// Dedicated response loop: pops inbound lines one at a time, hands each
/// to the source's validator, and settles the outstanding count.
async fn drain_loop<S: CommandSource>(
    name: &'static str,
    mut lines_rx: mpsc::Receiver<String>,
    source: Arc<Mutex<S>>,
    session: Arc<SessionState>,
    wake: Arc<WakeSignal>,
    event_tx: mpsc::Sender<LineEvent>,
    unresponsive_ceiling: u32,
) {
    tracing::debug!(controller = name, "response drain started");
    while let Some(line) = lines_rx.recv().await {
        let awaiting = session.awaiting.load(Ordering::Acquire);
        if awaiting == 0 {
            tracing::debug!(controller = name, line, "unsolicited line dropped");
            continue;
        }

        let total = session.expected_total.load(Ordering::Acquire);
        let index = total.saturating_sub(awaiting);
        let accepted = lock(&source).process_response(&line, index);

        if accepted {
            session.response_seen.store(true, Ordering::Release);
            let prior_timeouts = session.consecutive_timeouts.swap(0, Ordering::AcqRel);
            if prior_timeouts >= unresponsive_ceiling {
                tracing::info!(controller = name, "link responsive again");
                let _ = event_tx.try_send(LineEvent::ResponsivenessChanged {
                    controller: name.to_string(),
                    responsive: true,
                });
            }
            let remaining = session
                .awaiting
                .fetch_sub(1, Ordering::AcqRel)
                .saturating_sub(1);
            if remaining == 0 && session.hurry.load(Ordering::Acquire) {
                wake.set();
            }
        } else {
            // Reject means resynchronize: flush everything queued and
            // hold the outstanding count
            let mut flushed = 0u32;
            while lines_rx.try_recv().is_ok() {
                flushed += 1;
            }
            tracing::warn!(
                controller = name,
                line,
                flushed,
                "response rejected, delivery queue resynchronized"
            );
        }
    }
    tracing::debug!(controller = name, "response drain stopped");
}
