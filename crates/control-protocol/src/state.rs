/// # Actuation State Machine
///
/// Per-operation state machine for driving one actuator on a shared
/// multi-drop bus. Exactly one actuator's machine is active at a time;
/// the machine always returns to `Free` before the next queued request
/// is taken up.
///
/// ## State Transition Diagram
///
/// ```text
///                ┌────────────────────────────────────────────┐
///                │                                            │
///           ┌────▼───┐  dequeue +          ┌─────────────┐    │
///           │  Free  │  isolation prime    │ Configuring │◄─┐ │
///           └────▲───┘ ───────────────────►└──────┬──────┘  │ │
///                │                                │ report  │ │
///                │ stopped                        ▼ received│ │
///          ┌─────┴─────────┐   mismatch    ┌────────────┐   │ │
///          │ AwaitingFinish│◄─────┐        │ Confirming ├───┘ │
///          └─────▲─────────┘      │        └──────┬─────┘     │
///                │ motion /       │ (loop back)   │ settings  │
///                │ inhibited      │               ▼ match     │
///          ┌─────┴──────────┐     │        ┌────────────┐     │
///          │ AwaitingMotion │◄────┼────────┤   Going    │     │
///          └────────────────┘     │        └────────────┘     │
///                                                             │
///            any active state ──► Aborting ── stopped ────────┘
/// ```
///
/// ## State Invariants
///
/// - **Free**: no current actuator; the queue may hold pending requests
/// - **Configuring**: configuration tokens sent, confirmation report requested
/// - **Confirming**: reported settings being compared against desired;
///   mismatch loops back to Configuring (bounded only by the operation
///   watchdog, not counted as an error)
/// - **Going**: start-motion command issued this cycle
/// - **AwaitingMotion**: polling for motion onset (or a motion-inhibited
///   condition, which also advances)
/// - **AwaitingFinish**: polling until the actuator reports stopped
/// - **Aborting**: stop commands issued on both channels; resolves to Free
///
/// `Aborting` is reachable from every active state: an abort must be able
/// to interrupt an operation at any phase. It is not reachable from
/// `Free` — with nothing in flight, an abort only drains the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ActuationState {
    /// No operation in flight, ready to dequeue the next request
    Free,

    /// Sending the operation's configuration and requesting confirmation
    Configuring,

    /// Comparing the confirmation report against desired settings
    Confirming,

    /// Issuing the start-motion command
    Going,

    /// Waiting for motion onset
    AwaitingMotion,

    /// Waiting for the actuator to stop
    AwaitingFinish,

    /// Stopping an in-flight operation early
    Aborting,
}

impl ActuationState {
    /// True for every state with an operation in flight
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Free)
    }

    /// Validate if transition to new_state is allowed from current state
    pub fn can_transition_to(&self, new_state: ActuationState) -> bool {
        use ActuationState::*;

        // An in-flight operation can always be routed through Aborting
        if self.is_active() && new_state == Aborting {
            return true;
        }

        match (self, new_state) {
            (Free, Free) => true, // Idempotent idle cycle
            (Free, Configuring) => true, // Request dequeued

            (Configuring, Confirming) => true, // Confirmation report received

            (Confirming, Configuring) => true, // Settings mismatch, resend
            (Confirming, Going) => true, // Settings match, sub-device ready

            (Going, AwaitingMotion) => true, // Unconditional

            (AwaitingMotion, AwaitingFinish) => true, // Motion seen or inhibited

            (AwaitingFinish, Free) => true, // Stopped: operation complete

            (Aborting, Free) => true, // Stopped: operation aborted

            _ => false,
        }
    }

    pub fn status_text(&self) -> &'static str {
        match self {
            Self::Free => "Idle",
            Self::Configuring => "Configuring actuator...",
            Self::Confirming => "Confirming settings...",
            Self::Going => "Starting motion...",
            Self::AwaitingMotion => "Waiting for motion...",
            Self::AwaitingFinish => "Waiting for stop...",
            Self::Aborting => "Aborting...",
        }
    }
}
