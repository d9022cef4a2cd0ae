//! Centralized tuning constants for the line controllers
//!
//! All timeout, pacing, and threshold values are defined here with
//! rationale from bench testing against the extraction-line hardware.
//! Every value is the *default* of a config field, never hard-wired into
//! control flow; hosts with slower instruments override per controller.
//!
//! **Before changing any constant:**
//! 1. Read its full documentation comment
//! 2. Understand the hardware/protocol basis for the value
//! 3. Test on the real line (multi-drop bus with all drops populated)
//! 4. Update documentation with your findings

/// Serial command/response correlation timing
pub mod serial {
    /// Per-cycle wait for outstanding responses (milliseconds)
    ///
    /// **Value**: 200ms
    ///
    /// **Rationale**: Instrument firmware on the line answers a command in
    /// 20-120ms depending on drop count and command complexity. 200ms
    /// covers the slowest observed reply with margin while keeping the
    /// retry turnaround fast enough that a single dropped line costs one
    /// cycle, not a visible stall.
    ///
    /// **Trade-offs**:
    /// - Shorter: spurious timeout counts on a healthy but loaded bus
    /// - Longer: each lost response stalls unrelated scheduling longer
    ///
    /// **Used in**: `SerialControllerConfig::default`
    pub const RESPONSE_TIMEOUT_MS: u64 = 200;

    /// Idle wait between cycles when nothing is outstanding (milliseconds)
    ///
    /// **Value**: 500ms
    ///
    /// **Rationale**: With no queued work the loop only needs to wake for
    /// new service requests, and those set the wake signal explicitly.
    /// The timed wake is a safety net for missed signals, so it can be
    /// lazy without hurting latency.
    ///
    /// **Used in**: `SerialControllerConfig::default`
    pub const IDLE_TIMEOUT_MS: u64 = 500;

    /// Consecutive timeouts before a link is reported unresponsive
    ///
    /// **Value**: 3
    ///
    /// **Rationale**: One timeout is routine (collision on the multi-drop
    /// bus, instrument busy with a measurement). Two in a row still
    /// happen during heater duty-cycle peaks. Three consecutive misses
    /// has only been observed with a genuinely dead link (unplugged
    /// converter, powered-off rack).
    ///
    /// **Used in**: `SerialControllerConfig::default`
    pub const UNRESPONSIVE_CEILING: u32 = 3;

    /// Pacing delay between tokens of a split command (milliseconds)
    ///
    /// **Value**: 20ms
    ///
    /// **Rationale**: Some instrument families lose characters when a
    /// multi-token command arrives back-to-back (single-byte UART buffer,
    /// firmware polls between tokens). 20ms exceeds the slowest observed
    /// per-token processing time. Families without the limitation leave
    /// pacing off entirely.
    ///
    /// **Used in**: default for `SerialControllerConfig::token_pacing`
    /// when token splitting is enabled
    pub const TOKEN_PACING_MS: u64 = 20;
}

/// Actuation machine timing
pub mod actuator {
    /// Bounded wait for a controller-channel response (milliseconds)
    ///
    /// **Value**: 200ms
    ///
    /// **Rationale**: The bus controller acknowledges within ~50ms when
    /// idle and ~150ms while relaying motion telemetry. A miss is logged
    /// and the next cycle re-polls, so the cost of a timeout is one
    /// cycle, not a failed operation.
    ///
    /// **Used in**: `ActuatorControllerConfig::default`
    pub const CONTROLLER_RESPONSE_WAIT_MS: u64 = 200;

    /// Bounded wait for a sub-device response (milliseconds)
    ///
    /// **Value**: 200ms
    ///
    /// **Rationale**: Dual-channel actuators carry a secondary RS-232
    /// device with its own timing; empirically it answers in the same
    /// envelope as the bus controller, so the two waits share a default
    /// but remain independently configurable.
    ///
    /// **Used in**: `ActuatorControllerConfig::default`
    pub const SUBDEVICE_RESPONSE_WAIT_MS: u64 = 200;

    /// Gap between cycles while an operation is in flight (milliseconds)
    ///
    /// **Value**: 10ms
    ///
    /// **Rationale**: The in-cycle response waits already pace the
    /// machine; the inter-cycle gap only yields the task so other
    /// controllers run. Near-zero keeps state progression prompt.
    ///
    /// **Used in**: `ActuatorControllerConfig::default`
    pub const ACTIVE_CYCLE_GAP_MS: u64 = 10;

    /// Idle wait when the machine is Free with an empty queue (milliseconds)
    ///
    /// **Value**: 250ms
    ///
    /// **Rationale**: Requests arrive with a wake, so the timed wake is a
    /// safety net; 250ms bounds the worst-case pickup latency if a wake
    /// is ever missed.
    ///
    /// **Used in**: `ActuatorControllerConfig::default`
    pub const IDLE_TIMEOUT_MS: u64 = 250;
}
