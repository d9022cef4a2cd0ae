//! # Control Runtime
//!
//! Execution infrastructure for the gas-line control substrate.
//!
//! This crate defines:
//! - **WakeSignal**: single-slot early-wake signalling for control loops
//! - **ControlLoop / StateExecutor**: the periodic loop lifecycle with
//!   start/stop, bounded idle waits, and per-cycle failure isolation
//! - **TargetedState**: desired/actual state pairs with a time-in-state
//!   stopwatch and blocking state-change helpers
//! - **Supervision**: cancellable watchdogs for long-running operations
//!
//! ## Architecture
//!
//! The runtime follows these principles:
//! - **One task per loop**: each component owns a single long-lived task
//! - **No shared mutation**: external callers enqueue requests or set
//!   desired state; machine-internal fields belong to the loop task
//! - **Failure isolation**: a cycle error is logged and reported, never
//!   fatal to the loop
//!
//! ## Example
//!
//! ```ignore
//! use control_runtime::{ControlLoop, StateExecutor, WakeSignal};
//!
//! let wake = Arc::new(WakeSignal::new());
//! let mut executor = StateExecutor::new(wake.clone());
//! executor.start(my_loop, event_tx)?;
//!
//! // Any task may request an early re-evaluation
//! wake.set();
//!
//! // Graceful shutdown: waits for in-flight work to drain
//! executor.stop().await;
//! ```

#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::todo
)]

pub mod executor;
pub mod supervision;
pub mod targeted;
pub mod wake;

pub use executor::{ControlLoop, StateExecutor};
pub use supervision::{spawn_watchdog, SupervisionConfig, TimeoutHandle};
pub use targeted::{TargetedState, DEFAULT_PREDICATE_POLL};
pub use wake::WakeSignal;
