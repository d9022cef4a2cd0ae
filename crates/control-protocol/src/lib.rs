//! # Control Protocol
//!
//! Type-safe message and state definitions for the gas-line control
//! substrate.
//!
//! This crate defines the value types exchanged between the substrate's
//! components and its host: commands, service tokens, device keys, the
//! actuation state machine, observer events, and the transport boundary.
//! It has zero runtime dependencies (no tokio), making every type fully
//! testable in plain unit tests.
//!
//! ## Contents
//!
//! - **Command / ServiceToken**: outbound work items and the reasons
//!   devices request service
//! - **DeviceKey**: validated prefix+index registry keys
//! - **ActuationState**: FSM state machine (pure logic, no side effects)
//! - **LineEvent**: substrate → host observer events
//! - **LineTransport**: boundary trait for the physical link

#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::todo
)]

pub mod command;
pub mod errors;
pub mod events;
pub mod key;
pub mod state;
pub mod transport;

pub use command::{Command, ServiceToken};
pub use errors::ControlError;
pub use events::LineEvent;
pub use key::{DeviceKey, MAX_DEVICE_INDEX};
pub use state::ActuationState;
pub use transport::{LineTransport, TransportError};
