//! Serial-line controllers for laboratory gas-handling automation.
//!
//! Two controller shapes cover the line's instrument mix:
//!
//! - [`SerialController`]: half-duplex command/response scheduling for a
//!   device (or multi-drop family of devices) on one serial link. Pulls
//!   work from a [`CommandSource`], correlates response lines by count,
//!   and tracks link responsiveness through consecutive timeouts.
//! - [`ActuatorController`]: multi-step actuation sequences (configure,
//!   confirm, go, watch motion start and stop) over a shared bus
//!   controller, strictly one actuator at a time, with independent
//!   timing for an optional secondary sub-device channel.
//!
//! [`DeviceRegistry`] and [`SerialDeviceRegistry`] sit between the two
//! worlds: leaf devices request service through a [`ServiceQueue`] and a
//! [`DeviceFamily`] translates those requests into wire commands.

#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]

pub mod actuator;
pub mod constants;
pub mod registry;
pub mod serial;
pub mod serial_registry;
pub mod testing;

pub use actuator::{
    ActuationOperation, Actuator, ActuatorController, ActuatorControllerConfig, RequestHandle,
};
pub use registry::{DeviceRegistry, ManagedDevice, ServiceQueue};
pub use serial::{CommandSource, SerialController, SerialControllerConfig};
pub use serial_registry::{DeviceFamily, SerialDeviceRegistry};
pub use testing::ScriptedTransport;
