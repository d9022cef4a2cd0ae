use crate::key::DeviceKey;
use crate::state::ActuationState;
use serde::{Deserialize, Serialize};

/// Events from the substrate to the host process.
///
/// The substrate is embedded in a larger host (configuration loader, UI,
/// alerting); it reports noteworthy conditions on a channel rather than
/// returning them, since most arise inside long-lived loop tasks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum LineEvent {
    /// An actuation machine moved between states
    ActuationStateChanged {
        controller: String,
        from: ActuationState,
        to: ActuationState,
    },

    /// A serial link's health flipped (ceiling of consecutive timeouts
    /// crossed, or a response arrived on a link presumed dead)
    ResponsivenessChanged { controller: String, responsive: bool },

    /// A device was bound into a registry
    DeviceRegistered { key: DeviceKey },

    /// A device was detached (removal, or displaced by re-registration)
    DeviceDetached { key: DeviceKey },

    /// A supervised operation overran its watchdog deadline
    OperationTimeout { operation: String },

    /// Status message for host display
    StatusUpdate { message: String },

    /// Error caught at a loop boundary (the loop continues)
    Error { message: String },
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = LineEvent::ActuationStateChanged {
            controller: "actuator-bus".into(),
            from: ActuationState::Free,
            to: ActuationState::Configuring,
        };
        let json = serde_json::to_string(&event).unwrap();
        let deserialized: LineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, deserialized);
    }

    #[test]
    fn test_device_event_serialization() {
        let key = DeviceKey::parse("a3").unwrap();
        let event = LineEvent::DeviceRegistered { key };
        let json = serde_json::to_string(&event).unwrap();
        match serde_json::from_str(&json).unwrap() {
            LineEvent::DeviceRegistered { key: k } => assert_eq!(k, key),
            _ => panic!("Wrong variant"),
        }
    }
}
