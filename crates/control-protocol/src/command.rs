use serde::{Deserialize, Serialize};

/// One outbound service command paired with its response expectation.
///
/// Immutable value produced by the registry layer's service-selection hook
/// and consumed by a serial controller. An empty message means "nothing to
/// do this cycle".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Command {
    /// Wire text, device-family specific (e.g. `"g r"`, `"n3 1 r"`).
    /// Opaque to the substrate.
    message: String,
    /// How many inbound lines this command must be answered with before
    /// the controller considers it satisfied
    expected_responses: u32,
    /// Re-evaluate for new work as soon as expectations are satisfied,
    /// instead of waiting out the idle period
    hurry: bool,
}

impl Command {
    pub fn new(message: impl Into<String>, expected_responses: u32, hurry: bool) -> Self {
        Self {
            message: message.into(),
            expected_responses,
            hurry,
        }
    }

    /// The no-op command: nothing to send, nothing expected, no hurry
    pub fn idle() -> Self {
        Self {
            message: String::new(),
            expected_responses: 0,
            hurry: false,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.message.is_empty()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn expected_responses(&self) -> u32 {
        self.expected_responses
    }

    pub fn hurry(&self) -> bool {
        self.hurry
    }

    /// Space-delimited tokens of the message, for transports that require
    /// per-token pacing
    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.message.split_whitespace()
    }
}

/// Reason a device asked to be serviced.
///
/// Carried through the service queue alongside the device key and handed
/// to the family hook for translation into wire text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ServiceToken {
    /// Full (re-)initialization, used for freshly registered or stale devices
    Init,
    /// A named desired-state property changed (free-form, family specific)
    Property(String),
}

impl ServiceToken {
    /// Sentinel spelling used on the wire-adjacent logging surface
    pub const INIT_SENTINEL: &'static str = "{Init}";

    pub fn property(name: impl Into<String>) -> Self {
        Self::Property(name.into())
    }
}

impl std::fmt::Display for ServiceToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "{}", Self::INIT_SENTINEL),
            Self::Property(name) => write!(f, "{name}"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_command() {
        let cmd = Command::idle();
        assert!(cmd.is_idle());
        assert_eq!(cmd.expected_responses(), 0);
        assert!(!cmd.hurry());
    }

    #[test]
    fn test_command_tokens() {
        let cmd = Command::new("n3 1 r", 1, true);
        let tokens: Vec<_> = cmd.tokens().collect();
        assert_eq!(tokens, vec!["n3", "1", "r"]);
        assert!(!cmd.is_idle());
        assert!(cmd.hurry());
    }

    #[test]
    fn test_service_token_display() {
        assert_eq!(ServiceToken::Init.to_string(), "{Init}");
        assert_eq!(
            ServiceToken::property("SetpointTorr").to_string(),
            "SetpointTorr"
        );
    }

    #[test]
    fn test_command_serialization() {
        let cmd = Command::new("g r", 2, false);
        let json = serde_json::to_string(&cmd).unwrap();
        let deserialized: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(cmd, deserialized);
    }
}
