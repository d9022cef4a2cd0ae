//! Error Handling Guidelines
//!
//! All error messages should follow this format:
//!
//! 1. **What failed**: Describe the operation that failed
//! 2. **Why it failed**: Provide the root cause if known
//! 3. **What to do**: Suggest caller action when possible
//!
//! Examples:
//! - ✅ "Invalid device key: prefix 'V' is not a lowercase ASCII letter. Device families use single-letter prefixes like 'v' or 'a'."
//! - ✅ "State change did not settle - target predicate never held within 500ms. Check that the device loop is running."
//! - ❌ "Bad key" (lacks context and action)
//! - ❌ "Error" (too vague)

use thiserror::Error;

/// Unified error type for substrate operations
#[derive(Error, Debug, Clone)]
pub enum ControlError {
    /// State transition was rejected
    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    /// Device key failed prefix+index validation
    #[error("Invalid device key: {0}")]
    InvalidKey(String),

    /// Executor was started while its loop was already running
    #[error("Executor already running: {0}")]
    AlreadyRunning(String),

    /// Timeout waiting for a condition or response
    #[error("Operation timeout: {0}")]
    Timeout(String),

    /// Transport layer error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Device not found in the registry
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Communication channel closed
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<String> for ControlError {
    fn from(s: String) -> Self {
        ControlError::Other(s)
    }
}

impl From<&str> for ControlError {
    fn from(s: &str) -> Self {
        ControlError::Other(s.to_string())
    }
}

impl From<crate::transport::TransportError> for ControlError {
    fn from(e: crate::transport::TransportError) -> Self {
        ControlError::Transport(e.to_string())
    }
}
