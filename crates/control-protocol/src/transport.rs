use std::future::Future;
use thiserror::Error;

/// Errors surfaced by the transport boundary
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Transport not connected")]
    NotConnected,

    #[error("Transport error: {0}")]
    Other(String),
}

/// Boundary with the physical transport collaborator.
///
/// The substrate does not open ports or parse framing; it hands complete
/// outbound messages to the transport and receives complete inbound lines
/// on a channel supplied at controller start. `send` returns `Ok(false)`
/// when the transport declined the message without a hard fault (e.g. the
/// link is mid-reconnect); the controller treats that like a timeout.
///
/// Both methods return `Send` futures: controllers call them from loop
/// tasks running under `tokio::spawn`.
pub trait LineTransport: Send + Sync + 'static {
    /// Queue one outbound message for transmission
    fn send(&self, message: &str) -> impl Future<Output = Result<bool, TransportError>> + Send;

    /// Tear down the link; inbound delivery stops after this resolves
    fn close(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::Io("device unplugged".into());
        assert_eq!(err.to_string(), "I/O error: device unplugged");
        assert_eq!(
            TransportError::NotConnected.to_string(),
            "Transport not connected"
        );
    }
}
