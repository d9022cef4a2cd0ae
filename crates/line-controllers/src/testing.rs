//! In-memory transport for unit and integration tests.
//!
//! Records every outbound message and plays back scripted response lines
//! on the inbound channel, so controllers can be exercised end-to-end
//! with no hardware attached.

use control_protocol::{LineTransport, TransportError};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

struct ScriptEntry {
    /// One response set per matching send, consumed front to back
    queued: VecDeque<Vec<String>>,
    /// Replayed once the queue is exhausted (for repeated polls)
    sticky: Option<Vec<String>>,
}

/// Scripted loopback transport.
pub struct ScriptedTransport {
    sent: Mutex<Vec<String>>,
    script: Mutex<HashMap<String, ScriptEntry>>,
    line_tx: mpsc::Sender<String>,
    mute: AtomicBool,
    closed: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ScriptedTransport {
    /// Returns the transport and the inbound line channel to hand to the
    /// controller under test.
    pub fn new() -> (Arc<Self>, mpsc::Receiver<String>) {
        let (line_tx, line_rx) = mpsc::channel(64);
        (
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                script: Mutex::new(HashMap::new()),
                line_tx,
                mute: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
            line_rx,
        )
    }

    /// Queue one response set for the next send of `command`
    pub fn script(&self, command: &str, responses: &[&str]) {
        let mut script = lock(&self.script);
        let entry = script.entry(command.to_string()).or_insert(ScriptEntry {
            queued: VecDeque::new(),
            sticky: None,
        });
        entry
            .queued
            .push_back(responses.iter().map(|s| s.to_string()).collect());
    }

    /// Replay this response set for every send of `command` once queued
    /// sets run out
    pub fn script_repeat(&self, command: &str, responses: &[&str]) {
        let mut script = lock(&self.script);
        let entry = script.entry(command.to_string()).or_insert(ScriptEntry {
            queued: VecDeque::new(),
            sticky: None,
        });
        entry.sticky = Some(responses.iter().map(|s| s.to_string()).collect());
    }

    /// While muted, sends succeed but produce no responses (simulates a
    /// dead or deaf link)
    pub fn set_mute(&self, mute: bool) {
        self.mute.store(mute, Ordering::Release);
    }

    /// Everything sent so far, in order
    pub fn sent(&self) -> Vec<String> {
        lock(&self.sent).clone()
    }

    /// Deliver an unsolicited line, bypassing any script
    pub async fn inject(&self, line: &str) {
        let _ = self.line_tx.send(line.to_string()).await;
    }
}

impl LineTransport for ScriptedTransport {
    async fn send(&self, message: &str) -> Result<bool, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::NotConnected);
        }
        lock(&self.sent).push(message.to_string());
        if self.mute.load(Ordering::Acquire) {
            return Ok(true);
        }

        let responses = {
            let mut script = lock(&self.script);
            match script.get_mut(message) {
                Some(entry) => entry.queued.pop_front().or_else(|| entry.sticky.clone()),
                None => None,
            }
        };
        if let Some(lines) = responses {
            for line in lines {
                let _ = self.line_tx.send(line).await;
            }
        }
        Ok(true)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_responses_in_order() {
        let (transport, mut rx) = ScriptedTransport::new();
        transport.script("g r", &["1.0", "ok"]);
        transport.script("g r", &["2.0", "ok"]);

        assert!(transport.send("g r").await.unwrap());
        assert_eq!(rx.recv().await.unwrap(), "1.0");
        assert_eq!(rx.recv().await.unwrap(), "ok");

        assert!(transport.send("g r").await.unwrap());
        assert_eq!(rx.recv().await.unwrap(), "2.0");

        assert_eq!(transport.sent(), vec!["g r", "g r"]);
    }

    #[tokio::test]
    async fn test_sticky_script_repeats() {
        let (transport, mut rx) = ScriptedTransport::new();
        transport.script("m r", &["0"]);
        transport.script_repeat("m r", &["1"]);

        transport.send("m r").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "0");
        transport.send("m r").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "1");
        transport.send("m r").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "1");
    }

    #[tokio::test]
    async fn test_mute_swallows_responses() {
        let (transport, mut rx) = ScriptedTransport::new();
        transport.script("g r", &["1.0"]);
        transport.set_mute(true);

        transport.send("g r").await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_sends() {
        let (transport, _rx) = ScriptedTransport::new();
        transport.close().await.unwrap();
        assert!(transport.send("g r").await.is_err());
    }
}
