//! Ordered inbound event queue.
//!
//! Uses a bounded [`tokio::sync::mpsc`] channel under the hood: any number of
//! producers (the connection reader, a replay file, tests) feed one consumer,
//! the event loop, which handles one [`TransportEvent`] at a time in arrival
//! order.
//!
//! | Side | Type | Operations |
//! |---|---|---|
//! | producer | [`EventSender`] | `send` (awaits capacity), `try_send` |
//! | consumer | [`EventQueue`] | `recv` (awaits), `try_recv` |
//!
//! Events are also exchanged as JSON lines; see [`decode_line`] and
//! [`encode_line`].

use conduit_types::{ConduitError, TransportEvent};
use tokio::sync::mpsc;
use tracing::warn;

/// Default number of buffered events before producers wait.
pub const DEFAULT_CAPACITY: usize = 256;

/// Create a connected sender/queue pair holding up to `capacity` events.
pub fn channel(capacity: usize) -> (EventSender, EventQueue) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventSender { tx }, EventQueue { rx })
}

/// Producer side. Clone it cheaply – all clones feed the same queue.
#[derive(Clone, Debug)]
pub struct EventSender {
    tx: mpsc::Sender<TransportEvent>,
}

impl EventSender {
    /// Enqueue `event`, waiting for room if the queue is full.
    ///
    /// Fails with [`ConduitError::Transport`] once the queue was dropped.
    pub async fn send(&self, event: TransportEvent) -> Result<(), ConduitError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| ConduitError::Transport("event queue closed".into()))
    }

    /// Enqueue without waiting. A full or closed queue is an error.
    pub fn try_send(&self, event: TransportEvent) -> Result<(), ConduitError> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                warn!("event queue full, event rejected");
                ConduitError::Transport("event queue full".into())
            }
            mpsc::error::TrySendError::Closed(_) => ConduitError::Transport("event queue closed".into()),
        })
    }
}

/// Consumer side, owned by the event loop.
#[derive(Debug)]
pub struct EventQueue {
    rx: mpsc::Receiver<TransportEvent>,
}

impl EventQueue {
    /// Wait for the next event. `None` once every sender is gone and the
    /// queue is drained.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<TransportEvent> {
        self.rx.try_recv().ok()
    }

    /// Stop accepting new events; already queued ones can still be received.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

// ---------------------------------------------------------------------------
// JSON lines
// ---------------------------------------------------------------------------

/// Parse one line of an event stream.
///
/// Blank lines and lines starting with `#` yield `Ok(None)`.
pub fn decode_line(line: &str) -> Result<Option<TransportEvent>, ConduitError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    serde_json::from_str(line)
        .map(Some)
        .map_err(|e| ConduitError::Transport(format!("malformed event line: {e}")))
}

/// Render `event` as a single JSON line (without the trailing newline).
pub fn encode_line(event: &TransportEvent) -> Result<String, ConduitError> {
    serde_json::to_string(event).map_err(|e| ConduitError::Transport(format!("event encoding failed: {e}")))
}
