//! Named scan events and the sinks that carry them to a UI or CLI.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::types::{PortInfo, ScanComplete, ScanProgress, ScanStatus};

pub const SCAN_STATUS: &str = "scan-status";
pub const SCAN_PROGRESS: &str = "scan-progress";
pub const SCAN_ERROR: &str = "scan-error";
pub const SCAN_COMPLETE: &str = "scan-complete";
pub const PORT_FOUND: &str = "port-found";

/// One emitted event: a name plus its JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanEvent {
    pub name: String,
    pub payload: Value,
}

impl ScanEvent {
    /// Status string carried by a `scan-status` event.
    pub fn status(&self) -> Option<&str> {
        (self.name == SCAN_STATUS).then(|| self.payload.as_str()).flatten()
    }

    pub fn is_terminal_status(&self) -> bool {
        matches!(self.status(), Some("completed" | "cancelled" | "error"))
    }
}

/// Fire-and-forget receiver of scan events.
///
/// Called while the session holds its state lock, so implementations must
/// not block and must not call back into the session.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, name: &str, payload: Value);
}

/// Sink backed by an unbounded channel; events are dropped once the receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ScanEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ScanEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, name: &str, payload: Value) {
        let _ = self.tx.send(ScanEvent {
            name: name.to_string(),
            payload,
        });
    }
}

/// Sink fanning events out to any number of subscribers. Slow subscribers lag and lose events.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<ScanEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, name: &str, payload: Value) {
        let _ = self.tx.send(ScanEvent {
            name: name.to_string(),
            payload,
        });
    }
}

pub(crate) fn emit_status(sink: &dyn EventSink, status: ScanStatus) {
    sink.emit(SCAN_STATUS, Value::String(status.as_str().to_string()));
}

pub(crate) fn emit_progress(sink: &dyn EventSink, progress: &ScanProgress) {
    sink.emit(SCAN_PROGRESS, to_payload(progress));
}

pub(crate) fn emit_port(sink: &dyn EventSink, info: &PortInfo) {
    sink.emit(PORT_FOUND, to_payload(info));
}

pub(crate) fn emit_complete(sink: &dyn EventSink, complete: &ScanComplete) {
    sink.emit(SCAN_COMPLETE, to_payload(complete));
}

pub(crate) fn emit_error(sink: &dyn EventSink, message: &str) {
    sink.emit(SCAN_ERROR, Value::String(message.to_string()));
}

fn to_payload<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}
