//! Structured event emission.
//!
//! The engine core never talks to a UI directly; it posts [`Alert`]s into an
//! [`AlertSink`] supplied by the embedder. Sinks must be cheap and must not
//! block the network thread.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::peer::{Operation, PeerId, Severity};
use crate::picker::BlockRequest;

/// Warnings about configuration limits being the bottleneck.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerformanceWarning {
    DownloadLimitTooLow,
    UploadLimitTooLow,
    OutstandingDiskBufferLimitReached,
    TooManyOptimisticUnchokeSlots,
}

/// An event posted by the engine core.
#[derive(Debug, Clone)]
pub enum Alert {
    PeerConnected {
        endpoint: SocketAddr,
        peer_id: Option<PeerId>,
    },
    PeerDisconnected {
        endpoint: SocketAddr,
        peer_id: Option<PeerId>,
        operation: Operation,
        severity: Severity,
        reason: String,
    },
    PeerError {
        endpoint: SocketAddr,
        peer_id: Option<PeerId>,
        operation: Operation,
        reason: String,
    },
    InvalidRequest {
        endpoint: SocketAddr,
        peer_id: Option<PeerId>,
        request: BlockRequest,
    },
    BlockDownloading {
        endpoint: SocketAddr,
        piece: u32,
        block: u32,
    },
    BlockFinished {
        endpoint: SocketAddr,
        piece: u32,
        block: u32,
    },
    BlockTimeout {
        endpoint: SocketAddr,
        piece: u32,
        block: u32,
    },
    PeerSnubbed {
        endpoint: SocketAddr,
        peer_id: Option<PeerId>,
    },
    PeerUnsnubbed {
        endpoint: SocketAddr,
        peer_id: Option<PeerId>,
    },
    PerformanceWarning {
        warning: PerformanceWarning,
    },
    FileError {
        piece: u32,
        reason: String,
    },
}

/// Destination for alerts.
pub trait AlertSink: Send + Sync {
    fn post(&self, alert: Alert);
}

/// A sink that forwards alerts into an unbounded channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Alert>,
}

impl ChannelSink {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Alert>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl AlertSink for ChannelSink {
    fn post(&self, alert: Alert) {
        // receiver may be gone during shutdown
        let _ = self.tx.send(alert);
    }
}

/// A sink that drops everything.
pub struct NullSink;

impl AlertSink for NullSink {
    fn post(&self, _alert: Alert) {}
}

/// A sink that collects alerts in memory, for tests and polling consumers.
#[derive(Default)]
pub struct CollectSink {
    alerts: Mutex<Vec<Alert>>,
}

impl CollectSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn drain(&self) -> Vec<Alert> {
        std::mem::take(&mut *self.alerts.lock())
    }

    pub fn count<F: Fn(&Alert) -> bool>(&self, pred: F) -> usize {
        self.alerts.lock().iter().filter(|a| pred(a)).count()
    }
}

impl AlertSink for CollectSink {
    fn post(&self, alert: Alert) {
        self.alerts.lock().push(alert);
    }
}
