//! Progress reporting for sync and rebuild runs

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// Event emitted while documents are pushed to the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// Emitted after each batch
    #[serde(rename_all = "camelCase")]
    AddProgress {
        total_count: u64,
        processed_count: u64,
    },

    /// Emitted once the source is drained
    #[serde(rename_all = "camelCase")]
    AddFinished {
        total_count: u64,
        processed_count: u64,
    },

    /// A rebuild failed; the index set is normalized afterwards
    RebuildFailed { error: String },
}

/// Receiver of [`SyncEvent`]s
pub trait SyncObserver: Send + Sync {
    fn notify(&self, event: SyncEvent);
}

/// Observer that drops every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl SyncObserver for NoopObserver {
    fn notify(&self, _event: SyncEvent) {}
}

/// Observer forwarding events over an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<SyncEvent>,
}

impl ChannelObserver {
    pub fn new(tx: mpsc::UnboundedSender<SyncEvent>) -> Self {
        Self { tx }
    }

    /// Create an observer together with its receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl SyncObserver for ChannelObserver {
    fn notify(&self, event: SyncEvent) {
        if self.tx.send(event).is_err() {
            debug!("Sync event receiver dropped");
        }
    }
}
