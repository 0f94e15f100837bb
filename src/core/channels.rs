//! Channel bundle for the record processing pipeline
//!
//! Ingestion pushes records into a bounded mpsc queue, the router task
//! publishes emitted snapshots on a broadcast channel, and shutdown is a
//! broadcast from main to every task.

use tokio::sync::{broadcast, mpsc};

use crate::core::record::Record;

/// Default capacity for the bounded record queue
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Bundle of all inter-task communication channels
#[derive(Debug)]
pub struct ChannelBundle {
    /// Ingestion -> router: incoming records in delivery order
    pub record_tx: mpsc::Sender<Record>,
    pub record_rx: mpsc::Receiver<Record>,

    /// Router -> consumers: snapshot records emitted per closed cycle
    pub output_tx: broadcast::Sender<Record>,

    /// Shutdown broadcast: main -> all tasks
    pub shutdown_tx: broadcast::Sender<()>,
}

impl ChannelBundle {
    pub fn new(capacity: usize) -> Self {
        let (record_tx, record_rx) = mpsc::channel(capacity);
        let (output_tx, _) = broadcast::channel(capacity);
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            record_tx,
            record_rx,
            output_tx,
            shutdown_tx,
        }
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn subscribe_outputs(&self) -> broadcast::Receiver<Record> {
        self.output_tx.subscribe()
    }
}

impl Default for ChannelBundle {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_bundle_creation() {
        let bundle = ChannelBundle::new(50);
        assert!(!bundle.record_tx.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_signal() {
        let bundle = ChannelBundle::default();
        let mut rx = bundle.subscribe_shutdown();

        assert!(bundle.shutdown_tx.send(()).is_ok());
        assert!(rx.recv().await.is_ok());
    }
}
