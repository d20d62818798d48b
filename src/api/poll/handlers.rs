//! Flume-based implementation of the poll handler
//!
//! Batches and notices are forwarded as [`PollEvent`]s; connection parameters for
//! reconnection are whatever the collaborator last stored.
use anyhow::Result;
use parking_lot::RwLock;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use super::{
    traits::PollHandler,
    types::{Notice, PollCycleResult, PollEvent},
};
use crate::api::modbus::ConnectionConfig;

pub struct FlumePollHandler {
    sender: flume::Sender<PollEvent>,
    connection: RwLock<Option<ConnectionConfig>>,
    disconnect_requested: Arc<AtomicBool>,
}

impl FlumePollHandler {
    /// Create a new handler with an unbounded channel
    pub fn new() -> (Self, flume::Receiver<PollEvent>) {
        let (sender, receiver) = flume::unbounded();
        (Self::with_sender(sender), receiver)
    }

    /// Create a new handler with a bounded channel
    ///
    /// When the consumer lags, batches are dropped rather than stalling the bus.
    pub fn with_capacity(cap: usize) -> (Self, flume::Receiver<PollEvent>) {
        let (sender, receiver) = flume::bounded(cap);
        (Self::with_sender(sender), receiver)
    }

    fn with_sender(sender: flume::Sender<PollEvent>) -> Self {
        Self {
            sender,
            connection: RwLock::new(None),
            disconnect_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Remember the parameters used for later reconnection attempts
    pub fn set_connection_config(&self, config: ConnectionConfig) {
        *self.connection.write() = Some(config);
    }

    pub fn disconnect_requested(&self) -> bool {
        self.disconnect_requested.load(Ordering::SeqCst)
    }
}

impl PollHandler for FlumePollHandler {
    fn handle_batch(&self, batch: PollCycleResult) -> Result<()> {
        self.sender
            .try_send(PollEvent::Batch(batch))
            .map_err(|err| anyhow::anyhow!("Failed to deliver batch: {err}"))
    }

    fn handle_notice(&self, notice: Notice) {
        // Notices must not be lost to a full channel
        let _ = self.sender.send(PollEvent::Notice(notice));
    }

    fn connection_config(&self) -> Option<ConnectionConfig> {
        self.connection.read().clone()
    }

    fn request_disconnect(&self) {
        self.disconnect_requested.store(true, Ordering::SeqCst);
        let _ = self.sender.send(PollEvent::DisconnectRequested);
    }
}
