//! Poll engine collaborator interfaces
//!
//! The engine reports through [`PollHandler`] and asks it for reconnection
//! parameters. Channel-based implementations live in `handlers`.
use anyhow::Result;
use std::{collections::BTreeSet, time::Duration};

use super::types::{Notice, PollCycleResult};
use crate::api::modbus::ConnectionConfig;

/// Trait for receiving engine output and supplying connection data
pub trait PollHandler: Send + Sync {
    /// Called once per cycle that produced at least one value
    fn handle_batch(&self, batch: PollCycleResult) -> Result<()>;

    /// Called for watchdog, reconnect and terminal conditions
    fn handle_notice(&self, notice: Notice);

    /// Parameters for the next reconnection attempt
    ///
    /// `None` skips the attempt; it still counts against the reconnect budget.
    fn connection_config(&self) -> Option<ConnectionConfig> {
        None
    }

    /// Reconnection is exhausted; the collaborator should tear the connection down
    fn request_disconnect(&self) {}
}

/// Value generator used while the fallback mode is on and no device is connected
pub trait FallbackSource: Send {
    /// Produce raw values for the visible codes; `elapsed` is time since fallback began
    fn generate(&mut self, elapsed: Duration, visible: &BTreeSet<String>) -> Vec<(String, i64)>;
}

/// Handler that discards everything (useful for testing)
pub struct NoOpHandler;

impl PollHandler for NoOpHandler {
    fn handle_batch(&self, _batch: PollCycleResult) -> Result<()> {
        Ok(())
    }

    fn handle_notice(&self, _notice: Notice) {}
}
