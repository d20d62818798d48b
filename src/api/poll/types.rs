use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::{Display, EnumIter};

use crate::protocol::modbus::RegisterValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchSource {
    Device,
    /// Synthesized while no device is connected
    Fallback,
}

/// Values gathered in one poll cycle, keyed by register code
///
/// Codes whose fetch failed or whose value failed the range check are absent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollCycleResult {
    pub timestamp: DateTime<Utc>,
    pub source: BatchSource,
    pub values: BTreeMap<String, RegisterValue>,
}

impl PollCycleResult {
    pub fn new(source: BatchSource) -> Self {
        Self {
            timestamp: Utc::now(),
            source,
            values: BTreeMap::new(),
        }
    }

    pub fn get(&self, code: &str) -> Option<RegisterValue> {
        self.values.get(code).copied()
    }

    pub fn contains(&self, code: &str) -> bool {
        self.values.contains_key(code)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NoticeKind {
    /// A tick overran the watchdog bound; counters were reset and polling continues
    Watchdog,
    /// The link was re-established after a connection fault
    Reconnected,
    /// Too many consecutive failed cycles; the engine stopped
    FailureBudgetExhausted,
    /// Reconnection attempts ran out; the engine stopped and asked for a full disconnect
    ReconnectExhausted,
}

impl NoticeKind {
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            NoticeKind::FailureBudgetExhausted | NoticeKind::ReconnectExhausted
        )
    }
}

/// Status message for the collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Notice {
    pub fn new(kind: NoticeKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind.is_fatal()
    }
}

/// Everything the engine reports, as delivered by channel-based handlers
#[derive(Debug, Clone, PartialEq)]
pub enum PollEvent {
    Batch(PollCycleResult),
    Notice(Notice),
    DisconnectRequested,
}
