use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// Tunables the collaborator may change while the engine runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollConfig {
    /// At most one fetch per this interval
    #[serde(default = "default_min_update_interval_ms")]
    pub min_update_interval_ms: u64,
    /// Advisory only
    #[serde(default = "default_max_update_interval_ms")]
    pub max_update_interval_ms: u64,
    #[serde(default = "default_watchdog_timeout_secs")]
    pub watchdog_timeout_secs: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    /// Advisory only; sized for the consumer's history buffer
    #[serde(default = "default_max_data_points")]
    pub max_data_points: usize,
}

fn default_min_update_interval_ms() -> u64 {
    1
}

fn default_max_update_interval_ms() -> u64 {
    10
}

fn default_watchdog_timeout_secs() -> u64 {
    10
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_max_data_points() -> usize {
    1_000_000
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            min_update_interval_ms: default_min_update_interval_ms(),
            max_update_interval_ms: default_max_update_interval_ms(),
            watchdog_timeout_secs: default_watchdog_timeout_secs(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            max_data_points: default_max_data_points(),
        }
    }
}

impl PollConfig {
    pub fn min_update_interval(&self) -> Duration {
        Duration::from_millis(self.min_update_interval_ms)
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_secs(self.watchdog_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    /// Apply the keys present in `update`, leaving the rest unchanged
    pub fn merge(&mut self, update: &PollConfigUpdate) {
        if let Some(v) = update.min_update_interval_ms {
            self.min_update_interval_ms = v;
        }
        if let Some(v) = update.max_update_interval_ms {
            self.max_update_interval_ms = v;
        }
        if let Some(v) = update.watchdog_timeout_secs {
            self.watchdog_timeout_secs = v;
        }
        if let Some(v) = update.max_reconnect_attempts {
            self.max_reconnect_attempts = v;
        }
        if let Some(v) = update.reconnect_delay_secs {
            self.reconnect_delay_secs = v;
        }
        if let Some(v) = update.max_data_points {
            self.max_data_points = v;
        }
    }
}

/// Partial [`PollConfig`]; `None` keeps the current value
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfigUpdate {
    pub min_update_interval_ms: Option<u64>,
    pub max_update_interval_ms: Option<u64>,
    pub watchdog_timeout_secs: Option<u64>,
    pub max_reconnect_attempts: Option<u32>,
    pub reconnect_delay_secs: Option<u64>,
    pub max_data_points: Option<usize>,
}

/// Snapshot of the engine's counters, published after every tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStatus {
    pub running: bool,
    pub connected: bool,
    pub consecutive_failures: u32,
    pub reconnect_attempts: u32,
    pub cycles: u64,
    pub batches: u64,
    pub watchdog_resets: u32,
    /// Time since the last delivered batch, or since the last reset
    pub since_last_success: Duration,
}

/// Counters owned by the engine task
#[derive(Debug, Clone)]
pub(crate) struct WorkerState {
    pub consecutive_failures: u32,
    pub reconnect_attempts: u32,
    pub last_success: Instant,
    pub last_cycle: Instant,
    pub last_fetch: Option<Instant>,
    /// Set after a connection-level fault until a reconnect succeeds
    pub link_lost: bool,
    pub cycles: u64,
    pub batches: u64,
    pub watchdog_resets: u32,
}

impl WorkerState {
    pub fn new(now: Instant) -> Self {
        Self {
            consecutive_failures: 0,
            reconnect_attempts: 0,
            last_success: now,
            last_cycle: now,
            last_fetch: None,
            link_lost: false,
            cycles: 0,
            batches: 0,
            watchdog_resets: 0,
        }
    }

    /// Reset after the watchdog fired
    ///
    /// Reconnect attempts survive, so a link that keeps failing still runs out
    /// of attempts.
    pub fn restart(&mut self, now: Instant) {
        self.consecutive_failures = 0;
        self.last_success = now;
        self.last_cycle = now;
        self.watchdog_resets += 1;
    }

    pub fn record_success(&mut self, now: Instant) {
        self.consecutive_failures = 0;
        self.reconnect_attempts = 0;
        self.last_success = now;
        self.batches += 1;
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
    }
}

/// The only state crossing the task boundary
pub(crate) struct Shared {
    pub running: AtomicBool,
    pub fallback: AtomicBool,
    visible: RwLock<Arc<BTreeSet<String>>>,
    config: Mutex<PollConfig>,
    status: Mutex<WorkerStatus>,
}

impl Shared {
    pub fn new(config: PollConfig, visible: BTreeSet<String>) -> Self {
        Self {
            running: AtomicBool::new(true),
            fallback: AtomicBool::new(false),
            visible: RwLock::new(Arc::new(visible)),
            config: Mutex::new(config),
            status: Mutex::new(WorkerStatus::default()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn fallback_enabled(&self) -> bool {
        self.fallback.load(Ordering::SeqCst)
    }

    /// Whole-set snapshot; replacements never show up half-applied
    pub fn visible(&self) -> Arc<BTreeSet<String>> {
        self.visible.read().clone()
    }

    pub fn replace_visible(&self, codes: BTreeSet<String>) {
        *self.visible.write() = Arc::new(codes);
    }

    pub fn config(&self) -> PollConfig {
        self.config.lock().clone()
    }

    pub fn merge_config(&self, update: &PollConfigUpdate) {
        self.config.lock().merge(update);
    }

    pub fn status(&self) -> WorkerStatus {
        self.status.lock().clone()
    }

    pub fn publish(&self, state: &WorkerState, connected: bool) {
        *self.status.lock() = WorkerStatus {
            running: self.is_running(),
            connected,
            consecutive_failures: state.consecutive_failures,
            reconnect_attempts: state.reconnect_attempts,
            cycles: state.cycles,
            batches: state.batches,
            watchdog_resets: state.watchdog_resets,
            since_last_success: state.last_success.elapsed(),
        };
    }
}
