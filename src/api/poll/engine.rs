use anyhow::Result;
use std::{
    collections::BTreeSet,
    sync::{atomic::Ordering, Arc},
    thread::JoinHandle,
    time::{Duration, Instant},
};

use super::{
    catalog::{self, Fetch, PointSpec, BASE_BLOCK_ADDRESS, BASE_BLOCK_LEN},
    fallback::WaveformSource,
    state::{PollConfig, PollConfigUpdate, Shared, WorkerState, WorkerStatus},
    traits::{FallbackSource, PollHandler},
    types::{BatchSource, Notice, NoticeKind, PollCycleResult},
};
use crate::{
    api::modbus::{Fault, RegisterClient},
    core::logs::Logger,
    protocol::modbus::{decode_twos_complement, RegisterValue},
};

/// Failed cycles in a row before the engine gives up
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 10;

const RESTART_PAUSE: Duration = Duration::from_secs(1);
const IDLE_PAUSE: Duration = Duration::from_millis(100);
const FAULT_BACKOFF: Duration = Duration::from_millis(10);

enum Control {
    Stop,
}

/// Entry point for starting the background poller
pub struct PollEngine;

impl PollEngine {
    /// Start configuring an engine that will take ownership of `client`
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use std::sync::Arc;
    /// use servolink::{
    ///     api::{modbus::{ConnectionConfig, RegisterClient}, poll::{FlumePollHandler, PollEngine}},
    ///     core::logs::Logger,
    /// };
    ///
    /// let logger = Logger::default();
    /// let config = ConnectionConfig::new("/dev/ttyUSB0", 115200, 1);
    /// let mut client = RegisterClient::serial(logger.child("client"));
    /// client.connect(&config)?;
    ///
    /// let (handler, events) = FlumePollHandler::new();
    /// handler.set_connection_config(config);
    /// let engine = PollEngine::builder(client, logger)
    ///     .visible_codes(["P0B-00", "P0B-01"])
    ///     .spawn(Arc::new(handler))?;
    ///
    /// while let Ok(event) = events.recv() {
    ///     println!("{event:?}");
    /// }
    /// engine.stop();
    /// # Ok::<(), anyhow::Error>(())
    /// ```
    pub fn builder(client: RegisterClient, logger: Logger) -> PollEngineBuilder {
        PollEngineBuilder {
            client,
            logger,
            config: PollConfig::default(),
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            fallback: Box::new(WaveformSource::new()),
            fallback_enabled: false,
            visible: BTreeSet::new(),
        }
    }
}

pub struct PollEngineBuilder {
    client: RegisterClient,
    logger: Logger,
    config: PollConfig,
    max_consecutive_failures: u32,
    fallback: Box<dyn FallbackSource>,
    fallback_enabled: bool,
    visible: BTreeSet<String>,
}

impl PollEngineBuilder {
    pub fn config(mut self, config: PollConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_consecutive_failures(mut self, limit: u32) -> Self {
        self.max_consecutive_failures = limit.max(1);
        self
    }

    pub fn fallback_source(mut self, source: impl FallbackSource + 'static) -> Self {
        self.fallback = Box::new(source);
        self
    }

    pub fn fallback_mode(mut self, enabled: bool) -> Self {
        self.fallback_enabled = enabled;
        self
    }

    pub fn visible_codes<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.visible = codes.into_iter().map(Into::into).collect();
        self
    }

    /// Spawn the polling thread
    pub fn spawn(self, handler: Arc<dyn PollHandler>) -> Result<PollHandle> {
        let shared = Arc::new(Shared::new(self.config, self.visible));
        shared
            .fallback
            .store(self.fallback_enabled, Ordering::SeqCst);
        let (control_tx, control_rx) = flume::unbounded();

        let worker = PollWorker {
            client: self.client,
            handler,
            shared: shared.clone(),
            control: control_rx,
            fallback: self.fallback,
            fallback_started: None,
            max_consecutive_failures: self.max_consecutive_failures,
            state: WorkerState::new(Instant::now()),
            logger: self.logger,
        };

        let thread = std::thread::Builder::new()
            .name("servolink-poll".to_string())
            .spawn(move || worker.run())?;

        Ok(PollHandle {
            stopper: PollStopper {
                shared,
                control: control_tx,
            },
            thread: Some(thread),
        })
    }
}

/// Cloneable stop request, e.g. for signal handlers
#[derive(Clone)]
pub struct PollStopper {
    shared: Arc<Shared>,
    control: flume::Sender<Control>,
}

impl PollStopper {
    /// Idempotent; wakes the engine out of any pause
    pub fn stop(&self) {
        if self.shared.running.swap(false, Ordering::SeqCst) {
            let _ = self.control.send(Control::Stop);
        }
    }
}

/// Foreground view of a running engine
///
/// Dropping the handle stops the engine and waits for the task to release the link.
pub struct PollHandle {
    stopper: PollStopper,
    thread: Option<JoinHandle<RegisterClient>>,
}

impl PollHandle {
    /// Replace the visible set in one step
    pub fn set_visible_codes<I, S>(&self, codes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stopper
            .shared
            .replace_visible(codes.into_iter().map(Into::into).collect());
    }

    pub fn visible_codes(&self) -> BTreeSet<String> {
        self.stopper.shared.visible().as_ref().clone()
    }

    pub fn set_fallback_mode(&self, enabled: bool) {
        self.stopper.shared.fallback.store(enabled, Ordering::SeqCst);
    }

    pub fn fallback_mode(&self) -> bool {
        self.stopper.shared.fallback_enabled()
    }

    pub fn update_config(&self, update: &PollConfigUpdate) {
        self.stopper.shared.merge_config(update);
    }

    pub fn config(&self) -> PollConfig {
        self.stopper.shared.config()
    }

    pub fn status(&self) -> WorkerStatus {
        self.stopper.shared.status()
    }

    pub fn is_running(&self) -> bool {
        self.stopper.shared.is_running()
    }

    pub fn stopper(&self) -> PollStopper {
        self.stopper.clone()
    }

    pub fn stop(&self) {
        self.stopper.stop();
    }

    /// Wait for the engine to exit and take the client back
    pub fn join(mut self) -> Option<RegisterClient> {
        self.stop();
        self.thread.take().and_then(|thread| thread.join().ok())
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct PollWorker {
    client: RegisterClient,
    handler: Arc<dyn PollHandler>,
    shared: Arc<Shared>,
    control: flume::Receiver<Control>,
    fallback: Box<dyn FallbackSource>,
    fallback_started: Option<Instant>,
    max_consecutive_failures: u32,
    state: WorkerState,
    logger: Logger,
}

impl PollWorker {
    fn run(mut self) -> RegisterClient {
        self.logger.info(format_args!(
            "Poll engine started (failure budget {})",
            self.max_consecutive_failures
        ));
        self.state = WorkerState::new(Instant::now());

        while self.shared.is_running() {
            let now = Instant::now();
            let config = self.shared.config();

            if now.duration_since(self.state.last_cycle) > config.watchdog_timeout() {
                if !self.on_watchdog(now, &config) {
                    break;
                }
                continue;
            }

            if self.state.consecutive_failures >= self.max_consecutive_failures {
                let message = format!(
                    "too many errors: {} consecutive failed cycles",
                    self.state.consecutive_failures
                );
                self.logger.error(format_args!("{message}, stopping"));
                self.handler
                    .handle_notice(Notice::new(NoticeKind::FailureBudgetExhausted, message));
                break;
            }

            let keep_running = if self.client.is_connected() {
                self.tick_connected(now, &config)
            } else if self.state.link_lost {
                self.reconnect(&config)
            } else if self.shared.fallback_enabled() {
                self.tick_fallback(now, &config)
            } else {
                self.fallback_started = None;
                self.pause(IDLE_PAUSE)
            };

            // a reconnect stamps the end of its delay; keep the later mark
            self.state.last_cycle = self.state.last_cycle.max(now);
            self.publish();
            if !keep_running {
                break;
            }
        }

        self.shared.running.store(false, Ordering::SeqCst);
        self.client.disconnect();
        self.publish();
        self.logger.info(format_args!("Poll engine stopped"));
        self.client
    }

    fn on_watchdog(&mut self, now: Instant, config: &PollConfig) -> bool {
        let overrun = now.duration_since(self.state.last_cycle);
        self.logger.warn(format_args!(
            "Watchdog: last tick took {} ms (limit {} s), resetting worker state",
            overrun.as_millis(),
            config.watchdog_timeout_secs
        ));
        self.state.restart(now);
        self.publish();
        self.handler.handle_notice(Notice::new(
            NoticeKind::Watchdog,
            format!(
                "worker timeout after {} ms - restart required",
                overrun.as_millis()
            ),
        ));

        let keep_running = self.pause(RESTART_PAUSE);
        self.state.last_cycle = Instant::now();
        keep_running
    }

    /// Returns `Some(pause result)` while the fetch is throttled
    fn throttle(&self, now: Instant, config: &PollConfig) -> Option<bool> {
        let last = self.state.last_fetch?;
        let since = now.duration_since(last);
        let min = config.min_update_interval();
        (since < min).then(|| self.pause(min - since))
    }

    fn tick_connected(&mut self, now: Instant, config: &PollConfig) -> bool {
        if let Some(keep_running) = self.throttle(now, config) {
            return keep_running;
        }

        let visible = self.shared.visible();
        if visible.is_empty() {
            return self.pause(IDLE_PAUSE);
        }

        self.state.last_fetch = Some(now);
        self.state.cycles += 1;
        match self.poll_cycle(&visible) {
            Ok(batch) if batch.is_empty() => {
                self.state.record_failure();
                self.logger.debug(format_args!(
                    "Cycle produced no values ({} consecutive failures)",
                    self.state.consecutive_failures
                ));
                true
            }
            Ok(batch) => {
                self.deliver(batch);
                true
            }
            Err(fault) => self.on_cycle_abort(fault, config),
        }
    }

    fn tick_fallback(&mut self, now: Instant, config: &PollConfig) -> bool {
        if let Some(keep_running) = self.throttle(now, config) {
            return keep_running;
        }

        let visible = self.shared.visible();
        let started = *self.fallback_started.get_or_insert(now);
        let mut batch = PollCycleResult::new(BatchSource::Fallback);
        for (code, raw) in self.fallback.generate(now.duration_since(started), &visible) {
            let Some(point) = catalog::lookup(&code) else {
                continue;
            };
            match typed_value(point, raw) {
                Some(value) => self.admit(&mut batch, point, value),
                None => self.logger.warn(format_args!(
                    "Synthetic {code} value {raw} does not fit its register type"
                )),
            }
        }

        self.state.last_fetch = Some(now);
        if batch.is_empty() {
            return self.pause(IDLE_PAUSE);
        }
        self.deliver(batch);
        true
    }

    fn deliver(&mut self, batch: PollCycleResult) {
        self.state.record_success(Instant::now());
        if let Err(err) = self.handler.handle_batch(batch) {
            self.logger
                .warn(format_args!("Handler failed to process batch: {err}"));
        }
    }

    fn on_cycle_abort(&mut self, fault: Fault, config: &PollConfig) -> bool {
        self.state.record_failure();
        if fault.is_timeout() || fault.is_malformed() {
            self.logger.warn(format_args!(
                "Poll cycle failed ({} consecutive failures): {fault}",
                self.state.consecutive_failures
            ));
            return self.pause(FAULT_BACKOFF);
        }

        self.logger
            .error(format_args!("Poll cycle aborted, reconnecting: {fault}"));
        self.state.link_lost = true;
        self.reconnect(config)
    }

    fn reconnect(&mut self, config: &PollConfig) -> bool {
        if self.state.reconnect_attempts >= config.max_reconnect_attempts {
            self.logger.error(format_args!(
                "Reconnection failed {} times, giving up",
                self.state.reconnect_attempts
            ));
            self.handler.handle_notice(Notice::new(
                NoticeKind::ReconnectExhausted,
                "connection failure - reconnect impossible",
            ));
            self.handler.request_disconnect();
            return false;
        }

        self.state.reconnect_attempts += 1;
        self.logger.info(format_args!(
            "Reconnect attempt {}/{}",
            self.state.reconnect_attempts, config.max_reconnect_attempts
        ));
        self.client.disconnect();
        self.publish();

        if !self.pause(config.reconnect_delay()) {
            return false;
        }
        self.state.last_cycle = Instant::now();

        let Some(params) = self.handler.connection_config() else {
            self.logger
                .warn(format_args!("No connection parameters available for reconnect"));
            return true;
        };

        match self.client.connect(&params) {
            Ok(()) => {
                self.logger
                    .info(format_args!("Connection to {} restored", params.port));
                self.state.link_lost = false;
                self.state.reconnect_attempts = 0;
                self.state.last_success = Instant::now();
                self.state.last_fetch = None;
                self.handler.handle_notice(Notice::new(
                    NoticeKind::Reconnected,
                    format!("connection to {} restored", params.port),
                ));
            }
            Err(fault) => {
                self.logger
                    .warn(format_args!("Reconnect to {} failed: {fault}", params.port));
            }
        }
        true
    }

    /// One pass over the visible codes
    ///
    /// Returns `Err` only when the remainder of the cycle must be abandoned.
    fn poll_cycle(&mut self, visible: &BTreeSet<String>) -> Result<PollCycleResult, Fault> {
        let mut batch = PollCycleResult::new(BatchSource::Device);
        let points: Vec<&'static PointSpec> = catalog::POINTS
            .iter()
            .filter(|point| visible.contains(point.code))
            .collect();

        if points.iter().any(|point| point.in_base_block()) {
            let block = self
                .client
                .read_registers(BASE_BLOCK_ADDRESS, BASE_BLOCK_LEN)?;
            for point in points.iter().filter(|point| point.in_base_block()) {
                if let Fetch::BaseBlock { index, signed } = point.fetch {
                    let Some(raw) = block.get(index).copied() else {
                        continue;
                    };
                    let value = if signed {
                        RegisterValue::I16(decode_twos_complement(raw))
                    } else {
                        RegisterValue::U16(raw)
                    };
                    self.admit(&mut batch, point, value);
                }
            }
        }

        for point in points.iter().filter(|point| !point.in_base_block()) {
            let fetched = match point.fetch {
                Fetch::Register32 { address, signed } => {
                    self.client.read_register32(address, signed)
                }
                Fetch::Register16 { address } => {
                    self.client.read_register(address).map(RegisterValue::U16)
                }
                Fetch::Composite64 { address } => {
                    self.client.read_register64(address).map(RegisterValue::I64)
                }
                Fetch::BaseBlock { .. } => continue,
            };
            match fetched {
                Ok(value) => self.admit(&mut batch, point, value),
                Err(fault) if fault.is_connection_level() => return Err(fault),
                Err(fault) => self.logger.warn(format_args!(
                    "{} ({}) omitted: {fault}",
                    point.code, point.label
                )),
            }
        }

        Ok(batch)
    }

    fn admit(&self, batch: &mut PollCycleResult, point: &PointSpec, value: RegisterValue) {
        if point.admits(value.as_i64()) {
            batch.values.insert(point.code.to_string(), value);
        } else {
            self.logger.warn(format_args!(
                "{} value {value} outside {}..={}, discarded",
                point.code,
                point.envelope.start(),
                point.envelope.end()
            ));
        }
    }

    /// Interruptible sleep; `false` means the engine must stop
    fn pause(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return self.shared.is_running();
        }
        match self.control.recv_timeout(duration) {
            Ok(Control::Stop) | Err(flume::RecvTimeoutError::Disconnected) => {
                self.shared.running.store(false, Ordering::SeqCst);
                false
            }
            Err(flume::RecvTimeoutError::Timeout) => self.shared.is_running(),
        }
    }

    fn publish(&self) {
        self.shared.publish(&self.state, self.client.is_connected());
    }
}

/// Give a synthetic value the register type its catalog entry would decode to
fn typed_value(point: &PointSpec, raw: i64) -> Option<RegisterValue> {
    match point.fetch {
        Fetch::BaseBlock { signed: true, .. } => i16::try_from(raw).ok().map(RegisterValue::I16),
        Fetch::BaseBlock { signed: false, .. } | Fetch::Register16 { .. } => {
            u16::try_from(raw).ok().map(RegisterValue::U16)
        }
        Fetch::Register32 { signed: true, .. } => i32::try_from(raw).ok().map(RegisterValue::I32),
        Fetch::Register32 { signed: false, .. } => u32::try_from(raw).ok().map(RegisterValue::U32),
        Fetch::Composite64 { .. } => Some(RegisterValue::I64(raw)),
    }
}
