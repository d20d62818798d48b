mod common;

use std::{
    collections::BTreeSet,
    sync::Arc,
    time::{Duration, Instant},
};

use common::{client_for, connected_client, connection, memory_logger, FakeDevice};
use servolink::{
    api::poll::{
        BatchSource, FlumePollHandler, NoOpHandler, NoticeKind, PollConfig, PollConfigUpdate,
        PollCycleResult, PollEngine, PollEvent, PollHandle, WaveformSource,
    },
    core::logs::{LogLevel, Logger},
    protocol::modbus::RegisterValue,
};

const WAIT: Duration = Duration::from_secs(5);

fn fast_config() -> PollConfig {
    PollConfig {
        reconnect_delay_secs: 0,
        ..PollConfig::default()
    }
}

fn next_batch(events: &flume::Receiver<PollEvent>) -> PollCycleResult {
    let deadline = Instant::now() + WAIT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(remaining) {
            Ok(PollEvent::Batch(batch)) => return batch,
            Ok(_) => continue,
            Err(err) => panic!("no batch arrived: {err}"),
        }
    }
}

/// Wait for a notice of `kind`, returning every event seen before it
fn events_until(events: &flume::Receiver<PollEvent>, kind: NoticeKind) -> Vec<PollEvent> {
    let deadline = Instant::now() + WAIT;
    let mut seen = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(remaining) {
            Ok(PollEvent::Notice(notice)) if notice.kind == kind => return seen,
            Ok(event) => seen.push(event),
            Err(err) => panic!("no {kind} notice arrived: {err}"),
        }
    }
}

fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn spawn_connected(
    device: &FakeDevice,
    logger: &Logger,
    config: PollConfig,
    codes: &[&str],
) -> (PollHandle, Arc<FlumePollHandler>, flume::Receiver<PollEvent>) {
    let client = connected_client(device, logger);
    let (handler, events) = FlumePollHandler::new();
    handler.set_connection_config(connection());
    let handler = Arc::new(handler);
    let engine = PollEngine::builder(client, logger.child("poll"))
        .config(config)
        .visible_codes(codes.iter().copied())
        .spawn(handler.clone())
        .unwrap();
    (engine, handler, events)
}

#[test]
fn base_block_values_are_decoded() {
    let device = FakeDevice::new();
    device.set_many(2816, &[0xFFFE, 1200, 300]);
    let (logger, _) = memory_logger();
    let (engine, _, events) = spawn_connected(&device, &logger, fast_config(), &["P0B-00", "P0B-01"]);

    let batch = next_batch(&events);
    assert_eq!(batch.source, BatchSource::Device);
    assert_eq!(batch.get("P0B-00"), Some(RegisterValue::I16(-2)));
    assert_eq!(batch.get("P0B-01"), Some(RegisterValue::U16(1200)));
    assert!(!batch.contains("P0B-02"));
    assert!(engine.status().batches >= 1);

    let client = engine.join().unwrap();
    assert!(!client.is_connected());
}

#[test]
fn auxiliary_registers_use_their_widths() {
    let device = FakeDevice::new();
    device.set_many(2831, &[45, 0]);
    device.set(2840, 12_000);
    device.set_many(2874, &[0x0001, 0x0000, 0x0002, 0x0000]);
    let (logger, _) = memory_logger();
    let (engine, _, events) =
        spawn_connected(&device, &logger, fast_config(), &["P0B-15", "P0B-24", "P0B-58"]);

    let batch = next_batch(&events);
    assert_eq!(batch.get("P0B-15"), Some(RegisterValue::I32(45)));
    assert_eq!(batch.get("P0B-24"), Some(RegisterValue::U16(12_000)));
    assert_eq!(batch.get("P0B-58"), Some(RegisterValue::I64((2i64 << 32) | 1)));
    engine.stop();
}

#[test]
fn out_of_range_values_are_dropped() {
    let device = FakeDevice::new();
    device.set_many(2816, &[10, 5000, 20]);
    let (logger, sink) = memory_logger();
    let (engine, _, events) =
        spawn_connected(&device, &logger, fast_config(), &["P0B-00", "P0B-01", "P0B-02"]);

    let batch = next_batch(&events);
    assert_eq!(batch.get("P0B-00"), Some(RegisterValue::I16(10)));
    assert_eq!(batch.get("P0B-02"), Some(RegisterValue::I16(20)));
    assert!(!batch.contains("P0B-01"));
    assert!(sink.contains(LogLevel::Warning, "P0B-01 value 5000"));
    engine.stop();
}

#[test]
fn rejected_auxiliary_register_is_omitted() {
    let device = FakeDevice::new();
    device.set_many(2816, &[1, 2, 3]);
    device.reject(0x03, 2840, None, 0x02);
    let (logger, _) = memory_logger();
    let (engine, _, events) = spawn_connected(&device, &logger, fast_config(), &["P0B-00", "P0B-24"]);

    let batch = next_batch(&events);
    assert_eq!(batch.get("P0B-00"), Some(RegisterValue::I16(1)));
    assert!(!batch.contains("P0B-24"));
    assert!(engine.is_running());
    engine.stop();
}

#[test]
fn illegal_base_block_address_triggers_reconnect() {
    let device = FakeDevice::new();
    device.reject(0x03, 2816, None, 0x02);
    let (logger, _) = memory_logger();
    let (engine, _, events) = spawn_connected(&device, &logger, fast_config(), &["P0B-00", "P0B-01"]);

    let before = events_until(&events, NoticeKind::Reconnected);
    assert!(before
        .iter()
        .all(|event| !matches!(event, PollEvent::Batch(_))));
    assert!(device.opens() >= 2);
    engine.stop();
}

#[test]
fn corrupt_base_block_backs_off_without_reconnecting() {
    let device = FakeDevice::new();
    device.set_many(2816, &[1, 2, 3]);
    device.set_corrupt(true);
    let (logger, sink) = memory_logger();
    let (engine, _, events) = spawn_connected(&device, &logger, fast_config(), &["P0B-00"]);

    let before = events_until(&events, NoticeKind::FailureBudgetExhausted);
    assert!(before.is_empty(), "unexpected events: {before:?}");
    engine.join();
    assert_eq!(device.opens(), 1);
    assert_eq!(device.requests(), 10);
    assert!(!sink.contains(LogLevel::Error, "reconnecting"));
}

#[test]
fn failure_budget_stops_engine_once() {
    let device = FakeDevice::new();
    device.reject(0x03, 2840, None, 0x02);
    let (logger, _) = memory_logger();
    let (engine, _, events) = spawn_connected(&device, &logger, fast_config(), &["P0B-24"]);

    let before = events_until(&events, NoticeKind::FailureBudgetExhausted);
    assert!(before.is_empty());
    wait_for(|| !engine.is_running());
    let status = engine.status();
    assert_eq!(status.consecutive_failures, 10);
    engine.join();

    let fatal = events
        .drain()
        .filter(|event| matches!(event, PollEvent::Notice(notice) if notice.is_fatal()))
        .count();
    assert_eq!(fatal, 0);
    assert_eq!(device.requests(), 10);
}

#[test]
fn custom_failure_budget_is_honoured() {
    let device = FakeDevice::new();
    device.reject(0x03, 2840, None, 0x02);
    let (logger, _) = memory_logger();
    let client = connected_client(&device, &logger);
    let (handler, events) = FlumePollHandler::new();
    let engine = PollEngine::builder(client, logger.child("poll"))
        .config(fast_config())
        .max_consecutive_failures(3)
        .visible_codes(["P0B-24"])
        .spawn(Arc::new(handler))
        .unwrap();

    events_until(&events, NoticeKind::FailureBudgetExhausted);
    engine.join();
    assert_eq!(device.requests(), 3);
}

#[test]
fn watchdog_resets_after_overlong_tick() {
    let device = FakeDevice::new();
    device.set_many(2816, &[1, 2, 3]);
    device.set_delay(Duration::from_millis(1500));
    let (logger, _) = memory_logger();

    let mut config = connection();
    config.response_timeout_ms = 4000;
    let mut client = client_for(&device, &logger).with_read_timeout(Duration::from_secs(4));
    client.connect(&config).unwrap();

    let (handler, events) = FlumePollHandler::new();
    let engine = PollEngine::builder(client, logger.child("poll"))
        .config(PollConfig {
            watchdog_timeout_secs: 1,
            ..fast_config()
        })
        .visible_codes(["P0B-00"])
        .spawn(Arc::new(handler))
        .unwrap();

    events_until(&events, NoticeKind::Watchdog);
    device.set_delay(Duration::ZERO);
    assert!(engine.is_running());
    let status = engine.status();
    assert_eq!(status.consecutive_failures, 0);
    assert_eq!(status.reconnect_attempts, 0);
    assert!(status.watchdog_resets >= 1);

    let batch = next_batch(&events);
    assert_eq!(batch.get("P0B-00"), Some(RegisterValue::I16(1)));
    engine.stop();
}

#[test]
fn visible_set_changes_apply_to_later_cycles() {
    let device = FakeDevice::new();
    device.set_many(2816, &[1, 2, 3]);
    device.set(2840, 77);
    let (logger, _) = memory_logger();
    let (engine, _, events) = spawn_connected(&device, &logger, fast_config(), &["P0B-00"]);

    assert!(next_batch(&events).contains("P0B-00"));

    engine.set_visible_codes(["P0B-24"]);
    assert_eq!(engine.visible_codes().len(), 1);
    let batch = loop {
        let batch = next_batch(&events);
        if batch.contains("P0B-24") {
            break batch;
        }
    };
    assert!(!batch.contains("P0B-00"));
    assert_eq!(batch.get("P0B-24"), Some(RegisterValue::U16(77)));
    engine.stop();
}

#[test]
fn visible_set_swaps_during_cycles_keep_batches_consistent() {
    let device = FakeDevice::new();
    device.set_many(2816, &[1, 2, 3]);
    device.set(2840, 77);
    device.set_many(2874, &[5, 0, 0, 0]);
    device.set_delay(Duration::from_millis(20));
    let (logger, _) = memory_logger();
    let (engine, _, events) = spawn_connected(&device, &logger, fast_config(), &["P0B-00"]);

    let speed_only = BTreeSet::from(["P0B-00".to_string()]);
    let monitor_and_counter = BTreeSet::from(["P0B-24".to_string(), "P0B-58".to_string()]);
    let until = Instant::now() + Duration::from_secs(1);
    let mut flip = false;
    while Instant::now() < until {
        let codes = if flip { &speed_only } else { &monitor_and_counter };
        engine.set_visible_codes(codes.iter().cloned());
        flip = !flip;
        std::thread::sleep(Duration::from_millis(3));
    }
    assert!(engine.is_running());
    engine.join();

    let batches: Vec<PollCycleResult> = events
        .drain()
        .filter_map(|event| match event {
            PollEvent::Batch(batch) => Some(batch),
            _ => None,
        })
        .collect();
    assert!(batches.len() > 5, "only {} batches", batches.len());
    for batch in &batches {
        let keys: BTreeSet<String> = batch.values.keys().cloned().collect();
        assert!(
            keys.is_subset(&speed_only) || keys.is_subset(&monitor_and_counter),
            "batch mixes visible sets: {keys:?}"
        );
    }
}

#[test]
fn reconnect_delay_longer_than_watchdog_still_exhausts() {
    let device = FakeDevice::new();
    device.reject(0x03, 2816, None, 0x04);
    let (logger, _) = memory_logger();
    let config = PollConfig {
        watchdog_timeout_secs: 1,
        reconnect_delay_secs: 1,
        max_reconnect_attempts: 2,
        ..PollConfig::default()
    };
    let client = connected_client(&device, &logger);
    device.set_open_fails(true);
    let (handler, events) = FlumePollHandler::new();
    handler.set_connection_config(connection());
    let engine = PollEngine::builder(client, logger.child("poll"))
        .config(config)
        .visible_codes(["P0B-00"])
        .spawn(Arc::new(handler))
        .unwrap();

    let before = events_until(&events, NoticeKind::ReconnectExhausted);
    assert!(!before
        .iter()
        .any(|event| matches!(event, PollEvent::Notice(notice) if notice.kind == NoticeKind::Watchdog)));
    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        PollEvent::DisconnectRequested
    );
    wait_for(|| !engine.is_running());
    assert_eq!(engine.status().watchdog_resets, 0);
    engine.join();
    assert_eq!(device.opens(), 3);
}

#[test]
fn exhausted_reconnects_request_disconnect() {
    let device = FakeDevice::new();
    device.reject(0x03, 2816, None, 0x04);
    let (logger, _) = memory_logger();
    let config = PollConfig {
        max_reconnect_attempts: 3,
        ..fast_config()
    };
    let client = connected_client(&device, &logger);
    device.set_open_fails(true);
    let (handler, events) = FlumePollHandler::new();
    handler.set_connection_config(connection());
    let handler = Arc::new(handler);
    let engine = PollEngine::builder(client, logger.child("poll"))
        .config(config)
        .visible_codes(["P0B-00"])
        .spawn(handler.clone())
        .unwrap();

    let before = events_until(&events, NoticeKind::ReconnectExhausted);
    assert!(!before
        .iter()
        .any(|event| matches!(event, PollEvent::Notice(notice) if notice.kind == NoticeKind::Reconnected)));
    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        PollEvent::DisconnectRequested
    );
    assert!(handler.disconnect_requested());

    let client = engine.join().unwrap();
    assert!(!client.is_connected());
    assert_eq!(device.opens(), 4);
}

#[test]
fn stop_interrupts_reconnect_delay() {
    let device = FakeDevice::new();
    device.reject(0x03, 2816, None, 0x04);
    let (logger, _) = memory_logger();
    let config = PollConfig {
        reconnect_delay_secs: 30,
        ..PollConfig::default()
    };
    let (engine, _, _events) = spawn_connected(&device, &logger, config, &["P0B-00"]);

    wait_for(|| engine.status().reconnect_attempts == 1);
    let started = Instant::now();
    engine.join();
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn fallback_mode_emits_synthetic_batches() {
    let device = FakeDevice::new();
    let (logger, _) = memory_logger();
    let (handler, events) = FlumePollHandler::new();
    let engine = PollEngine::builder(client_for(&device, &logger), logger.child("poll"))
        .fallback_source(WaveformSource::without_noise())
        .fallback_mode(true)
        .visible_codes(["P0B-00", "P0B-01", "P0B-58"])
        .spawn(Arc::new(handler))
        .unwrap();

    let batch = next_batch(&events);
    assert_eq!(batch.source, BatchSource::Fallback);
    assert!(batch.contains("P0B-00"));
    assert!(batch.contains("P0B-01"));
    assert!(matches!(batch.get("P0B-58"), Some(RegisterValue::I64(_))));
    assert!(engine.fallback_mode());
    assert_eq!(device.requests(), 0);

    engine.set_fallback_mode(false);
    assert!(!engine.fallback_mode());
    engine.stop();
}

#[test]
fn idle_engine_without_link_or_fallback_stays_quiet() {
    let device = FakeDevice::new();
    let (logger, _) = memory_logger();
    let (handler, events) = FlumePollHandler::new();
    let engine = PollEngine::builder(client_for(&device, &logger), logger.child("poll"))
        .visible_codes(["P0B-00"])
        .spawn(Arc::new(handler))
        .unwrap();

    assert!(events.recv_timeout(Duration::from_millis(300)).is_err());
    assert!(engine.is_running());
    assert_eq!(engine.status().consecutive_failures, 0);
    engine.join();
}

#[test]
fn update_config_merges_present_keys() {
    let device = FakeDevice::new();
    let (logger, _) = memory_logger();
    let engine = PollEngine::builder(client_for(&device, &logger), logger.child("poll"))
        .spawn(Arc::new(NoOpHandler))
        .unwrap();

    engine.update_config(&PollConfigUpdate {
        reconnect_delay_secs: Some(2),
        max_reconnect_attempts: Some(9),
        ..PollConfigUpdate::default()
    });
    let config = engine.config();
    assert_eq!(config.reconnect_delay_secs, 2);
    assert_eq!(config.max_reconnect_attempts, 9);
    assert_eq!(config.watchdog_timeout_secs, 10);
    engine.stop();
}
