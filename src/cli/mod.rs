pub mod config;

use anyhow::{anyhow, Result};
use clap::{Arg, ArgMatches, Command};
use std::{path::Path, sync::Arc, time::Duration};

use crate::{
    api::{
        modbus::{ConnectionConfig, ConnectionParams, RegisterClient},
        poll::{catalog, FlumePollHandler, PollConfig, PollCycleResult, PollEngine, PollEvent},
    },
    core::logs::Logger,
};
use config::MonitorConfig;

pub fn build_command() -> Command {
    Command::new("servolink")
        .about("Poll a servo drive over Modbus RTU and print live values")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .help("TOML configuration file")
                .value_name("FILE"),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .short('p')
                .help("Serial port (overrides the config file)")
                .value_name("PORT"),
        )
        .arg(
            Arg::new("baud-rate")
                .long("baud-rate")
                .short('b')
                .help("Baud rate")
                .value_name("BAUD"),
        )
        .arg(
            Arg::new("parity")
                .long("parity")
                .help("Parity: none, even or odd")
                .value_name("PARITY"),
        )
        .arg(
            Arg::new("data-bits")
                .long("data-bits")
                .help("Data bits (5-8)")
                .value_name("BITS"),
        )
        .arg(
            Arg::new("stop-bits")
                .long("stop-bits")
                .help("Stop bits (1 or 2)")
                .value_name("BITS"),
        )
        .arg(
            Arg::new("slave-id")
                .long("slave-id")
                .short('s')
                .help("Modbus slave address")
                .value_name("ID"),
        )
        .arg(
            Arg::new("codes")
                .long("codes")
                .help("Comma-separated register codes to poll (default: all)")
                .value_name("CODES")
                .value_delimiter(','),
        )
        .arg(
            Arg::new("simulate")
                .long("simulate")
                .help("Do not open a port; emit synthetic values")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .short('j')
                .help("Print batches as JSON lines")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("list-codes")
                .long("list-codes")
                .help("List the register catalog and exit")
                .action(clap::ArgAction::SetTrue),
        )
}

pub fn parse_args() -> ArgMatches {
    build_command().get_matches()
}

fn connection_params(matches: &ArgMatches) -> ConnectionParams {
    let get = |name: &str| matches.get_one::<String>(name).cloned();
    ConnectionParams {
        port: get("port"),
        baud_rate: get("baud-rate"),
        data_bits: get("data-bits"),
        parity: get("parity"),
        stop_bits: get("stop-bits"),
        slave_id: get("slave-id"),
    }
}

/// Resolve the connection from the file and flag overrides
pub fn resolve_connection(
    file: Option<ConnectionConfig>,
    params: &ConnectionParams,
) -> Result<ConnectionConfig> {
    let base = file.or_else(|| {
        params
            .port
            .as_ref()
            .map(|port| ConnectionConfig::new(port.clone(), 9600, 1))
    });
    if base.is_none() {
        return Err(anyhow!(
            "No serial port configured; pass --port or a [connection] table"
        ));
    }
    Ok(params.overlay(base)?)
}

fn format_batch(batch: &PollCycleResult, json: bool) -> Result<String> {
    if json {
        return Ok(serde_json::to_string(batch)?);
    }
    let values = batch
        .values
        .iter()
        .map(|(code, value)| format!("{code}={value}"))
        .collect::<Vec<_>>()
        .join(" ");
    Ok(format!(
        "{} {}",
        batch.timestamp.format("%H:%M:%S%.3f"),
        values
    ))
}

pub fn run(matches: &ArgMatches) -> Result<()> {
    if matches.get_flag("list-codes") {
        for point in catalog::POINTS.iter() {
            println!(
                "{}\t{}\t{}..={}",
                point.code,
                point.label,
                point.envelope.start(),
                point.envelope.end()
            );
        }
        return Ok(());
    }

    let file = match matches.get_one::<String>("config") {
        Some(path) => MonitorConfig::load(Path::new(path))?,
        None => MonitorConfig::default(),
    };
    let simulate = matches.get_flag("simulate");
    let json = matches.get_flag("json");

    let mut codes: Vec<String> = matches
        .get_many::<String>("codes")
        .map(|values| values.cloned().collect())
        .unwrap_or_else(|| file.codes.clone());
    if codes.is_empty() {
        codes = catalog::codes().map(str::to_string).collect();
    }

    let logger = Logger::default();
    let mut client = RegisterClient::serial(logger.child("client"));
    if let Some(ms) = file.read_timeout_ms {
        client.set_read_timeout(Duration::from_millis(ms));
    }

    let (handler, events) = FlumePollHandler::with_capacity(1024);
    if !simulate {
        let connection = resolve_connection(file.connection.clone(), &connection_params(matches))?;
        client.connect(&connection)?;
        handler.set_connection_config(connection);
    }

    let mut poll_config = PollConfig::default();
    poll_config.merge(&file.poll);

    let engine = PollEngine::builder(client, logger.child("poll"))
        .config(poll_config)
        .visible_codes(codes)
        .fallback_mode(simulate)
        .spawn(Arc::new(handler))?;

    let stopper = engine.stopper();
    ctrlc::set_handler(move || stopper.stop())?;

    loop {
        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(PollEvent::Batch(batch)) => println!("{}", format_batch(&batch, json)?),
            Ok(PollEvent::Notice(notice)) => {
                if notice.is_fatal() {
                    log::error!("{}: {}", notice.kind, notice.message);
                    break;
                }
                log::warn!("{}: {}", notice.kind, notice.message);
            }
            Ok(PollEvent::DisconnectRequested) => {
                log::info!("Engine requested a full disconnect");
                break;
            }
            Err(flume::RecvTimeoutError::Timeout) => {
                if !engine.is_running() {
                    break;
                }
            }
            Err(flume::RecvTimeoutError::Disconnected) => break,
        }
    }

    engine.join();
    Ok(())
}
