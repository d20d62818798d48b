use chrono::Local;
use env_logger::{Builder, Target};
use log::LevelFilter;
use std::io::Write;

/// Install the process logger used by the `log`-backed [`Logger`](crate::core::logs::Logger) sink.
///
/// Records go to stderr so stdout stays free for batch output. Setting
/// `SERVOLINK_LOG_FILE` appends them to that file instead; `RUST_LOG` overrides the
/// default `info` filter.
pub fn init_logging() {
    let mut builder = Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {} - {}",
                Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .target(Target::Stderr);

    if let Ok(path) = std::env::var("SERVOLINK_LOG_FILE") {
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
        {
            Ok(file) => {
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(err) => eprintln!("Failed to open log file '{path}': {err}"),
        }
    }

    if builder.try_init().is_err() {
        eprintln!("Logger already initialized");
    }
}
