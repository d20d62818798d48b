use servolink::{boot, cli};

fn main() {
    boot::init_logging();
    let matches = cli::parse_args();

    if let Err(err) = cli::run(&matches) {
        log::error!("{err:#}");
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}
