use std::{
    io::{self, Read, Write},
    time::{Duration, Instant},
};

use super::{
    config::{AddressBase, ConnectionConfig},
    fault::Fault,
};
use crate::{core::logs::Logger, protocol::modbus::PendingRequest};

/// A byte stream to the device
///
/// Real sessions use a serial port; tests plug in scripted devices.
pub trait Link: Read + Write + Send {
    /// Drop any bytes still buffered from a previous exchange
    fn discard_input(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.flush()
    }
}

/// Produces links for a connection configuration
pub trait LinkOpener: Send {
    fn open(&mut self, config: &ConnectionConfig) -> io::Result<Box<dyn Link>>;
}

struct SerialLink {
    port: Box<dyn serialport::SerialPort>,
}

impl Read for SerialLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl Link for SerialLink {
    fn discard_input(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::from)
    }
}

/// Opens physical serial ports through `serialport`
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialOpener;

impl LinkOpener for SerialOpener {
    fn open(&mut self, config: &ConnectionConfig) -> io::Result<Box<dyn Link>> {
        let port = open_serial_port(config)?;
        Ok(Box::new(SerialLink { port }))
    }
}

/// Open a serial port with the configured line settings, enabling exclusive access on Unix systems.
pub fn open_serial_port(config: &ConnectionConfig) -> io::Result<Box<dyn serialport::SerialPort>> {
    let data_bits = match config.data_bits {
        5 => serialport::DataBits::Five,
        6 => serialport::DataBits::Six,
        7 => serialport::DataBits::Seven,
        _ => serialport::DataBits::Eight,
    };
    let stop_bits = match config.stop_bits {
        2 => serialport::StopBits::Two,
        _ => serialport::StopBits::One,
    };

    let builder = serialport::new(&config.port, config.baud_rate)
        .data_bits(data_bits)
        .parity(config.parity.into())
        .stop_bits(stop_bits)
        .timeout(config.response_timeout());

    #[cfg(unix)]
    {
        let mut handle = builder.open_native()?;
        handle.set_exclusive(true)?;
        Ok(Box::new(handle))
    }

    #[cfg(not(unix))]
    {
        Ok(builder.open()?)
    }
}

/// Owns at most one open link and runs single request/response exchanges on it
pub struct TransportSession {
    opener: Box<dyn LinkOpener>,
    link: Option<Box<dyn Link>>,
    config: Option<ConnectionConfig>,
    logger: Logger,
}

impl TransportSession {
    pub fn new(opener: Box<dyn LinkOpener>, logger: Logger) -> Self {
        Self {
            opener,
            link: None,
            config: None,
            logger,
        }
    }

    pub fn serial(logger: Logger) -> Self {
        Self::new(Box::new(SerialOpener), logger)
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// Configuration of the currently open link
    pub fn config(&self) -> Option<&ConnectionConfig> {
        self.config.as_ref()
    }

    pub fn slave_id(&self) -> Option<u8> {
        self.config.as_ref().map(|config| config.slave_id)
    }

    pub fn address_base(&self) -> AddressBase {
        self.config
            .as_ref()
            .map(|config| config.address_base)
            .unwrap_or_default()
    }

    pub fn connect(&mut self, config: &ConnectionConfig) -> Result<(), Fault> {
        config.validate()?;
        if self.is_connected() {
            self.disconnect();
        }

        self.logger.info(format_args!(
            "Opening {} at {} baud ({} data bits, parity {}, {} stop bits, slave {})",
            config.port,
            config.baud_rate,
            config.data_bits,
            config.parity,
            config.stop_bits,
            config.slave_id
        ));

        let started = Instant::now();
        let opened = self.opener.open(config);
        let elapsed = started.elapsed();

        let mut link = opened.map_err(|err| map_io_error("open", &config.port, err))?;

        if elapsed > config.connect_timeout() {
            if let Err(err) = link.close() {
                self.logger.debug(format_args!(
                    "Closing slow link on {} failed: {err}",
                    config.port
                ));
            }
            return Err(Fault::Timeout(format!(
                "opening {} took {} ms (limit {} ms)",
                config.port,
                elapsed.as_millis(),
                config.connect_timeout_ms
            )));
        }

        self.link = Some(link);
        self.config = Some(config.clone());
        self.logger.info(format_args!(
            "Connected to {} in {} ms",
            config.port,
            elapsed.as_millis()
        ));
        Ok(())
    }

    /// Close the link if one is open; never fails
    pub fn disconnect(&mut self) {
        if let Some(mut link) = self.link.take() {
            let port = self
                .config
                .as_ref()
                .map(|config| config.port.as_str())
                .unwrap_or("link");
            match link.close() {
                Ok(()) => self.logger.info(format_args!("Disconnected from {port}")),
                Err(err) => self
                    .logger
                    .warn(format_args!("Error while closing {port}: {err}")),
            }
        }
        self.config = None;
    }

    /// Send one request and read back one complete response frame
    pub fn exchange(&mut self, request: &PendingRequest) -> Result<Vec<u8>, Fault> {
        let timeout = self
            .config
            .as_ref()
            .map(ConnectionConfig::response_timeout)
            .unwrap_or(Duration::from_secs(1));
        let port = self
            .config
            .as_ref()
            .map(|config| config.port.clone())
            .unwrap_or_default();
        let link = self.link.as_mut().ok_or(Fault::NotConnected)?;

        if let Err(err) = link.discard_input() {
            self.logger
                .debug(format_args!("Could not discard stale input: {err}"));
        }

        self.logger
            .debug(format_args!("TX {:02X?}", request.frame()));
        link.write_all(request.frame())
            .and_then(|()| link.flush())
            .map_err(|err| map_io_error("write", &port, err))?;

        let deadline = Instant::now() + timeout;
        let mut frame = Vec::with_capacity(64);
        let mut chunk = [0u8; 256];
        let kind = request.kind();

        loop {
            if let Some(expected) = kind.response_len(&frame) {
                if frame.len() >= expected {
                    frame.truncate(expected);
                    self.logger.debug(format_args!("RX {frame:02X?}"));
                    return Ok(frame);
                }
            }
            if Instant::now() >= deadline {
                return Err(Fault::Timeout(format!(
                    "no complete response on {port} within {} ms ({} bytes received)",
                    timeout.as_millis(),
                    frame.len()
                )));
            }

            match link.read(&mut chunk) {
                Ok(0) => std::thread::sleep(Duration::from_millis(1)),
                Ok(n) => frame.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(map_io_error("read", &port, err)),
            }
        }
    }
}

fn map_io_error(action: &str, port: &str, err: io::Error) -> Fault {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            Fault::Timeout(format!("{action} on {port} timed out: {err}"))
        }
        _ => Fault::Connection(format!("{action} on {port} failed: {err}")),
    }
}
