use serde::{Deserialize, Serialize};
use std::{str::FromStr, time::Duration};
use strum::{Display, EnumIter, EnumString};

use super::fault::Fault;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum Parity {
    #[default]
    #[serde(alias = "N")]
    #[strum(to_string = "none", serialize = "n")]
    None,
    #[serde(alias = "E")]
    #[strum(to_string = "even", serialize = "e")]
    Even,
    #[serde(alias = "O")]
    #[strum(to_string = "odd", serialize = "o")]
    Odd,
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
        }
    }
}

/// How catalog register numbers map onto wire addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressBase {
    /// The catalog number is the wire address (the drive's documented layout)
    #[default]
    Direct,
    /// Catalog numbers start at 1, the wire starts at 0
    OneBased,
}

/// Register number in the catalog's numbering scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegisterAddress(u16);

impl RegisterAddress {
    pub const fn new(number: u16) -> Self {
        Self(number)
    }

    pub const fn number(self) -> u16 {
        self.0
    }

    /// Translate to the address placed in request frames
    ///
    /// This is the only place the translation happens, so reads and writes agree.
    pub fn wire(self, base: AddressBase) -> Option<u16> {
        match base {
            AddressBase::Direct => Some(self.0),
            AddressBase::OneBased => self.0.checked_sub(1),
        }
    }

    pub fn offset(self, registers: u16) -> Option<Self> {
        self.0.checked_add(registers).map(Self)
    }
}

impl From<u16> for RegisterAddress {
    fn from(number: u16) -> Self {
        Self(number)
    }
}

/// Serial line and station parameters for one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default = "default_slave_id")]
    pub slave_id: u8,
    /// Upper bound on the wall-clock time of opening the link
    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Transport I/O timeout for one request/response exchange
    #[serde(default = "default_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default)]
    pub address_base: AddressBase,
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_slave_id() -> u8 {
    1
}

fn default_timeout_ms() -> u64 {
    1000
}

impl ConnectionConfig {
    pub fn new(port: impl Into<String>, baud_rate: u32, slave_id: u8) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            data_bits: default_data_bits(),
            parity: Parity::None,
            stop_bits: default_stop_bits(),
            slave_id,
            connect_timeout_ms: default_timeout_ms(),
            response_timeout_ms: default_timeout_ms(),
            address_base: AddressBase::Direct,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), Fault> {
        if self.port.trim().is_empty() {
            return Err(Fault::Connection("serial port must not be empty".into()));
        }
        if self.baud_rate == 0 {
            return Err(Fault::Connection("baud rate must be positive".into()));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(Fault::Connection(format!(
                "unsupported data bits {}",
                self.data_bits
            )));
        }
        if !matches!(self.stop_bits, 1 | 2) {
            return Err(Fault::Connection(format!(
                "unsupported stop bits {}",
                self.stop_bits
            )));
        }
        if !(1..=247).contains(&self.slave_id) {
            return Err(Fault::Connection(format!(
                "slave address {} outside 1..=247",
                self.slave_id
            )));
        }
        Ok(())
    }
}

/// Connection parameters as loosely-typed text, the way a form hands them over
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionParams {
    pub port: Option<String>,
    pub baud_rate: Option<String>,
    pub data_bits: Option<String>,
    pub parity: Option<String>,
    pub stop_bits: Option<String>,
    pub slave_id: Option<String>,
}

impl ConnectionParams {
    /// Build a config from these parameters alone; port, baud rate and slave id are required
    pub fn parse(&self) -> Result<ConnectionConfig, Fault> {
        self.overlay(None)
    }

    /// Apply the parameters that are present on top of `base`
    pub fn overlay(&self, base: Option<ConnectionConfig>) -> Result<ConnectionConfig, Fault> {
        let mut config = match base {
            Some(config) => config,
            None => {
                let port = non_empty(&self.port).ok_or_else(|| missing("port"))?;
                non_empty(&self.baud_rate).ok_or_else(|| missing("baud_rate"))?;
                non_empty(&self.slave_id).ok_or_else(|| missing("slave_id"))?;
                ConnectionConfig::new(port, default_baud_rate(), default_slave_id())
            }
        };

        if let Some(port) = non_empty(&self.port) {
            config.port = port.to_string();
        }
        if let Some(raw) = non_empty(&self.baud_rate) {
            config.baud_rate = parse_field("baud_rate", raw)?;
        }
        if let Some(raw) = non_empty(&self.data_bits) {
            config.data_bits = parse_field("data_bits", raw)?;
        }
        if let Some(raw) = non_empty(&self.parity) {
            config.parity = Parity::from_str(raw)
                .map_err(|_| Fault::Connection(format!("unsupported parity '{raw}'")))?;
        }
        if let Some(raw) = non_empty(&self.stop_bits) {
            config.stop_bits = parse_field("stop_bits", raw)?;
        }
        if let Some(raw) = non_empty(&self.slave_id) {
            config.slave_id = parse_field("slave_id", raw)?;
        }

        config.validate()?;
        Ok(config)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn missing(field: &str) -> Fault {
    Fault::Connection(format!("missing connection parameter '{field}'"))
}

fn parse_field<T: FromStr>(field: &str, raw: &str) -> Result<T, Fault> {
    raw.parse()
        .map_err(|_| Fault::Connection(format!("{field} '{raw}' is not a valid integer")))
}
