use std::time::{Duration, Instant};

use super::{
    config::{ConnectionConfig, RegisterAddress},
    fault::{Fault, Operation},
    session::TransportSession,
};
use crate::{
    core::logs::Logger,
    protocol::modbus::{
        decode32, decode64, encode32, split_composite, FrameError, PendingRequest, RegisterValue,
        Reply,
    },
};

/// Application-level limit on one exchange, checked on top of the transport timeout
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(2000);

/// Typed register access over a [`TransportSession`]
///
/// Addresses are catalog register numbers; the session's [`AddressBase`](super::AddressBase)
/// decides the wire address. Every failing call, connect included, is remembered in
/// [`last_error`](Self::last_error).
pub struct RegisterClient {
    session: TransportSession,
    read_timeout: Duration,
    last_error: Option<Fault>,
    logger: Logger,
}

impl RegisterClient {
    pub fn new(session: TransportSession, logger: Logger) -> Self {
        Self {
            session,
            read_timeout: DEFAULT_READ_TIMEOUT,
            last_error: None,
            logger,
        }
    }

    /// Client on a physical serial session, sharing the logger's sink
    pub fn serial(logger: Logger) -> Self {
        let session = TransportSession::serial(logger.child("session"));
        Self::new(session, logger)
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn session(&self) -> &TransportSession {
        &self.session
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn connect(&mut self, config: &ConnectionConfig) -> Result<(), Fault> {
        let result = self.session.connect(config);
        self.record(result)
    }

    pub fn disconnect(&mut self) {
        self.session.disconnect();
    }

    /// Most recent fault, for diagnostics only
    pub fn last_error(&self) -> Option<&Fault> {
        self.last_error.as_ref()
    }

    pub fn clear_last_error(&mut self) {
        self.last_error = None;
    }

    /// Read `count` consecutive holding registers
    pub fn read_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>, Fault> {
        let result = self.read_block(address, count).and_then(|values| {
            if values.len() == count as usize {
                Ok(values)
            } else {
                Err(Fault::generic(
                    Operation::Read,
                    address,
                    format!("expected {count} registers, got {}", values.len()),
                ))
            }
        });
        self.record(result)
    }

    pub fn read_register(&mut self, address: u16) -> Result<u16, Fault> {
        self.read_registers(address, 1).map(|values| values[0])
    }

    /// Read a 32-bit value spanning `address` and `address + 1`
    ///
    /// Some 32-bit parameters are only exposed as one 16-bit register. When the device
    /// rejects the pair with an illegal-address exception, or answers with a single
    /// register, the 16-bit value is returned as [`RegisterValue::U16`].
    pub fn read_register32(&mut self, address: u16, signed: bool) -> Result<RegisterValue, Fault> {
        let result = match self.read_block(address, 2) {
            Ok(values) => match values.as_slice() {
                [low, high] => Ok(decode32([*low, *high], signed)),
                [single] => Ok(RegisterValue::U16(*single)),
                other => Err(Fault::generic(
                    Operation::Read,
                    address,
                    format!("expected 2 registers, got {}", other.len()),
                )),
            },
            Err(fault) if fault.is_invalid_address() => {
                self.logger.debug(format_args!(
                    "Register pair at {address} rejected, retrying as 16-bit"
                ));
                self.read_block(address, 1)
                    .and_then(|values| match values.as_slice() {
                        [single] => Ok(RegisterValue::U16(*single)),
                        other => Err(Fault::generic(
                            Operation::Read,
                            address,
                            format!("expected 1 register, got {}", other.len()),
                        )),
                    })
            }
            Err(fault) => Err(fault),
        };
        self.record(result)
    }

    /// Read the 64-bit composite stored as one 4-register block (low pair first)
    pub fn read_register64(&mut self, address: u16) -> Result<i64, Fault> {
        let block = self.read_registers(address, 4)?;
        let result = split_composite(&block)
            .map(|(low, high)| decode64(low, high))
            .ok_or_else(|| Fault::generic(Operation::Read, address, "short composite block"));
        self.record(result)
    }

    /// Write one holding register (function 0x06)
    pub fn write_register(&mut self, address: u16, value: u16) -> Result<(), Fault> {
        let result = self.write_single(address, value);
        self.record(result)
    }

    /// Write a 32-bit value as one two-register write (function 0x10)
    ///
    /// Falls back to a single-register write when the device rejects the pair with an
    /// illegal-address exception and the value fits in 16 bits.
    pub fn write_register32(&mut self, address: u16, value: i64, signed: bool) -> Result<(), Fault> {
        let Some(registers) = encode32(value, signed) else {
            return self.record(Err(Fault::InvalidValue {
                op: Operation::Write,
                address,
            }));
        };

        let result = match self.write_multiple(address, &registers) {
            Err(fault) if fault.is_invalid_address() => match narrow_to_register(value, signed) {
                Some(single) => {
                    self.logger.debug(format_args!(
                        "Register pair at {address} rejected, retrying as 16-bit write"
                    ));
                    self.write_single(address, single)
                }
                None => Err(fault),
            },
            other => other,
        };
        self.record(result)
    }

    fn read_block(&mut self, address: u16, count: u16) -> Result<Vec<u16>, Fault> {
        match self.transact(Operation::Read, address, |unit, wire| {
            PendingRequest::read_holdings(unit, wire, count)
        })? {
            Reply::Registers(values) => Ok(values),
            reply => Err(Fault::generic(
                Operation::Read,
                address,
                format!("unexpected reply {reply:?}"),
            )),
        }
    }

    fn write_single(&mut self, address: u16, value: u16) -> Result<(), Fault> {
        self.transact(Operation::Write, address, |unit, wire| {
            PendingRequest::write_single(unit, wire, value)
        })
        .map(|_| ())
    }

    fn write_multiple(&mut self, address: u16, values: &[u16]) -> Result<(), Fault> {
        self.transact(Operation::Write, address, |unit, wire| {
            PendingRequest::write_multiple(unit, wire, values)
        })
        .map(|_| ())
    }

    fn transact(
        &mut self,
        op: Operation,
        address: u16,
        build: impl FnOnce(u8, u16) -> Result<PendingRequest, FrameError>,
    ) -> Result<Reply, Fault> {
        let unit = match (self.session.is_connected(), self.session.slave_id()) {
            (true, Some(unit)) => unit,
            _ => return Err(Fault::NotConnected),
        };
        let wire = RegisterAddress::new(address)
            .wire(self.session.address_base())
            .ok_or(Fault::InvalidAddress { op, address })?;
        let mut request = build(unit, wire).map_err(|err| Fault::generic(op, address, err))?;

        let started = Instant::now();
        let response = self.session.exchange(&request)?;
        let elapsed = started.elapsed();
        if elapsed > self.read_timeout {
            return Err(Fault::Timeout(format!(
                "{op} at {address} took {} ms (limit {} ms)",
                elapsed.as_millis(),
                self.read_timeout.as_millis()
            )));
        }

        match request
            .parse(&response)
            .map_err(|err| Fault::generic(op, address, err))?
        {
            Reply::Exception(code) => Err(Fault::from_exception(op, address, code)),
            reply => Ok(reply),
        }
    }

    fn record<T>(&mut self, result: Result<T, Fault>) -> Result<T, Fault> {
        if let Err(fault) = &result {
            self.logger.debug(format_args!("Register access failed: {fault}"));
            self.last_error = Some(fault.clone());
        }
        result
    }
}

/// 16-bit register pattern for `value`, if it fits one register
fn narrow_to_register(value: i64, signed: bool) -> Option<u16> {
    if signed {
        i16::try_from(value).ok().map(|v| v as u16)
    } else {
        u16::try_from(value).ok()
    }
}
