use std::fmt;

/// Which kind of register access raised a device-side fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Read => write!(f, "read"),
            Operation::Write => write!(f, "write"),
        }
    }
}

/// Every way a register access or connection attempt can fail
///
/// Transport and client layers map all underlying I/O and protocol errors into
/// one of these kinds before returning.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Fault {
    #[error("not connected to device")]
    NotConnected,
    #[error("connection fault: {0}")]
    Connection(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("illegal data address on {op} at {address}")]
    InvalidAddress { op: Operation, address: u16 },
    #[error("illegal data value on {op} at {address}")]
    InvalidValue { op: Operation, address: u16 },
    #[error("device exception 0x{code:02X} on {op} at {address}")]
    Protocol {
        op: Operation,
        address: u16,
        code: u8,
    },
    #[error("read at {address} failed: {cause}")]
    Read { address: u16, cause: String },
    #[error("write at {address} failed: {cause}")]
    Write { address: u16, cause: String },
}

impl Fault {
    /// Map a Modbus exception code reported by the device
    pub fn from_exception(op: Operation, address: u16, code: u8) -> Self {
        match code {
            0x02 => Fault::InvalidAddress { op, address },
            0x03 => Fault::InvalidValue { op, address },
            code => Fault::Protocol { op, address, code },
        }
    }

    /// Generic catch-all for the given operation
    pub fn generic(op: Operation, address: u16, cause: impl fmt::Display) -> Self {
        match op {
            Operation::Read => Fault::Read {
                address,
                cause: cause.to_string(),
            },
            Operation::Write => Fault::Write {
                address,
                cause: cause.to_string(),
            },
        }
    }

    /// Faults that mean the link itself is gone, not just one register
    pub fn is_connection_level(&self) -> bool {
        matches!(self, Fault::NotConnected | Fault::Connection(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Fault::Timeout(_))
    }

    pub fn is_invalid_address(&self) -> bool {
        matches!(self, Fault::InvalidAddress { .. })
    }

    /// A reply arrived but could not be used (bad CRC, wrong length, echo mismatch)
    pub fn is_malformed(&self) -> bool {
        matches!(self, Fault::Read { .. } | Fault::Write { .. })
    }
}
