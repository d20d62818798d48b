use rmodbus::{client::ModbusRequest, ModbusProto};
use std::fmt;

pub const FUNC_READ_HOLDINGS: u8 = 0x03;
pub const FUNC_WRITE_SINGLE: u8 = 0x06;
pub const FUNC_WRITE_MULTIPLE: u8 = 0x10;

/// Exception responses: `[unit, func | 0x80, code, crc_lo, crc_hi]`
pub const EXCEPTION_FRAME_LEN: usize = 5;
/// Write responses echo `[unit, func, addr(2), value/quantity(2), crc(2)]`
pub const WRITE_ECHO_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("failed to build request: {0}")]
    Build(String),
    #[error("response too short ({0} bytes)")]
    Truncated(usize),
    #[error("CRC mismatch (computed 0x{computed:04X}, received 0x{received:04X})")]
    Crc { computed: u16, received: u16 },
    #[error("station mismatch: expected {expected}, got {actual}")]
    Station { expected: u8, actual: u8 },
    #[error("function code mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    Function { expected: u8, actual: u8 },
    #[error("byte count {byte_count} does not match a {frame_len}-byte frame")]
    ByteCount { byte_count: usize, frame_len: usize },
    #[error("response rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    ReadHoldings { count: u16 },
    WriteSingle,
    WriteMultiple { count: u16 },
}

impl RequestKind {
    pub fn function(self) -> u8 {
        match self {
            RequestKind::ReadHoldings { .. } => FUNC_READ_HOLDINGS,
            RequestKind::WriteSingle => FUNC_WRITE_SINGLE,
            RequestKind::WriteMultiple { .. } => FUNC_WRITE_MULTIPLE,
        }
    }

    pub fn is_write(self) -> bool {
        !matches!(self, RequestKind::ReadHoldings { .. })
    }

    /// Full RTU length of the response, once enough of its header has arrived
    ///
    /// Returns `None` while the header is still incomplete.
    pub fn response_len(self, head: &[u8]) -> Option<usize> {
        if head.len() < 2 {
            return None;
        }
        if head[1] & 0x80 != 0 {
            return Some(EXCEPTION_FRAME_LEN);
        }
        match self {
            RequestKind::ReadHoldings { .. } => head.get(2).map(|count| 5 + *count as usize),
            RequestKind::WriteSingle | RequestKind::WriteMultiple { .. } => Some(WRITE_ECHO_LEN),
        }
    }
}

/// Decoded outcome of one exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Registers(Vec<u16>),
    Written,
    /// Device-reported exception code
    Exception(u8),
}

/// A generated request frame together with the state needed to validate its reply
pub struct PendingRequest {
    request: ModbusRequest,
    frame: Vec<u8>,
    kind: RequestKind,
    unit: u8,
    address: u16,
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("kind", &self.kind)
            .field("unit", &self.unit)
            .field("address", &self.address)
            .field("frame", &format_args!("{:02X?}", self.frame))
            .finish()
    }
}

impl PendingRequest {
    pub fn read_holdings(unit: u8, address: u16, count: u16) -> Result<Self, FrameError> {
        let mut request = ModbusRequest::new(unit, ModbusProto::Rtu);
        let mut frame = Vec::new();
        request
            .generate_get_holdings(address, count, &mut frame)
            .map_err(|err| FrameError::Build(format!("{err:?}")))?;
        Ok(Self {
            request,
            frame,
            kind: RequestKind::ReadHoldings { count },
            unit,
            address,
        })
    }

    pub fn write_single(unit: u8, address: u16, value: u16) -> Result<Self, FrameError> {
        let mut request = ModbusRequest::new(unit, ModbusProto::Rtu);
        let mut frame = Vec::new();
        request
            .generate_set_holding(address, value, &mut frame)
            .map_err(|err| FrameError::Build(format!("{err:?}")))?;
        Ok(Self {
            request,
            frame,
            kind: RequestKind::WriteSingle,
            unit,
            address,
        })
    }

    pub fn write_multiple(unit: u8, address: u16, values: &[u16]) -> Result<Self, FrameError> {
        let mut request = ModbusRequest::new(unit, ModbusProto::Rtu);
        let mut frame = Vec::new();
        request
            .generate_set_holdings_bulk(address, values, &mut frame)
            .map_err(|err| FrameError::Build(format!("{err:?}")))?;
        Ok(Self {
            request,
            frame,
            kind: RequestKind::WriteMultiple {
                count: values.len() as u16,
            },
            unit,
            address,
        })
    }

    pub fn frame(&self) -> &[u8] {
        &self.frame
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn unit(&self) -> u8 {
        self.unit
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    /// Validate a complete response frame and extract its payload
    pub fn parse(&mut self, response: &[u8]) -> Result<Reply, FrameError> {
        if response.len() < EXCEPTION_FRAME_LEN {
            return Err(FrameError::Truncated(response.len()));
        }
        verify_crc(response)?;

        if response[0] != self.unit {
            return Err(FrameError::Station {
                expected: self.unit,
                actual: response[0],
            });
        }

        let function = self.kind.function();
        if response[1] == function | 0x80 {
            return Ok(Reply::Exception(response[2]));
        }
        if response[1] != function {
            return Err(FrameError::Function {
                expected: function,
                actual: response[1],
            });
        }

        if let RequestKind::ReadHoldings { .. } = self.kind {
            let byte_count = response[2] as usize;
            if byte_count % 2 != 0 || byte_count + 5 != response.len() {
                return Err(FrameError::ByteCount {
                    byte_count,
                    frame_len: response.len(),
                });
            }
        }

        self.request
            .parse_ok(response)
            .map_err(|err| FrameError::Rejected(format!("{err:?}")))?;

        match self.kind {
            RequestKind::ReadHoldings { .. } => {
                let values = response[3..response.len() - 2]
                    .chunks_exact(2)
                    .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
                    .collect::<Vec<_>>();
                Ok(Reply::Registers(values))
            }
            RequestKind::WriteSingle | RequestKind::WriteMultiple { .. } => Ok(Reply::Written),
        }
    }
}

/// Modbus CRC16 (reflected polynomial 0xA001, initial value 0xFFFF)
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0xFFFFu16;
    for byte in data {
        crc ^= *byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Append the CRC in wire order (low byte first)
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

fn verify_crc(frame: &[u8]) -> Result<(), FrameError> {
    let split = frame.len() - 2;
    let computed = crc16(&frame[..split]);
    let received = u16::from_le_bytes([frame[split], frame[split + 1]]);
    if computed != received {
        return Err(FrameError::Crc { computed, received });
    }
    Ok(())
}
