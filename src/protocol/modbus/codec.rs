//! Register codec - stateless conversion between register words and typed values
//!
//! The drive transmits each 16-bit register big-endian on the wire (handled by the
//! frame layer). Wider values span consecutive registers with the *first* register
//! holding the low word and the *second* register holding the high word.
use serde::{Serialize, Serializer};
use std::fmt;

/// A decoded register value, tagged with its width and signedness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterValue {
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    /// 64-bit composite built from two register pairs
    I64(i64),
}

impl RegisterValue {
    pub fn as_i64(self) -> i64 {
        match self {
            RegisterValue::U16(v) => v as i64,
            RegisterValue::I16(v) => v as i64,
            RegisterValue::U32(v) => v as i64,
            RegisterValue::I32(v) => v as i64,
            RegisterValue::I64(v) => v,
        }
    }

    /// Width of the value in bits
    pub fn width(self) -> u8 {
        match self {
            RegisterValue::U16(_) | RegisterValue::I16(_) => 16,
            RegisterValue::U32(_) | RegisterValue::I32(_) => 32,
            RegisterValue::I64(_) => 64,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            RegisterValue::I16(_) | RegisterValue::I32(_) | RegisterValue::I64(_)
        )
    }
}

impl fmt::Display for RegisterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i64())
    }
}

impl Serialize for RegisterValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.as_i64())
    }
}

/// Interpret a raw register as a 16-bit two's-complement integer
pub const fn decode_twos_complement(raw: u16) -> i16 {
    if raw & 0x8000 != 0 {
        (raw as i32 - 0x1_0000) as i16
    } else {
        raw as i16
    }
}

/// Combine `[low, high]` registers into an unsigned 32-bit value
pub const fn decode_u32(registers: [u16; 2]) -> u32 {
    ((registers[1] as u32) << 16) | registers[0] as u32
}

/// Combine `[low, high]` registers into a signed 32-bit value
pub const fn decode_i32(registers: [u16; 2]) -> i32 {
    decode_u32(registers) as i32
}

pub fn decode32(registers: [u16; 2], signed: bool) -> RegisterValue {
    if signed {
        RegisterValue::I32(decode_i32(registers))
    } else {
        RegisterValue::U32(decode_u32(registers))
    }
}

/// Decode the 64-bit composite: `low` is read unsigned, `high` signed, and the
/// result is `(high << 32) | low`, so the sign lives entirely in `high`.
pub const fn decode64(low: [u16; 2], high: [u16; 2]) -> i64 {
    ((decode_i32(high) as i64) << 32) | decode_u32(low) as i64
}

pub const fn encode_u32(value: u32) -> [u16; 2] {
    [(value & 0xFFFF) as u16, (value >> 16) as u16]
}

pub const fn encode_i32(value: i32) -> [u16; 2] {
    encode_u32(value as u32)
}

/// Encode a value for a two-register write
///
/// Returns `None` when `value` is not representable in the requested 32-bit type.
pub fn encode32(value: i64, signed: bool) -> Option<[u16; 2]> {
    if signed {
        i32::try_from(value).ok().map(encode_i32)
    } else {
        u32::try_from(value).ok().map(encode_u32)
    }
}

/// Split a 4-register block into the `(low, high)` pairs of the 64-bit composite
pub fn split_composite(block: &[u16]) -> Option<([u16; 2], [u16; 2])> {
    match block {
        [a, b, c, d] => Some(([*a, *b], [*c, *d])),
        _ => None,
    }
}
