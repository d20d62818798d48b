pub mod codec;
pub mod frame;

pub use codec::{
    decode32, decode64, decode_i32, decode_twos_complement, decode_u32, encode32, encode_i32,
    encode_u32, split_composite, RegisterValue,
};
pub use frame::{crc16, FrameError, PendingRequest, Reply, RequestKind};
