//! DCP wire model: opcodes and flag sets, the big-endian frame codec, and the value transport
//! transforms (compression negotiation and XATTR pruning).

pub mod codec;
pub mod message;
pub mod value;
