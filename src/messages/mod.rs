//! Wire message handling for both directions of the protocol.
//!
//! Messages are PackStream structures identified by a one-byte signature and
//! carried over the transport in chunks: each chunk is a u16 big-endian
//! payload length followed by that many bytes, and a zero-length chunk
//! terminates the message.

pub mod backend;
pub mod frontend;
