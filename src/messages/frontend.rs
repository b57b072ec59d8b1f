//! Construction of client request messages.

use bytes::{BufMut, BytesMut};

/// The four magic bytes a client sends before proposing protocol versions.
pub const HANDSHAKE_PREAMBLE: &[u8] = &[0x60, 0x60, 0xB0, 0x17];

/// Largest payload a single transport chunk can carry.
pub const MAX_CHUNK_PAYLOAD: usize = u16::MAX as usize;

/// Client request messages are PackStream structures identified by a one-byte
/// signature.
///
/// The signature determines the number and meaning of the structure's fields.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature(u8);

impl Signature {
    pub const INIT: Self = Self(0x01);
    pub const ACK_FAILURE: Self = Self(0x0E);
    pub const RESET: Self = Self(0x0F);
    pub const RUN: Self = Self(0x10);
    pub const DISCARD_ALL: Self = Self(0x2F);
    pub const PULL_ALL: Self = Self(0x3F);

    /// Appends a complete chunked message to `buf`.
    ///
    /// The structure body is assembled first (marker, signature, then the
    /// fields written by `fields_fn`) and then split into transport chunks.
    /// Request messages carry at most 15 fields, so the tiny-struct marker
    /// always suffices.
    pub fn message(self, buf: &mut BytesMut, n_fields: u8, fields_fn: impl FnOnce(&mut BytesMut)) {
        debug_assert!(n_fields < 16);
        let mut body = BytesMut::new();
        body.put_u8(0xB0 | n_fields);
        body.put_u8(self.0);
        fields_fn(&mut body);
        write_chunks(buf, &body);
    }
}

impl From<u8> for Signature {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl From<Signature> for u8 {
    fn from(value: Signature) -> Self {
        value.0
    }
}

impl PartialEq<u8> for Signature {
    fn eq(&self, other: &u8) -> bool {
        self.0 == *other
    }
}

impl PartialEq<Signature> for u8 {
    fn eq(&self, other: &Signature) -> bool {
        *self == other.0
    }
}

impl std::fmt::Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match *self {
            Signature::INIT => "Init",
            Signature::ACK_FAILURE => "AckFailure",
            Signature::RESET => "Reset",
            Signature::RUN => "Run",
            Signature::DISCARD_ALL => "DiscardAll",
            Signature::PULL_ALL => "PullAll",
            _ => "Unknown",
        };
        write!(f, "{name}(0x{:02X})", self.0)
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature(0x{:02X})", self.0)
    }
}

/// Splits `body` into transport chunks and appends them, with the zero-length
/// terminator, to `buf`.
pub fn write_chunks(buf: &mut BytesMut, body: &[u8]) {
    for chunk in body.chunks(MAX_CHUNK_PAYLOAD) {
        buf.put_u16(chunk.len() as u16);
        buf.put_slice(chunk);
    }
    buf.put_u16(0);
}
