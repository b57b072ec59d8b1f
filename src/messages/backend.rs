//! Reading and representing server response messages.

use std::collections::HashMap;
use std::io::Read;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::packstream;
use crate::value::Value;

/// Maximum allowed size of a reassembled message (16MiB).
///
/// This is an upper bound to prevent misbehaving servers from allocating
/// excessive memory or causing OOMs.
pub const MAX_MESSAGE_SIZE_BYTES: usize = 16 << 20;

/// Server response messages are PackStream structures identified by a
/// one-byte signature.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature(u8);

impl Signature {
    pub const SUCCESS: Self = Self(0x70);
    pub const RECORD: Self = Self(0x71);
    pub const IGNORED: Self = Self(0x7E);
    pub const FAILURE: Self = Self(0x7F);
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
            Signature::SUCCESS => "Success",
            Signature::RECORD => "Record",
            Signature::IGNORED => "Ignored",
            Signature::FAILURE => "Failure",
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

/// A single decoded server message: its signature and structure fields.
#[derive(Debug, Clone)]
pub struct BoltMessage {
    /// The type of the message.
    pub signature: Signature,
    /// The decoded fields of the message structure.
    pub fields: Vec<Value>,
}

impl BoltMessage {
    /// Constructs a new `BoltMessage` with the given signature and fields.
    pub fn new(signature: impl Into<Signature>, fields: Vec<Value>) -> Self {
        Self {
            signature: signature.into(),
            fields,
        }
    }

    /// Returns the metadata map carried in the first field, if there is one.
    ///
    /// `SUCCESS` and `FAILURE` messages carry exactly one map field.
    pub fn metadata(&self) -> Option<&HashMap<String, Value>> {
        match self.fields.first() {
            Some(Value::Map(m)) => Some(m),
            _ => None,
        }
    }

    /// Consumes the message, returning the record values of a `RECORD`.
    pub fn into_record_values(mut self) -> Option<Vec<Value>> {
        if self.signature != Signature::RECORD {
            return None;
        }
        match self.fields.pop() {
            Some(Value::List(values)) if self.fields.is_empty() => Some(values),
            _ => None,
        }
    }
}

impl std::fmt::Display for BoltMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {:?}", self.signature, self.fields)
    }
}

/// Reads one chunked message from an asynchronous stream and decodes it.
///
/// Zero-length chunks in front of a message are treated as keepalive noops.
/// Reassembled messages larger than [`MAX_MESSAGE_SIZE_BYTES`] are rejected
/// before their payload is read.
pub async fn read_message(mut stream: impl AsyncRead + Unpin) -> std::io::Result<BoltMessage> {
    let mut body = BytesMut::new();
    loop {
        let mut header = [0; 2];
        stream.read_exact(&mut header).await?;
        let len = u16::from_be_bytes(header) as usize;
        if len == 0 {
            if body.is_empty() {
                continue;
            }
            break;
        }

        if body.len() + len > MAX_MESSAGE_SIZE_BYTES {
            let err_msg = format!("message size exceeds {MAX_MESSAGE_SIZE_BYTES}B");
            return Err(std::io::Error::new(
                std::io::ErrorKind::QuotaExceeded,
                err_msg,
            ));
        }

        let start = body.len();
        body.resize(start + len, 0);
        stream.read_exact(&mut body[start..]).await?;
    }

    parse_message(body.freeze())
}

/// Blocking variant of [`read_message`].
pub fn read_message_blocking(mut stream: impl Read) -> std::io::Result<BoltMessage> {
    let mut body = BytesMut::new();
    loop {
        let mut header = [0; 2];
        stream.read_exact(&mut header)?;
        let len = u16::from_be_bytes(header) as usize;
        if len == 0 {
            if body.is_empty() {
                continue;
            }
            break;
        }

        if body.len() + len > MAX_MESSAGE_SIZE_BYTES {
            let err_msg = format!("message size exceeds {MAX_MESSAGE_SIZE_BYTES}B");
            return Err(std::io::Error::new(
                std::io::ErrorKind::QuotaExceeded,
                err_msg,
            ));
        }

        let start = body.len();
        body.resize(start + len, 0);
        stream.read_exact(&mut body[start..])?;
    }

    parse_message(body.freeze())
}

fn parse_message(mut body: Bytes) -> std::io::Result<BoltMessage> {
    if body.remaining() < 2 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "message body too short for a structure header",
        ));
    }

    let marker = body.get_u8();
    let n_fields = match marker {
        m if m & 0xF0 == 0xB0 => (m & 0x0F) as usize,
        _ => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("expected structure marker, found 0x{marker:02X}"),
            ));
        }
    };
    let signature = Signature::from(body.get_u8());

    let mut fields = Vec::with_capacity(n_fields);
    for _ in 0..n_fields {
        fields.push(packstream::decode(&mut body)?);
    }

    if body.has_remaining() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "trailing bytes after message structure",
        ));
    }

    Ok(BoltMessage { signature, fields })
}
