//! imgdl wire format: dictionary messages and link frames.
//!
//! Every message exchanged with the peer is a small dictionary of
//! `key -> value` tuples. The dictionary layout matches what the device
//! side parses, byte for byte, so changing anything here breaks deployed
//! peers.
//!
//! Headers are `#[repr(C)]` over unaligned little-endian integers and use
//! zerocopy derives for allocation-free parsing. There is no unsafe code in
//! this module.

use bytes::Bytes;
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Message Keys ─────────────────────────────────────────────────────────────

/// Logical message keys. The numeric ids are fixed by the peer application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKey {
    /// Sent once on startup; value 1.
    Ready,
    /// Largest DATA payload the peer accepts.
    ChunkSize,
    /// Target image width in pixels.
    Width,
    /// Target image height in pixels.
    Height,
    /// Start of a transfer; value is the total payload length.
    Begin,
    /// One slice of the packed payload.
    Data,
    /// End of a transfer; value 1.
    End,
    /// Human-readable failure description.
    Error,
    /// Source to fetch and deliver.
    Url,
    /// Anything else. Handlers ignore these.
    Unknown(u32),
}

impl From<u32> for MessageKey {
    fn from(value: u32) -> Self {
        match value {
            0 => MessageKey::Ready,
            1 => MessageKey::ChunkSize,
            2 => MessageKey::Width,
            3 => MessageKey::Height,
            4 => MessageKey::Begin,
            5 => MessageKey::Data,
            6 => MessageKey::End,
            7 => MessageKey::Error,
            8 => MessageKey::Url,
            other => MessageKey::Unknown(other),
        }
    }
}

impl From<MessageKey> for u32 {
    fn from(key: MessageKey) -> u32 {
        match key {
            MessageKey::Ready => 0,
            MessageKey::ChunkSize => 1,
            MessageKey::Width => 2,
            MessageKey::Height => 3,
            MessageKey::Begin => 4,
            MessageKey::Data => 5,
            MessageKey::End => 6,
            MessageKey::Error => 7,
            MessageKey::Url => 8,
            MessageKey::Unknown(other) => other,
        }
    }
}

// ── Values ───────────────────────────────────────────────────────────────────

/// Tuple type byte as written on the wire.
pub mod tuple_type {
    pub const BYTE_ARRAY: u8 = 0;
    pub const CSTRING: u8 = 1;
    pub const UINT: u8 = 2;
    pub const INT: u8 = 3;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bytes(Bytes),
    CString(String),
    Uint(u32),
    Int(i32),
}

impl Value {
    /// Integer view. Signed values below zero have no unsigned meaning.
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::Uint(v) => Some(*v),
            Value::Int(v) => u32::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::CString(s) => Some(s),
            _ => None,
        }
    }

    fn tuple_type(&self) -> u8 {
        match self {
            Value::Bytes(_) => tuple_type::BYTE_ARRAY,
            Value::CString(_) => tuple_type::CSTRING,
            Value::Uint(_) => tuple_type::UINT,
            Value::Int(_) => tuple_type::INT,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Value::Bytes(b) => b.len(),
            Value::CString(s) => s.len() + 1,
            Value::Uint(_) | Value::Int(_) => 4,
        }
    }
}

// ── Headers ──────────────────────────────────────────────────────────────────

/// Per-tuple header. Followed by `length` value bytes.
///
/// Wire size: 7 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct TupleHeader {
    pub key: U32<LittleEndian>,
    pub tuple_type: u8,
    pub length: U16<LittleEndian>,
}

assert_eq_size!(TupleHeader, [u8; 7]);

/// Link frame header. Followed by `length` dictionary bytes (PUSH only).
///
/// Wire size: 4 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct FrameHeader {
    /// See [`FrameKind`].
    pub kind: u8,
    /// Transaction id. An ACK/NACK echoes the id of the PUSH it answers.
    pub txn: u8,
    pub length: U16<LittleEndian>,
}

assert_eq_size!(FrameHeader, [u8; 4]);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Push = 0x01,
    Nack = 0x7F,
    Ack = 0xFF,
}

impl TryFrom<u8> for FrameKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameKind::Push),
            0x7F => Ok(FrameKind::Nack),
            0xFF => Ok(FrameKind::Ack),
            other => Err(WireError::UnknownFrameKind(other)),
        }
    }
}

impl FrameHeader {
    pub fn new(kind: FrameKind, txn: u8, length: u16) -> Self {
        Self {
            kind: kind as u8,
            txn,
            length: U16::new(length),
        }
    }
}

// ── Constants ─────────────────────────────────────────────────────────────────

/// Dictionary header: one tuple-count byte.
pub const DICT_HEADER_LEN: usize = 1;

pub const TUPLE_HEADER_LEN: usize = 7;

pub const FRAME_HEADER_LEN: usize = 4;

/// Bytes a single-tuple dictionary spends on framing.
/// A peer inbox of N bytes carries at most N - SINGLE_TUPLE_OVERHEAD DATA bytes.
pub const SINGLE_TUPLE_OVERHEAD: usize = DICT_HEADER_LEN + TUPLE_HEADER_LEN;

/// Default DATA chunk size. The smallest inbox every peer guarantees.
pub const DEFAULT_CHUNK_SIZE: usize = 124;

/// Largest encoded dictionary a frame can carry.
pub const MAX_DICT_LEN: usize = u16::MAX as usize;

// ── Messages ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuple {
    pub key: MessageKey,
    pub value: Value,
}

/// One dictionary message. Tuple order is preserved on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppMessage {
    tuples: Vec<Tuple>,
}

impl AppMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(key: MessageKey, value: Value) -> Self {
        Self::new().with(key, value)
    }

    pub fn with(mut self, key: MessageKey, value: Value) -> Self {
        self.tuples.push(Tuple { key, value });
        self
    }

    pub fn ready() -> Self {
        Self::single(MessageKey::Ready, Value::Uint(1))
    }

    pub fn begin(total_len: u32) -> Self {
        Self::single(MessageKey::Begin, Value::Uint(total_len))
    }

    pub fn data(chunk: Bytes) -> Self {
        Self::single(MessageKey::Data, Value::Bytes(chunk))
    }

    pub fn end() -> Self {
        Self::single(MessageKey::End, Value::Uint(1))
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::single(MessageKey::Error, Value::CString(text.into()))
    }

    /// First value stored under `key`.
    pub fn get(&self, key: MessageKey) -> Option<&Value> {
        self.tuples.iter().find(|t| t.key == key).map(|t| &t.value)
    }

    pub fn contains(&self, key: MessageKey) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tuple> {
        self.tuples.iter()
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    /// Size of [`AppMessage::encode`] output, without encoding.
    pub fn encoded_len(&self) -> usize {
        DICT_HEADER_LEN
            + self
                .tuples
                .iter()
                .map(|t| TUPLE_HEADER_LEN + t.value.encoded_len())
                .sum::<usize>()
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let count =
            u8::try_from(self.tuples.len()).map_err(|_| WireError::TooManyTuples(self.tuples.len()))?;

        let mut out = Vec::with_capacity(self.encoded_len());
        out.push(count);

        for tuple in &self.tuples {
            let len = tuple.value.encoded_len();
            let length = u16::try_from(len).map_err(|_| WireError::ValueTooLarge(len))?;
            let header = TupleHeader {
                key: U32::new(tuple.key.into()),
                tuple_type: tuple.value.tuple_type(),
                length: U16::new(length),
            };
            out.extend_from_slice(header.as_bytes());

            match &tuple.value {
                Value::Bytes(b) => out.extend_from_slice(b),
                Value::CString(s) => {
                    out.extend_from_slice(s.as_bytes());
                    out.push(0);
                }
                Value::Uint(v) => out.extend_from_slice(&v.to_le_bytes()),
                Value::Int(v) => out.extend_from_slice(&v.to_le_bytes()),
            }
        }

        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let (&count, mut rest) = buf.split_first().ok_or(WireError::Truncated)?;
        let mut tuples = Vec::with_capacity(count as usize);

        for _ in 0..count {
            let header = TupleHeader::read_from_prefix(rest).ok_or(WireError::Truncated)?;
            rest = &rest[TUPLE_HEADER_LEN..];

            let len = header.length.get() as usize;
            if rest.len() < len {
                return Err(WireError::Truncated);
            }
            let (raw, tail) = rest.split_at(len);
            rest = tail;

            let value = match header.tuple_type {
                tuple_type::BYTE_ARRAY => Value::Bytes(Bytes::copy_from_slice(raw)),
                tuple_type::CSTRING => {
                    // Peers may omit the terminator; stop at the first NUL if any.
                    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                    Value::CString(String::from_utf8_lossy(&raw[..end]).into_owned())
                }
                tuple_type::UINT => Value::Uint(read_uint(raw)?),
                tuple_type::INT => Value::Int(read_int(raw)?),
                other => return Err(WireError::UnknownTupleType(other)),
            };

            tuples.push(Tuple {
                key: MessageKey::from(header.key.get()),
                value,
            });
        }

        if !rest.is_empty() {
            return Err(WireError::TrailingBytes(rest.len()));
        }

        Ok(Self { tuples })
    }
}

fn read_uint(raw: &[u8]) -> Result<u32, WireError> {
    match raw.len() {
        1 => Ok(raw[0] as u32),
        2 => Ok(u16::from_le_bytes([raw[0], raw[1]]) as u32),
        4 => Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])),
        other => Err(WireError::BadIntegerWidth(other)),
    }
}

fn read_int(raw: &[u8]) -> Result<i32, WireError> {
    match raw.len() {
        1 => Ok(raw[0] as i8 as i32),
        2 => Ok(i16::from_le_bytes([raw[0], raw[1]]) as i32),
        4 => Ok(i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])),
        other => Err(WireError::BadIntegerWidth(other)),
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("dictionary truncated")]
    Truncated,

    #[error("{0} trailing bytes after last tuple")]
    TrailingBytes(usize),

    #[error("unknown tuple type: 0x{0:02x}")]
    UnknownTupleType(u8),

    #[error("integer tuple has unsupported width {0}")]
    BadIntegerWidth(usize),

    #[error("dictionary holds {0} tuples, at most 255 allowed")]
    TooManyTuples(usize),

    #[error("value length {0} exceeds maximum {}", u16::MAX)]
    ValueTooLarge(usize),

    #[error("unknown frame kind: 0x{0:02x}")]
    UnknownFrameKind(u8),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
