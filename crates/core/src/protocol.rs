//! Binary protocol spoken over the duplex channel to the sync peer
//!
//! Wire format (all integers are big-endian):
//!
//! ```text
//! +--------+--------+------------------+
//! | type   | length | payload          |
//! | 1 byte | 4 bytes| variable         |
//! +--------+--------+------------------+
//! ```
//!
//! Message types:
//! - 0x01: Hello (features:8)
//! - 0x02: Index (raw index bytes)
//! - 0x03: IndexEof (no payload)
//! - 0x04: Request (count:4, ids:[32]*count)
//! - 0x05: Chunk (flags:1, id:32, data)
//! - 0x06: Missing (id:32)
//! - 0x07: Goodbye (no payload)
//! - 0x08: Abort (code:4, reason)
//!
//! A whole frame, header included, never exceeds [`PROTOCOL_SIZE_MAX`].

use std::io::{Read, Write};

use bytes::Bytes;
use color_eyre::Result;

use crate::chunk::{CHUNK_ID_SIZE, ChunkId};

/// Upper bound for one frame including its header
pub const PROTOCOL_SIZE_MAX: usize = 16 * 1024 * 1024;

/// Size of the frame header (type + length)
pub const HEADER_SIZE: usize = 1 + 4;

/// Bytes a CHUNK frame spends before its data: header, flags, id
pub const CHUNK_HEADER_SIZE: usize = HEADER_SIZE + 1 + CHUNK_ID_SIZE;

/// Largest chunk body that still fits in one CHUNK frame
pub const CHUNK_PAYLOAD_MAX: usize = PROTOCOL_SIZE_MAX - CHUNK_HEADER_SIZE;

/// Message type identifiers
pub mod msg {
    pub const HELLO: u8 = 0x01;
    pub const INDEX: u8 = 0x02;
    pub const INDEX_EOF: u8 = 0x03;
    pub const REQUEST: u8 = 0x04;
    pub const CHUNK: u8 = 0x05;
    pub const MISSING: u8 = 0x06;
    pub const GOODBYE: u8 = 0x07;
    pub const ABORT: u8 = 0x08;
}

/// Feature bits announced in HELLO
pub mod feature {
    pub const READABLE_STORE: u64 = 1 << 0;
    pub const WRITABLE_STORE: u64 = 1 << 1;
    pub const READABLE_INDEX: u64 = 1 << 2;
    pub const WRITABLE_INDEX: u64 = 1 << 3;
    pub const READABLE_ARCHIVE: u64 = 1 << 4;
    pub const WRITABLE_ARCHIVE: u64 = 1 << 5;
    pub const PULL_CHUNKS: u64 = 1 << 6;
    pub const PULL_INDEX: u64 = 1 << 7;
    pub const PULL_ARCHIVE: u64 = 1 << 8;
    pub const PUSH_CHUNKS: u64 = 1 << 9;
    pub const PUSH_INDEX: u64 = 1 << 10;
    pub const PUSH_ARCHIVE: u64 = 1 << 11;

    /// Every bit this protocol revision defines
    pub const ALL: u64 = (1 << 12) - 1;
}

const CHUNK_FLAG_COMPRESSED: u8 = 0x01;

/// How the bytes of a CHUNK frame are encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkEncoding {
    Uncompressed,
    /// Stored form, handed through untouched
    Compressed,
}

impl ChunkEncoding {
    fn flags(self) -> u8 {
        match self {
            Self::Uncompressed => 0,
            Self::Compressed => CHUNK_FLAG_COMPRESSED,
        }
    }

    fn from_flags(flags: u8) -> Self {
        if flags & CHUNK_FLAG_COMPRESSED != 0 {
            Self::Compressed
        } else {
            Self::Uncompressed
        }
    }
}

/// Errors produced while framing or decoding messages
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown message type: {0:#04x}")]
    UnknownType(u8),

    #[error("frame of {0} bytes exceeds protocol maximum")]
    FrameTooLarge(usize),

    #[error("malformed {kind} frame: {detail}")]
    Malformed { kind: &'static str, detail: String },

    #[error("unknown feature bits: {0:#x}")]
    UnknownFeatures(u64),
}

fn malformed(kind: &'static str, detail: impl Into<String>) -> ProtocolError {
    ProtocolError::Malformed {
        kind,
        detail: detail.into(),
    }
}

/// Message exchanged with the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello {
        features: u64,
    },
    Index(Bytes),
    IndexEof,
    /// Peer wants these chunks
    Request(Vec<ChunkId>),
    Chunk {
        id: ChunkId,
        encoding: ChunkEncoding,
        data: Bytes,
    },
    /// Chunk could not be obtained
    Missing(ChunkId),
    Goodbye,
    Abort {
        code: u32,
        reason: String,
    },
}

/// Append one frame made of `parts` to `out`.
///
/// # Errors
/// Fails without touching `out` if the frame would exceed [`PROTOCOL_SIZE_MAX`].
pub fn write_frame(out: &mut Vec<u8>, msg_type: u8, parts: &[&[u8]]) -> Result<(), ProtocolError> {
    let payload_len: usize = parts.iter().map(|p| p.len()).sum();
    let frame_len = HEADER_SIZE + payload_len;
    if frame_len > PROTOCOL_SIZE_MAX {
        return Err(ProtocolError::FrameTooLarge(frame_len));
    }

    out.reserve(frame_len);
    out.push(msg_type);
    out.extend_from_slice(&(payload_len as u32).to_be_bytes());
    for part in parts {
        out.extend_from_slice(part);
    }
    Ok(())
}

/// Append a CHUNK frame without building an intermediate [`Message`]
///
/// # Errors
/// Fails if `data` is larger than [`CHUNK_PAYLOAD_MAX`].
pub fn write_chunk(
    out: &mut Vec<u8>,
    id: &ChunkId,
    encoding: ChunkEncoding,
    data: &[u8],
) -> Result<(), ProtocolError> {
    write_frame(out, msg::CHUNK, &[&[encoding.flags()], id.as_bytes(), data])
}

impl Message {
    /// Append the encoded frame to `out`
    ///
    /// # Errors
    /// Fails if the frame would exceed [`PROTOCOL_SIZE_MAX`].
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        match self {
            Self::Hello { features } => write_frame(out, msg::HELLO, &[&features.to_be_bytes()]),
            Self::Index(data) => write_frame(out, msg::INDEX, &[&data[..]]),
            Self::IndexEof => write_frame(out, msg::INDEX_EOF, &[]),
            Self::Request(ids) => {
                let mut payload = Vec::with_capacity(4 + ids.len() * CHUNK_ID_SIZE);
                payload.extend_from_slice(&(ids.len() as u32).to_be_bytes());
                for id in ids {
                    payload.extend_from_slice(id.as_bytes());
                }
                write_frame(out, msg::REQUEST, &[&payload])
            }
            Self::Chunk { id, encoding, data } => write_chunk(out, id, *encoding, data),
            Self::Missing(id) => write_frame(out, msg::MISSING, &[id.as_bytes()]),
            Self::Goodbye => write_frame(out, msg::GOODBYE, &[]),
            Self::Abort { code, reason } => {
                write_frame(out, msg::ABORT, &[&code.to_be_bytes(), reason.as_bytes()])
            }
        }
    }

    /// Short name for logging
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Index(_) => "index",
            Self::IndexEof => "index-eof",
            Self::Request(_) => "request",
            Self::Chunk { .. } => "chunk",
            Self::Missing(_) => "missing",
            Self::Goodbye => "goodbye",
            Self::Abort { .. } => "abort",
        }
    }
}

/// Parse a frame header, returns (type, payload length)
fn parse_header(header: [u8; HEADER_SIZE]) -> Result<(u8, usize), ProtocolError> {
    let msg_type = header[0];
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if HEADER_SIZE + len > PROTOCOL_SIZE_MAX {
        return Err(ProtocolError::FrameTooLarge(HEADER_SIZE + len));
    }
    Ok((msg_type, len))
}

fn read_id(kind: &'static str, data: &[u8]) -> Result<ChunkId, ProtocolError> {
    ChunkId::from_slice(data).ok_or_else(|| malformed(kind, format!("{} byte chunk id", data.len())))
}

/// Decode the payload of a frame whose header has already been parsed
fn decode_payload(msg_type: u8, payload: Bytes) -> Result<Message, ProtocolError> {
    match msg_type {
        msg::HELLO => {
            let raw = <[u8; 8]>::try_from(&payload[..])
                .map_err(|_| malformed("hello", format!("{} byte payload", payload.len())))?;
            let features = u64::from_be_bytes(raw);
            if features & !feature::ALL != 0 {
                return Err(ProtocolError::UnknownFeatures(features & !feature::ALL));
            }
            Ok(Message::Hello { features })
        }

        msg::INDEX => Ok(Message::Index(payload)),

        msg::INDEX_EOF => Ok(Message::IndexEof),

        msg::REQUEST => {
            if payload.len() < 4 {
                return Err(malformed("request", "missing count"));
            }
            let count = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
            let ids = &payload[4..];
            if ids.len() != count * CHUNK_ID_SIZE {
                return Err(malformed(
                    "request",
                    format!("{count} ids announced, {} bytes present", ids.len()),
                ));
            }
            let ids = ids
                .chunks_exact(CHUNK_ID_SIZE)
                .map(|raw| read_id("request", raw))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Message::Request(ids))
        }

        msg::CHUNK => {
            if payload.len() < 1 + CHUNK_ID_SIZE {
                return Err(malformed("chunk", "truncated header"));
            }
            let encoding = ChunkEncoding::from_flags(payload[0]);
            let id = read_id("chunk", &payload[1..=CHUNK_ID_SIZE])?;
            let data = payload.slice(1 + CHUNK_ID_SIZE..);
            Ok(Message::Chunk { id, encoding, data })
        }

        msg::MISSING => Ok(Message::Missing(read_id("missing", &payload)?)),

        msg::GOODBYE => Ok(Message::Goodbye),

        msg::ABORT => {
            if payload.len() < 4 {
                return Err(malformed("abort", "missing code"));
            }
            let code = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
            let reason = String::from_utf8_lossy(&payload[4..]).to_string();
            Ok(Message::Abort { code, reason })
        }

        _ => Err(ProtocolError::UnknownType(msg_type)),
    }
}

/// Try to decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` while the frame is still incomplete, otherwise the
/// message and the number of bytes it occupied.
///
/// # Errors
/// Fails on unknown types, oversized frames or malformed payloads.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(Message, usize)>, ProtocolError> {
    let Some(header) = buf.get(..HEADER_SIZE) else {
        return Ok(None);
    };
    let mut raw = [0u8; HEADER_SIZE];
    raw.copy_from_slice(header);
    let (msg_type, len) = parse_header(raw)?;

    let Some(payload) = buf.get(HEADER_SIZE..HEADER_SIZE + len) else {
        return Ok(None);
    };
    let message = decode_payload(msg_type, Bytes::copy_from_slice(payload))?;
    Ok(Some((message, HEADER_SIZE + len)))
}

/// Blocking protocol writer for sending messages
pub struct ProtocolWriter<W> {
    inner: W,
    scratch: Vec<u8>,
}

impl<W: Write> ProtocolWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            scratch: Vec::new(),
        }
    }

    /// Send one message and flush
    pub fn send(&mut self, message: &Message) -> Result<()> {
        self.scratch.clear();
        message.encode(&mut self.scratch)?;
        self.inner.write_all(&self.scratch)?;
        self.inner.flush()?;
        Ok(())
    }
}

/// Blocking protocol reader for receiving messages
pub struct ProtocolReader<R> {
    inner: R,
}

impl<R: Read> ProtocolReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read next message
    pub fn read_message(&mut self) -> Result<Message> {
        let mut header = [0u8; HEADER_SIZE];
        self.inner.read_exact(&mut header)?;
        let (msg_type, len) = parse_header(header)?;

        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload)?;

        Ok(decode_payload(msg_type, Bytes::from(payload))?)
    }
}
