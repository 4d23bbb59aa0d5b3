//! Wire-level framing.
//!
//! Every frame on the wire is laid out as:
//! - 1 byte: flags
//! - 4 bytes: big-endian nonce (0 when no response is expected)
//! - 4 bytes: big-endian body length
//! - N bytes: body
//!
//! Flag bits, from least significant:
//!
//! ```text
//!  7 6 5 | 4       | 3       | 2     | 1 0
//!  zero  | wrapped | request | error | encoding
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::config::WIRE_HEADER_LENGTH;
use crate::error::{P2pError, P2pResult};

const FLAG_WRAPPED: u8 = 0b0001_0000;
const FLAG_REQUEST: u8 = 0b0000_1000;
const FLAG_ERROR: u8 = 0b0000_0100;
const FLAG_ENCODING: u8 = 0b0000_0011;
const FLAG_RESERVED: u8 = 0b1110_0000;

/// Body encoding advertised in the two low flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Encoding {
    /// Opaque bytes.
    #[default]
    Binary,
    /// UTF-8 text.
    Utf8,
    /// Reserved for gRPC payloads.
    Grpc,
    /// JSON document.
    Json,
}

impl Encoding {
    fn bits(self) -> u8 {
        match self {
            Encoding::Binary => 0b00,
            Encoding::Utf8 => 0b01,
            Encoding::Grpc => 0b10,
            Encoding::Json => 0b11,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & FLAG_ENCODING {
            0b00 => Encoding::Binary,
            0b01 => Encoding::Utf8,
            0b10 => Encoding::Grpc,
            _ => Encoding::Json,
        }
    }
}

/// Parsed 9-byte header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireHeader {
    /// Raw flag byte, already validated.
    pub flags: u8,
    /// Request nonce, 0 when the frame is not a request.
    pub nonce: u32,
    /// Number of body bytes following the header.
    pub body_length: usize,
}

impl WireHeader {
    /// Body encoding.
    pub fn encoding(&self) -> Encoding {
        Encoding::from_bits(self.flags)
    }

    /// Whether the body must be passed through the envelope decoder.
    pub fn is_wrapped(&self) -> bool {
        self.flags & FLAG_WRAPPED != 0
    }

    /// Whether the sender expects a response.
    pub fn is_request(&self) -> bool {
        self.flags & FLAG_REQUEST != 0
    }

    /// Whether the frame marks an error or end of stream.
    pub fn is_error(&self) -> bool {
        self.flags & FLAG_ERROR != 0
    }

    /// Total frame length, header included.
    pub fn frame_length(&self) -> usize {
        WIRE_HEADER_LENGTH + self.body_length
    }
}

/// A fully decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Request nonce, 0 when the frame is not a request.
    pub nonce: u32,
    /// Body encoding.
    pub encoding: Encoding,
    /// Error/end-of-stream marker.
    pub is_error: bool,
    /// Whether the body is an envelope.
    pub wrapped: bool,
    /// Frame body.
    pub body: Bytes,
}

impl Frame {
    /// Build a binary frame.
    pub fn new(nonce: u32, body: impl Into<Bytes>, wrapped: bool) -> Self {
        Self {
            nonce,
            encoding: Encoding::Binary,
            is_error: false,
            wrapped,
            body: body.into(),
        }
    }

    /// Mark this frame as an error/end-of-stream frame.
    pub fn with_error(mut self, is_error: bool) -> Self {
        self.is_error = is_error;
        self
    }

    /// Set the body encoding.
    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }
}

fn build_flags(encoding: Encoding, is_error: bool, nonce: u32, wrapped: bool) -> u8 {
    let mut flags = encoding.bits();
    if wrapped {
        flags |= FLAG_WRAPPED;
    }
    if nonce != 0 {
        flags |= FLAG_REQUEST;
    }
    if is_error {
        flags |= FLAG_ERROR;
    }
    flags
}

fn parse_flags(flags: u8) -> P2pResult<u8> {
    if flags & FLAG_RESERVED != 0 {
        return Err(P2pError::InvalidFlag(flags));
    }
    Ok(flags)
}

/// Append an encoded frame to `dst`.
pub fn encode_into(
    encoding: Encoding,
    is_error: bool,
    nonce: u32,
    body: &[u8],
    wrapped: bool,
    dst: &mut BytesMut,
) {
    dst.reserve(WIRE_HEADER_LENGTH + body.len());
    dst.put_u8(build_flags(encoding, is_error, nonce, wrapped));
    dst.put_u32(nonce);
    dst.put_u32(body.len() as u32);
    dst.put_slice(body);
}

/// Encode a frame into a fresh buffer.
pub fn encode(encoding: Encoding, is_error: bool, nonce: u32, body: &[u8], wrapped: bool) -> Bytes {
    let mut dst = BytesMut::with_capacity(WIRE_HEADER_LENGTH + body.len());
    encode_into(encoding, is_error, nonce, body, wrapped, &mut dst);
    dst.freeze()
}

/// Decode only the header, so a reader can learn the body length first.
pub fn decode_header(header: &[u8]) -> P2pResult<WireHeader> {
    if header.len() < WIRE_HEADER_LENGTH {
        return Err(P2pError::TruncatedFrame {
            expected: WIRE_HEADER_LENGTH,
            actual: header.len(),
        });
    }

    let flags = parse_flags(header[0])?;
    let nonce = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    let body_length = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;

    Ok(WireHeader {
        flags,
        nonce,
        body_length,
    })
}

/// Decode a complete frame. The slice must hold at least the header plus
/// the announced body; trailing bytes are ignored.
pub fn decode(wire: &[u8]) -> P2pResult<Frame> {
    let header = decode_header(wire)?;
    let end = header.frame_length();
    if wire.len() < end {
        return Err(P2pError::TruncatedFrame {
            expected: end,
            actual: wire.len(),
        });
    }

    Ok(Frame {
        nonce: header.nonce,
        encoding: header.encoding(),
        is_error: header.is_error(),
        wrapped: header.is_wrapped(),
        body: Bytes::copy_from_slice(&wire[WIRE_HEADER_LENGTH..end]),
    })
}
