//! Stream codec for wire frames.
//!
//! The decoder reads the 9-byte header first, validates the declared body
//! length against the connection's buffer size, and then waits for exactly
//! that many body bytes.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::WIRE_HEADER_LENGTH;
use crate::error::{P2pError, P2pResult};
use crate::protocol::wire::{self, Frame, WireHeader};

/// Codec turning a byte stream into [`Frame`]s and back.
#[derive(Debug)]
pub struct FrameCodec {
    /// Largest body accepted in either direction.
    max_body_length: usize,
    /// Header of the frame being assembled, once it has been read.
    current: Option<WireHeader>,
}

impl FrameCodec {
    /// Create a codec accepting bodies up to `max_body_length` bytes.
    pub fn new(max_body_length: usize) -> Self {
        Self {
            max_body_length,
            current: None,
        }
    }

    /// Largest accepted body.
    pub fn max_body_length(&self) -> usize {
        self.max_body_length
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = P2pError;

    fn decode(&mut self, src: &mut BytesMut) -> P2pResult<Option<Self::Item>> {
        let header = match self.current {
            Some(header) => header,
            None => {
                if src.len() < WIRE_HEADER_LENGTH {
                    return Ok(None);
                }

                let header = wire::decode_header(&src[..WIRE_HEADER_LENGTH])?;
                if header.body_length > self.max_body_length {
                    return Err(P2pError::BodyTooLarge {
                        size: header.body_length,
                        max: self.max_body_length,
                    });
                }

                self.current = Some(header);
                header
            }
        };

        let frame_length = header.frame_length();
        if src.len() < frame_length {
            src.reserve(frame_length - src.len());
            return Ok(None);
        }

        src.advance(WIRE_HEADER_LENGTH);
        let body = src.split_to(header.body_length).freeze();
        self.current = None;

        Ok(Some(Frame {
            nonce: header.nonce,
            encoding: header.encoding(),
            is_error: header.is_error(),
            wrapped: header.is_wrapped(),
            body,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = P2pError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> P2pResult<()> {
        if frame.body.len() > self.max_body_length {
            return Err(P2pError::BodyTooLarge {
                size: frame.body.len(),
                max: self.max_body_length,
            });
        }

        wire::encode_into(
            frame.encoding,
            frame.is_error,
            frame.nonce,
            &frame.body,
            frame.wrapped,
            dst,
        );
        Ok(())
    }
}
