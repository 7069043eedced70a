//! Length-prefixed framing for the binary JSON-RPC transport.
//!
//! Each message on the wire is an 8-byte big-endian unsigned length followed
//! by exactly that many payload bytes. The next message's length starts
//! immediately after the previous payload.
//!
//! [`LengthPrefixedCodec`] implements `tokio_util`'s [`Decoder`] and
//! [`Encoder`] so the reactor-driven [`Connection`](crate::connection::Connection)
//! can feed it from a [`BytesMut`] receive buffer. Partial reads simply leave
//! the buffer short; over-reads leave the surplus in the buffer, where it is
//! decoded as the start of the next frame.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub mod error;

pub use error::{CodecError, EofError, FramingError, ProtocolError};

/// Size of the length prefix in bytes.
pub const LENGTH_HEADER_SIZE: usize = 8;

/// Default maximum payload length (16 MiB).
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Parse a length prefix from the first [`LENGTH_HEADER_SIZE`] bytes of `bytes`.
///
/// Returns `None` when fewer bytes are available.
#[must_use]
pub fn peek_length(bytes: &[u8]) -> Option<u64> {
    let header: [u8; LENGTH_HEADER_SIZE] = bytes.get(..LENGTH_HEADER_SIZE)?.try_into().ok()?;
    Some(u64::from_be_bytes(header))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DecodeState {
    WaitingForLength,
    WaitingForPayload(usize),
}

/// Codec for 8-byte big-endian length-prefixed frames.
///
/// ```
/// use bytes::{Bytes, BytesMut};
/// use hostwire::codec::LengthPrefixedCodec;
/// use tokio_util::codec::{Decoder, Encoder};
///
/// let mut codec = LengthPrefixedCodec::default();
/// let mut buf = BytesMut::new();
/// codec.encode(Bytes::from_static(b"{}"), &mut buf).unwrap();
/// assert_eq!(&buf[..], b"\0\0\0\0\0\0\0\x02{}");
/// assert_eq!(codec.decode(&mut buf).unwrap(), Some(Bytes::from_static(b"{}")));
/// ```
#[derive(Clone, Debug)]
pub struct LengthPrefixedCodec {
    max_frame_length: usize,
    state: DecodeState,
}

impl LengthPrefixedCodec {
    /// Construct a codec rejecting payloads longer than `max_frame_length`.
    #[must_use]
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            max_frame_length,
            state: DecodeState::WaitingForLength,
        }
    }

    /// Maximum payload length accepted in either direction.
    #[must_use]
    pub fn max_frame_length(&self) -> usize { self.max_frame_length }

    fn eof_error(&self, src: &BytesMut) -> CodecError {
        match self.state {
            DecodeState::WaitingForLength => EofError::MidHeader {
                bytes_received: src.len(),
                header_size: LENGTH_HEADER_SIZE,
            },
            DecodeState::WaitingForPayload(expected) => EofError::MidFrame {
                bytes_received: src.len(),
                expected,
            },
        }
        .into()
    }
}

impl Default for LengthPrefixedCodec {
    fn default() -> Self { Self::new(DEFAULT_MAX_FRAME_LENGTH) }
}

impl Decoder for LengthPrefixedCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                DecodeState::WaitingForLength => {
                    let Some(length) = peek_length(src) else {
                        return Ok(None);
                    };
                    let length = usize::try_from(length)
                        .map_err(|_| FramingError::InvalidLengthEncoding)?;
                    if length > self.max_frame_length {
                        return Err(FramingError::OversizedFrame {
                            size: length,
                            max: self.max_frame_length,
                        }
                        .into());
                    }
                    src.advance(LENGTH_HEADER_SIZE);
                    src.reserve(length);
                    self.state = DecodeState::WaitingForPayload(length);
                }
                DecodeState::WaitingForPayload(length) => {
                    if src.len() < length {
                        return Ok(None);
                    }
                    self.state = DecodeState::WaitingForLength;
                    return Ok(Some(src.split_to(length).freeze()));
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if src.is_empty() && self.state == DecodeState::WaitingForLength {
            return Ok(None);
        }
        Err(self.eof_error(src).into())
    }
}

impl Encoder<Bytes> for LengthPrefixedCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_frame_length {
            return Err(FramingError::OversizedFrame {
                size: item.len(),
                max: self.max_frame_length,
            }
            .into());
        }
        dst.reserve(LENGTH_HEADER_SIZE + item.len());
        dst.put_u64(item.len() as u64);
        dst.put_slice(&item);
        Ok(())
    }
}
