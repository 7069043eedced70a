//! STOMP 1.2 frame codec.
//!
//! Decoding runs in two stages. The header block (command line, header lines
//! and the blank separator) is parsed once it is complete and removed from
//! the buffer; the body is then read either by `content-length` or up to
//! the first NUL octet. End-of-line octets between frames are heart-beats
//! and are skipped.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::frame::{Command, Frame, headers};
use crate::codec::{CodecError, DEFAULT_MAX_FRAME_LENGTH, EofError, FramingError, ProtocolError};

#[derive(Clone, Debug)]
struct PendingBody {
    command: Command,
    headers: Vec<(String, String)>,
    content_length: Option<usize>,
    scanned: usize,
}

/// Codec for STOMP frames.
#[derive(Clone, Debug)]
pub struct StompCodec {
    max_frame_length: usize,
    pending: Option<PendingBody>,
}

impl Default for StompCodec {
    fn default() -> Self { Self::new(DEFAULT_MAX_FRAME_LENGTH) }
}

impl StompCodec {
    /// Codec rejecting frames larger than `max_frame_length` bytes.
    #[must_use]
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            max_frame_length,
            pending: None,
        }
    }

    fn check_size(&self, size: usize) -> Result<(), FramingError> {
        if size > self.max_frame_length {
            return Err(FramingError::OversizedFrame {
                size,
                max: self.max_frame_length,
            });
        }
        Ok(())
    }

    /// Parse a complete header block from the front of `src`.
    fn decode_head(&self, src: &mut BytesMut) -> Result<Option<PendingBody>, CodecError> {
        skip_heartbeats(src);
        let Some(end) = header_block_end(src) else {
            self.check_size(src.len())?;
            return Ok(None);
        };
        let block = src.split_to(end);
        let mut lines = block[..]
            .split(|&b| b == b'\n')
            .map(|line| line.strip_suffix(b"\r").unwrap_or(line));

        let command_line = lines.next().unwrap_or_default();
        let command: Command = utf8(command_line)?.parse()?;
        let mut parsed = Vec::new();
        for line in lines.filter(|line| !line.is_empty()) {
            let text = utf8(line)?;
            let (name, value) = text
                .split_once(':')
                .ok_or_else(|| FramingError::MalformedHeader {
                    line: text.to_owned(),
                })?;
            if command.escapes_headers() {
                parsed.push((unescape(name)?, unescape(value)?));
            } else {
                parsed.push((name.to_owned(), value.to_owned()));
            }
        }
        let content_length = parsed
            .iter()
            .find(|(name, _)| name == headers::CONTENT_LENGTH)
            .map(|(_, value)| {
                value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| FramingError::InvalidContentLength {
                        value: value.clone(),
                    })
            })
            .transpose()?;
        if let Some(length) = content_length {
            self.check_size(length)?;
        }
        Ok(Some(PendingBody {
            command,
            headers: parsed,
            content_length,
            scanned: 0,
        }))
    }

    fn decode_body(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        let Some(pending) = self.pending.as_mut() else {
            return Ok(None);
        };
        let body_len = match pending.content_length {
            Some(length) => {
                if src.len() <= length {
                    return Ok(None);
                }
                if src[length] != 0 {
                    return Err(FramingError::MissingTerminator.into());
                }
                length
            }
            None => {
                let found = src[pending.scanned..].iter().position(|&b| b == 0);
                if let Some(offset) = found {
                    pending.scanned + offset
                } else {
                    pending.scanned = src.len();
                    let size = src.len();
                    self.check_size(size)?;
                    return Ok(None);
                }
            }
        };
        let body = src.split_to(body_len).freeze();
        src.advance(1);
        let Some(PendingBody {
            command, headers, ..
        }) = self.pending.take()
        else {
            return Ok(None);
        };
        Ok(Some(Frame {
            command,
            headers,
            body,
        }))
    }
}

fn utf8(bytes: &[u8]) -> Result<&str, ProtocolError> {
    std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)
}

fn skip_heartbeats(src: &mut BytesMut) {
    loop {
        if src.first() == Some(&b'\n') {
            src.advance(1);
        } else if src.starts_with(b"\r\n") {
            src.advance(2);
        } else {
            return;
        }
    }
}

/// Offset just past the blank line ending the header block.
fn header_block_end(src: &[u8]) -> Option<usize> {
    let mut start = 0;
    let mut first = true;
    while let Some(offset) = src[start..].iter().position(|&b| b == b'\n') {
        let line = &src[start..start + offset];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let next = start + offset + 1;
        if line.is_empty() && !first {
            return Some(next);
        }
        first = false;
        start = next;
    }
    None
}

fn unescape(value: &str) -> Result<String, ProtocolError> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            Some('\\') => out.push('\\'),
            other => {
                return Err(ProtocolError::InvalidEscape {
                    sequence: other.map_or_else(|| "\\".to_owned(), |c| format!("\\{c}")),
                });
            }
        }
    }
    Ok(out)
}

fn escape_into(value: &str, dst: &mut BytesMut) {
    for c in value.chars() {
        match c {
            '\\' => dst.put_slice(b"\\\\"),
            '\n' => dst.put_slice(b"\\n"),
            '\r' => dst.put_slice(b"\\r"),
            ':' => dst.put_slice(b"\\c"),
            _ => {
                let mut buf = [0_u8; 4];
                dst.put_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
}

impl Decoder for StompCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.pending.is_none() {
            match self.decode_head(src)? {
                Some(pending) => self.pending = Some(pending),
                None => return Ok(None),
            }
        }
        Ok(self.decode_body(src)?)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        skip_heartbeats(src);
        match &self.pending {
            None if src.is_empty() => Ok(None),
            None => Err(CodecError::from(EofError::MidHeader {
                bytes_received: src.len(),
                header_size: 0,
            })
            .into()),
            Some(pending) => Err(CodecError::from(EofError::MidFrame {
                bytes_received: src.len(),
                expected: pending.content_length.unwrap_or(0),
            })
            .into()),
        }
    }
}

impl Encoder<Frame> for StompCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.check_size(frame.body.len())?;
        let escape = frame.command.escapes_headers();
        dst.put_slice(frame.command.as_str().as_bytes());
        dst.put_u8(b'\n');
        for (name, value) in &frame.headers {
            if name == headers::CONTENT_LENGTH {
                continue;
            }
            if escape {
                escape_into(name, dst);
                dst.put_u8(b':');
                escape_into(value, dst);
            } else {
                dst.put_slice(name.as_bytes());
                dst.put_u8(b':');
                dst.put_slice(value.as_bytes());
            }
            dst.put_u8(b'\n');
        }
        if !frame.body.is_empty()
            || matches!(frame.command, Command::Send | Command::Message | Command::Error)
        {
            dst.put_slice(format!("{}:{}\n", headers::CONTENT_LENGTH, frame.body.len()).as_bytes());
        }
        dst.put_u8(b'\n');
        dst.put_slice(&frame.body);
        dst.put_u8(0);
        Ok(())
    }
}

/// Encode `frame` into a standalone buffer.
///
/// # Errors
///
/// Returns an error if the body exceeds the default maximum frame length.
pub fn encode_frame(frame: Frame) -> io::Result<Bytes> {
    let mut buf = BytesMut::new();
    StompCodec::default().encode(frame, &mut buf)?;
    Ok(buf.freeze())
}
