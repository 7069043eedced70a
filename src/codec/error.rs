//! Error types for the codec layer.
//!
//! Codecs report failures through [`CodecError`], which separates wire-level
//! framing problems from protocol violations found after a frame boundary
//! was located, and from premature end-of-stream. Every variant is
//! connection-local: the connection that produced it is closed and nothing
//! else is affected.

use std::io;

use thiserror::Error;

/// Framing-level errors raised while locating frame boundaries.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    /// Frame length exceeds the configured maximum.
    #[error("frame exceeds max length: {size} > {max}")]
    OversizedFrame {
        /// Size announced by the peer, or buffered so far.
        size: usize,
        /// Maximum allowed frame size.
        max: usize,
    },

    /// Length prefix does not fit the platform's address space.
    #[error("invalid frame length encoding")]
    InvalidLengthEncoding,

    /// A STOMP header line lacks the `:` separator.
    #[error("malformed header line: {line:?}")]
    MalformedHeader {
        /// Offending line, lossily decoded.
        line: String,
    },

    /// A `content-length` header is not a decimal integer.
    #[error("invalid content-length: {value:?}")]
    InvalidContentLength {
        /// Raw header value.
        value: String,
    },

    /// The byte after a `content-length` body is not the NUL terminator.
    #[error("missing frame terminator")]
    MissingTerminator,
}

/// Protocol-level errors raised after a frame was extracted.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The command line names no STOMP command.
    #[error("unknown command: {command}")]
    UnknownCommand {
        /// Command text as received.
        command: String,
    },

    /// Headers or command are not UTF-8.
    #[error("frame header is not valid UTF-8")]
    InvalidUtf8,

    /// A header escape sequence is not one of `\n`, `\r`, `\c`, `\\`.
    #[error("invalid escape sequence in header: {sequence:?}")]
    InvalidEscape {
        /// The two-character sequence that failed to decode.
        sequence: String,
    },
}

/// End-of-stream conditions that lose data.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum EofError {
    /// EOF received while the payload was being read.
    #[error("premature EOF: {bytes_received} bytes of {expected} byte frame received")]
    MidFrame {
        /// Payload bytes received before EOF.
        bytes_received: usize,
        /// Payload size announced by the header.
        expected: usize,
    },

    /// EOF received while the header was being read.
    #[error("premature EOF during header: {bytes_received} of {header_size} header bytes")]
    MidHeader {
        /// Header bytes received before EOF.
        bytes_received: usize,
        /// Header size, or zero when the header is delimiter-terminated.
        header_size: usize,
    },
}

/// Top-level codec error taxonomy.
///
/// ```
/// use hostwire::codec::{CodecError, FramingError};
///
/// let err = CodecError::from(FramingError::OversizedFrame { size: 20, max: 10 });
/// assert_eq!(err.error_type(), "framing");
/// let io: std::io::Error = err.into();
/// assert_eq!(io.kind(), std::io::ErrorKind::InvalidData);
/// ```
#[derive(Debug, Error)]
pub enum CodecError {
    /// Framing layer error.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// Protocol layer error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport layer I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Premature end of stream.
    #[error("EOF: {0}")]
    Eof(#[from] EofError),
}

impl CodecError {
    /// Category name for logs and metrics: `framing`, `protocol`, `io` or `eof`.
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Framing(_) => "framing",
            Self::Protocol(_) => "protocol",
            Self::Io(_) => "io",
            Self::Eof(_) => "eof",
        }
    }
}

impl From<CodecError> for io::Error {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) => e,
            CodecError::Framing(e) => io::Error::new(io::ErrorKind::InvalidData, e),
            CodecError::Protocol(e) => io::Error::new(io::ErrorKind::InvalidData, e),
            CodecError::Eof(e) => io::Error::new(io::ErrorKind::UnexpectedEof, e),
        }
    }
}

impl From<FramingError> for io::Error {
    fn from(err: FramingError) -> Self { CodecError::from(err).into() }
}

impl From<ProtocolError> for io::Error {
    fn from(err: ProtocolError) -> Self { CodecError::from(err).into() }
}
