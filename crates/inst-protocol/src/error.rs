//! Error types for instrument protocol framing and decoding

use thiserror::Error;

/// Errors that can occur while decoding a frame from an instrument
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Frame did not have the length the pending command expected
    #[error("unexpected frame length: expected {expected} bytes, got {actual}")]
    UnexpectedLength { expected: usize, actual: usize },

    /// Invalid frame structure
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Frame was not valid UTF-8 text
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    /// JSON line failed to parse
    #[error("malformed JSON: {0}")]
    Json(String),

    /// A typed key:value field held an unparsable integer
    #[error("invalid integer for field {field}: {value:?}")]
    InvalidInteger { field: String, value: String },

    /// Invalid BCD encoding
    #[error("invalid BCD digit: 0x{0:02X}")]
    InvalidBcd(u8),
}

impl From<serde_json::Error> for ParseError {
    fn from(e: serde_json::Error) -> Self {
        ParseError::Json(e.to_string())
    }
}

/// Higher-level protocol errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Parse error
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// Request cannot be expressed in this instrument's command set
    #[error("{instrument} does not support {request}")]
    UnsupportedRequest {
        /// Instrument profile name
        instrument: &'static str,
        /// Debug rendering of the rejected request
        request: String,
    },

    /// Request argument out of range for the wire format
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
