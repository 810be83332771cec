//! Error types for the HTTP/2 engine
//!
//! This module defines error types for connection and stream operations,
//! mapping to the error codes defined in RFC 7540 Section 7.

use std::fmt;

/// HTTP/2 engine errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error on the underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol error detected (RFC 7540 Section 7 - Error code 0x1)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Internal error (RFC 7540 Section 7 - Error code 0x2)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Flow control error (RFC 7540 Section 7 - Error code 0x3)
    #[error("Flow control error: {0}")]
    FlowControl(String),

    /// Frame illegal for the stream's current state
    #[error("Stream {stream_id} cannot {operation} in state {state}")]
    StreamState {
        stream_id: u32,
        state: &'static str,
        operation: &'static str,
    },

    /// Operation on a stream whose write side is already closed
    #[error("Stream closed: {0}")]
    StreamClosed(u32),

    /// Stream was reset, locally or by the peer
    #[error("Stream {stream_id} reset: {code}")]
    StreamReset { stream_id: u32, code: ErrorCode },

    /// Frame size error (RFC 7540 Section 7 - Error code 0x6)
    #[error("Frame size error: {0}")]
    FrameSize(String),

    /// Peer refused the stream (RFC 7540 Section 7 - Error code 0x7)
    #[error("Refused stream: {0}")]
    RefusedStream(u32),

    /// Header compression failure; unrecoverable at connection scope
    #[error("Compression error: {0}")]
    Compression(String),

    /// Header list is malformed (pseudo-header ordering, trailer rules)
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// Invalid settings value
    #[error("Invalid settings value: {0}")]
    InvalidSettings(String),

    /// Local concurrent stream budget exhausted
    #[error("Too many concurrent streams")]
    TooManyStreams,

    /// Stream handle refers to a stream the connection no longer tracks
    #[error("Stream not found: {0}")]
    StreamNotFound(u32),

    /// Peer announced shutdown; no new streams may be opened
    #[error("GOAWAY received: last stream {last_stream_id}, {code}")]
    GoawayReceived { last_stream_id: u32, code: ErrorCode },

    /// Connection failed with a protocol-level error and was terminated
    #[error("Connection error: {code}: {reason}")]
    Connection { code: ErrorCode, reason: String },

    /// Connection closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Missing connection preface
    #[error("Missing connection preface")]
    MissingPreface,
}

impl Error {
    /// Whether the failure is scoped to a single stream; the connection
    /// remains usable for other streams.
    pub fn is_stream_error(&self) -> bool {
        matches!(
            self,
            Error::StreamState { .. }
                | Error::StreamClosed(_)
                | Error::StreamReset { .. }
                | Error::RefusedStream(_)
                | Error::StreamNotFound(_)
        )
    }

    /// Whether the failure terminates the whole connection.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Protocol(_)
                | Error::FrameSize(_)
                | Error::Compression(_)
                | Error::Connection { .. }
                | Error::ConnectionClosed
                | Error::GoawayReceived { .. }
                | Error::MissingPreface
        )
    }
}

/// HTTP/2 error codes as defined in RFC 7540 Section 7
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    /// Graceful shutdown
    NoError = 0x0,
    /// Protocol error detected
    ProtocolError = 0x1,
    /// Implementation fault
    InternalError = 0x2,
    /// Flow-control limits exceeded
    FlowControlError = 0x3,
    /// Settings not acknowledged
    SettingsTimeout = 0x4,
    /// Frame received for closed stream
    StreamClosed = 0x5,
    /// Frame size incorrect
    FrameSizeError = 0x6,
    /// Stream not processed
    RefusedStream = 0x7,
    /// Stream cancelled
    Cancel = 0x8,
    /// Compression state not updated
    CompressionError = 0x9,
    /// TCP connection error for CONNECT method
    ConnectError = 0xa,
    /// Processing capacity exceeded
    EnhanceYourCalm = 0xb,
    /// Negotiated TLS parameters not acceptable
    InadequateSecurity = 0xc,
    /// Use HTTP/1.1 for the request
    Http11Required = 0xd,
}

impl ErrorCode {
    /// Convert error code to u32
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Create error code from u32
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            0x0 => Some(ErrorCode::NoError),
            0x1 => Some(ErrorCode::ProtocolError),
            0x2 => Some(ErrorCode::InternalError),
            0x3 => Some(ErrorCode::FlowControlError),
            0x4 => Some(ErrorCode::SettingsTimeout),
            0x5 => Some(ErrorCode::StreamClosed),
            0x6 => Some(ErrorCode::FrameSizeError),
            0x7 => Some(ErrorCode::RefusedStream),
            0x8 => Some(ErrorCode::Cancel),
            0x9 => Some(ErrorCode::CompressionError),
            0xa => Some(ErrorCode::ConnectError),
            0xb => Some(ErrorCode::EnhanceYourCalm),
            0xc => Some(ErrorCode::InadequateSecurity),
            0xd => Some(ErrorCode::Http11Required),
            _ => None,
        }
    }

    /// Get error name
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::NoError => "NO_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::FlowControlError => "FLOW_CONTROL_ERROR",
            ErrorCode::SettingsTimeout => "SETTINGS_TIMEOUT",
            ErrorCode::StreamClosed => "STREAM_CLOSED",
            ErrorCode::FrameSizeError => "FRAME_SIZE_ERROR",
            ErrorCode::RefusedStream => "REFUSED_STREAM",
            ErrorCode::Cancel => "CANCEL",
            ErrorCode::CompressionError => "COMPRESSION_ERROR",
            ErrorCode::ConnectError => "CONNECT_ERROR",
            ErrorCode::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            ErrorCode::InadequateSecurity => "INADEQUATE_SECURITY",
            ErrorCode::Http11Required => "HTTP_1_1_REQUIRED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u32())
    }
}

/// Classification of a rejected inbound frame: reset the stream or
/// terminate the connection (RFC 7540 Section 5.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    /// Emit RST_STREAM with the code; the connection stays up
    Stream(ErrorCode),
    /// Emit GOAWAY with the code and tear the connection down
    Connection(ErrorCode),
}

impl Violation {
    /// The RFC 7540 error code carried either way
    pub fn code(&self) -> ErrorCode {
        match self {
            Violation::Stream(code) | Violation::Connection(code) => *code,
        }
    }
}

/// Result type for HTTP/2 operations
pub type Result<T> = std::result::Result<T, Error>;
