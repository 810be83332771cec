//! h2mux - connection-level HTTP/2 framing engine
//!
//! This crate multiplexes many independent request/response streams over a
//! single ordered byte transport, enforcing the RFC 7540 per-stream and
//! per-connection state machines and flow-control accounting. It stops at
//! the framing layer: HTTP semantics, TLS/ALPN and the transport itself are
//! the caller's business, and HPACK is consumed through the `hpack` crate
//! behind a narrow encode/decode boundary.
//!
//! # Architecture
//!
//! - **Frame codecs**: the fixed 9-byte frame header and the per-type
//!   payloads (DATA, HEADERS, PRIORITY, RST_STREAM, SETTINGS, PUSH_PROMISE,
//!   PING, GOAWAY, WINDOW_UPDATE, CONTINUATION)
//! - **Stream state machine**: the full RFC 7540 Section 5.1 lifecycle,
//!   with `Reset` kept distinct from `Closed`
//! - **Flow control**: paired signed windows at stream and connection scope;
//!   writers suspend instead of overdrawing
//! - **Connection multiplexer**: one reader thread demultiplexing inbound
//!   frames, one writer serialization point keeping frames atomic and
//!   HEADERS+CONTINUATION sequences unbroken
//!
//! # Example
//!
//! ```no_run
//! use h2mux::{Connection, HeaderField};
//! use std::net::TcpStream;
//!
//! # fn example() -> h2mux::Result<()> {
//! let transport = TcpStream::connect("example.com:80")?;
//! let conn = Connection::client(transport.try_clone()?, transport)?;
//!
//! let stream = conn.open_stream(
//!     &[
//!         HeaderField::new(":method", "GET"),
//!         HeaderField::new(":path", "/"),
//!         HeaderField::new(":scheme", "http"),
//!         HeaderField::new(":authority", "example.com"),
//!     ],
//!     true,
//! )?;
//!
//! for event in stream.events() {
//!     println!("{:?}", event?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod connection;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod headers;
pub mod settings;
pub mod stream;

pub use connection::{Connection, ConnectionBuilder, Role};
pub use error::{Error, ErrorCode, Result, Violation};
pub use flow_control::FlowControlWindow;
pub use frames::{Frame, FrameFlags, FrameHeader, FrameType};
pub use headers::HeaderField;
pub use settings::{Settings, SettingsBuilder};
pub use stream::{StreamEvent, StreamHandle, StreamId, StreamState};

/// HTTP/2 connection preface that must be sent by clients
///
/// From RFC 7540 Section 3.5:
/// "PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n"
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Default initial window size (65535 bytes)
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65535;

/// Default maximum frame size (16384 bytes)
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;

/// Default header table size (4096 bytes)
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;

/// Maximum stream ID value (2^31 - 1)
pub const MAX_STREAM_ID: u32 = 0x7FFFFFFF;

/// Stream ID 0 (connection-level)
pub const CONNECTION_STREAM_ID: u32 = 0;
