//! HTTP/2 stream management
//!
//! One stream's lifecycle state machine (RFC 7540 Section 5.1), its
//! flow-control windows and its ordered inbound event queue, plus the
//! application-facing [`StreamHandle`].
//!
//! `Reset` is kept as a terminal state distinct from `Closed`: it carries
//! the error code and skips END_STREAM negotiation, and the read/write
//! surfaces report the two differently.

use crate::connection::{ConnShutdown, Shared};
use crate::error::{Error, ErrorCode, Result, Violation};
use crate::flow_control::FlowControlPair;
use crate::frames::PrioritySpec;
use crate::headers::{validate_header_order, validate_trailers, HeaderField};
use bytes::Bytes;
use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Condvar, Mutex};

/// Stream ID type
pub type StreamId = u32;

/// Stream state as defined in RFC 7540 Section 5.1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No frames have been sent or received
    Idle,
    /// PUSH_PROMISE sent; we will send the response
    ReservedLocal,
    /// PUSH_PROMISE received; the peer will send the response
    ReservedRemote,
    /// Both sides can send frames
    Open,
    /// Local write side closed; the peer can still send
    HalfClosedLocal,
    /// Peer's write side closed; we can still send
    HalfClosedRemote,
    /// Both sides closed normally
    Closed,
    /// Terminated abnormally by RST_STREAM; carries an error code
    Reset,
}

impl StreamState {
    /// State name for diagnostics
    pub fn name(&self) -> &'static str {
        match self {
            StreamState::Idle => "idle",
            StreamState::ReservedLocal => "reserved (local)",
            StreamState::ReservedRemote => "reserved (remote)",
            StreamState::Open => "open",
            StreamState::HalfClosedLocal => "half-closed (local)",
            StreamState::HalfClosedRemote => "half-closed (remote)",
            StreamState::Closed => "closed",
            StreamState::Reset => "reset",
        }
    }

    /// Check if the local side may still send DATA
    pub fn can_send(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedRemote)
    }

    /// Check if the peer may still send DATA
    pub fn can_receive(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedLocal)
    }

    /// Check if the stream reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamState::Closed | StreamState::Reset)
    }
}

/// One item of a stream's inbound sequence, delivered in transport
/// arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A complete decoded header block
    Headers {
        fields: Vec<HeaderField>,
        end_stream: bool,
    },
    /// A chunk of body data
    Data { chunk: Bytes, end_stream: bool },
    /// A trailing header block; always ends the stream
    Trailers { fields: Vec<HeaderField> },
}

impl StreamEvent {
    /// Whether this event terminates the inbound sequence
    pub fn is_end(&self) -> bool {
        match self {
            StreamEvent::Headers { end_stream, .. } => *end_stream,
            StreamEvent::Data { end_stream, .. } => *end_stream,
            StreamEvent::Trailers { .. } => true,
        }
    }
}

/// Stream bookkeeping guarded by the stream's mutex
#[derive(Debug)]
pub(crate) struct StreamCore {
    /// Stream ID
    pub(crate) id: StreamId,
    /// Current state
    pub(crate) state: StreamState,
    /// Send/receive flow-control windows
    pub(crate) flow: FlowControlPair,
    /// Inbound events awaiting the consumer
    pub(crate) events: VecDeque<StreamEvent>,
    /// END_STREAM has been queued; the inbound sequence is complete
    pub(crate) recv_finished: bool,
    /// Error code if the stream was reset
    pub(crate) reset_code: Option<ErrorCode>,
    /// Set when the whole connection went down
    pub(crate) shutdown: Option<ConnShutdown>,
    /// An initial header block has been received (later blocks are trailers)
    pub(crate) headers_received: bool,
    /// An initial header block has been sent (later blocks are trailers)
    pub(crate) headers_sent: bool,
    /// Last priority advised by the peer
    pub(crate) priority: Option<PrioritySpec>,
}

impl StreamCore {
    pub(crate) fn new(id: StreamId, state: StreamState, send_size: u32, recv_size: u32) -> Self {
        StreamCore {
            id,
            state,
            flow: FlowControlPair::with_initial_sizes(send_size, recv_size),
            events: VecDeque::new(),
            recv_finished: false,
            reset_code: None,
            shutdown: None,
            headers_received: false,
            headers_sent: false,
            priority: None,
        }
    }

    /// Error the application sees for a dead stream, if it is dead
    fn dead_error(&self) -> Option<Error> {
        if let Some(code) = self.reset_code {
            return Some(Error::StreamReset {
                stream_id: self.id,
                code,
            });
        }
        self.shutdown.as_ref().map(|s| s.to_error())
    }

    /// Validate and apply the state transition for sending a header block
    pub(crate) fn send_headers(&mut self, end_stream: bool) -> Result<()> {
        if let Some(err) = self.dead_error() {
            return Err(err);
        }
        match self.state {
            StreamState::Idle => {
                self.state = if end_stream {
                    StreamState::HalfClosedLocal
                } else {
                    StreamState::Open
                };
            }
            StreamState::ReservedLocal => {
                self.state = if end_stream {
                    StreamState::Closed
                } else {
                    StreamState::HalfClosedRemote
                };
            }
            StreamState::Open => {
                if end_stream {
                    self.state = StreamState::HalfClosedLocal;
                }
            }
            StreamState::HalfClosedRemote => {
                if end_stream {
                    self.state = StreamState::Closed;
                }
            }
            StreamState::HalfClosedLocal | StreamState::Closed => {
                return Err(Error::StreamClosed(self.id));
            }
            StreamState::ReservedRemote | StreamState::Reset => {
                return Err(Error::StreamState {
                    stream_id: self.id,
                    state: self.state.name(),
                    operation: "send HEADERS",
                });
            }
        }
        self.headers_sent = true;
        Ok(())
    }

    /// Check that the local side may send DATA, without transitioning
    pub(crate) fn ensure_can_send(&self) -> Result<()> {
        if let Some(err) = self.dead_error() {
            return Err(err);
        }
        match self.state {
            StreamState::Open | StreamState::HalfClosedRemote => Ok(()),
            StreamState::HalfClosedLocal | StreamState::Closed => {
                Err(Error::StreamClosed(self.id))
            }
            _ => Err(Error::StreamState {
                stream_id: self.id,
                state: self.state.name(),
                operation: "send DATA",
            }),
        }
    }

    /// Validate and apply the state transition for sending DATA
    pub(crate) fn send_data(&mut self, end_stream: bool) -> Result<()> {
        if let Some(err) = self.dead_error() {
            return Err(err);
        }
        match self.state {
            StreamState::Open => {
                if end_stream {
                    self.state = StreamState::HalfClosedLocal;
                }
            }
            StreamState::HalfClosedRemote => {
                if end_stream {
                    self.state = StreamState::Closed;
                }
            }
            StreamState::HalfClosedLocal | StreamState::Closed => {
                return Err(Error::StreamClosed(self.id));
            }
            _ => {
                return Err(Error::StreamState {
                    stream_id: self.id,
                    state: self.state.name(),
                    operation: "send DATA",
                });
            }
        }
        Ok(())
    }

    /// Transition to Reset from any non-terminal state
    pub(crate) fn reset(&mut self, code: ErrorCode) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = StreamState::Reset;
        self.reset_code = Some(code);
        true
    }

    /// Validate and apply the state transition for a received header block.
    /// Returns whether the block is a trailer block.
    pub(crate) fn recv_headers(&mut self, end_stream: bool) -> std::result::Result<bool, Violation> {
        let trailers = self.headers_received;
        match self.state {
            StreamState::Idle => {
                self.state = if end_stream {
                    StreamState::HalfClosedRemote
                } else {
                    StreamState::Open
                };
            }
            StreamState::ReservedRemote => {
                self.state = if end_stream {
                    StreamState::Closed
                } else {
                    StreamState::HalfClosedLocal
                };
            }
            StreamState::Open | StreamState::HalfClosedLocal => {
                if trailers && !end_stream {
                    // Trailers must close the peer's write side
                    return Err(Violation::Stream(ErrorCode::ProtocolError));
                }
                if end_stream {
                    self.state = match self.state {
                        StreamState::Open => StreamState::HalfClosedRemote,
                        _ => StreamState::Closed,
                    };
                }
            }
            StreamState::HalfClosedRemote | StreamState::Closed | StreamState::Reset => {
                return Err(Violation::Stream(ErrorCode::StreamClosed));
            }
            StreamState::ReservedLocal => {
                // The peer may not send a header block on a stream we reserved
                return Err(Violation::Connection(ErrorCode::ProtocolError));
            }
        }
        self.headers_received = true;
        if end_stream {
            self.recv_finished = true;
        }
        Ok(trailers)
    }

    /// Validate and apply the state transition for received DATA
    pub(crate) fn recv_data(&mut self, end_stream: bool) -> std::result::Result<(), Violation> {
        match self.state {
            StreamState::Open => {
                if end_stream {
                    self.state = StreamState::HalfClosedRemote;
                }
            }
            StreamState::HalfClosedLocal => {
                if end_stream {
                    self.state = StreamState::Closed;
                }
            }
            StreamState::Idle | StreamState::ReservedLocal | StreamState::ReservedRemote => {
                // DATA cannot open a stream (RFC 7540 Section 6.1)
                return Err(Violation::Connection(ErrorCode::ProtocolError));
            }
            StreamState::HalfClosedRemote | StreamState::Closed | StreamState::Reset => {
                return Err(Violation::Stream(ErrorCode::StreamClosed));
            }
        }
        if end_stream {
            self.recv_finished = true;
        }
        Ok(())
    }
}

/// A stream plus its wait point, shared between the connection and handles
#[derive(Debug)]
pub(crate) struct SharedStream {
    pub(crate) inner: Mutex<StreamCore>,
    pub(crate) cv: Condvar,
}

impl SharedStream {
    pub(crate) fn new(core: StreamCore) -> Self {
        SharedStream {
            inner: Mutex::new(core),
            cv: Condvar::new(),
        }
    }

    /// Wake every reader and writer parked on this stream
    pub(crate) fn notify(&self) {
        self.cv.notify_all();
    }
}

/// Application handle for one stream.
///
/// Handles are cheap to clone and reference the stream by shared state;
/// once the stream reaches a terminal state and is reaped, operations fail
/// with the stream's terminal error rather than crash.
pub struct StreamHandle<W: Write + Send + 'static> {
    pub(crate) id: StreamId,
    pub(crate) stream: Arc<SharedStream>,
    pub(crate) conn: Arc<Shared<W>>,
}

impl<W: Write + Send + 'static> Clone for StreamHandle<W> {
    fn clone(&self) -> Self {
        StreamHandle {
            id: self.id,
            stream: Arc::clone(&self.stream),
            conn: Arc::clone(&self.conn),
        }
    }
}

impl<W: Write + Send + 'static> StreamHandle<W> {
    /// The stream's id
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// The stream's current state
    pub fn state(&self) -> StreamState {
        self.stream.inner.lock().unwrap().state
    }

    /// Error code carried by a reset stream
    pub fn reset_code(&self) -> Option<ErrorCode> {
        self.stream.inner.lock().unwrap().reset_code
    }

    /// Write a header block for the stream.
    ///
    /// The list must contain the stream's pseudo-headers first; lists that
    /// put a pseudo-header after a regular header are rejected before
    /// encoding.
    pub fn write_headers(&self, fields: &[HeaderField], end_of_stream: bool) -> Result<()> {
        validate_header_order(fields)?;
        self.conn
            .send_headers_on(&self.stream, fields, end_of_stream)
    }

    /// Write a block of trailing headers and close the local write side.
    ///
    /// Trailers must carry no pseudo-headers.
    pub fn write_trailers(&self, fields: &[HeaderField]) -> Result<()> {
        validate_trailers(fields)?;
        {
            let core = self.stream.inner.lock().unwrap();
            if !core.headers_sent {
                return Err(Error::StreamState {
                    stream_id: self.id,
                    state: core.state.name(),
                    operation: "send trailers before headers",
                });
            }
        }
        self.conn.send_headers_on(&self.stream, fields, true)
    }

    /// Write data to the stream, optionally signalling end of stream.
    ///
    /// The write suspends while flow-control budget is exhausted and splits
    /// across several DATA frames when the buffer exceeds the per-frame
    /// budget. Returns once every byte is on the transport.
    pub fn write_data(&self, buffer: &[u8], end_of_stream: bool) -> Result<()> {
        self.conn.send_data_on(&self.stream, buffer, end_of_stream)
    }

    /// Cancel the stream.
    ///
    /// Sends RST_STREAM with CANCEL and transitions to Reset unless the
    /// stream is already terminal. Idempotent and fire-and-forget: pending
    /// reads and writes fail fast with a reset error.
    pub fn cancel(&self) -> Result<()> {
        self.conn
            .reset_stream_local(&self.stream, ErrorCode::Cancel)
    }

    /// Pull the next inbound event, blocking until one is available.
    ///
    /// Returns `Ok(None)` once the peer's side ended cleanly. Fails with
    /// `StreamReset` if the stream was reset and a connection-level error
    /// if the connection went down.
    pub fn read_event(&self) -> Result<Option<StreamEvent>> {
        let mut core = self.stream.inner.lock().unwrap();
        loop {
            if let Some(code) = core.reset_code {
                return Err(Error::StreamReset {
                    stream_id: core.id,
                    code,
                });
            }
            if let Some(event) = core.events.pop_front() {
                return Ok(Some(event));
            }
            if core.recv_finished {
                return Ok(None);
            }
            if let Some(shutdown) = &core.shutdown {
                return Err(shutdown.to_error());
            }
            core = self.stream.cv.wait(core).unwrap();
        }
    }

    /// A lazy, finite, non-restartable iterator over the inbound sequence.
    ///
    /// Yields events until end-of-stream; a reset or connection failure
    /// surfaces as a final `Err` item.
    pub fn events(&self) -> Events<'_, W> {
        Events {
            handle: self,
            done: false,
        }
    }
}

/// Iterator over a stream's inbound events; see [`StreamHandle::events`]
pub struct Events<'a, W: Write + Send + 'static> {
    handle: &'a StreamHandle<W>,
    done: bool,
}

impl<W: Write + Send + 'static> Iterator for Events<'_, W> {
    type Item = Result<StreamEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.handle.read_event() {
            Ok(Some(event)) => {
                if event.is_end() {
                    self.done = true;
                }
                Some(Ok(event))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
