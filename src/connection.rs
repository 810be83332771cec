//! HTTP/2 connection multiplexer
//!
//! Owns the map of active streams, the connection-wide flow-control
//! windows, the single reader loop that demultiplexes inbound frames, and
//! the single writer serialization point that guarantees atomic frame
//! emission.
//!
//! Lock order: streams table, then a stream's inner state, then the
//! writer, then the settings state. The connection flow windows are never
//! held across another lock.

use crate::codec::FrameCodec;
use crate::error::{Error, ErrorCode, Result, Violation};
use crate::flow_control::FlowControlPair;
use crate::frames::{
    DataFrame, FrameHeader, FrameType, GoawayFrame, PingFrame, RstStreamFrame, SettingsFrame,
    WindowUpdateFrame,
};
use crate::headers::{validate_header_order, HeaderDecoder, HeaderEncoder, HeaderField};
use crate::settings::Settings;
use crate::stream::{SharedStream, StreamCore, StreamEvent, StreamHandle, StreamId, StreamState};
use crate::CONNECTION_PREFACE;
use bytes::{Bytes, BytesMut};
use log::{debug, trace, warn};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

/// How many reaped stream ids are remembered to tolerate late frames
/// still in flight for a just-closed stream.
const CLOSED_GRACE_CAPACITY: usize = 64;

/// Which side of the connection this endpoint plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiates odd-numbered streams, sends the preface
    Client,
    /// Initiates even-numbered streams, verifies the preface
    Server,
}

impl Role {
    fn local_parity(self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 0,
        }
    }

    fn remote_parity(self) -> u32 {
        1 - self.local_parity()
    }

    fn first_local_id(self) -> StreamId {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }
}

/// Why the connection stopped accepting work
#[derive(Debug, Clone)]
pub(crate) enum ConnShutdown {
    /// Closed locally or by transport EOF, no error
    Clean,
    /// Peer sent GOAWAY
    Goaway {
        last_stream_id: StreamId,
        code: ErrorCode,
    },
    /// A connection-level protocol failure
    Failed { code: ErrorCode, reason: String },
}

impl ConnShutdown {
    pub(crate) fn to_error(&self) -> Error {
        match self {
            ConnShutdown::Clean => Error::ConnectionClosed,
            ConnShutdown::Goaway {
                last_stream_id,
                code,
            } => Error::GoawayReceived {
                last_stream_id: *last_stream_id,
                code: *code,
            },
            ConnShutdown::Failed { code, reason } => Error::Connection {
                code: *code,
                reason: reason.clone(),
            },
        }
    }
}

/// A rejected inbound frame: classification plus the reason for logging
/// and GOAWAY debug data.
struct Rejection {
    scope: Violation,
    reason: String,
}

impl Rejection {
    fn stream(code: ErrorCode, reason: impl Into<String>) -> Self {
        Rejection {
            scope: Violation::Stream(code),
            reason: reason.into(),
        }
    }

    fn connection(code: ErrorCode, reason: impl Into<String>) -> Self {
        Rejection {
            scope: Violation::Connection(code),
            reason: reason.into(),
        }
    }

    fn from_violation(violation: Violation, reason: impl Into<String>) -> Self {
        Rejection {
            scope: violation,
            reason: reason.into(),
        }
    }

    /// Map a codec/settings error onto a connection-level rejection
    fn from_error(err: Error) -> Self {
        let code = match err {
            Error::FrameSize(_) => ErrorCode::FrameSizeError,
            Error::Compression(_) => ErrorCode::CompressionError,
            Error::FlowControl(_) => ErrorCode::FlowControlError,
            Error::Protocol(_) | Error::InvalidSettings(_) | Error::InvalidHeader(_) => {
                ErrorCode::ProtocolError
            }
            _ => ErrorCode::InternalError,
        };
        Rejection {
            scope: Violation::Connection(code),
            reason: err.to_string(),
        }
    }
}

type Dispatch = std::result::Result<(), Rejection>;

/// The writer serialization point: the transport's write half plus the
/// header encoder, kept together so encode order always equals wire order.
struct FrameWriter<W: Write> {
    transport: W,
    encoder: HeaderEncoder,
}

impl<W: Write> FrameWriter<W> {
    fn write(&mut self, frame: &[u8]) -> Result<()> {
        FrameCodec::write_frame(&mut self.transport, frame)
    }
}

/// Stream table: id to stream mapping plus id allocation and the
/// recently-closed grace ring. Stream creation and reaping go through
/// here; ids are never reused.
struct StreamTable {
    map: HashMap<StreamId, Arc<SharedStream>>,
    next_local_id: StreamId,
    highest_remote_id: StreamId,
    recently_closed: VecDeque<StreamId>,
    recently_closed_set: HashSet<StreamId>,
}

impl StreamTable {
    fn new(role: Role) -> Self {
        StreamTable {
            map: HashMap::new(),
            next_local_id: role.first_local_id(),
            highest_remote_id: 0,
            recently_closed: VecDeque::new(),
            recently_closed_set: HashSet::new(),
        }
    }

    fn remember_closed(&mut self, id: StreamId) {
        if self.recently_closed_set.insert(id) {
            self.recently_closed.push_back(id);
            if self.recently_closed.len() > CLOSED_GRACE_CAPACITY {
                if let Some(old) = self.recently_closed.pop_front() {
                    self.recently_closed_set.remove(&old);
                }
            }
        }
    }

    fn in_grace(&self, id: StreamId) -> bool {
        self.recently_closed_set.contains(&id)
    }

    /// Count non-terminal streams initiated by the side with `parity`
    fn active_count(&self, parity: u32) -> usize {
        self.map
            .iter()
            .filter(|(id, stream)| {
                *id % 2 == parity && !stream.inner.lock().unwrap().state.is_terminal()
            })
            .count()
    }
}

/// Settings and shutdown state
struct ConnState {
    /// Local parameters in effect (those the peer has acknowledged)
    local_applied: Settings,
    /// Local parameter sets sent but not yet acknowledged
    pending_local: VecDeque<Settings>,
    /// Peer parameters, applied immediately on receipt
    remote: Settings,
    shutdown: Option<ConnShutdown>,
}

struct PingState {
    next: u64,
    acked: HashSet<[u8; 8]>,
}

/// State shared between the reader loop, stream handles and the
/// connection front object.
pub(crate) struct Shared<W: Write + Send + 'static> {
    role: Role,
    writer: Mutex<FrameWriter<W>>,
    streams: Mutex<StreamTable>,
    /// Connection-scope flow-control windows; send waiters park on `flow_cv`
    flow: Mutex<FlowControlPair>,
    flow_cv: Condvar,
    state: Mutex<ConnState>,
    /// Fast-path flag checked by waiters; set in `finish`
    closed: AtomicBool,
    accept_queue: Mutex<VecDeque<Arc<SharedStream>>>,
    accept_cv: Condvar,
    pings: Mutex<PingState>,
    ping_cv: Condvar,
}

impl<W: Write + Send + 'static> Shared<W> {
    fn local_max_frame_size(&self) -> usize {
        self.state.lock().unwrap().local_applied.get_max_frame_size() as usize
    }

    fn peer_max_frame_size(&self) -> usize {
        self.state.lock().unwrap().remote.get_max_frame_size() as usize
    }

    fn shutdown_error(&self) -> Option<Error> {
        self.state
            .lock()
            .unwrap()
            .shutdown
            .as_ref()
            .map(|s| s.to_error())
    }

    fn handle_for(self: &Arc<Self>, stream: Arc<SharedStream>) -> StreamHandle<W> {
        let id = stream.inner.lock().unwrap().id;
        StreamHandle {
            id,
            stream,
            conn: Arc::clone(self),
        }
    }

    // ---- outbound paths (called from application threads) ----

    /// Open a locally-initiated stream by writing its first header block.
    ///
    /// The id is allocated inside the writer critical section so ids appear
    /// on the wire in strictly increasing order even under concurrent opens.
    pub(crate) fn open_stream(
        self: &Arc<Self>,
        fields: &[HeaderField],
        end_of_stream: bool,
    ) -> Result<StreamHandle<W>> {
        validate_header_order(fields)?;
        if let Some(err) = self.shutdown_error() {
            return Err(err);
        }

        let (send_init, recv_init, peer_max, max_concurrent) = {
            let state = self.state.lock().unwrap();
            (
                state.remote.get_initial_window_size(),
                state.local_applied.get_initial_window_size(),
                state.remote.get_max_frame_size() as usize,
                state.remote.get_max_concurrent_streams(),
            )
        };

        let mut table = self.streams.lock().unwrap();

        if let Some(max) = max_concurrent {
            if table.active_count(self.role.local_parity()) >= max as usize {
                return Err(Error::TooManyStreams);
            }
        }

        if table.next_local_id > crate::MAX_STREAM_ID {
            return Err(Error::Protocol("stream ids exhausted".to_string()));
        }
        let id = table.next_local_id;
        table.next_local_id += 2;

        let mut core = StreamCore::new(id, StreamState::Idle, send_init, recv_init);
        core.send_headers(end_of_stream)?;
        let stream = Arc::new(SharedStream::new(core));
        table.map.insert(id, Arc::clone(&stream));

        let mut writer = self.writer.lock().unwrap();
        let block = writer.encoder.encode(fields)?;
        for frame in FrameCodec::encode_header_block(id, &block, end_of_stream, peer_max) {
            writer.write(&frame)?;
        }
        drop(writer);
        drop(table);

        trace!("opened stream {} (end_of_stream={})", id, end_of_stream);
        Ok(StreamHandle {
            id,
            stream,
            conn: Arc::clone(self),
        })
    }

    /// Send a header block (response, informational or trailers) on an
    /// existing stream as one unbroken HEADERS(+CONTINUATION) sequence.
    pub(crate) fn send_headers_on(
        &self,
        stream: &Arc<SharedStream>,
        fields: &[HeaderField],
        end_of_stream: bool,
    ) -> Result<()> {
        let peer_max = self.peer_max_frame_size();

        let mut core = stream.inner.lock().unwrap();
        core.send_headers(end_of_stream)?;
        let id = core.id;

        let mut writer = self.writer.lock().unwrap();
        let block = writer.encoder.encode(fields)?;
        for frame in FrameCodec::encode_header_block(id, &block, end_of_stream, peer_max) {
            writer.write(&frame)?;
        }
        drop(writer);

        let terminal = core.state.is_terminal();
        drop(core);
        if terminal {
            self.reap(id);
        }
        trace!("sent HEADERS on stream {} (end={})", id, end_of_stream);
        Ok(())
    }

    /// Send data, splitting it against the lesser of the stream window,
    /// the connection window and the peer's max frame size. Suspends while
    /// both budgets are exhausted.
    pub(crate) fn send_data_on(
        &self,
        stream: &Arc<SharedStream>,
        buffer: &[u8],
        end_of_stream: bool,
    ) -> Result<()> {
        if buffer.is_empty() {
            if !end_of_stream {
                return Ok(());
            }
            // A bare end-of-stream signal consumes no window
            let mut core = stream.inner.lock().unwrap();
            core.send_data(true)?;
            let id = core.id;
            let frame = DataFrame::new(id, Bytes::new(), true);
            let encoded = FrameCodec::encode_data_frame(&frame);
            self.writer.lock().unwrap().write(&encoded)?;
            let terminal = core.state.is_terminal();
            drop(core);
            if terminal {
                self.reap(id);
            }
            return Ok(());
        }

        let mut offset = 0;
        while offset < buffer.len() {
            let remaining = buffer.len() - offset;
            let peer_max = self.peer_max_frame_size();

            // Reserve from the stream window, waiting for replenishment
            let (id, want) = {
                let mut core = stream.inner.lock().unwrap();
                loop {
                    core.ensure_can_send()?;
                    if core.flow.send.has_capacity() {
                        break;
                    }
                    trace!("stream {} suspended on stream window", core.id);
                    core = stream.cv.wait(core).unwrap();
                }
                let want = remaining
                    .min(core.flow.send.size() as usize)
                    .min(peer_max);
                core.flow.send.consume(want);
                (core.id, want)
            };

            // Reserve from the connection window
            let mut flow = self.flow.lock().unwrap();
            let granted = loop {
                if self.closed.load(Ordering::Acquire) {
                    drop(flow);
                    let err = self
                        .shutdown_error()
                        .unwrap_or(Error::ConnectionClosed);
                    let mut core = stream.inner.lock().unwrap();
                    core.flow.send.release(want);
                    drop(core);
                    return Err(err);
                }
                if flow.send.has_capacity() {
                    break flow.send.consume(want);
                }
                trace!("stream {} suspended on connection window", id);
                flow = self.flow_cv.wait(flow).unwrap();
            };
            drop(flow);

            if granted < want {
                let mut core = stream.inner.lock().unwrap();
                core.flow.send.release(want - granted);
                stream.notify();
            }

            // Emit under the stream lock so chunks from concurrent callers
            // cannot interleave out of issue order
            let mut core = stream.inner.lock().unwrap();
            let end = end_of_stream && offset + granted == buffer.len();
            if let Err(err) = core.send_data(end) {
                core.flow.send.release(granted);
                drop(core);
                let mut flow = self.flow.lock().unwrap();
                flow.send.release(granted);
                self.flow_cv.notify_all();
                return Err(err);
            }
            let chunk = Bytes::copy_from_slice(&buffer[offset..offset + granted]);
            let frame = DataFrame::new(id, chunk, end);
            let encoded = FrameCodec::encode_data_frame(&frame);
            self.writer.lock().unwrap().write(&encoded)?;
            let terminal = core.state.is_terminal();
            drop(core);
            if terminal {
                self.reap(id);
            }

            offset += granted;
        }
        Ok(())
    }

    /// Locally reset a stream (cancel). Idempotent; no-op when already
    /// terminal.
    pub(crate) fn reset_stream_local(
        &self,
        stream: &Arc<SharedStream>,
        code: ErrorCode,
    ) -> Result<()> {
        let mut core = stream.inner.lock().unwrap();
        if !core.reset(code) {
            return Ok(());
        }
        let id = core.id;
        stream.notify();

        let frame = RstStreamFrame {
            stream_id: id,
            error_code: code,
        };
        let encoded = FrameCodec::encode_rst_stream_frame(&frame);
        self.writer.lock().unwrap().write(&encoded)?;
        drop(core);

        debug!("reset stream {} locally: {}", id, code);
        self.reap(id);
        Ok(())
    }

    /// Blocking accept of the next peer-initiated stream
    pub(crate) fn accept(self: &Arc<Self>) -> Result<StreamHandle<W>> {
        let mut queue = self.accept_queue.lock().unwrap();
        loop {
            if let Some(stream) = queue.pop_front() {
                return Ok(self.handle_for(stream));
            }
            if let Some(err) = self.shutdown_error() {
                return Err(err);
            }
            queue = self.accept_cv.wait(queue).unwrap();
        }
    }

    /// Round-trip a PING through the peer
    pub(crate) fn ping(&self) -> Result<()> {
        let data = {
            let mut pings = self.pings.lock().unwrap();
            let n = pings.next;
            pings.next += 1;
            n.to_be_bytes()
        };

        let encoded = FrameCodec::encode_ping_frame(&PingFrame::new(data));
        self.writer.lock().unwrap().write(&encoded)?;

        let mut pings = self.pings.lock().unwrap();
        loop {
            if pings.acked.remove(&data) {
                return Ok(());
            }
            if self.closed.load(Ordering::Acquire) {
                drop(pings);
                return Err(self.shutdown_error().unwrap_or(Error::ConnectionClosed));
            }
            pings = self.ping_cv.wait(pings).unwrap();
        }
    }

    /// Graceful local shutdown: announce the last stream we will process
    /// and refuse new streams. Existing streams keep draining.
    pub(crate) fn close(&self) -> Result<()> {
        let last = self.streams.lock().unwrap().highest_remote_id;
        {
            let mut state = self.state.lock().unwrap();
            if state.shutdown.is_some() {
                return Ok(());
            }
            state.shutdown = Some(ConnShutdown::Clean);
        }

        let frame = GoawayFrame::new(last, ErrorCode::NoError, Bytes::new());
        let encoded = FrameCodec::encode_goaway_frame(&frame);
        self.writer.lock().unwrap().write(&encoded)?;

        let queue = self.accept_queue.lock().unwrap();
        self.accept_cv.notify_all();
        drop(queue);
        debug!("sent GOAWAY (NO_ERROR, last stream {})", last);
        Ok(())
    }

    /// Advertise new settings to the peer.
    ///
    /// The parameters take local effect only once the peer's ACK comes
    /// back; the pending set is queued under the writer lock so ACKs match
    /// SETTINGS frames in emission order.
    pub(crate) fn update_settings(&self, settings: Settings) -> Result<()> {
        settings.validate()?;
        let frame = FrameCodec::encode_settings_frame(&SettingsFrame::new(settings.clone()));
        let mut writer = self.writer.lock().unwrap();
        self.state.lock().unwrap().pending_local.push_back(settings);
        writer.write(&frame)
    }

    pub(crate) fn lookup(&self, id: StreamId) -> Option<Arc<SharedStream>> {
        self.streams.lock().unwrap().map.get(&id).cloned()
    }

    pub(crate) fn local_settings(&self) -> Settings {
        self.state.lock().unwrap().local_applied.clone()
    }

    pub(crate) fn remote_settings(&self) -> Settings {
        self.state.lock().unwrap().remote.clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().unwrap().shutdown.is_some()
    }

    // ---- teardown ----

    /// Remove a terminal stream from the table, remembering its id for the
    /// late-frame grace window.
    fn reap(&self, id: StreamId) {
        let mut table = self.streams.lock().unwrap();
        let terminal = table
            .map
            .get(&id)
            .map(|s| s.inner.lock().unwrap().state.is_terminal())
            .unwrap_or(false);
        if terminal {
            table.map.remove(&id);
            table.remember_closed(id);
            trace!("reaped stream {}", id);
        }
    }

    /// Mark the connection dead and wake every parked reader and writer.
    fn finish(&self, cause: ConnShutdown) {
        {
            let mut state = self.state.lock().unwrap();
            if state.shutdown.is_none() || matches!(state.shutdown, Some(ConnShutdown::Clean)) {
                state.shutdown = Some(cause.clone());
            }
        }
        self.closed.store(true, Ordering::Release);

        let table = self.streams.lock().unwrap();
        for stream in table.map.values() {
            let mut core = stream.inner.lock().unwrap();
            if core.shutdown.is_none() {
                core.shutdown = Some(cause.clone());
            }
            stream.notify();
        }
        drop(table);

        let flow = self.flow.lock().unwrap();
        self.flow_cv.notify_all();
        drop(flow);

        let queue = self.accept_queue.lock().unwrap();
        self.accept_cv.notify_all();
        drop(queue);

        let pings = self.pings.lock().unwrap();
        self.ping_cv.notify_all();
        drop(pings);
    }

    /// Terminate on a connection-level protocol failure: GOAWAY out
    /// (best effort), then tear down.
    fn fail(&self, code: ErrorCode, reason: &str) {
        warn!("connection failed: {}: {}", code, reason);
        let last = self.streams.lock().unwrap().highest_remote_id;
        let frame = GoawayFrame::new(last, code, Bytes::copy_from_slice(reason.as_bytes()));
        let encoded = FrameCodec::encode_goaway_frame(&frame);
        if let Err(err) = self.writer.lock().unwrap().write(&encoded) {
            debug!("GOAWAY write failed during teardown: {}", err);
        }
        self.finish(ConnShutdown::Failed {
            code,
            reason: reason.to_string(),
        });
    }

    // ---- inbound settings ----

    /// Peer SETTINGS take effect immediately; the ACK is written by the
    /// dispatcher right after this returns.
    fn apply_remote_settings(&self, settings: &Settings) -> Dispatch {
        let (old_init, new_init) = {
            let mut state = self.state.lock().unwrap();
            let old = state.remote.get_initial_window_size();
            state.remote.merge(settings);
            (old, state.remote.get_initial_window_size())
        };

        if old_init != new_init {
            let table = self.streams.lock().unwrap();
            for stream in table.map.values() {
                let mut core = stream.inner.lock().unwrap();
                core.flow
                    .send
                    .update_initial_size(new_init)
                    .map_err(|e| {
                        Rejection::connection(ErrorCode::FlowControlError, e.to_string())
                    })?;
                // Waiters are woken by the dispatcher once the ACK is on
                // the wire, so resumed DATA can never overtake the ACK
            }
        }
        debug!("applied peer settings, initial window {}", new_init);
        Ok(())
    }

    /// A SETTINGS ACK applies the oldest parameters we sent but had not
    /// yet taken into effect locally.
    fn apply_local_settings_ack(&self) -> Dispatch {
        let (acked, old_init, new_init) = {
            let mut state = self.state.lock().unwrap();
            match state.pending_local.pop_front() {
                Some(settings) => {
                    let old = state.local_applied.get_initial_window_size();
                    state.local_applied.merge(&settings);
                    (true, old, state.local_applied.get_initial_window_size())
                }
                None => (false, 0, 0),
            }
        };
        if !acked {
            warn!("SETTINGS ACK with no outstanding SETTINGS");
            return Ok(());
        }

        if old_init != new_init {
            let table = self.streams.lock().unwrap();
            for stream in table.map.values() {
                let mut core = stream.inner.lock().unwrap();
                core.flow
                    .recv
                    .update_initial_size(new_init)
                    .map_err(|e| {
                        Rejection::connection(ErrorCode::FlowControlError, e.to_string())
                    })?;
            }
        }
        debug!("local settings acknowledged, initial window {}", new_init);
        Ok(())
    }

    // ---- inbound stream-level reactions ----

    /// Stream-level rejection of an inbound frame: RST out, local state to
    /// Reset, connection stays up.
    fn reset_stream_inbound(&self, id: StreamId, code: ErrorCode) -> Result<()> {
        if let Some(stream) = self.lookup(id) {
            let mut core = stream.inner.lock().unwrap();
            core.reset(code);
            stream.notify();
        }
        let frame = RstStreamFrame {
            stream_id: id,
            error_code: code,
        };
        let encoded = FrameCodec::encode_rst_stream_frame(&frame);
        self.writer.lock().unwrap().write(&encoded)?;
        self.reap(id);
        Ok(())
    }

    fn complete_ping(&self, data: [u8; 8]) {
        let mut pings = self.pings.lock().unwrap();
        pings.acked.insert(data);
        self.ping_cv.notify_all();
    }

    fn handle_goaway(&self, frame: &GoawayFrame) {
        debug!(
            "GOAWAY received: last stream {}, {}",
            frame.last_stream_id, frame.error_code
        );
        let cause = ConnShutdown::Goaway {
            last_stream_id: frame.last_stream_id,
            code: frame.error_code,
        };

        if frame.error_code != ErrorCode::NoError {
            self.finish(cause);
            return;
        }

        // Graceful: refuse new streams, fail local streams the peer will
        // never process, keep draining the rest.
        {
            let mut state = self.state.lock().unwrap();
            if state.shutdown.is_none() {
                state.shutdown = Some(cause.clone());
            }
        }
        let table = self.streams.lock().unwrap();
        for (id, stream) in table.map.iter() {
            if *id % 2 == self.role.local_parity() && *id > frame.last_stream_id {
                let mut core = stream.inner.lock().unwrap();
                if core.shutdown.is_none() {
                    core.shutdown = Some(cause.clone());
                }
                stream.notify();
            }
        }
        drop(table);

        let queue = self.accept_queue.lock().unwrap();
        self.accept_cv.notify_all();
        drop(queue);
    }
}

/// A header block in progress: HEADERS or PUSH_PROMISE arrived without
/// END_HEADERS and CONTINUATIONs are still due. While one is open, any
/// frame other than CONTINUATION on the same stream kills the connection.
struct PartialHeaderBlock {
    stream_id: StreamId,
    end_stream: bool,
    /// Set when the block was started by PUSH_PROMISE
    promised_id: Option<StreamId>,
    buf: BytesMut,
}

/// The connection front object.
///
/// `R` and `W` are the two halves of an ordered byte transport (for a
/// `TcpStream`, the stream and its `try_clone`). The reader half is owned
/// by a dedicated thread for the connection's lifetime.
pub struct Connection<W: Write + Send + 'static> {
    shared: Arc<Shared<W>>,
    reader: Option<thread::JoinHandle<()>>,
}

impl<W: Write + Send + 'static> Connection<W> {
    /// Connect as a client with default settings
    pub fn client<R: Read + Send + 'static>(reader: R, writer: W) -> Result<Self> {
        ConnectionBuilder::new().client(reader, writer)
    }

    /// Accept as a server with default settings
    pub fn server<R: Read + Send + 'static>(reader: R, writer: W) -> Result<Self> {
        ConnectionBuilder::new().server(reader, writer)
    }

    /// This endpoint's role
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Open a new locally-initiated stream by sending its header block.
    ///
    /// Pseudo-headers must precede regular headers in `fields`.
    pub fn open_stream(
        &self,
        fields: &[HeaderField],
        end_of_stream: bool,
    ) -> Result<StreamHandle<W>> {
        self.shared.open_stream(fields, end_of_stream)
    }

    /// Wait for the next peer-initiated stream (requests on a server,
    /// pushed streams on a client).
    pub fn accept(&self) -> Result<StreamHandle<W>> {
        self.shared.accept()
    }

    /// Look up a live stream by id; `None` once it has been reaped
    pub fn stream(&self, id: StreamId) -> Option<StreamHandle<W>> {
        self.shared
            .lookup(id)
            .map(|stream| self.shared.handle_for(stream))
    }

    /// Round-trip a PING through the peer
    pub fn ping(&self) -> Result<()> {
        self.shared.ping()
    }

    /// Advertise new settings to the peer; they take local effect once the
    /// peer acknowledges them.
    pub fn update_settings(&self, settings: Settings) -> Result<()> {
        self.shared.update_settings(settings)
    }

    /// Graceful shutdown: GOAWAY(NO_ERROR) out, new streams refused,
    /// existing streams drain.
    pub fn close(&self) -> Result<()> {
        self.shared.close()
    }

    /// Local settings currently in effect (acknowledged by the peer)
    pub fn local_settings(&self) -> Settings {
        self.shared.local_settings()
    }

    /// Peer settings as last received
    pub fn remote_settings(&self) -> Settings {
        self.shared.remote_settings()
    }

    /// Whether the connection has stopped accepting new streams
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

impl<W: Write + Send + 'static> Drop for Connection<W> {
    fn drop(&mut self) {
        // The reader thread exits on transport EOF or error; it is not
        // joined so dropping the front object never blocks on the peer.
        drop(self.reader.take());
    }
}

/// Builder for a [`Connection`], configuring the settings advertised in
/// the initial SETTINGS frame.
pub struct ConnectionBuilder {
    settings: Settings,
}

impl ConnectionBuilder {
    /// Create a builder with default settings
    pub fn new() -> Self {
        ConnectionBuilder {
            settings: Settings::new(),
        }
    }

    /// Advertise a complete settings set
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Set header table size
    pub fn header_table_size(mut self, size: u32) -> Self {
        self.settings.header_table_size = Some(size);
        self
    }

    /// Enable or disable server push
    pub fn enable_push(mut self, enable: bool) -> Self {
        self.settings.enable_push = Some(enable);
        self
    }

    /// Set max concurrent streams
    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.settings.max_concurrent_streams = Some(max);
        self
    }

    /// Set initial window size
    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.settings.initial_window_size = Some(size);
        self
    }

    /// Set max frame size
    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.settings.max_frame_size = Some(size);
        self
    }

    /// Build a client connection: send the preface and initial SETTINGS,
    /// then start the reader loop.
    pub fn client<R, W>(self, reader: R, writer: W) -> Result<Connection<W>>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        self.settings.validate()?;
        let shared = Shared::build(Role::Client, writer, self.settings.clone());

        {
            let mut w = shared.writer.lock().unwrap();
            w.transport.write_all(CONNECTION_PREFACE)?;
            let frame = FrameCodec::encode_settings_frame(&SettingsFrame::new(self.settings));
            w.write(&frame)?;
        }

        Ok(Connection::spawn(shared, reader))
    }

    /// Build a server connection: verify the client preface byte-exact,
    /// send initial SETTINGS, then start the reader loop.
    pub fn server<R, W>(self, mut reader: R, writer: W) -> Result<Connection<W>>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        self.settings.validate()?;

        let mut preface = [0u8; 24];
        reader.read_exact(&mut preface)?;
        if preface[..] != *CONNECTION_PREFACE {
            return Err(Error::MissingPreface);
        }

        let shared = Shared::build(Role::Server, writer, self.settings.clone());
        {
            let mut w = shared.writer.lock().unwrap();
            let frame = FrameCodec::encode_settings_frame(&SettingsFrame::new(self.settings));
            w.write(&frame)?;
        }

        Ok(Connection::spawn(shared, reader))
    }
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Write + Send + 'static> Shared<W> {
    fn build(role: Role, writer: W, advertised: Settings) -> Arc<Self> {
        let mut pending = VecDeque::new();
        pending.push_back(advertised);

        Arc::new(Shared {
            role,
            writer: Mutex::new(FrameWriter {
                transport: writer,
                encoder: HeaderEncoder::new(),
            }),
            streams: Mutex::new(StreamTable::new(role)),
            flow: Mutex::new(FlowControlPair::new()),
            flow_cv: Condvar::new(),
            state: Mutex::new(ConnState {
                local_applied: Settings::new(),
                pending_local: pending,
                remote: Settings::new(),
                shutdown: None,
            }),
            closed: AtomicBool::new(false),
            accept_queue: Mutex::new(VecDeque::new()),
            accept_cv: Condvar::new(),
            pings: Mutex::new(PingState {
                next: 0,
                acked: HashSet::new(),
            }),
            ping_cv: Condvar::new(),
        })
    }
}

impl<W: Write + Send + 'static> Connection<W> {
    fn spawn<R: Read + Send + 'static>(shared: Arc<Shared<W>>, reader: R) -> Self {
        let loop_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("h2mux-reader".to_string())
            .spawn(move || reader_loop(loop_shared, reader))
            .expect("failed to spawn reader thread");

        Connection {
            shared,
            reader: Some(handle),
        }
    }
}

// ---- reader loop ----

fn reader_loop<R: Read, W: Write + Send + 'static>(shared: Arc<Shared<W>>, mut reader: R) {
    let mut decoder = HeaderDecoder::new();
    let mut partial: Option<PartialHeaderBlock> = None;
    let mut awaiting_preface_settings = true;

    loop {
        let max = shared.local_max_frame_size();
        let (raw, payload) = match FrameCodec::read_frame(&mut reader, max) {
            Ok(frame) => frame,
            Err(Error::ConnectionClosed) => {
                debug!("transport closed by peer");
                shared.finish(ConnShutdown::Clean);
                return;
            }
            Err(Error::FrameSize(reason)) => {
                shared.fail(ErrorCode::FrameSizeError, &reason);
                return;
            }
            Err(err) => {
                shared.fail(ErrorCode::InternalError, &err.to_string());
                return;
            }
        };

        let header = match raw.typed() {
            Some(header) => header,
            None => {
                if awaiting_preface_settings {
                    shared.fail(ErrorCode::ProtocolError, "expected SETTINGS preface frame");
                    return;
                }
                if partial.is_some() {
                    shared.fail(
                        ErrorCode::ProtocolError,
                        "header block interrupted by unknown frame",
                    );
                    return;
                }
                trace!("ignoring unknown frame type 0x{:x}", raw.type_byte);
                continue;
            }
        };
        trace!("received {}", header);

        if awaiting_preface_settings {
            if header.frame_type != FrameType::Settings || header.flags.is_ack() {
                shared.fail(ErrorCode::ProtocolError, "expected SETTINGS preface frame");
                return;
            }
            awaiting_preface_settings = false;
        }

        if let Some(block) = &partial {
            if header.frame_type != FrameType::Continuation
                || header.stream_id != block.stream_id
            {
                shared.fail(
                    ErrorCode::ProtocolError,
                    "header block interrupted by another frame",
                );
                return;
            }
        }

        match dispatch_frame(&shared, &mut decoder, &mut partial, header, payload) {
            Ok(()) => {}
            Err(rejection) => match rejection.scope {
                Violation::Stream(code) => {
                    warn!(
                        "stream error on stream {}: {} ({})",
                        header.stream_id, code, rejection.reason
                    );
                    if shared.reset_stream_inbound(header.stream_id, code).is_err() {
                        shared.finish(ConnShutdown::Failed {
                            code: ErrorCode::InternalError,
                            reason: "transport write failed".to_string(),
                        });
                        return;
                    }
                }
                Violation::Connection(code) => {
                    shared.fail(code, &rejection.reason);
                    return;
                }
            },
        }
    }
}

fn dispatch_frame<W: Write + Send + 'static>(
    shared: &Arc<Shared<W>>,
    decoder: &mut HeaderDecoder,
    partial: &mut Option<PartialHeaderBlock>,
    header: FrameHeader,
    payload: Bytes,
) -> Dispatch {
    match header.frame_type {
        FrameType::Settings => dispatch_settings(shared, &header, &payload),
        FrameType::Ping => dispatch_ping(shared, &header, &payload),
        FrameType::Goaway => {
            if header.stream_id != 0 {
                return Err(Rejection::connection(
                    ErrorCode::ProtocolError,
                    "GOAWAY on a stream",
                ));
            }
            let frame =
                FrameCodec::decode_goaway_frame(&header, payload).map_err(Rejection::from_error)?;
            shared.handle_goaway(&frame);
            Ok(())
        }
        FrameType::WindowUpdate => dispatch_window_update(shared, &header, &payload),
        FrameType::Data => dispatch_data(shared, &header, payload),
        FrameType::Headers => {
            if header.stream_id == 0 {
                return Err(Rejection::connection(
                    ErrorCode::ProtocolError,
                    "HEADERS on stream 0",
                ));
            }
            let frame = FrameCodec::decode_headers_frame(&header, payload)
                .map_err(Rejection::from_error)?;
            if let Some(priority) = frame.priority {
                if priority.stream_dependency == header.stream_id {
                    return Err(Rejection::stream(
                        ErrorCode::ProtocolError,
                        "stream depends on itself",
                    ));
                }
            }
            if frame.end_headers {
                process_header_block(
                    shared,
                    decoder,
                    header.stream_id,
                    &frame.header_block,
                    frame.end_stream,
                    None,
                )
            } else {
                *partial = Some(PartialHeaderBlock {
                    stream_id: header.stream_id,
                    end_stream: frame.end_stream,
                    promised_id: None,
                    buf: BytesMut::from(&frame.header_block[..]),
                });
                Ok(())
            }
        }
        FrameType::Continuation => {
            let Some(mut block) = partial.take() else {
                return Err(Rejection::connection(
                    ErrorCode::ProtocolError,
                    "CONTINUATION without an open header block",
                ));
            };
            let frame = FrameCodec::decode_continuation_frame(&header, payload);
            block.buf.extend_from_slice(&frame.header_block);

            if !frame.end_headers {
                *partial = Some(block);
                return Ok(());
            }
            match block.promised_id {
                None => process_header_block(
                    shared,
                    decoder,
                    block.stream_id,
                    &block.buf,
                    block.end_stream,
                    None,
                ),
                Some(promised) => process_header_block(
                    shared,
                    decoder,
                    block.stream_id,
                    &block.buf,
                    false,
                    Some(promised),
                ),
            }
        }
        FrameType::PushPromise => dispatch_push_promise(shared, decoder, partial, &header, payload),
        FrameType::RstStream => dispatch_rst_stream(shared, &header, &payload),
        FrameType::Priority => dispatch_priority(shared, &header, &payload),
    }
}

fn dispatch_settings<W: Write + Send + 'static>(
    shared: &Arc<Shared<W>>,
    header: &FrameHeader,
    payload: &[u8],
) -> Dispatch {
    if header.stream_id != 0 {
        return Err(Rejection::connection(
            ErrorCode::ProtocolError,
            "SETTINGS on a stream",
        ));
    }
    let frame =
        FrameCodec::decode_settings_frame(header, payload).map_err(Rejection::from_error)?;

    if frame.ack {
        return shared.apply_local_settings_ack();
    }

    shared.apply_remote_settings(&frame.settings)?;

    // Peer settings are in effect; acknowledge before any further frame
    let ack = FrameCodec::encode_settings_frame(&SettingsFrame::ack());
    shared
        .writer
        .lock()
        .unwrap()
        .write(&ack)
        .map_err(Rejection::from_error)?;

    // Streams parked on a grown send window can move again
    let table = shared.streams.lock().unwrap();
    for stream in table.map.values() {
        stream.notify();
    }
    Ok(())
}

fn dispatch_ping<W: Write + Send + 'static>(
    shared: &Arc<Shared<W>>,
    header: &FrameHeader,
    payload: &[u8],
) -> Dispatch {
    if header.stream_id != 0 {
        return Err(Rejection::connection(
            ErrorCode::ProtocolError,
            "PING on a stream",
        ));
    }
    let frame = FrameCodec::decode_ping_frame(header, payload).map_err(Rejection::from_error)?;

    if frame.ack {
        shared.complete_ping(frame.data);
        return Ok(());
    }

    let pong = FrameCodec::encode_ping_frame(&PingFrame::ack(frame.data));
    shared
        .writer
        .lock()
        .unwrap()
        .write(&pong)
        .map_err(Rejection::from_error)
}

fn dispatch_window_update<W: Write + Send + 'static>(
    shared: &Arc<Shared<W>>,
    header: &FrameHeader,
    payload: &[u8],
) -> Dispatch {
    let frame =
        FrameCodec::decode_window_update_frame(header, payload).map_err(Rejection::from_error)?;

    if frame.size_increment == 0 {
        return Err(if frame.stream_id == 0 {
            Rejection::connection(ErrorCode::ProtocolError, "zero connection window increment")
        } else {
            Rejection::stream(ErrorCode::ProtocolError, "zero stream window increment")
        });
    }

    if frame.stream_id == 0 {
        let mut flow = shared.flow.lock().unwrap();
        flow.send.increase(frame.size_increment).map_err(|e| {
            Rejection::connection(ErrorCode::FlowControlError, e.to_string())
        })?;
        shared.flow_cv.notify_all();
        trace!(
            "connection send window now {}",
            flow.send.size()
        );
        return Ok(());
    }

    match shared.lookup(frame.stream_id) {
        Some(stream) => {
            let mut core = stream.inner.lock().unwrap();
            core.flow.send.increase(frame.size_increment).map_err(|e| {
                Rejection::stream(ErrorCode::FlowControlError, e.to_string())
            })?;
            stream.notify();
            Ok(())
        }
        // WINDOW_UPDATE is always tolerated on closed streams
        None => Ok(()),
    }
}

fn dispatch_data<W: Write + Send + 'static>(
    shared: &Arc<Shared<W>>,
    header: &FrameHeader,
    payload: Bytes,
) -> Dispatch {
    if header.stream_id == 0 {
        return Err(Rejection::connection(
            ErrorCode::ProtocolError,
            "DATA on stream 0",
        ));
    }

    // Flow control counts the whole payload, padding included
    let flow_len = header.length as usize;
    let frame = FrameCodec::decode_data_frame(header, payload).map_err(Rejection::from_error)?;

    // Connection-scope accounting plus auto-replenishment. A negative
    // window after a local initial-size decrease is not an overrun: data
    // in flight under the old credit is still legal.
    let conn_update = {
        let mut flow = shared.flow.lock().unwrap();
        if flow.recv.size() >= 0 && (flow_len as i64) > flow.recv.size() {
            return Err(Rejection::connection(
                ErrorCode::FlowControlError,
                "connection receive window overrun",
            ));
        }
        flow.consume_recv(flow_len);
        match flow.pending_recv_update() {
            Some(increment) => {
                flow.apply_recv_update(increment)
                    .map_err(Rejection::from_error)?;
                Some(increment)
            }
            None => None,
        }
    };
    if let Some(increment) = conn_update {
        let update = FrameCodec::encode_window_update_frame(&WindowUpdateFrame::new(0, increment));
        shared
            .writer
            .lock()
            .unwrap()
            .write(&update)
            .map_err(Rejection::from_error)?;
    }

    let stream = {
        let table = shared.streams.lock().unwrap();
        match table.map.get(&header.stream_id) {
            Some(stream) => Arc::clone(stream),
            None => {
                if table.in_grace(header.stream_id) {
                    // Late frame for a just-closed stream
                    return Ok(());
                }
                return if header.stream_id % 2 == shared.role.remote_parity()
                    && header.stream_id > table.highest_remote_id
                {
                    Err(Rejection::connection(
                        ErrorCode::ProtocolError,
                        "DATA on an idle stream",
                    ))
                } else {
                    Err(Rejection::stream(
                        ErrorCode::StreamClosed,
                        "DATA on a closed stream",
                    ))
                };
            }
        }
    };

    let stream_update = {
        let mut core = stream.inner.lock().unwrap();
        if core.flow.recv.size() >= 0 && (flow_len as i64) > core.flow.recv.size() {
            return Err(Rejection::stream(
                ErrorCode::FlowControlError,
                "stream receive window overrun",
            ));
        }
        core.recv_data(frame.end_stream)
            .map_err(|v| Rejection::from_violation(v, "DATA illegal in stream state"))?;
        core.flow.consume_recv(flow_len);
        let update = match core.flow.pending_recv_update() {
            Some(increment) if !core.recv_finished => {
                core.flow
                    .apply_recv_update(increment)
                    .map_err(Rejection::from_error)?;
                Some(increment)
            }
            _ => None,
        };
        core.events.push_back(StreamEvent::Data {
            chunk: frame.data,
            end_stream: frame.end_stream,
        });
        stream.notify();
        update
    };

    if let Some(increment) = stream_update {
        let update = FrameCodec::encode_window_update_frame(&WindowUpdateFrame::new(
            header.stream_id,
            increment,
        ));
        shared
            .writer
            .lock()
            .unwrap()
            .write(&update)
            .map_err(Rejection::from_error)?;
    }

    if stream.inner.lock().unwrap().state.is_terminal() {
        shared.reap(header.stream_id);
    }
    Ok(())
}

fn dispatch_rst_stream<W: Write + Send + 'static>(
    shared: &Arc<Shared<W>>,
    header: &FrameHeader,
    payload: &[u8],
) -> Dispatch {
    if header.stream_id == 0 {
        return Err(Rejection::connection(
            ErrorCode::ProtocolError,
            "RST_STREAM on stream 0",
        ));
    }
    let frame =
        FrameCodec::decode_rst_stream_frame(header, payload).map_err(Rejection::from_error)?;

    let stream = {
        let table = shared.streams.lock().unwrap();
        match table.map.get(&frame.stream_id) {
            Some(stream) => Arc::clone(stream),
            None => {
                if frame.stream_id % 2 == shared.role.remote_parity()
                    && frame.stream_id > table.highest_remote_id
                {
                    return Err(Rejection::connection(
                        ErrorCode::ProtocolError,
                        "RST_STREAM on an idle stream",
                    ));
                }
                // RST_STREAM is always tolerated on closed streams
                return Ok(());
            }
        }
    };

    {
        let mut core = stream.inner.lock().unwrap();
        core.reset(frame.error_code);
        stream.notify();
    }
    debug!(
        "stream {} reset by peer: {}",
        frame.stream_id, frame.error_code
    );
    shared.reap(frame.stream_id);
    Ok(())
}

fn dispatch_priority<W: Write + Send + 'static>(
    shared: &Arc<Shared<W>>,
    header: &FrameHeader,
    payload: &[u8],
) -> Dispatch {
    if header.stream_id == 0 {
        return Err(Rejection::connection(
            ErrorCode::ProtocolError,
            "PRIORITY on stream 0",
        ));
    }
    // A malformed PRIORITY only harms its own stream
    let frame = FrameCodec::decode_priority_frame(header, payload)
        .map_err(|e| Rejection::stream(ErrorCode::FrameSizeError, e.to_string()))?;

    if frame.priority.stream_dependency == header.stream_id {
        return Err(Rejection::stream(
            ErrorCode::ProtocolError,
            "stream depends on itself",
        ));
    }

    // PRIORITY is legal in any state, idle and closed included; without a
    // priority scheduler it is recorded and otherwise ignored.
    if let Some(stream) = shared.lookup(frame.stream_id) {
        stream.inner.lock().unwrap().priority = Some(frame.priority);
    }
    Ok(())
}

fn dispatch_push_promise<W: Write + Send + 'static>(
    shared: &Arc<Shared<W>>,
    decoder: &mut HeaderDecoder,
    partial: &mut Option<PartialHeaderBlock>,
    header: &FrameHeader,
    payload: Bytes,
) -> Dispatch {
    if shared.role != Role::Client {
        return Err(Rejection::connection(
            ErrorCode::ProtocolError,
            "PUSH_PROMISE sent to a server",
        ));
    }
    if header.stream_id == 0 {
        return Err(Rejection::connection(
            ErrorCode::ProtocolError,
            "PUSH_PROMISE on stream 0",
        ));
    }
    if !shared.state.lock().unwrap().local_applied.get_enable_push() {
        return Err(Rejection::connection(
            ErrorCode::ProtocolError,
            "PUSH_PROMISE with push disabled",
        ));
    }

    let frame =
        FrameCodec::decode_push_promise_frame(header, payload).map_err(Rejection::from_error)?;

    if frame.end_headers {
        process_header_block(
            shared,
            decoder,
            header.stream_id,
            &frame.header_block,
            false,
            Some(frame.promised_stream_id),
        )
    } else {
        *partial = Some(PartialHeaderBlock {
            stream_id: header.stream_id,
            end_stream: false,
            promised_id: Some(frame.promised_stream_id),
            buf: BytesMut::from(&frame.header_block[..]),
        });
        Ok(())
    }
}

/// A complete header block arrived: decode it and route it to an existing
/// stream, a fresh remote-initiated stream, or a reserved pushed stream.
fn process_header_block<W: Write + Send + 'static>(
    shared: &Arc<Shared<W>>,
    decoder: &mut HeaderDecoder,
    stream_id: StreamId,
    block: &[u8],
    end_stream: bool,
    promised_id: Option<StreamId>,
) -> Dispatch {
    // Decompression happens unconditionally: the dynamic table must see
    // every block even when the stream is being rejected.
    let fields = decoder.decode(block).map_err(Rejection::from_error)?;

    if let Some(promised) = promised_id {
        return process_push_block(shared, stream_id, promised, fields);
    }

    // Existing stream: response headers or trailers
    if let Some(stream) = shared.lookup(stream_id) {
        let trailers = {
            let mut core = stream.inner.lock().unwrap();
            let trailers = core
                .recv_headers(end_stream)
                .map_err(|v| Rejection::from_violation(v, "HEADERS illegal in stream state"))?;
            let event = if trailers {
                StreamEvent::Trailers { fields }
            } else {
                StreamEvent::Headers { fields, end_stream }
            };
            core.events.push_back(event);
            stream.notify();
            trailers
        };
        trace!(
            "delivered {} on stream {}",
            if trailers { "trailers" } else { "headers" },
            stream_id
        );
        if stream.inner.lock().unwrap().state.is_terminal() {
            shared.reap(stream_id);
        }
        return Ok(());
    }

    // Unknown stream id
    if stream_id % 2 != shared.role.remote_parity() {
        let table = shared.streams.lock().unwrap();
        if table.in_grace(stream_id) {
            return Ok(());
        }
        return if stream_id >= table.next_local_id {
            Err(Rejection::connection(
                ErrorCode::ProtocolError,
                "HEADERS on a stream we never opened",
            ))
        } else {
            Err(Rejection::stream(
                ErrorCode::StreamClosed,
                "HEADERS on a closed stream",
            ))
        };
    }

    // Remote-initiated: maybe a fresh stream
    let (send_init, recv_init, shutting_down, max_concurrent) = {
        let state = shared.state.lock().unwrap();
        (
            state.remote.get_initial_window_size(),
            state.local_applied.get_initial_window_size(),
            state.shutdown.is_some(),
            state.local_applied.get_max_concurrent_streams(),
        )
    };

    let stream = {
        let mut table = shared.streams.lock().unwrap();
        if stream_id <= table.highest_remote_id {
            if table.in_grace(stream_id) {
                return Ok(());
            }
            return Err(Rejection::stream(
                ErrorCode::StreamClosed,
                "HEADERS on a closed stream",
            ));
        }
        // Fresh id: it is "seen" even if creation is refused
        table.highest_remote_id = stream_id;

        if shutting_down {
            // Streams past our GOAWAY are ignored, not errors
            return Ok(());
        }
        if let Some(max) = max_concurrent {
            if table.active_count(shared.role.remote_parity()) >= max as usize {
                return Err(Rejection::stream(
                    ErrorCode::RefusedStream,
                    "concurrent stream limit exceeded",
                ));
            }
        }

        let mut core = StreamCore::new(stream_id, StreamState::Idle, send_init, recv_init);
        core.recv_headers(end_stream)
            .map_err(|v| Rejection::from_violation(v, "HEADERS illegal in stream state"))?;
        core.events.push_back(StreamEvent::Headers { fields, end_stream });
        let stream = Arc::new(SharedStream::new(core));
        table.map.insert(stream_id, Arc::clone(&stream));
        stream
    };

    debug!("peer opened stream {}", stream_id);
    let mut queue = shared.accept_queue.lock().unwrap();
    queue.push_back(stream);
    shared.accept_cv.notify_all();
    Ok(())
}

/// A complete PUSH_PROMISE block: reserve the promised stream and deliver
/// the pushed request fields on it.
fn process_push_block<W: Write + Send + 'static>(
    shared: &Arc<Shared<W>>,
    parent_id: StreamId,
    promised_id: StreamId,
    fields: Vec<HeaderField>,
) -> Dispatch {
    if promised_id % 2 != shared.role.remote_parity() {
        return Err(Rejection::connection(
            ErrorCode::ProtocolError,
            "promised stream id has the wrong parity",
        ));
    }

    let parent = shared.lookup(parent_id).ok_or_else(|| {
        Rejection::connection(ErrorCode::ProtocolError, "PUSH_PROMISE on an unknown stream")
    })?;
    if !parent.inner.lock().unwrap().state.can_receive() {
        return Err(Rejection::connection(
            ErrorCode::ProtocolError,
            "PUSH_PROMISE on a stream that cannot receive",
        ));
    }

    let (send_init, recv_init) = {
        let state = shared.state.lock().unwrap();
        (
            state.remote.get_initial_window_size(),
            state.local_applied.get_initial_window_size(),
        )
    };

    let stream = {
        let mut table = shared.streams.lock().unwrap();
        if promised_id <= table.highest_remote_id {
            return Err(Rejection::connection(
                ErrorCode::ProtocolError,
                "promised stream id is not above the highest seen",
            ));
        }
        table.highest_remote_id = promised_id;

        let mut core =
            StreamCore::new(promised_id, StreamState::ReservedRemote, send_init, recv_init);
        core.events.push_back(StreamEvent::Headers {
            fields,
            end_stream: false,
        });
        let stream = Arc::new(SharedStream::new(core));
        table.map.insert(promised_id, Arc::clone(&stream));
        stream
    };

    debug!(
        "peer reserved stream {} (promised on {})",
        promised_id, parent_id
    );
    let mut queue = shared.accept_queue.lock().unwrap();
    queue.push_back(stream);
    shared.accept_cv.notify_all();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parity() {
        assert_eq!(Role::Client.local_parity(), 1);
        assert_eq!(Role::Client.remote_parity(), 0);
        assert_eq!(Role::Server.local_parity(), 0);
        assert_eq!(Role::Server.remote_parity(), 1);
        assert_eq!(Role::Client.first_local_id(), 1);
        assert_eq!(Role::Server.first_local_id(), 2);
    }

    #[test]
    fn test_shutdown_to_error() {
        assert!(matches!(
            ConnShutdown::Clean.to_error(),
            Error::ConnectionClosed
        ));
        assert!(matches!(
            ConnShutdown::Goaway {
                last_stream_id: 5,
                code: ErrorCode::NoError
            }
            .to_error(),
            Error::GoawayReceived {
                last_stream_id: 5,
                code: ErrorCode::NoError
            }
        ));
        assert!(matches!(
            ConnShutdown::Failed {
                code: ErrorCode::ProtocolError,
                reason: "x".to_string()
            }
            .to_error(),
            Error::Connection {
                code: ErrorCode::ProtocolError,
                ..
            }
        ));
    }

    #[test]
    fn test_stream_table_grace_ring() {
        let mut table = StreamTable::new(Role::Server);
        for id in (1..=(2 * CLOSED_GRACE_CAPACITY as u32 + 1)).step_by(2) {
            table.remember_closed(id);
        }
        // The oldest ids fell out of the ring
        assert!(!table.in_grace(1));
        assert!(table.in_grace(2 * CLOSED_GRACE_CAPACITY as u32 + 1));
        assert_eq!(table.recently_closed.len(), CLOSED_GRACE_CAPACITY);
    }

    #[test]
    fn test_rejection_from_error_mapping() {
        let r = Rejection::from_error(Error::FrameSize("x".to_string()));
        assert_eq!(r.scope, Violation::Connection(ErrorCode::FrameSizeError));

        let r = Rejection::from_error(Error::Compression("x".to_string()));
        assert_eq!(r.scope, Violation::Connection(ErrorCode::CompressionError));

        let r = Rejection::from_error(Error::Protocol("x".to_string()));
        assert_eq!(r.scope, Violation::Connection(ErrorCode::ProtocolError));
    }

    #[test]
    fn test_stream_table_allocates_by_parity() {
        let table = StreamTable::new(Role::Client);
        assert_eq!(table.next_local_id, 1);
        let table = StreamTable::new(Role::Server);
        assert_eq!(table.next_local_id, 2);
    }
}
