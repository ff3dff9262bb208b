//! The framing endpoint: one HTTP/2 connection.
//!
//! An `Endpoint` is a duplex channel over a transport. A dedicated
//! driver thread owns the socket and interleaves two duties: draining
//! the outbound operation queue (HPACK-encoding header blocks in queue
//! order, honoring flow-control windows) and polling the socket for
//! inbound frames, which it decodes and dispatches to per-stream event
//! channels. The message layer consumes those events through `Stream`
//! handles; it never touches the socket.
//!
//! Stream-scoped failures reset one stream and leave the connection
//! alive; endpoint-scoped failures (socket error, GOAWAY, malformed
//! compression state) tear down every stream the endpoint owns.

use crate::error::{Error, ErrorCode, Result};
use crate::frame::{
    self, FrameFlags, FrameType, CONNECTION_PREFACE, CONNECTION_STREAM_ID, FRAME_HEADER_SIZE,
};
use crate::headers::{HeaderBlock, Headers};
use crate::session::{PollEvents, Transport};
use crate::settings::Settings;
use bytes::{Bytes, BytesMut};
use log::{debug, trace, warn};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Stream identifier (31 bits on the wire)
pub type StreamId = u32;

/// How often the driver wakes to check its outbound queue
const DRIVER_TICK: Duration = Duration::from_millis(5);

/// Deadline for completing a partially read frame or the preface
const READ_DEADLINE: Duration = Duration::from_secs(10);

/// Which side of the connection this endpoint is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiates streams with odd identifiers
    Client,
    /// Accepts streams; initiates only promised (even) streams
    Server,
}

/// Events delivered to a stream's consumer, in wire order
#[derive(Debug)]
pub enum StreamEvent {
    /// A header block arrived (initial headers, or trailers later)
    Headers {
        /// The decoded block
        block: HeaderBlock,
        /// Whether the block also ended the stream
        end_stream: bool,
    },
    /// A chunk of body data arrived
    Data {
        /// The bytes
        chunk: Bytes,
        /// Whether this chunk ended the stream
        end_stream: bool,
    },
    /// The peer promised a pushed stream associated with this one
    Promise {
        /// Handle for the stream the pushed response will arrive on
        stream: Stream,
        /// Request header block of the promised resource
        block: HeaderBlock,
    },
    /// The peer (or this side) reset the stream
    Reset(ErrorCode),
    /// The endpoint went away
    Closed,
}

enum Op {
    Headers {
        id: StreamId,
        block: HeaderBlock,
        end_stream: bool,
    },
    Data {
        id: StreamId,
        chunk: Bytes,
        end_stream: bool,
    },
    Trailers {
        id: StreamId,
        headers: Headers,
    },
    Rst {
        id: StreamId,
        code: ErrorCode,
    },
    Priority {
        id: StreamId,
        weight: u32,
    },
    Promise {
        id: StreamId,
        promised: StreamId,
        block: HeaderBlock,
    },
    AltSvc {
        id: StreamId,
        origin: String,
        field: String,
    },
    Close,
}

struct Shared {
    role: Role,
    ops: Sender<Op>,
    streams: Mutex<HashMap<StreamId, Sender<StreamEvent>>>,
    next_stream_id: AtomicU32,
    incoming: Mutex<Option<Receiver<Stream>>>,
    closed: AtomicBool,
}

impl Shared {
    fn alloc_stream_id(&self) -> StreamId {
        self.next_stream_id.fetch_add(2, Ordering::SeqCst)
    }

    fn register(self: &Arc<Self>, id: StreamId) -> Stream {
        let (tx, rx) = channel();
        self.streams.lock().unwrap().insert(id, tx);
        Stream {
            id,
            shared: Arc::clone(self),
            events: Arc::new(Mutex::new(rx)),
        }
    }

    fn send_op(&self, op: Op) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        self.ops.send(op).map_err(|_| Error::ConnectionClosed)
    }
}

/// One HTTP/2 connection, shared by every stream it carries.
#[derive(Clone)]
pub struct Endpoint {
    shared: Arc<Shared>,
}

impl Endpoint {
    /// Open a client-side endpoint over a connected transport.
    ///
    /// The driver thread sends the connection preface and initial
    /// SETTINGS before serving streams.
    pub fn client(settings: Settings, transport: Transport) -> Endpoint {
        Endpoint::start(Role::Client, settings, transport)
    }

    /// Open a server-side endpoint over an accepted transport.
    ///
    /// New inbound streams are surfaced through [`Endpoint::incoming`].
    pub fn server(settings: Settings, transport: Transport) -> Endpoint {
        Endpoint::start(Role::Server, settings, transport)
    }

    fn start(role: Role, settings: Settings, transport: Transport) -> Endpoint {
        let (ops_tx, ops_rx) = channel();
        let (incoming_tx, incoming_rx) = channel();

        let shared = Arc::new(Shared {
            role,
            ops: ops_tx,
            streams: Mutex::new(HashMap::new()),
            next_stream_id: AtomicU32::new(match role {
                Role::Client => 1,
                Role::Server => 2,
            }),
            incoming: Mutex::new(Some(incoming_rx)),
            closed: AtomicBool::new(false),
        });

        let driver_shared = Arc::clone(&shared);
        thread::spawn(move || {
            let mut driver = Driver::new(driver_shared, settings, transport, ops_rx, incoming_tx);
            if let Err(e) = driver.run() {
                debug!("endpoint driver stopped: {}", e);
            }
            driver.teardown();
        });

        Endpoint { shared }
    }

    /// Open a new outbound stream (client side).
    pub fn create_stream(&self) -> Result<Stream> {
        if self.shared.role != Role::Client {
            return Err(Error::Usage(
                "only client endpoints create streams directly".to_string(),
            ));
        }
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let id = self.shared.alloc_stream_id();
        Ok(self.shared.register(id))
    }

    /// Take the inbound stream feed (server side). May be taken once.
    pub fn incoming(&self) -> Result<Incoming> {
        self.shared
            .incoming
            .lock()
            .unwrap()
            .take()
            .map(|rx| Incoming { rx })
            .ok_or_else(|| Error::Usage("incoming streams already claimed".to_string()))
    }

    /// Ask the driver to send GOAWAY and shut the connection down.
    pub fn close(&self) {
        let _ = self.shared.ops.send(Op::Close);
    }

    /// Whether the connection is gone
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

/// Iterator over new inbound streams on a server endpoint
pub struct Incoming {
    rx: Receiver<Stream>,
}

impl Iterator for Incoming {
    type Item = Stream;

    fn next(&mut self) -> Option<Stream> {
        self.rx.recv().ok()
    }
}

/// Handle for one stream within an endpoint.
///
/// Cloning is cheap; all clones address the same stream. Events are
/// consumed by whichever clone reads them.
#[derive(Clone)]
pub struct Stream {
    id: StreamId,
    shared: Arc<Shared>,
    events: Arc<Mutex<Receiver<StreamEvent>>>,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream").field("id", &self.id).finish()
    }
}

impl Stream {
    /// Numeric stream id
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Block until the next event for this stream
    pub fn recv_event(&self) -> Result<StreamEvent> {
        self.events
            .lock()
            .unwrap()
            .recv()
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Like [`Stream::recv_event`] with an upper bound on the wait
    pub fn recv_event_timeout(&self, timeout: Duration) -> Result<StreamEvent> {
        match self.events.lock().unwrap().recv_timeout(timeout) {
            Ok(event) => Ok(event),
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(Error::ConnectionClosed),
        }
    }

    /// Send a header block, optionally ending the stream
    pub fn send_headers(&self, block: HeaderBlock, end_stream: bool) -> Result<()> {
        self.shared.send_op(Op::Headers {
            id: self.id,
            block,
            end_stream,
        })
    }

    /// Send body bytes, optionally ending the stream
    pub fn send_data(&self, chunk: Bytes, end_stream: bool) -> Result<()> {
        self.shared.send_op(Op::Data {
            id: self.id,
            chunk,
            end_stream,
        })
    }

    /// End the stream with an empty DATA frame
    pub fn end(&self) -> Result<()> {
        self.send_data(Bytes::new(), true)
    }

    /// Send a trailer block; this is always the final frame
    pub fn send_trailers(&self, headers: Headers) -> Result<()> {
        self.shared.send_op(Op::Trailers {
            id: self.id,
            headers,
        })
    }

    /// Advise the peer of this stream's priority weight
    pub fn priority(&self, weight: u32) -> Result<()> {
        self.shared.send_op(Op::Priority {
            id: self.id,
            weight: weight & 0x7fff_ffff,
        })
    }

    /// Promise a pushed stream carrying the given request block
    /// (server side). Returns the handle the pushed response is sent
    /// on.
    pub fn promise(&self, block: HeaderBlock) -> Result<Stream> {
        if self.shared.role != Role::Server {
            return Err(Error::Usage(
                "only server endpoints promise streams".to_string(),
            ));
        }
        let promised = self.shared.alloc_stream_id();
        let stream = self.shared.register(promised);
        self.shared.send_op(Op::Promise {
            id: self.id,
            promised,
            block,
        })?;
        Ok(stream)
    }

    /// Emit an ALTSVC frame advertising an alternative service
    pub fn altsvc(
        &self,
        host: &str,
        port: u16,
        protocol: &str,
        max_age: u32,
        origin: &str,
    ) -> Result<()> {
        let field = format!("{}=\"{}:{}\"; ma={}", protocol, host, port, max_age);
        self.shared.send_op(Op::AltSvc {
            id: self.id,
            origin: origin.to_string(),
            field,
        })
    }

    /// Abort the stream with the given error code
    pub fn reset(&self, code: ErrorCode) -> Result<()> {
        self.shared.send_op(Op::Rst { id: self.id, code })
    }
}

struct FlowState {
    send_window: i64,
    pending: VecDeque<PendingItem>,
}

enum PendingItem {
    Data(Bytes, bool),
    Trailers(Headers),
}

struct ContState {
    stream_id: StreamId,
    promised: Option<StreamId>,
    fragment: BytesMut,
    end_stream: bool,
}

struct Driver {
    shared: Arc<Shared>,
    local: Settings,
    remote: Settings,
    transport: Transport,
    ops: Receiver<Op>,
    incoming: Sender<Stream>,
    encoder: hpack::Encoder<'static>,
    decoder: hpack::Decoder<'static>,
    conn_send_window: i64,
    flow: HashMap<StreamId, FlowState>,
    cont: Option<ContState>,
    highest_inbound: StreamId,
    retired: HashSet<StreamId>,
}

impl Driver {
    fn new(
        shared: Arc<Shared>,
        local: Settings,
        transport: Transport,
        ops: Receiver<Op>,
        incoming: Sender<Stream>,
    ) -> Driver {
        Driver {
            shared,
            local,
            remote: Settings::new(),
            transport,
            ops,
            incoming,
            encoder: hpack::Encoder::new(),
            decoder: hpack::Decoder::new(),
            conn_send_window: 65_535,
            flow: HashMap::new(),
            cont: None,
            highest_inbound: 0,
            retired: HashSet::new(),
        }
    }

    fn run(&mut self) -> Result<()> {
        self.handshake()?;
        loop {
            loop {
                match self.ops.try_recv() {
                    Ok(Op::Close) => {
                        self.write_all(&frame::goaway_frame(
                            self.highest_inbound,
                            ErrorCode::NoError,
                        ))?;
                        return Ok(());
                    }
                    Ok(op) => self.handle_op(op)?,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return Ok(()),
                }
            }

            // Only the driver keeps the connection alive once every
            // endpoint and stream handle is gone.
            if Arc::strong_count(&self.shared) == 1 {
                let _ = self.write_all(&frame::goaway_frame(
                    self.highest_inbound,
                    ErrorCode::NoError,
                ));
                return Ok(());
            }

            if self.transport.poll(PollEvents::Read, Some(DRIVER_TICK))? {
                self.read_one_frame()?;
            }
        }
    }

    fn handshake(&mut self) -> Result<()> {
        match self.shared.role {
            Role::Client => {
                self.write_all(CONNECTION_PREFACE)?;
            }
            Role::Server => {
                let mut preface = [0u8; 24];
                self.read_exact(&mut preface)?;
                if preface != CONNECTION_PREFACE {
                    return Err(Error::Protocol("bad connection preface".to_string()));
                }
            }
        }
        let payload = self.local.encode_payload();
        self.write_all(&frame::settings_frame(&payload))?;
        Ok(())
    }

    fn handle_op(&mut self, op: Op) -> Result<()> {
        match op {
            Op::Headers {
                id,
                block,
                end_stream,
            } => {
                let fragment = self.encode_block(&block);
                self.write_header_frames(id, &fragment, end_stream)?;
            }
            Op::Data {
                id,
                chunk,
                end_stream,
            } => {
                self.flow_entry(id)
                    .pending
                    .push_back(PendingItem::Data(chunk, end_stream));
                self.flush_stream(id)?;
            }
            Op::Trailers { id, headers } => {
                self.flow_entry(id)
                    .pending
                    .push_back(PendingItem::Trailers(headers));
                self.flush_stream(id)?;
            }
            Op::Rst { id, code } => {
                self.write_all(&frame::rst_frame(id, code))?;
                self.drop_stream(id, Some(code));
            }
            Op::Priority { id, weight } => {
                let weight = weight.min(255) as u8;
                self.write_all(&frame::priority_frame(id, 0, false, weight))?;
            }
            Op::Promise {
                id,
                promised,
                block,
            } => {
                let fragment = self.encode_block(&block);
                self.write_all(&frame::push_promise_frame(id, promised, &fragment, true))?;
            }
            Op::AltSvc { id, origin, field } => {
                self.write_all(&frame::altsvc_frame(id, &origin, &field))?;
            }
            Op::Close => unreachable!("handled by the run loop"),
        }
        Ok(())
    }

    fn encode_block(&mut self, block: &HeaderBlock) -> Vec<u8> {
        let wire = block.to_wire();
        let tuples: Vec<(&[u8], &[u8])> = wire
            .iter()
            .map(|(name, value)| (name.as_bytes(), value.as_bytes()))
            .collect();
        let mut fragment = Vec::new();
        self.encoder
            .encode_into(tuples, &mut fragment)
            .expect("HPACK encoding into a Vec cannot fail");
        fragment
    }

    /// Write a header block as HEADERS plus CONTINUATION frames when it
    /// exceeds the peer's frame size.
    fn write_header_frames(&mut self, id: StreamId, fragment: &[u8], end_stream: bool) -> Result<()> {
        let max = self.remote.max_frame_size() as usize;
        if fragment.len() <= max {
            return self.write_all(&frame::headers_frame(id, fragment, end_stream, true));
        }
        self.write_all(&frame::headers_frame(id, &fragment[..max], end_stream, false))?;
        let mut rest = &fragment[max..];
        while rest.len() > max {
            self.write_all(&frame::continuation_frame(id, &rest[..max], false))?;
            rest = &rest[max..];
        }
        self.write_all(&frame::continuation_frame(id, rest, true))
    }

    fn flow_entry(&mut self, id: StreamId) -> &mut FlowState {
        let initial = self.remote.initial_window_size() as i64;
        self.flow.entry(id).or_insert(FlowState {
            send_window: initial,
            pending: VecDeque::new(),
        })
    }

    /// Send as much queued data for the stream as flow control allows.
    fn flush_stream(&mut self, id: StreamId) -> Result<()> {
        let max_frame = self.remote.max_frame_size() as usize;
        loop {
            let conn_window = self.conn_send_window;
            let entry = match self.flow.get_mut(&id) {
                Some(entry) => entry,
                None => return Ok(()),
            };
            let item = match entry.pending.pop_front() {
                Some(item) => item,
                None => return Ok(()),
            };

            match item {
                PendingItem::Trailers(headers) => {
                    let mut block = HeaderBlock::new();
                    for (name, value) in headers.iter() {
                        block.push_regular(name, value);
                    }
                    let fragment = self.encode_block(&block);
                    self.write_header_frames(id, &fragment, true)?;
                }
                PendingItem::Data(chunk, end_stream) => {
                    if chunk.is_empty() {
                        self.write_all(&frame::data_frame(id, &[], end_stream))?;
                        continue;
                    }
                    let window = conn_window.min(entry.send_window);
                    if window <= 0 {
                        entry.pending.push_front(PendingItem::Data(chunk, end_stream));
                        trace!("stream {} waiting for window update", id);
                        return Ok(());
                    }
                    let take = chunk.len().min(window as usize).min(max_frame);
                    let part = chunk.slice(..take);
                    let rest = chunk.slice(take..);
                    let last = rest.is_empty();
                    if !last {
                        // Put the remainder back before writing so a
                        // window stall resumes cleanly.
                        entry
                            .pending
                            .push_front(PendingItem::Data(rest, end_stream));
                    }
                    entry.send_window -= take as i64;
                    self.conn_send_window -= take as i64;
                    self.write_all(&frame::data_frame(id, &part, end_stream && last))?;
                }
            }
        }
    }

    fn read_one_frame(&mut self) -> Result<()> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        self.read_exact(&mut header)?;
        let (kind, flags, stream_id, length) = frame::decode_header(&header);

        let mut payload = vec![0u8; length];
        self.read_exact(&mut payload)?;
        let payload = Bytes::from(payload);

        match FrameType::from_u8(kind) {
            Some(kind) => self.dispatch(kind, flags, stream_id, payload),
            None => {
                trace!("ignoring unknown frame type 0x{:x}", kind);
                Ok(())
            }
        }
    }

    fn dispatch(
        &mut self,
        kind: FrameType,
        flags: FrameFlags,
        stream_id: StreamId,
        payload: Bytes,
    ) -> Result<()> {
        if let Some(cont) = &self.cont {
            if kind != FrameType::Continuation || stream_id != cont.stream_id {
                return Err(Error::Protocol(
                    "expected CONTINUATION for the open header block".to_string(),
                ));
            }
        }

        trace!("recv {} on stream {}", kind, stream_id);
        match kind {
            FrameType::Data => {
                let chunk = frame::data_payload(payload, flags)?;
                if !chunk.is_empty() {
                    // Replenish both windows right away; backpressure is
                    // the consumer's concern at a higher layer.
                    let n = chunk.len() as u32;
                    self.write_all(&frame::window_update_frame(CONNECTION_STREAM_ID, n))?;
                    self.write_all(&frame::window_update_frame(stream_id, n))?;
                }
                self.deliver(
                    stream_id,
                    StreamEvent::Data {
                        chunk,
                        end_stream: flags.is_end_stream(),
                    },
                );
            }
            FrameType::Headers => {
                let fragment = frame::headers_fragment(payload, flags)?;
                if flags.is_end_headers() {
                    self.complete_headers(stream_id, &fragment, flags.is_end_stream())?;
                } else {
                    self.cont = Some(ContState {
                        stream_id,
                        promised: None,
                        fragment: BytesMut::from(&fragment[..]),
                        end_stream: flags.is_end_stream(),
                    });
                }
            }
            FrameType::Continuation => {
                let mut cont = self
                    .cont
                    .take()
                    .ok_or_else(|| Error::Protocol("stray CONTINUATION".to_string()))?;
                cont.fragment.extend_from_slice(&payload);
                if flags.is_end_headers() {
                    let fragment = cont.fragment.freeze();
                    match cont.promised {
                        Some(promised) => {
                            self.complete_push(cont.stream_id, promised, &fragment)?
                        }
                        None => {
                            self.complete_headers(cont.stream_id, &fragment, cont.end_stream)?
                        }
                    }
                } else {
                    self.cont = Some(cont);
                }
            }
            FrameType::PushPromise => {
                if self.shared.role != Role::Client {
                    return Err(Error::Protocol(
                        "server received PUSH_PROMISE".to_string(),
                    ));
                }
                let (promised, fragment) = frame::push_promise_parts(payload, flags)?;
                if flags.is_end_headers() {
                    self.complete_push(stream_id, promised, &fragment)?;
                } else {
                    self.cont = Some(ContState {
                        stream_id,
                        promised: Some(promised),
                        fragment: BytesMut::from(&fragment[..]),
                        end_stream: false,
                    });
                }
            }
            FrameType::RstStream => {
                let code = frame::rst_code(&payload)?;
                debug!("stream {} reset by peer: {}", stream_id, code);
                self.deliver(stream_id, StreamEvent::Reset(code));
                self.drop_stream(stream_id, None);
            }
            FrameType::Settings => {
                if !flags.is_ack() {
                    let settings = Settings::decode_payload(&payload)?;
                    if let Some(size) = settings.initial_window_size {
                        let delta =
                            size as i64 - self.remote.initial_window_size() as i64;
                        for state in self.flow.values_mut() {
                            state.send_window += delta;
                        }
                    }
                    self.remote.merge(&settings);
                    self.write_all(&frame::settings_ack())?;
                    let ids: Vec<StreamId> = self.flow.keys().copied().collect();
                    for id in ids {
                        self.flush_stream(id)?;
                    }
                }
            }
            FrameType::Ping => {
                if !flags.is_ack() {
                    if payload.len() != 8 {
                        return Err(Error::Protocol("bad PING length".to_string()));
                    }
                    let mut data = [0u8; 8];
                    data.copy_from_slice(&payload);
                    self.write_all(&frame::ping_ack(&data))?;
                }
            }
            FrameType::Goaway => {
                let (last, code) = frame::goaway_parts(&payload)?;
                debug!("peer sent GOAWAY: last stream {}, {}", last, code);
                return Err(Error::ConnectionClosed);
            }
            FrameType::WindowUpdate => {
                let increment = frame::window_increment(&payload)? as i64;
                if stream_id == CONNECTION_STREAM_ID {
                    self.conn_send_window += increment;
                    let ids: Vec<StreamId> = self.flow.keys().copied().collect();
                    for id in ids {
                        self.flush_stream(id)?;
                    }
                } else {
                    if let Some(state) = self.flow.get_mut(&stream_id) {
                        state.send_window += increment;
                    }
                    self.flush_stream(stream_id)?;
                }
            }
            FrameType::Priority => {
                // Advisory; this endpoint does not schedule by priority.
            }
            FrameType::AltSvc => {
                trace!("ignoring inbound ALTSVC on stream {}", stream_id);
            }
        }
        Ok(())
    }

    fn complete_headers(
        &mut self,
        stream_id: StreamId,
        fragment: &[u8],
        end_stream: bool,
    ) -> Result<()> {
        let decoded = self
            .decoder
            .decode(fragment)
            .map_err(|e| Error::Protocol(format!("HPACK decode error: {:?}", e)))?;
        let block = match HeaderBlock::from_wire(decoded) {
            Ok(block) => block,
            Err(code) => {
                warn!("malformed header block on stream {}", stream_id);
                self.write_all(&frame::rst_frame(stream_id, code))?;
                self.drop_stream(stream_id, Some(code));
                return Ok(());
            }
        };

        let known = self.shared.streams.lock().unwrap().contains_key(&stream_id);
        if known {
            self.deliver(stream_id, StreamEvent::Headers { block, end_stream });
            return Ok(());
        }

        if self.shared.role == Role::Server
            && stream_id % 2 == 1
            && !self.retired.contains(&stream_id)
        {
            self.highest_inbound = self.highest_inbound.max(stream_id);
            let stream = self.shared.register(stream_id);
            self.deliver(stream_id, StreamEvent::Headers { block, end_stream });
            if self.incoming.send(stream).is_err() {
                // Nobody is accepting streams anymore.
                self.write_all(&frame::rst_frame(stream_id, ErrorCode::RefusedStream))?;
                self.drop_stream(stream_id, None);
            }
        } else {
            trace!("headers for unknown stream {} dropped", stream_id);
        }
        Ok(())
    }

    fn complete_push(
        &mut self,
        stream_id: StreamId,
        promised: StreamId,
        fragment: &[u8],
    ) -> Result<()> {
        let decoded = self
            .decoder
            .decode(fragment)
            .map_err(|e| Error::Protocol(format!("HPACK decode error: {:?}", e)))?;
        let block = match HeaderBlock::from_wire(decoded) {
            Ok(block) => block,
            Err(code) => {
                self.write_all(&frame::rst_frame(promised, code))?;
                return Ok(());
            }
        };

        let parent_known = self.shared.streams.lock().unwrap().contains_key(&stream_id);
        if !parent_known {
            // The request this push belongs to is gone.
            self.write_all(&frame::rst_frame(promised, ErrorCode::Cancel))?;
            return Ok(());
        }

        let stream = self.shared.register(promised);
        self.deliver(stream_id, StreamEvent::Promise { stream, block });
        Ok(())
    }

    /// Hand an event to a stream's consumer. A consumer that dropped
    /// its receiver no longer wants the stream, so it is cancelled.
    fn deliver(&mut self, id: StreamId, event: StreamEvent) {
        let sender = self.shared.streams.lock().unwrap().get(&id).cloned();
        if let Some(sender) = sender {
            if sender.send(event).is_err() {
                debug!("stream {} abandoned by consumer, cancelling", id);
                let _ = self.write_all(&frame::rst_frame(id, ErrorCode::Cancel));
                self.drop_stream(id, None);
            }
        }
    }

    fn drop_stream(&mut self, id: StreamId, code: Option<ErrorCode>) {
        if let Some(code) = code {
            self.deliver(id, StreamEvent::Reset(code));
        }
        self.shared.streams.lock().unwrap().remove(&id);
        self.flow.remove(&id);
        self.retired.insert(id);
    }

    fn write_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            if !self
                .transport
                .poll(PollEvents::Write, Some(READ_DEADLINE))?
            {
                return Err(Error::Timeout);
            }
            let n = self.transport.write(buf)?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            buf = &buf[n..];
        }
        self.transport.flush()
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            if !self.transport.poll(PollEvents::Read, Some(READ_DEADLINE))? {
                return Err(Error::Timeout);
            }
            let n = self.transport.read(&mut buf[filled..])?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            filled += n;
        }
        Ok(())
    }

    /// Mark the endpoint dead and notify every stream.
    fn teardown(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        let senders: Vec<Sender<StreamEvent>> = {
            let mut streams = self.shared.streams.lock().unwrap();
            streams.drain().map(|(_, tx)| tx).collect()
        };
        for sender in senders {
            let _ = sender.send(StreamEvent::Closed);
        }
        let _ = self.transport.close();
    }
}
