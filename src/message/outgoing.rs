//! Outbound messages: requests and responses.
//!
//! An outgoing message buffers header mutations until the header block
//! is flushed and buffers body writes until a stream is attached, so a
//! request can be written to before protocol negotiation has finished.
//! The lifecycle is `Buffering -> Attached -> HeadersSent -> Writing ->
//! Ending -> Closed`; header mutations are accepted only before
//! `HeadersSent`, and trailers are always the final frame before the
//! stream closes.

use crate::agent::RequestOptions;
use crate::endpoint::Stream;
use crate::error::{Error, ErrorCode, Result};
use crate::fallback::{self, FallbackTarget, H1Out};
use crate::headers::{is_forbidden, HeaderBlock, Headers};
use crate::message::incoming::{IncomingPromise, IncomingResponse};
use crate::message::PushHandler;
use crate::util;
use bytes::Bytes;
use log::debug;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, SystemTime};

/// Upper bound on bytes buffered before a stream is attached
const MAX_BUFFERED: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutgoingState {
    Buffering,
    Attached,
    HeadersSent,
    Writing,
    Ending,
    Closed,
}

enum Sink {
    Detached,
    H2(Stream),
    H1(H1Out),
}

/// Shared buffering and state machine for outbound messages.
struct OutgoingMessage {
    state: OutgoingState,
    headers: Headers,
    trailers: Option<Headers>,
    sink: Sink,
    queued: VecDeque<Bytes>,
    queued_bytes: usize,
    queued_end: bool,
}

impl OutgoingMessage {
    fn detached(headers: Headers) -> Self {
        OutgoingMessage {
            state: OutgoingState::Buffering,
            headers,
            trailers: None,
            sink: Sink::Detached,
            queued: VecDeque::new(),
            queued_bytes: 0,
            queued_end: false,
        }
    }

    fn attached(sink: Sink) -> Self {
        OutgoingMessage {
            state: OutgoingState::Attached,
            headers: Headers::new(),
            trailers: None,
            sink,
            queued: VecDeque::new(),
            queued_bytes: 0,
            queued_end: false,
        }
    }

    fn headers_sent(&self) -> bool {
        !matches!(
            self.state,
            OutgoingState::Buffering | OutgoingState::Attached
        )
    }

    fn set_header(&mut self, name: &str, value: &str) -> Result<()> {
        if self.headers_sent() {
            return Err(Error::Usage(
                "cannot set a header after headers were sent".to_string(),
            ));
        }
        let name = name.to_ascii_lowercase();
        if is_forbidden(&name) {
            return Err(Error::Usage(format!(
                "the {} header is not allowed on HTTP/2 messages",
                name
            )));
        }
        self.headers.remove(&name);
        self.headers.insert(name, value);
        Ok(())
    }

    fn remove_header(&mut self, name: &str) -> Result<()> {
        if self.headers_sent() {
            return Err(Error::Usage(
                "cannot remove a header after headers were sent".to_string(),
            ));
        }
        self.headers.remove(name);
        Ok(())
    }

    fn get_header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    fn h2_stream(&self) -> Result<Stream> {
        match &self.sink {
            Sink::H2(stream) => Ok(stream.clone()),
            _ => Err(Error::Usage("no stream attached".to_string())),
        }
    }

    fn enqueue(&mut self, data: &[u8]) -> Result<()> {
        if self.queued_end
            || matches!(self.state, OutgoingState::Ending | OutgoingState::Closed)
        {
            return Err(Error::Usage("write after end".to_string()));
        }
        if self.queued_bytes + data.len() > MAX_BUFFERED {
            return Err(Error::Usage(
                "write buffer overflow before stream attachment".to_string(),
            ));
        }
        self.queued_bytes += data.len();
        self.queued.push_back(Bytes::copy_from_slice(data));
        Ok(())
    }

    /// Send the header block and replay everything buffered so far, in
    /// order. END_STREAM lands on the last frame of whatever is known
    /// to be final.
    fn send_head_h2(&mut self, block: HeaderBlock) -> Result<()> {
        let stream = self.h2_stream()?;
        let body_done = self.queued.is_empty() && self.queued_end;
        let end = body_done && self.trailers.is_none();
        stream.send_headers(block, end)?;
        self.state = if end {
            OutgoingState::Closed
        } else {
            OutgoingState::HeadersSent
        };

        while let Some(chunk) = self.queued.pop_front() {
            self.queued_bytes -= chunk.len();
            let last = self.queued.is_empty() && self.queued_end;
            let end_now = last && self.trailers.is_none();
            stream.send_data(chunk, end_now)?;
            self.state = if end_now {
                OutgoingState::Closed
            } else {
                OutgoingState::Writing
            };
        }

        if self.queued_end && self.state != OutgoingState::Closed {
            self.finish_h2()?;
        }
        Ok(())
    }

    fn write_h2(&mut self, data: &[u8]) -> Result<()> {
        match self.state {
            OutgoingState::HeadersSent | OutgoingState::Writing => {
                let stream = self.h2_stream()?;
                stream.send_data(Bytes::copy_from_slice(data), false)?;
                self.state = OutgoingState::Writing;
                Ok(())
            }
            OutgoingState::Buffering | OutgoingState::Attached => self.enqueue(data),
            OutgoingState::Ending | OutgoingState::Closed => {
                Err(Error::Usage("write after end".to_string()))
            }
        }
    }

    /// Emit trailers (if any) after the last DATA, then close.
    fn finish_h2(&mut self) -> Result<()> {
        if self.state == OutgoingState::Closed {
            return Err(Error::Usage("message already ended".to_string()));
        }
        let stream = self.h2_stream()?;
        self.state = OutgoingState::Ending;
        match self.trailers.take() {
            Some(trailers) => stream.send_trailers(trailers)?,
            None => stream.end()?,
        }
        self.state = OutgoingState::Closed;
        Ok(())
    }

    fn drain_queued(&mut self) -> Vec<u8> {
        let mut body = Vec::with_capacity(self.queued_bytes);
        for chunk in self.queued.drain(..) {
            body.extend_from_slice(&chunk);
        }
        self.queued_bytes = 0;
        body
    }
}

/// Options for a server push initiated from a response.
#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    /// Path of the promised resource
    pub path: String,
    /// Method of the promised request (GET when unset)
    pub method: Option<String>,
    /// Regular headers of the promised request
    pub headers: Headers,
}

impl From<&str> for PushOptions {
    fn from(path: &str) -> Self {
        PushOptions {
            path: path.to_string(),
            ..Default::default()
        }
    }
}

/// The server side of one exchange: buffers a status line, headers,
/// body, and trailers onto the response stream.
pub struct OutgoingResponse {
    msg: OutgoingMessage,
    status_code: u16,
    send_date: bool,
    scheme: String,
    authority: String,
}

impl OutgoingResponse {
    pub(crate) fn new_h2(stream: Stream, scheme: String, authority: String) -> Self {
        OutgoingResponse {
            msg: OutgoingMessage::attached(Sink::H2(stream)),
            status_code: 200,
            send_date: true,
            scheme,
            authority,
        }
    }

    pub(crate) fn for_h1(out: H1Out) -> Self {
        OutgoingResponse {
            msg: OutgoingMessage::attached(Sink::H1(out)),
            status_code: 200,
            send_date: true,
            scheme: String::new(),
            authority: String::new(),
        }
    }

    /// Status code to be sent (200 until changed)
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    /// Change the status code; rejected once headers are sent
    pub fn set_status(&mut self, code: u16) -> Result<()> {
        if self.msg.headers_sent() {
            return Err(Error::Usage(
                "cannot change the status after headers were sent".to_string(),
            ));
        }
        self.status_code = code;
        Ok(())
    }

    /// Whether a `date` header is added automatically (on by default)
    pub fn set_send_date(&mut self, send: bool) {
        self.send_date = send;
    }

    /// Set a response header
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<()> {
        self.msg.set_header(name, value)
    }

    /// Remove a response header
    pub fn remove_header(&mut self, name: &str) -> Result<()> {
        self.msg.remove_header(name)
    }

    /// Read back a buffered header
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.msg.get_header(name)
    }

    /// Whether the header block has been flushed
    pub fn headers_sent(&self) -> bool {
        self.msg.headers_sent()
    }

    /// Buffer trailers to be sent after the body
    pub fn add_trailers(&mut self, trailers: Headers) {
        self.msg.trailers = Some(trailers);
    }

    fn response_block(&mut self) -> HeaderBlock {
        if self.send_date && !self.msg.headers.contains("date") {
            self.msg
                .headers
                .insert("date", util::http_date(SystemTime::now()));
        }
        let mut block = HeaderBlock::new();
        block.push_pseudo("status", self.status_code.to_string());
        for (name, value) in self.msg.headers.iter() {
            block.push_regular(name, value);
        }
        block
    }

    /// Write body bytes, flushing the header block first if needed
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        match self.msg.sink {
            Sink::H2(_) => {
                if !self.msg.headers_sent() {
                    let block = self.response_block();
                    self.msg.send_head_h2(block)?;
                }
                self.msg.write_h2(data)
            }
            Sink::H1(_) => self.msg.enqueue(data),
            Sink::Detached => Err(Error::Usage("response has no connection".to_string())),
        }
    }

    /// Finish the response: emit trailers (if any) and close the stream
    pub fn end(&mut self) -> Result<()> {
        match &self.msg.sink {
            Sink::H2(_) => {
                if self.msg.headers_sent() {
                    self.msg.finish_h2()
                } else {
                    self.msg.queued_end = true;
                    let block = self.response_block();
                    self.msg.send_head_h2(block)
                }
            }
            Sink::H1(_) => self.flush_h1(),
            Sink::Detached => Err(Error::Usage("response has no connection".to_string())),
        }
    }

    fn flush_h1(&mut self) -> Result<()> {
        if self.msg.state == OutgoingState::Closed {
            return Err(Error::Usage("message already ended".to_string()));
        }
        if self.msg.trailers.take().is_some() {
            debug!("dropping trailers on an HTTP/1.1 fallback response");
        }
        if self.send_date && !self.msg.headers.contains("date") {
            self.msg
                .headers
                .insert("date", util::http_date(SystemTime::now()));
        }
        let body = self.msg.drain_queued();
        let out = match &self.msg.sink {
            Sink::H1(out) => out.clone(),
            _ => unreachable!("flush_h1 called with a non-H1 sink"),
        };
        out.send(self.status_code, &self.msg.headers, &body)?;
        self.msg.state = OutgoingState::Closed;
        Ok(())
    }

    /// Promise a pushed resource tied to this response's request.
    ///
    /// The promised request inherits this request's scheme and
    /// authority; the returned response is bound to the pushed stream
    /// and is written like any other.
    pub fn push(&mut self, options: impl Into<PushOptions>) -> Result<OutgoingResponse> {
        let options = options.into();
        let stream = match &self.msg.sink {
            Sink::H2(stream) => stream.clone(),
            _ => {
                return Err(Error::Usage(
                    "server push requires an HTTP/2 connection".to_string(),
                ))
            }
        };
        if options.path.is_empty() {
            return Err(Error::Usage("push requires a path".to_string()));
        }

        let mut block = HeaderBlock::new();
        block.push_pseudo(
            "method",
            options.method.unwrap_or_else(|| "GET".to_string()),
        );
        block.push_pseudo("scheme", self.scheme.clone());
        block.push_pseudo("authority", self.authority.clone());
        block.push_pseudo("path", options.path);
        for (name, value) in options.headers.iter() {
            if is_forbidden(name) {
                return Err(Error::Usage(format!(
                    "the {} header is not allowed on HTTP/2 messages",
                    name
                )));
            }
            block.push_regular(name, value);
        }

        let pushed = stream.promise(block)?;
        Ok(OutgoingResponse::new_h2(
            pushed,
            self.scheme.clone(),
            self.authority.clone(),
        ))
    }

    /// Advertise an alternative service to the client
    pub fn altsvc(
        &self,
        host: &str,
        port: u16,
        protocol: &str,
        max_age: u32,
        origin: &str,
    ) -> Result<()> {
        let stream = self.msg.h2_stream()?;
        stream.altsvc(host, port, protocol, max_age, origin)
    }

    /// The response stream, when served over HTTP/2
    pub fn socket(&self) -> Option<&Stream> {
        match &self.msg.sink {
            Sink::H2(stream) => Some(stream),
            _ => None,
        }
    }
}

enum Attachment {
    Pending,
    H2(Stream),
    Fallback(FallbackTarget),
    Failed(String),
}

struct RequestInner {
    msg: OutgoingMessage,
    options: RequestOptions,
    attachment: Attachment,
    aborted: bool,
    push: Option<PushHandler>,
    deferred_priority: Option<u32>,
    timeout: Option<Duration>,
    h1_response: Option<Result<IncomingResponse>>,
    h1_done: bool,
}

/// The client side of one exchange.
///
/// Created before a connection exists: writes queue until negotiation
/// attaches a stream (or settles on the HTTP/1.1 fallback), then
/// replay in order. Clones address the same request.
#[derive(Clone)]
pub struct OutgoingRequest {
    inner: Arc<(Mutex<RequestInner>, Condvar)>,
}

impl OutgoingRequest {
    pub(crate) fn new(options: RequestOptions) -> Result<Self> {
        let mut headers = Headers::new();
        for (name, value) in options.headers.iter() {
            // The authority pseudo-header supersedes any host header.
            if name.eq_ignore_ascii_case("host") {
                continue;
            }
            if is_forbidden(name) {
                return Err(Error::Usage(format!(
                    "the {} header is not allowed on HTTP/2 messages",
                    name
                )));
            }
            headers.insert(name, value);
        }

        Ok(OutgoingRequest {
            inner: Arc::new((
                Mutex::new(RequestInner {
                    msg: OutgoingMessage::detached(headers),
                    options,
                    attachment: Attachment::Pending,
                    aborted: false,
                    push: None,
                    deferred_priority: None,
                    timeout: None,
                    h1_response: None,
                    h1_done: false,
                }),
                Condvar::new(),
            )),
        })
    }

    /// Set a request header; rejected once the block is on the wire
    pub fn set_header(&self, name: &str, value: &str) -> Result<()> {
        self.inner.0.lock().unwrap().msg.set_header(name, value)
    }

    /// Remove a buffered request header
    pub fn remove_header(&self, name: &str) -> Result<()> {
        self.inner.0.lock().unwrap().msg.remove_header(name)
    }

    /// Read back a buffered request header
    pub fn get_header(&self, name: &str) -> Option<String> {
        self.inner
            .0
            .lock()
            .unwrap()
            .msg
            .get_header(name)
            .map(|v| v.to_string())
    }

    /// Buffer trailers to be sent after the body
    pub fn add_trailers(&self, trailers: Headers) {
        self.inner.0.lock().unwrap().msg.trailers = Some(trailers);
    }

    /// Register the listener for pushed resources. Without one, every
    /// promise is cancelled on arrival.
    pub fn on_push<F>(&self, handler: F)
    where
        F: Fn(IncomingPromise) + Send + Sync + 'static,
    {
        self.inner.0.lock().unwrap().push = Some(Arc::new(handler));
    }

    /// Advise the peer of this request's priority; defers until a
    /// stream is attached.
    pub fn set_priority(&self, weight: u32) {
        let mut st = self.inner.0.lock().unwrap();
        match &st.attachment {
            Attachment::H2(stream) => {
                let _ = stream.priority(weight);
            }
            _ => st.deferred_priority = Some(weight),
        }
    }

    /// Set an I/O timeout. A no-op over HTTP/2 (the endpoint keeps the
    /// connection alive); forwarded to the transport on the fallback
    /// path.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.inner.0.lock().unwrap().timeout = timeout;
    }

    /// Abort the exchange. Over HTTP/2 the stream is reset with CANCEL.
    pub fn abort(&self) {
        let mut st = self.inner.0.lock().unwrap();
        st.aborted = true;
        if let Attachment::H2(stream) = &st.attachment {
            let _ = stream.reset(ErrorCode::Cancel);
            st.msg.state = OutgoingState::Closed;
        }
    }

    /// Write request body bytes
    pub fn write(&self, data: &[u8]) -> Result<()> {
        let mut st = self.inner.0.lock().unwrap();
        if st.aborted {
            return Err(Error::Usage("request was aborted".to_string()));
        }
        match &st.attachment {
            Attachment::H2(_) => st.msg.write_h2(data),
            Attachment::Pending | Attachment::Fallback(_) => st.msg.enqueue(data),
            Attachment::Failed(e) => Err(Error::Handshake(e.clone())),
        }
    }

    /// Finish the request body
    pub fn end(&self) -> Result<()> {
        let mut st = self.inner.0.lock().unwrap();
        if st.aborted {
            return Err(Error::Usage("request was aborted".to_string()));
        }
        match &st.attachment {
            Attachment::H2(_) => st.msg.finish_h2(),
            Attachment::Pending => {
                if st.msg.queued_end {
                    return Err(Error::Usage("message already ended".to_string()));
                }
                st.msg.queued_end = true;
                Ok(())
            }
            Attachment::Fallback(target) => {
                let target = target.clone();
                st.msg.queued_end = true;
                run_fallback(&mut st, target);
                self.inner.1.notify_all();
                Ok(())
            }
            Attachment::Failed(e) => Err(Error::Handshake(e.clone())),
        }
    }

    /// Block until the response arrives.
    ///
    /// Over HTTP/2 this may complete before the request body is
    /// finished; on the fallback path the request must be ended first.
    pub fn response(&self) -> Result<IncomingResponse> {
        let (lock, cv) = &*self.inner;
        let mut st = lock.lock().unwrap();
        loop {
            match &st.attachment {
                Attachment::Pending => {
                    st = cv.wait(st).unwrap();
                }
                Attachment::H2(stream) => {
                    let stream = stream.clone();
                    let push = st.push.clone();
                    drop(st);
                    return IncomingResponse::from_stream(stream, push);
                }
                Attachment::Fallback(target) => {
                    let target = target.clone();
                    if let Some(result) = st.h1_response.take() {
                        return result;
                    }
                    if st.h1_done {
                        return Err(Error::Usage(
                            "the fallback response was already consumed".to_string(),
                        ));
                    }
                    if !st.msg.queued_end {
                        return Err(Error::Usage(
                            "end() the request before waiting for a fallback response"
                                .to_string(),
                        ));
                    }
                    run_fallback(&mut st, target);
                }
                Attachment::Failed(e) => return Err(Error::Handshake(e.clone())),
            }
        }
    }

    /// Attach the negotiated HTTP/2 stream: send the header block with
    /// the four request pseudo-headers, then replay buffered writes.
    pub(crate) fn start(&self, stream: Stream) {
        let (lock, cv) = &*self.inner;
        let mut st = lock.lock().unwrap();

        if st.aborted {
            let _ = stream.reset(ErrorCode::Cancel);
            st.attachment = Attachment::Failed("request was aborted".to_string());
            cv.notify_all();
            return;
        }

        let mut block = HeaderBlock::new();
        block.push_pseudo("method", st.options.method.clone());
        block.push_pseudo("scheme", st.options.scheme.as_str());
        block.push_pseudo("authority", st.options.host.clone());
        block.push_pseudo("path", st.options.path.clone());
        let auth = st.options.auth.clone();
        if let Some(auth) = auth {
            let credential = format!("Basic {}", util::base64_encode(auth.as_bytes()));
            st.msg.headers.remove("authorization");
            st.msg.headers.insert("authorization", credential);
        }
        for (name, value) in st.msg.headers.iter() {
            block.push_regular(name, value);
        }

        st.msg.sink = Sink::H2(stream.clone());
        st.msg.state = OutgoingState::Attached;
        if let Some(weight) = st.deferred_priority.take() {
            let _ = stream.priority(weight);
        }

        match st.msg.send_head_h2(block) {
            Ok(()) => st.attachment = Attachment::H2(stream),
            Err(e) => st.attachment = Attachment::Failed(e.to_string()),
        }
        cv.notify_all();
    }

    /// Record that negotiation settled on HTTP/1.1.
    pub(crate) fn fall_back(&self, target: FallbackTarget) {
        let (lock, cv) = &*self.inner;
        let mut st = lock.lock().unwrap();
        if st.aborted {
            st.attachment = Attachment::Failed("request was aborted".to_string());
            cv.notify_all();
            return;
        }
        st.attachment = Attachment::Fallback(target.clone());
        if st.msg.queued_end {
            run_fallback(&mut st, target);
        }
        cv.notify_all();
    }

    /// Record a negotiation failure.
    pub(crate) fn fail(&self, reason: String) {
        let (lock, cv) = &*self.inner;
        let mut st = lock.lock().unwrap();
        st.attachment = Attachment::Failed(reason);
        cv.notify_all();
    }
}

fn run_fallback(st: &mut RequestInner, target: FallbackTarget) {
    if st.h1_done {
        return;
    }
    st.h1_done = true;
    let body = st.msg.drain_queued();
    let mut headers = st.msg.headers.clone();
    headers.remove("host");
    if let Some(auth) = &st.options.auth {
        headers.remove("authorization");
        headers.insert(
            "authorization",
            format!("Basic {}", util::base64_encode(auth.as_bytes())),
        );
    }
    let result = fallback::exchange(
        &target,
        &st.options.method,
        &st.options.path,
        &headers,
        &body,
        st.timeout,
    );
    st.msg.state = OutgoingState::Closed;
    st.h1_response = Some(result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Scheme;

    fn options() -> RequestOptions {
        RequestOptions {
            method: "GET".to_string(),
            scheme: Scheme::Https,
            host: "localhost".to_string(),
            port: 443,
            path: "/".to_string(),
            plain: false,
            auth: None,
            headers: Headers::new(),
        }
    }

    #[test]
    fn test_set_header_stores_lowercase() {
        let req = OutgoingRequest::new(options()).unwrap();
        req.set_header("X-Custom", "1").unwrap();
        assert_eq!(req.get_header("x-custom").as_deref(), Some("1"));
    }

    #[test]
    fn test_set_header_replaces_value() {
        let req = OutgoingRequest::new(options()).unwrap();
        req.set_header("x-a", "1").unwrap();
        req.set_header("X-A", "2").unwrap();
        assert_eq!(req.get_header("x-a").as_deref(), Some("2"));
    }

    #[test]
    fn test_forbidden_headers_rejected() {
        let req = OutgoingRequest::new(options()).unwrap();
        for name in crate::headers::FORBIDDEN_HEADERS {
            assert!(
                matches!(req.set_header(name, "x"), Err(Error::Usage(_))),
                "{} should be rejected",
                name
            );
        }
    }

    #[test]
    fn test_options_host_header_dropped() {
        let mut opts = options();
        opts.headers.insert("host", "stale.example");
        opts.headers.insert("accept", "*/*");
        let req = OutgoingRequest::new(opts).unwrap();
        assert_eq!(req.get_header("host"), None);
        assert_eq!(req.get_header("accept").as_deref(), Some("*/*"));
    }

    #[test]
    fn test_forbidden_options_header_is_usage_error() {
        let mut opts = options();
        opts.headers.insert("transfer-encoding", "chunked");
        assert!(matches!(
            OutgoingRequest::new(opts),
            Err(Error::Usage(_))
        ));
    }

    #[test]
    fn test_writes_queue_until_attachment() {
        let req = OutgoingRequest::new(options()).unwrap();
        req.write(b"hello ").unwrap();
        req.write(b"world").unwrap();
        req.end().unwrap();

        let st = req.inner.0.lock().unwrap();
        assert_eq!(st.msg.queued.len(), 2);
        assert!(st.msg.queued_end);
    }

    #[test]
    fn test_double_end_rejected() {
        let req = OutgoingRequest::new(options()).unwrap();
        req.end().unwrap();
        assert!(matches!(req.end(), Err(Error::Usage(_))));
    }

    #[test]
    fn test_buffer_cap_enforced() {
        let req = OutgoingRequest::new(options()).unwrap();
        let chunk = vec![0u8; MAX_BUFFERED / 2 + 1];
        req.write(&chunk).unwrap();
        assert!(matches!(req.write(&chunk), Err(Error::Usage(_))));
    }
}
