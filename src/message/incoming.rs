//! Inbound messages: requests, responses, and push promises.
//!
//! An `IncomingMessage` subscribes to one stream's events. The first
//! header block is validated before anything becomes visible to the
//! user; a block that fails validation resets the stream with
//! PROTOCOL_ERROR and the message constructor returns the error
//! instead of a message. Body bytes flow through `std::io::Read`
//! unchanged. A second header block is held back as the candidate
//! trailer block and surfaces through `trailers()` only after
//! end-of-body.

use super::{check_special_header, PushHandler, Version};
use crate::endpoint::{Stream, StreamEvent};
use crate::error::{Error, ErrorCode, Result};
use crate::headers::{HeaderBlock, Headers};
use bytes::Bytes;
use log::debug;
use std::io::{self, Cursor, Read};

enum BodySource {
    Stream(Stream),
    Buffered(Cursor<Vec<u8>>),
}

/// Shared core of every inbound message kind.
pub struct IncomingMessage {
    version: Version,
    headers: Headers,
    first_block: HeaderBlock,
    trailers: Option<Headers>,
    candidate_trailers: Option<Headers>,
    saw_trailer_block: bool,
    source: BodySource,
    push: Option<PushHandler>,
    ended: bool,
    pending: Bytes,
}

impl IncomingMessage {
    /// Bind to a stream and wait for its first header block.
    ///
    /// Returns once the block passes validation; on rejection the
    /// stream is reset with PROTOCOL_ERROR and no message is produced.
    pub(crate) fn from_stream(stream: Stream, push: Option<PushHandler>) -> Result<Self> {
        loop {
            match stream.recv_event()? {
                StreamEvent::Headers { block, end_stream } => {
                    if let Err(code) = block.validate() {
                        debug!("stream {} rejected by header validation", stream.id());
                        let _ = stream.reset(code);
                        return Err(Error::Protocol(
                            "inbound header block failed validation".to_string(),
                        ));
                    }
                    let headers = block.regular_headers();
                    return Ok(IncomingMessage {
                        version: Version::Http2,
                        headers,
                        first_block: block,
                        trailers: None,
                        candidate_trailers: None,
                        saw_trailer_block: false,
                        source: BodySource::Stream(stream),
                        push,
                        ended: end_stream,
                        pending: Bytes::new(),
                    });
                }
                StreamEvent::Data { .. } => {
                    let _ = stream.reset(ErrorCode::ProtocolError);
                    return Err(Error::Protocol("DATA before first header block".to_string()));
                }
                StreamEvent::Promise { stream: pushed, block } => {
                    dispatch_promise(&push, pushed, block);
                }
                StreamEvent::Reset(code) => return Err(Error::Reset(code)),
                StreamEvent::Closed => return Err(Error::ConnectionClosed),
            }
        }
    }

    /// Build a fallback message around an already-read HTTP/1.1 body.
    pub(crate) fn from_buffered(headers: Headers, body: Vec<u8>) -> Self {
        IncomingMessage {
            version: Version::Http11,
            headers,
            first_block: HeaderBlock::new(),
            trailers: None,
            candidate_trailers: None,
            saw_trailer_block: false,
            source: BodySource::Buffered(Cursor::new(body)),
            push: None,
            ended: true,
            pending: Bytes::new(),
        }
    }

    /// Regular headers; never contains a pseudo-header.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Trailer headers, present only after the body has been read to
    /// its end and only if the peer sent a trailer block.
    pub fn trailers(&self) -> Option<&Headers> {
        self.trailers.as_ref()
    }

    /// Protocol version the message travelled over
    pub fn version(&self) -> Version {
        self.version
    }

    /// The stream carrying this message (None on the fallback path)
    pub fn socket(&self) -> Option<&Stream> {
        match &self.source {
            BodySource::Stream(stream) => Some(stream),
            BodySource::Buffered(_) => None,
        }
    }

    pub(crate) fn first_block(&self) -> &HeaderBlock {
        &self.first_block
    }

    pub(crate) fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    fn mark_ended(&mut self) {
        self.ended = true;
        if let Some(trailers) = self.candidate_trailers.take() {
            self.trailers = Some(trailers);
        }
    }

    /// Record a header block received after the first one. One trailer
    /// block is allowed per stream; anything beyond that, or a block
    /// smuggling pseudo-headers, is a protocol error.
    fn on_trailer_block(&mut self, block: HeaderBlock, end_stream: bool) -> io::Result<()> {
        let bad = self.saw_trailer_block || block.has_pseudo() || block.validate().is_err();
        if bad {
            if let BodySource::Stream(stream) = &self.source {
                let _ = stream.reset(ErrorCode::ProtocolError);
            }
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid trailer block",
            ));
        }
        self.saw_trailer_block = true;
        self.candidate_trailers = Some(block.regular_headers());
        if end_stream {
            self.mark_ended();
        }
        Ok(())
    }
}

impl Read for IncomingMessage {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if !self.pending.is_empty() {
                let n = self.pending.len().min(buf.len());
                buf[..n].copy_from_slice(&self.pending[..n]);
                self.pending = self.pending.slice(n..);
                return Ok(n);
            }
            if self.ended {
                return Ok(0);
            }

            let event = match &mut self.source {
                BodySource::Buffered(cursor) => return cursor.read(buf),
                BodySource::Stream(stream) => stream
                    .recv_event()
                    .map_err(|e| io::Error::new(io::ErrorKind::UnexpectedEof, e.to_string()))?,
            };

            match event {
                StreamEvent::Data { chunk, end_stream } => {
                    self.pending = chunk;
                    if end_stream {
                        self.mark_ended();
                    }
                }
                StreamEvent::Headers { block, end_stream } => {
                    self.on_trailer_block(block, end_stream)?;
                }
                StreamEvent::Promise { stream, block } => {
                    dispatch_promise(&self.push, stream, block);
                }
                StreamEvent::Reset(code) => {
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        format!("stream reset: {}", code),
                    ));
                }
                StreamEvent::Closed => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "endpoint closed before end of body",
                    ));
                }
            }
        }
    }
}

fn dispatch_promise(push: &Option<PushHandler>, pushed: Stream, block: HeaderBlock) {
    match push {
        Some(handler) => match IncomingPromise::new(pushed, block) {
            Ok(promise) => handler(promise),
            Err(e) => debug!("discarding malformed push promise: {}", e),
        },
        None => {
            // Nobody is listening for pushes on this request.
            let _ = pushed.reset(ErrorCode::Cancel);
        }
    }
}

/// An inbound request as seen by a server handler.
pub struct IncomingRequest {
    msg: IncomingMessage,
    method: String,
    scheme: String,
    host: String,
    url: String,
}

impl IncomingRequest {
    pub(crate) fn from_stream(stream: Stream) -> Result<Self> {
        let msg = IncomingMessage::from_stream(stream, None)?;
        Self::from_message(msg)
    }

    fn from_message(mut msg: IncomingMessage) -> Result<Self> {
        let stream = match &msg.source {
            BodySource::Stream(stream) => Some(stream.clone()),
            BodySource::Buffered(_) => None,
        };
        let block = msg.first_block.clone();
        let method = check_special_header(&block, "method", stream.as_ref())?;
        let scheme = check_special_header(&block, "scheme", stream.as_ref())?;
        let host = check_special_header(&block, "authority", stream.as_ref())?;
        let url = check_special_header(&block, "path", stream.as_ref())?;

        // Legacy-API compatibility: expose the authority as a host
        // header the way HTTP/1.1 code expects to find it.
        msg.headers_mut().insert("host", host.clone());

        Ok(IncomingRequest {
            msg,
            method,
            scheme,
            host,
            url,
        })
    }

    pub(crate) fn from_h1(
        method: String,
        url: String,
        scheme: String,
        headers: Headers,
        body: Vec<u8>,
    ) -> Self {
        let host = headers.get("host").unwrap_or_default().to_string();
        IncomingRequest {
            msg: IncomingMessage::from_buffered(headers, body),
            method,
            scheme,
            host,
            url,
        }
    }

    /// Request method (`GET`, `POST`, ...)
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Request scheme (`https` or `http`)
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Authority the request was addressed to
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Path and query string
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Regular request headers
    pub fn headers(&self) -> &Headers {
        self.msg.headers()
    }

    /// Trailers, available after the body ends
    pub fn trailers(&self) -> Option<&Headers> {
        self.msg.trailers()
    }

    /// Protocol version
    pub fn version(&self) -> Version {
        self.msg.version()
    }

    /// The underlying stream, when served over HTTP/2
    pub fn socket(&self) -> Option<&Stream> {
        self.msg.socket()
    }
}

impl Read for IncomingRequest {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.msg.read(buf)
    }
}

/// An inbound response as seen by the requesting client.
pub struct IncomingResponse {
    msg: IncomingMessage,
    status_code: u16,
}

impl IncomingResponse {
    pub(crate) fn from_stream(stream: Stream, push: Option<PushHandler>) -> Result<Self> {
        let msg = IncomingMessage::from_stream(stream.clone(), push)?;
        let status = check_special_header(msg.first_block(), "status", Some(&stream))?;
        let status_code = match status.parse::<u16>() {
            Ok(code) => code,
            Err(_) => {
                let _ = stream.reset(ErrorCode::ProtocolError);
                return Err(Error::Protocol(format!(
                    "non-numeric :status value {:?}",
                    status
                )));
            }
        };
        Ok(IncomingResponse { msg, status_code })
    }

    pub(crate) fn from_h1(status_code: u16, headers: Headers, body: Vec<u8>) -> Self {
        IncomingResponse {
            msg: IncomingMessage::from_buffered(headers, body),
            status_code,
        }
    }

    /// Response status code
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    /// Regular response headers
    pub fn headers(&self) -> &Headers {
        self.msg.headers()
    }

    /// Trailers, available after the body ends
    pub fn trailers(&self) -> Option<&Headers> {
        self.msg.trailers()
    }

    /// Protocol version
    pub fn version(&self) -> Version {
        self.msg.version()
    }

    /// The underlying stream, when received over HTTP/2
    pub fn socket(&self) -> Option<&Stream> {
        self.msg.socket()
    }
}

impl Read for IncomingResponse {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.msg.read(buf)
    }
}

/// A server push announcement: the request-side metadata of a pushed
/// resource, owning the stream its response will arrive on.
pub struct IncomingPromise {
    method: String,
    scheme: String,
    host: String,
    url: String,
    headers: Headers,
    response_stream: Stream,
}

impl IncomingPromise {
    pub(crate) fn new(pushed: Stream, block: HeaderBlock) -> Result<Self> {
        if block.validate().is_err() {
            let _ = pushed.reset(ErrorCode::ProtocolError);
            return Err(Error::Protocol(
                "push promise header block failed validation".to_string(),
            ));
        }
        let method = check_special_header(&block, "method", Some(&pushed))?;
        let scheme = check_special_header(&block, "scheme", Some(&pushed))?;
        let host = check_special_header(&block, "authority", Some(&pushed))?;
        let url = check_special_header(&block, "path", Some(&pushed))?;
        let mut headers = block.regular_headers();
        headers.insert("host", host.clone());

        Ok(IncomingPromise {
            method,
            scheme,
            host,
            url,
            headers,
            response_stream: pushed,
        })
    }

    /// Method of the promised request (always a safe method)
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Scheme of the promised request
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Authority of the promised request
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Path of the promised resource
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Regular headers of the promised request
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Decline the push, resetting the pushed stream
    pub fn cancel(&self) {
        let _ = self.response_stream.reset(ErrorCode::Cancel);
    }

    /// Advise the peer of the pushed stream's priority
    pub fn set_priority(&self, weight: u32) {
        let _ = self.response_stream.priority(weight);
    }

    /// Wait for the pushed response
    pub fn response(self) -> Result<IncomingResponse> {
        IncomingResponse::from_stream(self.response_stream, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{Endpoint, StreamEvent};
    use crate::session::TcpSession;
    use crate::settings::Settings;
    use std::net::{TcpListener, TcpStream};
    use std::time::Duration;

    fn endpoints() -> (Endpoint, Endpoint) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (
            Endpoint::client(Settings::new(), Box::new(TcpSession::new(client))),
            Endpoint::server(Settings::new(), Box::new(TcpSession::new(server))),
        )
    }

    fn send_request(client: &Endpoint, extra: &[(&str, &str)], end: bool) -> crate::endpoint::Stream {
        let stream = client.create_stream().unwrap();
        let mut block = HeaderBlock::new();
        block.push_pseudo("method", "POST");
        block.push_pseudo("scheme", "https");
        block.push_pseudo("authority", "example.com");
        block.push_pseudo("path", "/a?b=1");
        for (name, value) in extra {
            block.push_regular(*name, *value);
        }
        stream.send_headers(block, end).unwrap();
        stream
    }

    #[test]
    fn test_pseudo_header_extraction() {
        let (client, server) = endpoints();
        let incoming = server.incoming().unwrap();

        let _stream = send_request(&client, &[("content-type", "text/plain")], true);

        let stream = incoming.into_iter().next().unwrap();
        let req = IncomingRequest::from_stream(stream).unwrap();

        assert_eq!(req.method(), "POST");
        assert_eq!(req.scheme(), "https");
        assert_eq!(req.host(), "example.com");
        assert_eq!(req.url(), "/a?b=1");
        assert_eq!(req.headers().get("content-type"), Some("text/plain"));
        assert_eq!(req.headers().get("host"), Some("example.com"));
        assert!(!req.headers().iter().any(|(n, _)| n.starts_with(':')));
    }

    #[test]
    fn test_forbidden_header_resets_stream() {
        let (client, server) = endpoints();
        let incoming = server.incoming().unwrap();

        let stream = send_request(&client, &[("transfer-encoding", "chunked")], true);

        let inbound = incoming.into_iter().next().unwrap();
        assert!(IncomingRequest::from_stream(inbound).is_err());

        match stream.recv_event_timeout(Duration::from_secs(5)).unwrap() {
            StreamEvent::Reset(code) => assert_eq!(code, ErrorCode::ProtocolError),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_missing_pseudo_header_rejected() {
        let (client, server) = endpoints();
        let incoming = server.incoming().unwrap();

        let stream = client.create_stream().unwrap();
        let mut block = HeaderBlock::new();
        block.push_pseudo("method", "GET");
        // no :scheme, :authority, :path
        stream.send_headers(block, true).unwrap();

        let inbound = incoming.into_iter().next().unwrap();
        assert!(IncomingRequest::from_stream(inbound).is_err());
    }

    #[test]
    fn test_body_and_trailers() {
        let (client, server) = endpoints();
        let incoming = server.incoming().unwrap();

        let stream = client.create_stream().unwrap();
        let mut block = HeaderBlock::new();
        block.push_pseudo("method", "POST");
        block.push_pseudo("scheme", "https");
        block.push_pseudo("authority", "example.com");
        block.push_pseudo("path", "/");
        stream.send_headers(block, false).unwrap();
        stream.send_data(Bytes::from_static(b"abc"), false).unwrap();
        let mut trailers = Headers::new();
        trailers.insert("checksum", "x");
        stream.send_trailers(trailers).unwrap();

        let inbound = incoming.into_iter().next().unwrap();
        let mut req = IncomingRequest::from_stream(inbound).unwrap();

        assert!(req.trailers().is_none());
        let mut body = Vec::new();
        req.read_to_end(&mut body).unwrap();
        assert_eq!(body, b"abc");
        assert_eq!(req.trailers().unwrap().get("checksum"), Some("x"));
    }

    #[test]
    fn test_second_trailer_block_is_protocol_error() {
        let (client, server) = endpoints();
        let incoming = server.incoming().unwrap();

        let stream = client.create_stream().unwrap();
        let mut block = HeaderBlock::new();
        block.push_pseudo("method", "POST");
        block.push_pseudo("scheme", "https");
        block.push_pseudo("authority", "example.com");
        block.push_pseudo("path", "/");
        stream.send_headers(block, false).unwrap();

        let mut t1 = HeaderBlock::new();
        t1.push_regular("first", "1");
        stream.send_headers(t1, false).unwrap();
        let mut t2 = HeaderBlock::new();
        t2.push_regular("second", "2");
        stream.send_headers(t2, true).unwrap();

        let inbound = incoming.into_iter().next().unwrap();
        let mut req = IncomingRequest::from_stream(inbound).unwrap();
        let mut body = Vec::new();
        assert!(req.read_to_end(&mut body).is_err());

        match stream.recv_event_timeout(Duration::from_secs(5)).unwrap() {
            StreamEvent::Reset(code) => assert_eq!(code, ErrorCode::ProtocolError),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
