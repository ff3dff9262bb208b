//! HTTP/1.1 fallback stack.
//!
//! When ALPN settles on `http/1.1` instead of the HTTP/2 identifier,
//! connections are served through this module: a compact HTTP/1.1
//! parser and serializer bridging the same request/response types the
//! HTTP/2 path produces. Client requests perform one buffered
//! exchange; server connections are served with keep-alive.

use crate::error::{Error, Result};
use crate::headers::Headers;
use crate::message::incoming::{IncomingRequest, IncomingResponse};
use crate::message::outgoing::OutgoingResponse;
use crate::session::{HttpSession, Transport};
use crate::tls::TlsConfig;
use log::debug;
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const CRLF: &str = "\r\n";

/// Where a fallen-back client request should reconnect to.
#[derive(Debug, Clone)]
pub(crate) struct FallbackTarget {
    pub host: String,
    pub port: u16,
    pub verify_peer: bool,
}

/// A buffered HTTP/1.1 connection.
pub(crate) struct H1Conn {
    session: HttpSession,
    buf: Vec<u8>,
}

impl H1Conn {
    pub(crate) fn new(transport: Transport) -> Self {
        H1Conn {
            session: HttpSession::new(transport),
            buf: Vec::new(),
        }
    }

    pub(crate) fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.session.set_timeout(timeout);
    }

    fn fill(&mut self) -> Result<usize> {
        let mut tmp = [0u8; 4096];
        let n = self.session.read(&mut tmp)?;
        self.buf.extend_from_slice(&tmp[..n]);
        Ok(n)
    }

    fn read_line(&mut self) -> Result<String> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                let line = String::from_utf8(line)
                    .map_err(|_| Error::Parse("non-UTF-8 header line".to_string()))?;
                return Ok(line.trim_end_matches(['\r', '\n']).to_string());
            }
            if self.fill()? == 0 {
                return Err(Error::ConnectionClosed);
            }
        }
    }

    /// Read a start line plus header fields up to the blank line.
    /// Returns None on clean end-of-connection before any byte.
    fn read_head(&mut self) -> Result<Option<(String, Headers)>> {
        while self.buf.is_empty() {
            match self.fill() {
                Ok(0) => return Ok(None),
                Ok(_) => {}
                Err(Error::ConnectionClosed) => return Ok(None),
                Err(e) => return Err(e),
            }
        }

        let start_line = self.read_line()?;
        let mut headers = Headers::new();
        loop {
            let line = self.read_line()?;
            if line.is_empty() {
                break;
            }
            let colon = line
                .find(':')
                .ok_or_else(|| Error::Parse(format!("header without colon: {:?}", line)))?;
            let name = line[..colon].trim();
            if name.is_empty() {
                return Err(Error::Parse("empty header name".to_string()));
            }
            headers.insert(name, line[colon + 1..].trim());
        }
        Ok(Some((start_line, headers)))
    }

    fn read_body_exact(&mut self, length: usize) -> Result<Vec<u8>> {
        while self.buf.len() < length {
            if self.fill()? == 0 {
                return Err(Error::ConnectionClosed);
            }
        }
        Ok(self.buf.drain(..length).collect())
    }

    fn read_body_chunked(&mut self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        loop {
            let size_line = self.read_line()?;
            let size_str = size_line.split(';').next().unwrap_or("").trim();
            let size = usize::from_str_radix(size_str, 16)
                .map_err(|_| Error::Parse(format!("bad chunk size: {:?}", size_line)))?;
            if size == 0 {
                // Trailer section (ignored) runs to the blank line.
                loop {
                    if self.read_line()?.is_empty() {
                        break;
                    }
                }
                return Ok(body);
            }
            body.extend_from_slice(&self.read_body_exact(size)?);
            let sep = self.read_line()?;
            if !sep.is_empty() {
                return Err(Error::Parse("missing CRLF after chunk".to_string()));
            }
        }
    }

    fn read_body_to_eof(&mut self) -> Result<Vec<u8>> {
        loop {
            match self.fill() {
                Ok(0) => break,
                Ok(_) => {}
                Err(Error::ConnectionClosed) | Err(Error::Timeout) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(std::mem::take(&mut self.buf))
    }

    fn read_body(&mut self, headers: &Headers, allow_eof_body: bool) -> Result<Vec<u8>> {
        if let Some(encoding) = headers.get("transfer-encoding") {
            if encoding.eq_ignore_ascii_case("chunked") {
                return self.read_body_chunked();
            }
        }
        if let Some(length) = headers.get("content-length") {
            let length = length
                .parse::<usize>()
                .map_err(|_| Error::Parse(format!("bad content-length: {:?}", length)))?;
            return self.read_body_exact(length);
        }
        if allow_eof_body {
            return self.read_body_to_eof();
        }
        Ok(Vec::new())
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.session.write_all(bytes)
    }
}

/// One parsed HTTP/1.1 request
pub(crate) struct H1Request {
    pub method: String,
    pub path: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub close: bool,
}

/// Read one request, or None when the peer closed between requests.
pub(crate) fn read_request(conn: &mut H1Conn) -> Result<Option<H1Request>> {
    let (start_line, headers) = match conn.read_head()? {
        Some(head) => head,
        None => return Ok(None),
    };

    let mut parts = start_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| Error::Parse("empty request line".to_string()))?
        .to_string();
    let path = parts
        .next()
        .ok_or_else(|| Error::Parse("request line without target".to_string()))?
        .to_string();
    let version = parts.next().unwrap_or("HTTP/1.1");

    let close = version == "HTTP/1.0"
        || headers
            .get("connection")
            .is_some_and(|c| c.eq_ignore_ascii_case("close"));

    let body = conn.read_body(&headers, false)?;
    Ok(Some(H1Request {
        method,
        path,
        headers,
        body,
        close,
    }))
}

/// Read one response head and body.
pub(crate) fn read_response(conn: &mut H1Conn, head_request: bool) -> Result<(u16, Headers, Vec<u8>)> {
    let (start_line, headers) = conn
        .read_head()?
        .ok_or(Error::ConnectionClosed)?;

    let mut parts = start_line.split_whitespace();
    let _version = parts.next();
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| Error::Parse(format!("bad status line: {:?}", start_line)))?;

    let body = if head_request {
        Vec::new()
    } else {
        conn.read_body(&headers, true)?
    };
    Ok((status, headers, body))
}

/// Serialize and send one request with a fully buffered body.
pub(crate) fn write_request(
    conn: &mut H1Conn,
    method: &str,
    path: &str,
    host: &str,
    headers: &Headers,
    body: &[u8],
) -> Result<()> {
    let mut wire = String::new();
    wire.push_str(method);
    wire.push(' ');
    wire.push_str(path);
    wire.push_str(" HTTP/1.1");
    wire.push_str(CRLF);
    wire.push_str("host: ");
    wire.push_str(host);
    wire.push_str(CRLF);
    for (name, value) in headers.iter() {
        wire.push_str(name);
        wire.push_str(": ");
        wire.push_str(value);
        wire.push_str(CRLF);
    }
    if !body.is_empty() || matches!(method, "POST" | "PUT" | "PATCH") {
        wire.push_str(&format!("content-length: {}{}", body.len(), CRLF));
    }
    wire.push_str(CRLF);

    conn.write_all(wire.as_bytes())?;
    conn.write_all(body)
}

/// Serialize and send one response with a fully buffered body.
pub(crate) fn write_response(
    conn: &mut H1Conn,
    status: u16,
    headers: &Headers,
    body: &[u8],
) -> Result<()> {
    let mut wire = String::new();
    wire.push_str(&format!(
        "HTTP/1.1 {} {}{}",
        status,
        reason_phrase(status),
        CRLF
    ));
    for (name, value) in headers.iter() {
        wire.push_str(name);
        wire.push_str(": ");
        wire.push_str(value);
        wire.push_str(CRLF);
    }
    wire.push_str(&format!("content-length: {}{}", body.len(), CRLF));
    wire.push_str(CRLF);

    conn.write_all(wire.as_bytes())?;
    conn.write_all(body)
}

/// Writer handle an `OutgoingResponse` uses on the fallback path.
#[derive(Clone)]
pub(crate) struct H1Out {
    conn: Arc<Mutex<H1Conn>>,
}

impl H1Out {
    pub(crate) fn send(&self, status: u16, headers: &Headers, body: &[u8]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        write_response(&mut conn, status, headers, body)
    }
}

/// Perform one buffered request/response exchange against a host that
/// negotiated down to HTTP/1.1.
pub(crate) fn exchange(
    target: &FallbackTarget,
    method: &str,
    path: &str,
    headers: &Headers,
    body: &[u8],
    timeout: Option<Duration>,
) -> Result<IncomingResponse> {
    let stream = TcpStream::connect((target.host.as_str(), target.port))?;
    let config = TlsConfig::client()
        .alpn(&["http/1.1"])?
        .servername(&target.host)
        .verify_peer(target.verify_peer)
        .build();
    let session = config.connect(stream)?;

    let mut conn = H1Conn::new(Box::new(session));
    if let Some(timeout) = timeout {
        conn.set_timeout(Some(timeout));
    }

    write_request(&mut conn, method, path, &target.host, headers, body)?;
    let (status, headers, body) = read_response(&mut conn, method == "HEAD")?;
    Ok(IncomingResponse::from_h1(status, headers, body))
}

/// Serve a fallen-back connection with the server's request handler,
/// honoring keep-alive.
pub(crate) fn serve(
    transport: Transport,
    handler: crate::server::Handler,
    scheme: &str,
    timeout: Option<Duration>,
) {
    let mut first_conn = H1Conn::new(transport);
    if let Some(timeout) = timeout {
        first_conn.set_timeout(Some(timeout));
    }
    let conn = Arc::new(Mutex::new(first_conn));

    loop {
        let parsed = {
            let mut guard = conn.lock().unwrap();
            read_request(&mut guard)
        };
        let request = match parsed {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                debug!("fallback connection ended: {}", e);
                break;
            }
        };

        let close = request.close;
        let incoming = IncomingRequest::from_h1(
            request.method,
            request.path,
            scheme.to_string(),
            request.headers,
            request.body,
        );
        let outgoing = OutgoingResponse::for_h1(H1Out { conn: Arc::clone(&conn) });
        handler(incoming, outgoing);

        if close {
            break;
        }
    }
}

/// Open a plain TCP fallback connection for tests and `http:` targets
/// that negotiated nothing.
#[cfg(test)]
pub(crate) fn plain_conn(stream: TcpStream) -> H1Conn {
    H1Conn::new(Box::new(crate::session::TcpSession::new(stream)))
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_read_request_with_content_length() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream
                .write_all(b"POST /submit HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\n\r\nhello")
                .unwrap();
        });

        let (stream, _) = listener.accept().unwrap();
        let mut conn = plain_conn(stream);
        let request = read_request(&mut conn).unwrap().unwrap();

        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/submit");
        assert_eq!(request.headers.get("host"), Some("localhost"));
        assert_eq!(request.body, b"hello");
        assert!(!request.close);

        handle.join().unwrap();
    }

    #[test]
    fn test_read_response_chunked() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream
                .write_all(
                    b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n",
                )
                .unwrap();
        });

        let stream = TcpStream::connect(addr).unwrap();
        let mut conn = plain_conn(stream);
        let (status, headers, body) = read_response(&mut conn, false).unwrap();

        assert_eq!(status, 200);
        assert_eq!(headers.get("transfer-encoding"), Some("chunked"));
        assert_eq!(body, b"abcde");

        handle.join().unwrap();
    }

    #[test]
    fn test_write_request_wire_format() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = vec![0u8; 1024];
            let n = stream.read(&mut buf).unwrap();
            let wire = String::from_utf8_lossy(&buf[..n]).to_string();
            assert!(wire.starts_with("POST /x HTTP/1.1\r\n"));
            assert!(wire.contains("host: example.com\r\n"));
            assert!(wire.contains("content-length: 2\r\n"));
            assert!(wire.ends_with("\r\nhi"));
        });

        let stream = TcpStream::connect(addr).unwrap();
        let mut conn = plain_conn(stream);
        write_request(&mut conn, "POST", "/x", "example.com", &Headers::new(), b"hi").unwrap();

        handle.join().unwrap();
    }

    #[test]
    fn test_connection_close_detected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream
                .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
                .unwrap();
        });

        let (stream, _) = listener.accept().unwrap();
        let mut conn = plain_conn(stream);
        let request = read_request(&mut conn).unwrap().unwrap();
        assert!(request.close);

        handle.join().unwrap();
    }
}
