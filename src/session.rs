//! Transport abstraction shared by plain TCP and TLS connections.
//!
//! All protocol code talks to a `SessionOps` object (poll, read,
//! write, flush, close) so the HTTP/2 endpoint and the HTTP/1.1
//! fallback are both transparent to the underlying transport.

use crate::error::{Error, Result};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::time::Duration;

/// Readiness classes for `poll`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvents {
    /// Readable
    Read,
    /// Writable
    Write,
    /// Either
    Both,
}

/// Operations on a connected transport.
///
/// Implementations are blocking; `poll` bounds how long a subsequent
/// read or write may wait.
pub trait SessionOps: Send {
    /// Wait for readiness; returns false on timeout
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool>;

    /// Read available bytes
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write bytes, returning how many were accepted
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Flush buffered output
    fn flush(&mut self) -> Result<()>;

    /// Shut the transport down
    fn close(&mut self) -> Result<()>;
}

/// Boxed transport handed to the endpoint or the fallback stack
pub type Transport = Box<dyn SessionOps>;

pub(crate) fn poll_fd(fd: i32, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
    use libc::{poll, pollfd, POLLIN, POLLOUT};

    let mut pfd = pollfd {
        fd,
        events: match events {
            PollEvents::Read => POLLIN,
            PollEvents::Write => POLLOUT,
            PollEvents::Both => POLLIN | POLLOUT,
        },
        revents: 0,
    };

    let timeout_ms = timeout.map(|d| d.as_millis() as i32).unwrap_or(-1);
    let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };

    if result < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(result > 0)
}

/// Plain TCP transport
pub struct TcpSession {
    stream: TcpStream,
}

impl TcpSession {
    /// Wrap a connected stream
    pub fn new(stream: TcpStream) -> Self {
        TcpSession { stream }
    }

    /// The underlying stream
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }
}

impl SessionOps for TcpSession {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
        poll_fd(self.stream.as_raw_fd(), events, timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.stream.read(buf).map_err(Error::from)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.stream.write(buf).map_err(Error::from)
    }

    fn flush(&mut self) -> Result<()> {
        self.stream.flush().map_err(Error::from)
    }

    fn close(&mut self) -> Result<()> {
        use std::net::Shutdown;
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            // The peer may already have torn the connection down.
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

/// Transport wrapper adding a per-operation timeout.
pub struct HttpSession {
    session: Transport,
    timeout: Option<Duration>,
}

impl HttpSession {
    /// Wrap a transport with the default 10s timeout
    pub fn new(session: Transport) -> Self {
        HttpSession {
            session,
            timeout: Some(Duration::from_secs(10)),
        }
    }

    /// Change the per-operation timeout (None waits forever)
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Read some bytes, honoring the timeout
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.session.poll(PollEvents::Read, self.timeout)? {
            return Err(Error::Timeout);
        }
        self.session.read(buf)
    }

    /// Write the whole buffer, honoring the timeout per chunk
    pub fn write_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            if !self.session.poll(PollEvents::Write, self.timeout)? {
                return Err(Error::Timeout);
            }
            let n = self.session.write(buf)?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            buf = &buf[n..];
        }
        self.session.flush()
    }

    /// Fill the whole buffer, honoring the timeout per chunk
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..])?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            filled += n;
        }
        Ok(())
    }

    /// Close the transport
    pub fn close(&mut self) -> Result<()> {
        self.session.close()
    }

    /// Access the wrapped transport
    pub fn get_mut(&mut self) -> &mut Transport {
        &mut self.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_tcp_session_read_write() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"hello").unwrap();
        });

        let stream = TcpStream::connect(addr).unwrap();
        let mut session = TcpSession::new(stream);

        assert!(session
            .poll(PollEvents::Read, Some(Duration::from_secs(1)))
            .unwrap());

        let mut buf = [0u8; 5];
        let n = session.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");

        handle.join().unwrap();
    }

    #[test]
    fn test_http_session_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let _handle = thread::spawn(move || {
            let (_stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(500));
        });

        let stream = TcpStream::connect(addr).unwrap();
        let mut session = HttpSession::new(Box::new(TcpSession::new(stream)));
        session.set_timeout(Some(Duration::from_millis(50)));

        let mut buf = [0u8; 8];
        assert!(matches!(session.read(&mut buf), Err(Error::Timeout)));
    }
}
