//! weft - HTTP/2 client and server library
//!
//! This crate implements the HTTP/2 semantic layer: it turns streams
//! into a request/response programming model with trailers, server
//! push, per-stream priority, and transparent HTTP/1.1 fallback when
//! ALPN negotiation picks the older protocol.
//!
//! # Architecture
//!
//! - An `Endpoint` is one HTTP/2 connection, driven by a dedicated
//!   thread that owns the socket and dispatches per-stream events.
//! - Incoming/outgoing message types bridge stream lifecycle events to
//!   message lifecycle events, validating header blocks against
//!   HTTP/2 conformance rules on the way in.
//! - The `Server` negotiates protocol per connection and serves both
//!   HTTP/2 streams and fallen-back HTTP/1.1 requests through one
//!   handler.
//! - The `Agent` coalesces client requests onto at most one shared
//!   endpoint per `(plain, host, port)` authority.
//!
//! # Examples
//!
//! ## Server
//!
//! ```no_run
//! use weft::{Server, ServerOptions};
//!
//! let options = ServerOptions {
//!     cert: Some(weft::tls::BUILTIN_CERT.into()),
//!     key: Some(weft::tls::BUILTIN_CERT.into()),
//!     ..Default::default()
//! };
//! let server = Server::bind("0.0.0.0:8443", options, |_req, mut res| {
//!     res.write(b"hello").unwrap();
//!     res.end().unwrap();
//! }).unwrap();
//! println!("listening on {}", server.local_addr());
//! ```
//!
//! ## Client
//!
//! ```no_run
//! use std::io::Read;
//!
//! let options = weft::RequestOptions::parse("https://example.com/").unwrap();
//! let request = weft::get(options).unwrap();
//! let mut response = request.response().unwrap();
//! let mut body = Vec::new();
//! response.read_to_end(&mut body).unwrap();
//! println!("{}: {} bytes", response.status_code(), body.len());
//! ```

pub mod agent;
pub mod endpoint;
pub mod error;
mod fallback;
pub mod frame;
pub mod headers;
pub mod message;
pub mod server;
pub mod session;
pub mod settings;
pub mod tls;
mod util;

pub use agent::{Agent, AgentOptions, RequestOptions, Scheme};
pub use endpoint::{Endpoint, Role, Stream, StreamEvent, StreamId};
pub use error::{Error, ErrorCode, Result};
pub use headers::{HeaderBlock, HeaderName, Headers};
pub use message::incoming::{IncomingMessage, IncomingPromise, IncomingRequest, IncomingResponse};
pub use message::outgoing::{OutgoingRequest, OutgoingResponse, PushOptions};
pub use message::Version;
pub use server::{Server, ServerOptions};
pub use settings::Settings;

/// ALPN identifier for the HTTP/2 version this crate speaks
pub const PROTOCOL_ID: &str = "h2";

/// Protocols advertised during negotiation, most preferred first
pub const ALPN_PROTOCOLS: &[&str] = &[PROTOCOL_ID, "http/1.1", "http/0.9"];

/// Dispatch a request through the process-global agent.
pub fn request(options: RequestOptions) -> Result<OutgoingRequest> {
    Agent::global().request(options)
}

/// Dispatch a request and immediately end its body.
pub fn get(options: RequestOptions) -> Result<OutgoingRequest> {
    Agent::global().get(options)
}

/// Plain-TCP analogues: HTTP/2 over cleartext sockets, no negotiation.
pub mod raw {
    use super::*;

    fn check_plain(mut options: RequestOptions) -> Result<RequestOptions> {
        if options.scheme != Scheme::Http {
            return Err(Error::Usage(
                "the raw API accepts only http: targets".to_string(),
            ));
        }
        options.plain = true;
        Ok(options)
    }

    /// Dispatch a cleartext request through the global agent.
    pub fn request(options: RequestOptions) -> Result<OutgoingRequest> {
        Agent::global().request(check_plain(options)?)
    }

    /// Dispatch a cleartext request and immediately end its body.
    pub fn get(options: RequestOptions) -> Result<OutgoingRequest> {
        Agent::global().get(check_plain(options)?)
    }

    /// Bind a cleartext HTTP/2 server. TLS credentials are rejected.
    pub fn create_server<A, F>(
        addr: A,
        mut options: ServerOptions,
        handler: F,
    ) -> Result<Server>
    where
        A: std::net::ToSocketAddrs,
        F: Fn(IncomingRequest, OutgoingResponse) + Send + Sync + 'static,
    {
        options.plain = true;
        Server::bind(addr, options, handler)
    }
}
