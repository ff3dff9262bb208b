//! Server core: owns the listener, negotiates protocol per connection,
//! and hands each inbound stream to the request handler as a matched
//! (request, response) pair.
//!
//! In TLS mode the ALPN list is advertised with the HTTP/2 identifier
//! first. A connection is served as HTTP/2 only when the handshake
//! selected that identifier *and* the client presented a server name;
//! every other connection is replayed through the HTTP/1.1 fallback
//! service on the same socket, with the same handler behind it. Plain
//! mode skips negotiation and speaks HTTP/2 directly over TCP.

use crate::endpoint::{Endpoint, Stream};
use crate::error::{Error, Result};
use crate::fallback;
use crate::message::incoming::IncomingRequest;
use crate::message::outgoing::OutgoingResponse;
use crate::session::{TcpSession, Transport};
use crate::settings::Settings;
use crate::tls::{TlsConfig, DEFAULT_CIPHERS};
use crate::{ALPN_PROTOCOLS, PROTOCOL_ID};
use log::{debug, warn};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Request handler invoked once per ready request
pub type Handler = Arc<dyn Fn(IncomingRequest, OutgoingResponse) + Send + Sync>;

/// Callback for connection-level failures
pub type ErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;

/// Callback observing each accepted connection; the endpoint argument
/// is present only when the connection negotiated HTTP/2.
pub type ConnectionCallback = Arc<dyn Fn(SocketAddr, Option<&Endpoint>) + Send + Sync>;

/// Server configuration
#[derive(Default)]
pub struct ServerOptions {
    /// PEM private key (TLS mode, together with `cert`)
    pub key: Option<Vec<u8>>,
    /// PEM certificate (TLS mode, together with `key`)
    pub cert: Option<Vec<u8>>,
    /// PKCS#12 archive, an alternative to `key` + `cert`
    pub pfx: Option<Vec<u8>>,
    /// Passphrase for the `pfx` archive
    pub pfx_passphrase: String,
    /// Accept HTTP/2 over cleartext TCP, without negotiation
    pub plain: bool,
    /// SETTINGS advertised on every connection
    pub settings: Settings,
    /// Cipher list override
    pub ciphers: Option<String>,
    /// Prefer the server's cipher order (recommended)
    pub honor_cipher_order: Option<bool>,
    /// Observe accepted connections
    pub on_connection: Option<ConnectionCallback>,
    /// Observe connection-level failures
    pub on_client_error: Option<ErrorCallback>,
}

struct ServerInner {
    tls: Option<TlsConfig>,
    settings: Settings,
    handler: Handler,
    on_connection: Option<ConnectionCallback>,
    on_client_error: Option<ErrorCallback>,
    endpoints: Mutex<Vec<Endpoint>>,
    closing: AtomicBool,
    local_addr: SocketAddr,
    timeout: Mutex<Option<Duration>>,
}

impl ServerInner {
    fn client_error(&self, error: &Error) {
        warn!("client connection error: {}", error);
        if let Some(callback) = &self.on_client_error {
            callback(error);
        }
    }
}

/// A bound HTTP/2 server
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Bind a listener and start serving.
    ///
    /// TLS is the default and requires `key` + `cert` or `pfx`; set
    /// `plain` for cleartext HTTP/2 (which rejects TLS credentials).
    pub fn bind<A, F>(addr: A, options: ServerOptions, handler: F) -> Result<Server>
    where
        A: ToSocketAddrs,
        F: Fn(IncomingRequest, OutgoingResponse) + Send + Sync + 'static,
    {
        let has_creds =
            options.key.is_some() || options.cert.is_some() || options.pfx.is_some();

        let tls = if options.plain {
            if has_creds {
                return Err(Error::Usage(
                    "a plain server does not take TLS credentials".to_string(),
                ));
            }
            None
        } else {
            let mut builder = TlsConfig::server();
            builder = match (&options.pfx, &options.key, &options.cert) {
                (Some(pfx), _, _) => builder.pfx(pfx, &options.pfx_passphrase)?,
                (None, Some(key), Some(cert)) => builder.key_cert_pem(key, cert)?,
                _ => {
                    return Err(Error::Usage(
                        "a TLS server requires key and cert or pfx".to_string(),
                    ))
                }
            };
            builder = builder
                .ciphers(options.ciphers.as_deref().unwrap_or(DEFAULT_CIPHERS))?
                .honor_cipher_order(options.honor_cipher_order.unwrap_or(true))
                .alpn(ALPN_PROTOCOLS);
            Some(builder.build()?)
        };

        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;

        let inner = Arc::new(ServerInner {
            tls,
            settings: options.settings,
            handler: Arc::new(handler),
            on_connection: options.on_connection,
            on_client_error: options.on_client_error,
            endpoints: Mutex::new(Vec::new()),
            closing: AtomicBool::new(false),
            local_addr,
            timeout: Mutex::new(None),
        });

        let accept_inner = Arc::clone(&inner);
        thread::spawn(move || {
            for connection in listener.incoming() {
                if accept_inner.closing.load(Ordering::SeqCst) {
                    break;
                }
                match connection {
                    Ok(socket) => {
                        let conn_inner = Arc::clone(&accept_inner);
                        thread::spawn(move || handle_connection(conn_inner, socket));
                    }
                    Err(e) => accept_inner.client_error(&Error::Io(e)),
                }
            }
            debug!("accept loop for {} stopped", accept_inner.local_addr);
        });

        Ok(Server { inner })
    }

    /// The address the server is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// The bound port
    pub fn port(&self) -> u16 {
        self.inner.local_addr.port()
    }

    /// I/O timeout applied to fallback HTTP/1.1 sessions. HTTP/2
    /// connections are kept alive by the endpoint and ignore this.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        *self.inner.timeout.lock().unwrap() = timeout;
    }

    /// Stop accepting connections and close every held endpoint.
    /// Streams already handed to the handler are left to finish.
    pub fn close(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);

        // Unblock the accept loop.
        let mut wake_addr = self.inner.local_addr;
        if wake_addr.ip().is_unspecified() {
            wake_addr.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        }
        let _ = TcpStream::connect(wake_addr);

        let endpoints: Vec<Endpoint> = self.inner.endpoints.lock().unwrap().drain(..).collect();
        for endpoint in endpoints {
            endpoint.close();
        }
    }
}

fn handle_connection(inner: Arc<ServerInner>, socket: TcpStream) {
    let peer = match socket.peer_addr() {
        Ok(peer) => peer,
        Err(e) => {
            inner.client_error(&Error::Io(e));
            return;
        }
    };

    match &inner.tls {
        None => {
            debug!("plain HTTP/2 connection from {}", peer);
            start_endpoint(&inner, Box::new(TcpSession::new(socket)), peer);
        }
        Some(config) => match config.accept(socket) {
            Ok(session) => {
                let is_h2 = session.selected_protocol().as_deref()
                    == Some(PROTOCOL_ID.as_bytes())
                    && session.sni_servername().is_some();
                if is_h2 {
                    debug!("{} negotiated {}", peer, PROTOCOL_ID);
                    start_endpoint(&inner, Box::new(session), peer);
                } else {
                    debug!("{} fell back to HTTP/1.1", peer);
                    if let Some(callback) = &inner.on_connection {
                        callback(peer, None);
                    }
                    let timeout = *inner.timeout.lock().unwrap();
                    fallback::serve(
                        Box::new(session),
                        Arc::clone(&inner.handler),
                        "https",
                        timeout,
                    );
                }
            }
            Err(e) => inner.client_error(&e),
        },
    }
}

fn start_endpoint(inner: &Arc<ServerInner>, transport: Transport, peer: SocketAddr) {
    let endpoint = Endpoint::server(inner.settings.clone(), transport);
    inner.endpoints.lock().unwrap().push(endpoint.clone());
    if let Some(callback) = &inner.on_connection {
        callback(peer, Some(&endpoint));
    }

    let incoming = match endpoint.incoming() {
        Ok(incoming) => incoming,
        Err(e) => {
            inner.client_error(&e);
            return;
        }
    };

    for stream in incoming {
        let handler = Arc::clone(&inner.handler);
        thread::spawn(move || serve_stream(stream, handler));
    }
}

/// Pair one inbound stream with a response and run the handler once
/// the request's metadata is validated.
fn serve_stream(stream: Stream, handler: Handler) {
    match IncomingRequest::from_stream(stream.clone()) {
        Ok(request) => {
            let scheme = request.scheme().to_string();
            let authority = request.host().to_string();
            let response = OutgoingResponse::new_h2(stream, scheme, authority);
            handler(request, response);
        }
        Err(e) => {
            // The stream was reset during validation; nothing reaches
            // the handler.
            debug!("inbound stream rejected: {}", e);
        }
    }
}
