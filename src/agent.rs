//! Client agent: dispatches requests, sharing at most one HTTP/2
//! endpoint per authority.
//!
//! The agent keys shareable connections by `(plain, host, port)`. The
//! first request to an authority starts ALPN negotiation; every
//! request racing in before it finishes subscribes to the same
//! negotiation slot, a one-shot broadcast that resolves to either the
//! shared endpoint or the HTTP/1.1 fallback verdict. Installation is
//! first-wins: a negotiation that completes after another already
//! installed an endpoint closes its own and uses the installed one, so
//! an authority never holds more than one live endpoint.

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::fallback::FallbackTarget;
use crate::headers::Headers;
use crate::message::outgoing::OutgoingRequest;
use crate::session::TcpSession;
use crate::settings::Settings;
use crate::tls::TlsConfig;
use crate::{ALPN_PROTOCOLS, PROTOCOL_ID};
use log::{debug, warn};
use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;

/// Request scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Cleartext; accepted only by the raw (plain TCP) API
    Http,
    /// TLS with ALPN negotiation (the default)
    Https,
}

impl Scheme {
    /// The scheme string used in the `:scheme` pseudo-header
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// Where and how to send one request.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Request method (GET when empty)
    pub method: String,
    /// Target scheme
    pub scheme: Scheme,
    /// Target host (localhost when empty)
    pub host: String,
    /// Target port (scheme default when zero)
    pub port: u16,
    /// Path and query string (/ when empty)
    pub path: String,
    /// Use HTTP/2 over cleartext TCP without negotiation
    pub plain: bool,
    /// `user:password` credential sent as basic authorization
    pub auth: Option<String>,
    /// Extra request headers
    pub headers: Headers,
}

impl Default for RequestOptions {
    fn default() -> Self {
        RequestOptions {
            method: "GET".to_string(),
            scheme: Scheme::Https,
            host: "localhost".to_string(),
            port: 0,
            path: "/".to_string(),
            plain: false,
            auth: None,
            headers: Headers::new(),
        }
    }
}

impl RequestOptions {
    /// Parse a `http://` or `https://` URL string into options.
    pub fn parse(url: &str) -> Result<RequestOptions> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| Error::InvalidUrl(url.to_string()))?;
        let scheme = match scheme {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            _ => return Err(Error::InvalidUrl(url.to_string())),
        };

        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], rest[i..].to_string()),
            None => (rest, "/".to_string()),
        };
        let (auth, host_port) = match authority.rsplit_once('@') {
            Some((auth, host_port)) => (Some(auth.to_string()), host_port),
            None => (None, authority),
        };
        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port)) => (
                host.to_string(),
                port.parse::<u16>()
                    .map_err(|_| Error::InvalidUrl(url.to_string()))?,
            ),
            None => (host_port.to_string(), 0),
        };
        if host.is_empty() {
            return Err(Error::InvalidUrl(url.to_string()));
        }

        Ok(RequestOptions {
            method: "GET".to_string(),
            scheme,
            host,
            port,
            path,
            plain: false,
            auth,
            headers: Headers::new(),
        })
    }

    fn normalize(&mut self) {
        if self.method.is_empty() {
            self.method = "GET".to_string();
        }
        if self.host.is_empty() {
            self.host = "localhost".to_string();
        }
        if self.path.is_empty() {
            self.path = "/".to_string();
        }
        if self.port == 0 {
            self.port = self.scheme.default_port();
        }
    }
}

/// Identity of a shareable connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointKey {
    plain: bool,
    host: String,
    port: u16,
}

#[derive(Clone)]
enum NegotiationOutcome {
    Endpoint(Endpoint),
    Fallback,
    Failed(String),
}

/// One-shot broadcast every request racing on the same key waits on.
struct NegotiationSlot {
    state: Mutex<Option<NegotiationOutcome>>,
    cv: Condvar,
}

impl NegotiationSlot {
    fn new() -> Self {
        NegotiationSlot {
            state: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    fn resolve(&self, outcome: NegotiationOutcome) {
        *self.state.lock().unwrap() = Some(outcome);
        self.cv.notify_all();
    }

    fn wait(&self) -> NegotiationOutcome {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(outcome) = state.clone() {
                return outcome;
            }
            state = self.cv.wait(state).unwrap();
        }
    }
}

enum Slot {
    Negotiating(Arc<NegotiationSlot>),
    Installed(Endpoint),
}

/// Agent configuration
#[derive(Clone)]
pub struct AgentOptions {
    /// SETTINGS advertised on every endpoint the agent opens
    pub settings: Settings,
    /// Verify server certificates (on by default)
    pub verify_peer: bool,
}

impl Default for AgentOptions {
    fn default() -> Self {
        AgentOptions {
            settings: Settings::new(),
            verify_peer: true,
        }
    }
}

struct AgentInner {
    endpoints: Mutex<HashMap<EndpointKey, Slot>>,
    options: AgentOptions,
}

/// Per-process client registry coalescing requests onto shared
/// endpoints.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

enum Action {
    Start(Endpoint),
    Wait(Arc<NegotiationSlot>),
    ConnectPlain,
    Negotiate(Arc<NegotiationSlot>),
}

impl Agent {
    /// Create an agent with the given options
    pub fn new(options: AgentOptions) -> Agent {
        Agent {
            inner: Arc::new(AgentInner {
                endpoints: Mutex::new(HashMap::new()),
                options,
            }),
        }
    }

    /// The process-wide default agent
    pub fn global() -> &'static Agent {
        static GLOBAL: OnceLock<Agent> = OnceLock::new();
        GLOBAL.get_or_init(|| Agent::new(AgentOptions::default()))
    }

    /// Dispatch a request, reusing or negotiating a connection as
    /// needed. Returns immediately; writes buffer until a connection
    /// attaches.
    pub fn request(&self, mut options: RequestOptions) -> Result<OutgoingRequest> {
        options.normalize();
        if options.scheme == Scheme::Http && !options.plain {
            return Err(Error::Usage(
                "plaintext upgrade is not supported; use the raw API for http: targets"
                    .to_string(),
            ));
        }

        let key = EndpointKey {
            plain: options.plain,
            host: options.host.clone(),
            port: options.port,
        };
        let request = OutgoingRequest::new(options.clone())?;
        self.dispatch(key, options, request.clone())?;
        Ok(request)
    }

    /// `request` followed by immediate end-of-body
    pub fn get(&self, options: RequestOptions) -> Result<OutgoingRequest> {
        let request = self.request(options)?;
        request.end()?;
        Ok(request)
    }

    /// Number of endpoints currently installed
    pub fn endpoint_count(&self) -> usize {
        self.inner
            .endpoints
            .lock()
            .unwrap()
            .values()
            .filter(|slot| matches!(slot, Slot::Installed(_)))
            .count()
    }

    /// Close every installed endpoint and forget them
    pub fn close(&self) {
        let slots: Vec<Slot> = self
            .inner
            .endpoints
            .lock()
            .unwrap()
            .drain()
            .map(|(_, slot)| slot)
            .collect();
        for slot in slots {
            if let Slot::Installed(endpoint) = slot {
                endpoint.close();
            }
        }
    }

    fn dispatch(&self, key: EndpointKey, options: RequestOptions, request: OutgoingRequest) -> Result<()> {
        let action = {
            let mut map = self.inner.endpoints.lock().unwrap();
            if let Some(Slot::Installed(endpoint)) = map.get(&key) {
                if endpoint.is_closed() {
                    map.remove(&key);
                }
            }
            match map.get(&key) {
                Some(Slot::Installed(endpoint)) => Action::Start(endpoint.clone()),
                Some(Slot::Negotiating(slot)) => Action::Wait(slot.clone()),
                None => {
                    if key.plain {
                        Action::ConnectPlain
                    } else {
                        let slot = Arc::new(NegotiationSlot::new());
                        map.insert(key.clone(), Slot::Negotiating(slot.clone()));
                        Action::Negotiate(slot)
                    }
                }
            }
        };

        match action {
            Action::Start(endpoint) => match endpoint.create_stream() {
                Ok(stream) => {
                    request.start(stream);
                    Ok(())
                }
                Err(_) => {
                    // The shared endpoint died underneath us; evict it
                    // and dispatch afresh.
                    self.inner.endpoints.lock().unwrap().remove(&key);
                    self.dispatch(key, options, request)
                }
            },
            Action::ConnectPlain => {
                let endpoint = self.connect_plain(&options)?;
                let endpoint = self.install(key, endpoint);
                let stream = endpoint.create_stream()?;
                request.start(stream);
                Ok(())
            }
            Action::Wait(slot) => {
                self.spawn_waiter(slot, options, request);
                Ok(())
            }
            Action::Negotiate(slot) => {
                let agent = self.clone();
                let negotiate_key = key.clone();
                let negotiate_options = options.clone();
                let negotiate_slot = slot.clone();
                thread::spawn(move || {
                    agent.negotiate(negotiate_key, negotiate_options, negotiate_slot)
                });
                self.spawn_waiter(slot, options, request);
                Ok(())
            }
        }
    }

    fn spawn_waiter(&self, slot: Arc<NegotiationSlot>, options: RequestOptions, request: OutgoingRequest) {
        let verify_peer = self.inner.options.verify_peer;
        thread::spawn(move || {
            match slot.wait() {
                NegotiationOutcome::Endpoint(endpoint) => match endpoint.create_stream() {
                    Ok(stream) => request.start(stream),
                    Err(e) => request.fail(e.to_string()),
                },
                NegotiationOutcome::Fallback => request.fall_back(FallbackTarget {
                    host: options.host.clone(),
                    port: options.port,
                    verify_peer,
                }),
                NegotiationOutcome::Failed(reason) => request.fail(reason),
            };
        });
    }

    fn negotiate(&self, key: EndpointKey, options: RequestOptions, slot: Arc<NegotiationSlot>) {
        let outcome = match self.try_negotiate(&options) {
            Ok(Some(endpoint)) => {
                let installed = self.install(key, endpoint);
                NegotiationOutcome::Endpoint(installed)
            }
            Ok(None) => {
                debug!("{}:{} negotiated down to HTTP/1.1", key.host, key.port);
                self.inner.endpoints.lock().unwrap().remove(&key);
                NegotiationOutcome::Fallback
            }
            Err(e) => {
                warn!("negotiation with {}:{} failed: {}", key.host, key.port, e);
                self.inner.endpoints.lock().unwrap().remove(&key);
                NegotiationOutcome::Failed(e.to_string())
            }
        };
        slot.resolve(outcome);
    }

    fn try_negotiate(&self, options: &RequestOptions) -> Result<Option<Endpoint>> {
        let stream = TcpStream::connect((options.host.as_str(), options.port))?;
        let config = TlsConfig::client()
            .alpn(ALPN_PROTOCOLS)?
            .servername(&options.host)
            .verify_peer(self.inner.options.verify_peer)
            .build();
        let session = config.connect(stream)?;

        match session.selected_protocol() {
            Some(protocol) if protocol == PROTOCOL_ID.as_bytes() => Ok(Some(Endpoint::client(
                self.inner.options.settings.clone(),
                Box::new(session),
            ))),
            protocol => {
                debug!("ALPN selected {:?}", protocol);
                Ok(None)
            }
        }
    }

    fn connect_plain(&self, options: &RequestOptions) -> Result<Endpoint> {
        let stream = TcpStream::connect((options.host.as_str(), options.port))?;
        Ok(Endpoint::client(
            self.inner.options.settings.clone(),
            Box::new(TcpSession::new(stream)),
        ))
    }

    /// Install an endpoint under its key. First-installed wins: when a
    /// racing negotiation got there earlier, the newer endpoint is
    /// closed and the installed one is returned.
    fn install(&self, key: EndpointKey, endpoint: Endpoint) -> Endpoint {
        let mut map = self.inner.endpoints.lock().unwrap();
        match map.get(&key) {
            Some(Slot::Installed(existing)) if !existing.is_closed() => {
                debug!(
                    "racing negotiation for {}:{} lost; closing the newer endpoint",
                    key.host, key.port
                );
                endpoint.close();
                existing.clone()
            }
            _ => {
                map.insert(key, Slot::Installed(endpoint.clone()));
                endpoint
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_url() {
        let options = RequestOptions::parse("https://user:pw@example.com:8443/a/b?c=1").unwrap();
        assert_eq!(options.scheme, Scheme::Https);
        assert_eq!(options.auth.as_deref(), Some("user:pw"));
        assert_eq!(options.host, "example.com");
        assert_eq!(options.port, 8443);
        assert_eq!(options.path, "/a/b?c=1");
    }

    #[test]
    fn test_parse_defaults() {
        let mut options = RequestOptions::parse("https://example.com").unwrap();
        options.normalize();
        assert_eq!(options.port, 443);
        assert_eq!(options.path, "/");
        assert_eq!(options.method, "GET");

        let mut options = RequestOptions::parse("http://example.com").unwrap();
        options.normalize();
        assert_eq!(options.port, 80);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(RequestOptions::parse("example.com").is_err());
        assert!(RequestOptions::parse("ftp://example.com").is_err());
        assert!(RequestOptions::parse("https://:443/").is_err());
    }

    #[test]
    fn test_http_scheme_requires_plain() {
        let agent = Agent::new(AgentOptions::default());
        let options = RequestOptions {
            scheme: Scheme::Http,
            ..Default::default()
        };
        assert!(matches!(
            agent.request(options),
            Err(Error::Usage(_))
        ));
    }

    #[test]
    fn test_normalize_fills_defaults() {
        let mut options = RequestOptions {
            method: String::new(),
            host: String::new(),
            path: String::new(),
            ..Default::default()
        };
        options.normalize();
        assert_eq!(options.method, "GET");
        assert_eq!(options.host, "localhost");
        assert_eq!(options.path, "/");
        assert_eq!(options.port, 443);
    }
}
