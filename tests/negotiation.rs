//! ALPN negotiation: coalescing onto one endpoint, and the HTTP/1.1
//! fallback in both directions.

use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::channel;
use std::thread;
use std::time::Duration;
use weft::session::{PollEvents, SessionOps};
use weft::tls::{TlsConfig, BUILTIN_CERT};
use weft::{Agent, AgentOptions, RequestOptions, ServerOptions};

fn tls_server_options() -> ServerOptions {
    let _ = env_logger::builder().is_test(true).try_init();
    ServerOptions {
        cert: Some(BUILTIN_CERT.into()),
        key: Some(BUILTIN_CERT.into()),
        ..Default::default()
    }
}

fn tls_agent() -> Agent {
    Agent::new(AgentOptions {
        verify_peer: false,
        ..Default::default()
    })
}

fn https_options(port: u16, path: &str) -> RequestOptions {
    RequestOptions {
        host: "localhost".to_string(),
        port,
        path: path.to_string(),
        ..Default::default()
    }
}

#[test]
fn test_tls_round_trip() {
    let server = weft::Server::bind("127.0.0.1:0", tls_server_options(), |req, mut res| {
        assert_eq!(req.scheme(), "https");
        res.write(b"over tls").unwrap();
        res.end().unwrap();
    })
    .unwrap();

    let agent = tls_agent();
    let request = agent.get(https_options(server.port(), "/")).unwrap();
    let mut response = request.response().unwrap();
    assert_eq!(response.status_code(), 200);
    let mut body = Vec::new();
    response.read_to_end(&mut body).unwrap();
    assert_eq!(body, b"over tls");

    server.close();
}

#[test]
fn test_concurrent_requests_share_one_endpoint() {
    let server = weft::Server::bind("127.0.0.1:0", tls_server_options(), |req, mut res| {
        res.write(req.url().as_bytes()).unwrap();
        res.end().unwrap();
    })
    .unwrap();
    let port = server.port();

    let agent = tls_agent();
    let (result_tx, result_rx) = channel();

    // Both requests are issued before negotiation can have finished;
    // they must coalesce onto the same endpoint.
    let mut handles = Vec::new();
    for path in ["/first", "/second"] {
        let agent = agent.clone();
        let result_tx = result_tx.clone();
        handles.push(thread::spawn(move || {
            let request = agent.get(https_options(port, path)).unwrap();
            let mut response = request.response().unwrap();
            let mut body = Vec::new();
            response.read_to_end(&mut body).unwrap();
            result_tx.send((path, response.status_code(), body)).unwrap();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    for _ in 0..2 {
        let (path, status, body) = result_rx.recv().unwrap();
        assert_eq!(status, 200);
        assert_eq!(body, path.as_bytes());
    }
    assert_eq!(agent.endpoint_count(), 1);

    server.close();
}

/// A minimal TLS server that only speaks HTTP/1.1, for exercising the
/// client-side fallback.
fn spawn_h1_only_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    thread::spawn(move || {
        let config = TlsConfig::server()
            .cert_pem(BUILTIN_CERT.as_bytes())
            .unwrap()
            .alpn(&["http/1.1"])
            .build()
            .unwrap();

        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(_) => break,
            };
            let mut session = match config.accept(stream) {
                Ok(session) => session,
                Err(_) => continue,
            };
            assert_eq!(session.selected_protocol(), Some(b"http/1.1".to_vec()));

            // Read the request head, then answer with a fixed body.
            let mut seen = Vec::new();
            loop {
                let mut buf = [0u8; 1024];
                if !session
                    .poll(PollEvents::Read, Some(Duration::from_secs(5)))
                    .unwrap()
                {
                    break;
                }
                let n = session.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                seen.extend_from_slice(&buf[..n]);
                if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            session
                .write(b"HTTP/1.1 200 OK\r\ncontent-length: 8\r\n\r\nfallback")
                .unwrap();
            let _ = session.flush();
        }
    });

    port
}

#[test]
fn test_client_falls_back_to_http11() {
    let port = spawn_h1_only_server();

    let agent = tls_agent();
    let request = agent.get(https_options(port, "/")).unwrap();
    let mut response = request.response().unwrap();

    assert_eq!(response.status_code(), 200);
    assert_eq!(response.version(), weft::Version::Http11);
    let mut body = Vec::new();
    response.read_to_end(&mut body).unwrap();
    assert_eq!(body, b"fallback");

    // A fallen-back authority holds no installed endpoint.
    assert_eq!(agent.endpoint_count(), 0);
}

#[test]
fn test_server_falls_back_for_h1_clients() {
    let server = weft::Server::bind("127.0.0.1:0", tls_server_options(), |req, mut res| {
        assert_eq!(req.version(), weft::Version::Http11);
        assert_eq!(req.url(), "/legacy");
        res.write(b"served over 1.1").unwrap();
        res.end().unwrap();
    })
    .unwrap();

    let config = TlsConfig::client()
        .alpn(&["http/1.1"])
        .unwrap()
        .servername("localhost")
        .verify_peer(false)
        .build();
    let stream = TcpStream::connect(("127.0.0.1", server.port())).unwrap();
    let mut session = config.connect(stream).unwrap();
    assert_eq!(session.selected_protocol(), Some(b"http/1.1".to_vec()));

    session
        .write(b"GET /legacy HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n")
        .unwrap();
    session.flush().unwrap();

    let mut reply = Vec::new();
    loop {
        let mut buf = [0u8; 1024];
        if !session
            .poll(PollEvents::Read, Some(Duration::from_secs(5)))
            .unwrap()
        {
            break;
        }
        let n = session.read(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        reply.extend_from_slice(&buf[..n]);
    }
    let reply = String::from_utf8_lossy(&reply);
    assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(reply.ends_with("served over 1.1"));

    server.close();
}

#[test]
fn test_tls_server_requires_credentials() {
    let result = weft::Server::bind("127.0.0.1:0", ServerOptions::default(), |_req, _res| {});
    assert!(result.is_err());
}
