//! Header validation against a live server: conformance violations
//! reset the stream and never reach the request handler.

use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use weft::endpoint::{Endpoint, StreamEvent};
use weft::session::TcpSession;
use weft::{ErrorCode, HeaderBlock, ServerOptions, Settings};

fn raw_client(port: u16) -> Endpoint {
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    Endpoint::client(Settings::new(), Box::new(TcpSession::new(stream)))
}

fn request_block(extra: &[(&str, &str)]) -> HeaderBlock {
    let mut block = HeaderBlock::new();
    block.push_pseudo("method", "GET");
    block.push_pseudo("scheme", "http");
    block.push_pseudo("authority", "localhost");
    block.push_pseudo("path", "/");
    for (name, value) in extra {
        block.push_regular(*name, *value);
    }
    block
}

fn expect_protocol_error(extra: &[(&str, &str)]) {
    let handled = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&handled);

    let server = weft::raw::create_server("127.0.0.1:0", ServerOptions::default(), move |_req, mut res| {
        handler_flag.store(true, Ordering::SeqCst);
        res.end().unwrap();
    })
    .unwrap();

    let client = raw_client(server.port());
    let stream = client.create_stream().unwrap();
    stream.send_headers(request_block(extra), true).unwrap();

    match stream.recv_event_timeout(Duration::from_secs(5)).unwrap() {
        StreamEvent::Reset(code) => assert_eq!(code, ErrorCode::ProtocolError),
        other => panic!("expected a reset, got {:?}", other),
    }
    assert!(
        !handled.load(Ordering::SeqCst),
        "handler must not see a rejected request"
    );

    server.close();
}

#[test]
fn test_forbidden_headers_reset_stream() {
    for name in ["connection", "keep-alive", "proxy-connection", "te", "transfer-encoding", "upgrade", "host"] {
        expect_protocol_error(&[(name, "x")]);
    }
}

#[test]
fn test_short_header_name_resets_stream() {
    expect_protocol_error(&[("a", "x")]);
}

#[test]
fn test_well_formed_request_is_served() {
    let server = weft::raw::create_server("127.0.0.1:0", ServerOptions::default(), |_req, mut res| {
        res.end().unwrap();
    })
    .unwrap();

    let client = raw_client(server.port());
    let stream = client.create_stream().unwrap();
    stream
        .send_headers(request_block(&[("accept", "*/*")]), true)
        .unwrap();

    match stream.recv_event_timeout(Duration::from_secs(5)).unwrap() {
        StreamEvent::Headers { block, .. } => {
            assert_eq!(block.pseudo("status"), Some("200"));
        }
        other => panic!("expected response headers, got {:?}", other),
    }

    server.close();
}
