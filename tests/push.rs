//! Server push delivery and cancellation.

use std::io::Read;
use std::sync::mpsc::channel;
use std::sync::Mutex;
use weft::{Agent, AgentOptions, PushOptions, RequestOptions, Scheme, ServerOptions};

fn options(port: u16) -> RequestOptions {
    RequestOptions {
        scheme: Scheme::Http,
        plain: true,
        port,
        ..Default::default()
    }
}

fn push_server() -> weft::Server {
    weft::raw::create_server("127.0.0.1:0", ServerOptions::default(), |_req, mut res| {
        let mut pushed = res.push(PushOptions::from("/aux")).unwrap();
        pushed.set_header("content-type", "text/css").unwrap();
        pushed.write(b"aux body").unwrap();
        pushed.end().unwrap();

        res.write(b"main body").unwrap();
        res.end().unwrap();
    })
    .unwrap()
}

#[test]
fn test_push_delivered_to_listener() {
    let server = push_server();

    let agent = Agent::new(AgentOptions::default());
    let request = agent.request(options(server.port())).unwrap();

    let (promise_tx, promise_rx) = channel();
    let promise_tx = Mutex::new(promise_tx);
    request.on_push(move |promise| {
        promise_tx.lock().unwrap().send(promise).unwrap();
    });
    request.end().unwrap();

    let mut response = request.response().unwrap();
    let mut body = Vec::new();
    response.read_to_end(&mut body).unwrap();
    assert_eq!(body, b"main body");

    let promise = promise_rx.recv().unwrap();
    assert_eq!(promise.url(), "/aux");
    assert_eq!(promise.method(), "GET");
    assert_eq!(promise.host(), "localhost");

    let mut pushed = promise.response().unwrap();
    assert_eq!(pushed.status_code(), 200);
    assert_eq!(pushed.headers().get("content-type"), Some("text/css"));
    let mut aux = Vec::new();
    pushed.read_to_end(&mut aux).unwrap();
    assert_eq!(aux, b"aux body");

    server.close();
}

#[test]
fn test_push_without_listener_is_cancelled() {
    let server = push_server();

    let agent = Agent::new(AgentOptions::default());
    let request = agent.get(options(server.port())).unwrap();

    // No push listener: the promise is reset on arrival and the main
    // response is unaffected.
    let mut response = request.response().unwrap();
    let mut body = Vec::new();
    response.read_to_end(&mut body).unwrap();
    assert_eq!(body, b"main body");

    server.close();
}

#[test]
fn test_promise_cancel_resets_pushed_stream() {
    let server = push_server();

    let agent = Agent::new(AgentOptions::default());
    let request = agent.request(options(server.port())).unwrap();

    let (promise_tx, promise_rx) = channel();
    let promise_tx = Mutex::new(promise_tx);
    request.on_push(move |promise| {
        promise_tx.lock().unwrap().send(promise).unwrap();
    });
    request.end().unwrap();

    let mut response = request.response().unwrap();
    let mut body = Vec::new();
    response.read_to_end(&mut body).unwrap();

    let promise = promise_rx.recv().unwrap();
    promise.cancel();

    server.close();
}
