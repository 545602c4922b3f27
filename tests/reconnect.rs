//! Reconnect scheduler behavior: capped retries, delay growth, counter
//! reset, and clean-close suppression.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use rmpv::Value;
use swill::codec::{decode_request, encode_response};
use swill::protocol::ResponseFrame;
use swill::{Client, ClientConfig, ClientStatus, ReconnectPolicy};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

fn fast_policy(retries: u32) -> ClientConfig {
    ClientConfig {
        connect_timeout: Duration::from_secs(2),
        reconnect: ReconnectPolicy {
            base_delay: Duration::from_millis(100),
            backoff_factor: 1.0,
            min_jitter: Duration::ZERO,
            max_jitter: Duration::ZERO,
            retries,
        },
    }
}

/// Accept the upgrade, echoing the `swill/1` subprotocol.
async fn accept_swill(stream: TcpStream) -> WebSocketStream<TcpStream> {
    let callback = |_request: &Request, mut response: Response| {
        response.headers_mut().append(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static("swill/1"),
        );
        Ok(response)
    };
    tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .unwrap()
}

/// Handshake, then hard-drop the TCP stream: the client observes an
/// abnormal closure (1006) and becomes reconnect-eligible.
async fn accept_and_drop(listener: &TcpListener) {
    let (stream, _) = listener.accept().await.unwrap();
    let ws = accept_swill(stream).await;
    drop(ws);
}

/// Handshake, then answer `add` requests with a constant.
async fn accept_and_serve_add(listener: &TcpListener) {
    let (stream, _) = listener.accept().await.unwrap();
    let mut ws = accept_swill(stream).await;
    while let Some(Ok(message)) = ws.next().await {
        match message {
            Message::Binary(data) => {
                let frame = decode_request(&data).unwrap();
                assert_eq!(frame.method, "add");
                // Fresh connection, fresh sequence counter.
                assert_eq!(frame.seq, 1);
                let response = ResponseFrame::message(frame.seq, Value::from(3i64));
                let bytes = encode_response(&response).unwrap();
                ws.send(Message::Binary(bytes.into())).await.unwrap();
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

/// Retries are capped: once the server is gone, the client attempts
/// `retries` reconnects with linearly growing delays, then gives up.
#[tokio::test]
async fn test_retries_are_capped() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        accept_and_drop(&listener).await;
        // Dropping the listener refuses all reconnect attempts.
    });

    let started = Instant::now();
    let client = Client::connect_with(format!("ws://{addr}"), fast_policy(3))
        .await
        .unwrap();
    server.await.unwrap();

    let mut status = client.status_stream();
    loop {
        if *status.borrow() == ClientStatus::Disconnected {
            break;
        }
        status.changed().await.unwrap();
    }
    let elapsed = started.elapsed();

    // Three scheduled attempts at 100, 200, and 300 ms: at least 600 ms in
    // delays, and nowhere near a fourth cycle.
    assert!(elapsed >= Duration::from_millis(550), "gave up too fast: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "gave up too slow: {elapsed:?}");
}

/// A successful reconnect resets per-connection state: the next call runs
/// on a fresh connection with a fresh sequence counter.
#[tokio::test]
async fn test_reconnect_then_call() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        accept_and_drop(&listener).await;
        accept_and_serve_add(&listener).await;
    });

    let client = Client::connect_with(format!("ws://{addr}"), fast_policy(5))
        .await
        .unwrap();

    // Wait until the supervisor has replaced the dead connection: first
    // observe the drop, then the reconnect.
    let mut status = client.status_stream();
    while *status.borrow() != ClientStatus::Reconnecting {
        status.changed().await.unwrap();
    }
    while *status.borrow() != ClientStatus::Connected {
        status.changed().await.unwrap();
    }

    let sum: Option<i64> = client.call("add", &(1i64, 2i64)).await.unwrap();
    assert_eq!(sum, Some(3));

    // The serving task sees the request on a fresh sequence counter
    // (asserted inside accept_and_serve_add via the decoded frame).
    client.close().await;
    server.await.unwrap();
}

/// In-flight requests fail with ConnectionClosed when the transport drops.
#[tokio::test]
async fn test_inflight_requests_fail_on_disconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_swill(stream).await;
        // Swallow the request, then vanish.
        let _ = ws.next().await;
        drop(ws);
    });

    let client = Client::connect_with(format!("ws://{addr}"), fast_policy(1))
        .await
        .unwrap();

    let mut request = client
        .rpc::<Value, Value>(
            "never_answered",
            Some(&Value::Nil),
            swill::CallOptions::default(),
        )
        .await
        .unwrap();

    let result = request.receive().await;
    assert!(matches!(result, Err(swill::SwillError::ConnectionClosed)));
    server.await.unwrap();
}

/// A clean close (normal closure) does not engage the scheduler.
#[tokio::test]
async fn test_clean_close_does_not_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let reconnect_attempts = Arc::new(AtomicUsize::new(0));

    let attempts = reconnect_attempts.clone();
    tokio::spawn(async move {
        // First connection: close cleanly.
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_swill(stream).await;
        ws.close(None).await.unwrap();

        // Any further connection would be a scheduler bug.
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            attempts.fetch_add(1, Ordering::SeqCst);
            drop(stream);
        }
    });

    let client = Client::connect_with(format!("ws://{addr}"), fast_policy(3))
        .await
        .unwrap();

    let mut status = client.status_stream();
    loop {
        if *status.borrow() == ClientStatus::Disconnected {
            break;
        }
        status.changed().await.unwrap();
    }

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(reconnect_attempts.load(Ordering::SeqCst), 0);
}

/// Initial connect failures engage the scheduler too, and exhaust into an
/// error.
#[tokio::test]
async fn test_initial_connect_retries_then_fails() {
    // Nothing is listening here.
    let started = Instant::now();
    let result = Client::connect_with("ws://127.0.0.1:9", fast_policy(2)).await;
    let elapsed = started.elapsed();

    match result {
        Err(swill::SwillError::RetriesExhausted { attempts }) => assert_eq!(attempts, 3),
        Err(e) => panic!("expected retries exhausted, got {e}"),
        Ok(_) => panic!("expected failure"),
    }
    // Two scheduled retries: 100 + 200 ms of delay.
    assert!(elapsed >= Duration::from_millis(250));
}
