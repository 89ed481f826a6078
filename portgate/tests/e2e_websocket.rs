mod common;

use std::time::Duration;

use common::{Frame, Harness, header, request};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

/// A local WebSocket server that greets right after the handshake and then
/// echoes text messages.
async fn spawn_ws_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        ws.send(Message::Text("hello".into())).await.unwrap();
        while let Some(Ok(message)) = ws.next().await {
            if message.is_text() {
                if ws.send(message).await.is_err() {
                    break;
                }
            }
        }
    });
    addr
}

/// A masked client text frame, as a browser would send it.
fn client_text_frame(text: &str) -> Vec<u8> {
    let mask = [0x11u8, 0x22, 0x33, 0x44];
    let payload = text.as_bytes();
    assert!(payload.len() < 126);
    let mut frame = vec![0x81, 0x80 | payload.len() as u8];
    frame.extend_from_slice(&mask);
    frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
    frame
}

fn upgrade_request() -> portgate::transport::message::HttpRequest {
    request(
        "GET",
        "/socket",
        &[
            ("Host", "demo.example.com"),
            ("Upgrade", "websocket"),
            ("Connection", "keep-alive, Upgrade"),
            ("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ=="),
            ("Sec-WebSocket-Version", "13"),
        ],
        b"",
    )
}

#[tokio::test]
async fn test_websocket_upgrade_and_bridge() {
    let addr = spawn_ws_server().await;
    let mut harness = Harness::start(&addr);
    harness.push_http("ws-1", upgrade_request());

    match harness.next_frame().await {
        Frame::Http {
            request_id,
            response,
            end_of_stream,
        } => {
            assert_eq!(request_id, "ws-1");
            assert_eq!(response.status_code, 101);
            assert!(!end_of_stream);
            assert_eq!(
                header(&response, "sec-websocket-accept"),
                Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
            );
        }
        other => panic!("unexpected frame {other:?}"),
    }
    assert_eq!(harness.state.ws_count().await, 1);

    // The greeting was written right after the 101 and must not be lost.
    let greeting = harness.collect_tcp("ws-1", 7).await;
    assert_eq!(greeting, b"\x81\x05hello");

    harness.push_tcp("ws-1", &client_text_frame("hi"));
    let echo = harness.collect_tcp("ws-1", 4).await;
    assert_eq!(echo, b"\x81\x02hi");

    // Closing the public side shuts the local write half; the server then
    // drops the socket and the bridge reports the close.
    harness.push_tcp("ws-1", b"");
    let rest = harness.collect_tcp_until_close("ws-1").await;
    assert!(rest.len() <= 4, "unexpected trailing bytes {rest:?}");

    for _ in 0..50 {
        if harness.state.ws_count().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(harness.state.ws_count().await, 0);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_refused_upgrade_is_relayed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let _ = stream.read(&mut buf).await.unwrap();
        stream
            .write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
    });

    let mut harness = Harness::start(&addr);
    harness.push_http("ws-2", upgrade_request());
    match harness.next_frame().await {
        Frame::Http {
            response,
            end_of_stream,
            ..
        } => {
            assert_eq!(response.status_code, 403);
            assert!(end_of_stream);
        }
        other => panic!("unexpected frame {other:?}"),
    }
    assert_eq!(harness.state.ws_count().await, 0);
    harness.shutdown().await;
}
