mod common;

use common::Harness;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Echoes every connection until the peer closes; reports each accept.
async fn spawn_echo_server() -> (String, mpsc::UnboundedReceiver<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let _ = accepted_tx.send(());
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    (addr, accepted_rx)
}

#[tokio::test]
async fn test_tcp_echo_with_half_close() {
    let (addr, mut accepted) = spawn_echo_server().await;
    let mut harness = Harness::start(&addr);

    harness.push_tcp("tcp-1", b"hello ");
    harness.push_tcp("tcp-1", b"world");
    let echoed = harness.collect_tcp("tcp-1", 11).await;
    assert_eq!(echoed, b"hello world");
    accepted.recv().await.unwrap();

    // Close from the public side, then reuse the id: a fresh local
    // connection is dialed.
    harness.push_tcp("tcp-1", b"");
    harness.push_tcp("tcp-1", b"again");
    let echoed = harness.collect_tcp("tcp-1", 5).await;
    assert_eq!(echoed, b"again");
    accepted.recv().await.unwrap();

    harness.shutdown().await;
}

#[tokio::test]
async fn test_local_close_is_signalled() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        stream.write_all(b"bye").await.unwrap();
    });

    let mut harness = Harness::start(&addr);
    harness.push_tcp("tcp-2", b"hello");
    let data = harness.collect_tcp_until_close("tcp-2").await;
    assert_eq!(data, b"bye");
    harness.shutdown().await;
}

#[tokio::test]
async fn test_close_for_unknown_id_is_ignored() {
    let (addr, mut accepted) = spawn_echo_server().await;
    let mut harness = Harness::start(&addr);

    harness.push_tcp("ghost", b"");
    harness.push_tcp("tcp-3", b"ping");
    let echoed = harness.collect_tcp("tcp-3", 4).await;
    assert_eq!(echoed, b"ping");
    accepted.recv().await.unwrap();
    assert!(accepted.try_recv().is_err());

    harness.shutdown().await;
}
