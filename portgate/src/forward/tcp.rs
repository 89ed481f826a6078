use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::event::Metrics;
use crate::pool::{AdaptiveBufferPool, BufferTier};
use crate::session::FrameSender;

pub const TCP_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

struct WriteSide {
    half: Option<OwnedWriteHalf>,
    closed: bool,
    read_loop_started: bool,
}

/// One persistent local socket, bound to a request id.
pub struct TcpConnection {
    request_id: String,
    reader: StdMutex<Option<OwnedReadHalf>>,
    writer: Mutex<WriteSide>,
    shutdown: CancellationToken,
}

impl TcpConnection {
    fn new(request_id: &str, stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            request_id: request_id.to_string(),
            reader: StdMutex::new(Some(reader)),
            writer: Mutex::new(WriteSide {
                half: Some(writer),
                closed: false,
                read_loop_started: false,
            }),
            shutdown: CancellationToken::new(),
        }
    }

    fn take_reader(&self) -> Option<OwnedReadHalf> {
        self.reader
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    /// Stops the read loop and drops both halves of the socket.
    async fn close(&self) {
        self.shutdown.cancel();
        drop(self.take_reader());
        let mut writer = self.writer.lock().await;
        writer.closed = true;
        if let Some(mut half) = writer.half.take() {
            let _ = half.shutdown().await;
        }
    }
}

struct Inner {
    local_addr: String,
    connections: DashMap<String, Arc<TcpConnection>>,
    buffers: AdaptiveBufferPool,
    metrics: Arc<Metrics>,
    closed: AtomicBool,
}

/// Ferries TCP segments between the proxy stream and per-request local
/// sockets. One forwarder lives for one session.
#[derive(Clone)]
pub struct TcpForwarder {
    inner: Arc<Inner>,
}

impl TcpForwarder {
    pub fn new(local_addr: &str, buffers: AdaptiveBufferPool, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Arc::new(Inner {
                local_addr: local_addr.to_string(),
                connections: DashMap::new(),
                buffers,
                metrics,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn has_connection(&self, request_id: &str) -> bool {
        self.inner.connections.contains_key(request_id)
    }

    /// Writes one inbound segment to the local socket for `request_id`,
    /// dialing it first if needed. Returns `true` exactly once per
    /// connection: the caller must then run [`TcpForwarder::start_read_loop`].
    ///
    /// An empty segment closes the connection and is a no-op for unknown ids.
    pub async fn forward(&self, request_id: &str, data: Bytes) -> Result<bool> {
        if data.is_empty() {
            debug!("TCP {}: close requested by remote", request_id);
            self.close_connection(request_id).await;
            return Ok(false);
        }
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed(request_id.to_string()));
        }

        let existing = self
            .inner
            .connections
            .get(request_id)
            .map(|entry| entry.value().clone());
        let (conn, is_new) = match existing {
            Some(conn) => (conn, false),
            None => self.dial(request_id).await?,
        };

        let mut writer = conn.writer.lock().await;
        if writer.closed {
            return Err(Error::ConnectionClosed(request_id.to_string()));
        }
        let Some(half) = writer.half.as_mut() else {
            return Err(Error::ConnectionClosed(request_id.to_string()));
        };
        if let Err(e) = half.write_all(&data).await {
            drop(writer);
            warn!("TCP {}: local write failed: {}", request_id, e);
            self.remove_if_same(request_id, &conn).await;
            return Err(Error::LocalIo(e));
        }
        self.inner.metrics.add_bytes(data.len() as u64, 0);

        if is_new && !writer.read_loop_started {
            writer.read_loop_started = true;
            return Ok(true);
        }
        Ok(false)
    }

    async fn dial(&self, request_id: &str) -> Result<(Arc<TcpConnection>, bool)> {
        let addr = &self.inner.local_addr;
        let stream = match tokio::time::timeout(TCP_DIAL_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(Error::LocalDial {
                    addr: addr.clone(),
                    source,
                });
            }
            Err(_) => {
                return Err(Error::LocalDial {
                    addr: addr.clone(),
                    source: std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timed out"),
                });
            }
        };
        let _ = stream.set_nodelay(true);

        let conn = Arc::new(TcpConnection::new(request_id, stream));
        match self.inner.connections.entry(request_id.to_string()) {
            Entry::Occupied(entry) => Ok((entry.get().clone(), false)),
            Entry::Vacant(entry) => {
                entry.insert(conn.clone());
                self.inner.metrics.tcp_opened();
                info!("TCP {}: connected to {}", request_id, addr);
                Ok((conn, true))
            }
        }
    }

    /// Pumps bytes from the local socket to the proxy stream until EOF, an
    /// error, a send failure, or cancellation. Each segment carries a copy of
    /// the bytes read; EOF and read errors end with an empty segment.
    pub async fn start_read_loop(
        &self,
        request_id: &str,
        sender: FrameSender,
        cancel: CancellationToken,
    ) {
        let Some(conn) = self
            .inner
            .connections
            .get(request_id)
            .map(|entry| entry.value().clone())
        else {
            return;
        };
        let Some(mut reader) = conn.take_reader() else {
            return;
        };

        let mut buf = self.inner.buffers.get(BufferTier::Small);
        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = conn.shutdown.cancelled() => break,
                read = reader.read(&mut buf) => read,
            };
            match read {
                Ok(0) => {
                    debug!("TCP {}: local EOF", request_id);
                    let _ = sender.send_tcp(request_id, Bytes::new()).await;
                    break;
                }
                Ok(n) => {
                    self.inner.metrics.add_bytes(0, n as u64);
                    let data = Bytes::copy_from_slice(&buf[..n]);
                    if let Err(e) = sender.send_tcp(request_id, data).await {
                        debug!("TCP {}: send failed: {}", request_id, e);
                        break;
                    }
                }
                Err(e) => {
                    debug!("TCP {}: local read failed: {}", request_id, e);
                    let _ = sender.send_tcp(request_id, Bytes::new()).await;
                    break;
                }
            }
        }
        buf.release();
        drop(reader);
        self.remove_if_same(request_id, &conn).await;
    }

    /// Closes and forgets the connection for `request_id`, if any.
    pub async fn close_connection(&self, request_id: &str) {
        if let Some((_, conn)) = self.inner.connections.remove(request_id) {
            self.inner.metrics.tcp_closed();
            conn.close().await;
            info!("TCP {}: closed", conn.request_id);
        }
    }

    async fn remove_if_same(&self, request_id: &str, conn: &Arc<TcpConnection>) {
        let removed = self
            .inner
            .connections
            .remove_if(request_id, |_, current| Arc::ptr_eq(current, conn));
        if removed.is_some() {
            self.inner.metrics.tcp_closed();
            info!("TCP {}: closed", request_id);
        }
        conn.close().await;
    }

    /// Closes every connection. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let ids: Vec<String> = self
            .inner
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for id in ids {
            self.close_connection(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;
    use tokio::net::TcpListener;
    use tokio_stream::wrappers::ReceiverStream;

    use super::*;
    use crate::session::outbound;
    use crate::transport::message::{ProxyMessage, proxy_message, proxy_response};

    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    fn forwarder(addr: &str) -> TcpForwarder {
        TcpForwarder::new(addr, AdaptiveBufferPool::new(), Arc::default())
    }

    fn segment(frame: ProxyMessage) -> (String, Bytes) {
        let Some(proxy_message::Message::Response(response)) = frame.message else {
            panic!("expected response");
        };
        let Some(proxy_response::Payload::Tcp(segment)) = response.payload else {
            panic!("expected tcp payload");
        };
        (response.request_id, segment.data)
    }

    async fn next_segment(stream: &mut ReceiverStream<ProxyMessage>) -> (String, Bytes) {
        let frame = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap();
        segment(frame)
    }

    #[tokio::test]
    async fn test_empty_segment_for_unknown_id_is_noop() {
        let tcp = forwarder("127.0.0.1:1");
        assert!(!tcp.forward("nobody", Bytes::new()).await.unwrap());
        assert_eq!(tcp.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_first_segment_requests_read_loop_once() {
        let addr = echo_server().await;
        let tcp = forwarder(&addr);
        assert!(tcp.forward("r1", Bytes::from_static(b"a")).await.unwrap());
        assert!(!tcp.forward("r1", Bytes::from_static(b"b")).await.unwrap());
        assert_eq!(tcp.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_segments_share_one_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (received_tx, mut received) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let received_tx = received_tx.clone();
                tokio::spawn(async move {
                    let mut data = Vec::new();
                    let _ = stream.read_to_end(&mut data).await;
                    let _ = received_tx.send(data);
                });
            }
        });

        let tcp = forwarder(&addr);
        let (first, second) = tokio::join!(
            tcp.forward("r5", Bytes::from_static(b"aaa")),
            tcp.forward("r5", Bytes::from_static(b"bbb")),
        );
        let started = [first.unwrap(), second.unwrap()];
        assert_eq!(started.iter().filter(|s| **s).count(), 1);
        assert_eq!(tcp.connection_count(), 1);

        tcp.close_connection("r5").await;
        // The losing dial is dropped unused; both segments reach the winner.
        let mut payloads = Vec::new();
        while payloads.iter().map(Vec::len).sum::<usize>() < 6 {
            let data = tokio::time::timeout(Duration::from_secs(5), received.recv())
                .await
                .unwrap()
                .unwrap();
            if !data.is_empty() {
                payloads.push(data);
            }
        }
        assert_eq!(payloads.len(), 1);
        let mut data = payloads.remove(0);
        data.sort_unstable();
        assert_eq!(data, b"aaabbb");
    }

    #[tokio::test]
    async fn test_echo_roundtrip() {
        let addr = echo_server().await;
        let tcp = forwarder(&addr);
        let (sender, mut stream) = outbound::channel(16, "t1");

        assert!(tcp.forward("r2", Bytes::from_static(b"ping")).await.unwrap());
        let reader = {
            let tcp = tcp.clone();
            tokio::spawn(async move {
                tcp.start_read_loop("r2", sender, CancellationToken::new())
                    .await
            })
        };

        let (id, data) = next_segment(&mut stream).await;
        assert_eq!(id, "r2");
        assert_eq!(&data[..], b"ping");

        tcp.close_connection("r2").await;
        reader.await.unwrap();
        assert!(!tcp.has_connection("r2"));
    }

    #[tokio::test]
    async fn test_close_then_reopen_creates_new_connection() {
        let addr = echo_server().await;
        let tcp = forwarder(&addr);
        assert!(tcp.forward("r3", Bytes::from_static(b"x")).await.unwrap());
        assert!(!tcp.forward("r3", Bytes::new()).await.unwrap());
        assert!(!tcp.has_connection("r3"));
        assert!(tcp.forward("r3", Bytes::from_static(b"y")).await.unwrap());
    }

    #[tokio::test]
    async fn test_local_eof_sends_close_signal_and_removes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let tcp = forwarder(&addr);
        let (sender, mut stream) = outbound::channel(16, "t1");
        assert!(tcp.forward("r2", Bytes::from_static(b"ping")).await.unwrap());
        let reader = {
            let tcp = tcp.clone();
            tokio::spawn(async move {
                tcp.start_read_loop("r2", sender, CancellationToken::new())
                    .await
            })
        };

        assert_eq!(&next_segment(&mut stream).await.1[..], b"ping");
        let (id, data) = next_segment(&mut stream).await;
        assert_eq!(id, "r2");
        assert!(data.is_empty());
        reader.await.unwrap();
        assert!(!tcp.has_connection("r2"));
    }

    #[tokio::test]
    async fn test_dial_failure_is_local_dial() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let tcp = forwarder(&addr);
        let err = tcp.forward("r4", Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, Error::LocalDial { .. }));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let addr = echo_server().await;
        let tcp = forwarder(&addr);
        tcp.forward("a", Bytes::from_static(b"1")).await.unwrap();
        tcp.forward("b", Bytes::from_static(b"2")).await.unwrap();

        tcp.close().await;
        tcp.close().await;
        assert_eq!(tcp.connection_count(), 0);
        assert!(tcp.forward("c", Bytes::from_static(b"3")).await.is_err());
    }
}
