use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::TryStreamExt;
use http::header::{CONTENT_LENGTH, HeaderName, HeaderValue};
use http::{Method, Request, Uri};
use http_body_util::{BodyDataStream, BodyExt, Full};
use hyper::body::Body as _;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::debug;

use super::websocket::{UpgradedConn, forward_websocket_upgrade};
use crate::config::PoolConfig;
use crate::error::Result;
use crate::pool::conn::tcp_factory;
use crate::pool::{AdaptiveBufferPool, ConnPool, PoolMetrics, PooledConn};
use crate::transport::message::{HttpRequest, HttpResponse, headers_to_wire};

/// Largest body slice carried by one response frame.
pub const CHUNK_SIZE: usize = 4 * 1024 * 1024;
pub const LOCAL_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection-scoped headers that describe the hop to the server, not the
/// hop to the local listener.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// What a forwarded exchange produced, for logging and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardSummary {
    pub status: u16,
    pub body_bytes: u64,
}

// =============================================================================
// Local connections
// =============================================================================

enum LocalStream {
    Direct(TcpStream),
    Pooled(PooledConn),
}

impl AsyncRead for LocalStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            LocalStream::Direct(stream) => Pin::new(stream).poll_read(cx, buf),
            LocalStream::Pooled(conn) => Pin::new(conn).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for LocalStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            LocalStream::Direct(stream) => Pin::new(stream).poll_write(cx, buf),
            LocalStream::Pooled(conn) => Pin::new(conn).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            LocalStream::Direct(stream) => Pin::new(stream).poll_flush(cx),
            LocalStream::Pooled(conn) => Pin::new(conn).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            LocalStream::Direct(stream) => Pin::new(stream).poll_shutdown(cx),
            LocalStream::Pooled(conn) => Pin::new(conn).poll_shutdown(cx),
        }
    }
}

/// Socket handed to the HTTP client.
pub struct LocalIo {
    inner: TokioIo<LocalStream>,
}

impl hyper::rt::Read for LocalIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        hyper::rt::Read::poll_read(Pin::new(&mut self.get_mut().inner), cx, buf)
    }
}

impl hyper::rt::Write for LocalIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        hyper::rt::Write::poll_write(Pin::new(&mut self.get_mut().inner), cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        hyper::rt::Write::poll_flush(Pin::new(&mut self.get_mut().inner), cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        hyper::rt::Write::poll_shutdown(Pin::new(&mut self.get_mut().inner), cx)
    }
}

impl Connection for LocalIo {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

/// Dialer plugged into the HTTP client: the pool when one is configured,
/// a plain TCP dial otherwise.
#[derive(Clone)]
enum LocalConnector {
    Direct {
        addr: Arc<str>,
        timeout: Duration,
    },
    Pooled {
        pool: ConnPool,
        cancel: CancellationToken,
    },
}

impl Service<Uri> for LocalConnector {
    type Response = LocalIo;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = io::Result<LocalIo>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _uri: Uri) -> Self::Future {
        let connector = self.clone();
        Box::pin(async move {
            let stream = match connector {
                LocalConnector::Direct { addr, timeout } => {
                    let stream = tokio::time::timeout(timeout, TcpStream::connect(&*addr))
                        .await
                        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial timed out"))??;
                    stream.set_nodelay(true)?;
                    LocalStream::Direct(stream)
                }
                LocalConnector::Pooled { pool, cancel } => {
                    LocalStream::Pooled(pool.get(&cancel).await.map_err(io::Error::other)?)
                }
            };
            Ok(LocalIo {
                inner: TokioIo::new(stream),
            })
        })
    }
}

// =============================================================================
// Forwarder
// =============================================================================

struct Inner {
    local_addr: String,
    client: Client<LocalConnector, Full<Bytes>>,
    pool: Option<ConnPool>,
    buffers: AdaptiveBufferPool,
    shutdown: CancellationToken,
}

/// Forwards inbound HTTP requests to the local listener. Cloning shares the
/// client and its connections.
#[derive(Clone)]
pub struct HttpForwarder {
    inner: Arc<Inner>,
}

impl HttpForwarder {
    /// Builds the forwarder; when the pool is enabled but cannot be created,
    /// falls back to direct dials.
    pub fn new(local_addr: &str, pool_config: &PoolConfig, buffers: AdaptiveBufferPool) -> Self {
        let shutdown = CancellationToken::new();
        let pool = if pool_config.enabled {
            let factory = tcp_factory(local_addr.to_string(), pool_config.dial_timeout);
            match ConnPool::new(local_addr, pool_config.clone(), factory) {
                Ok(pool) => Some(pool),
                Err(e) => {
                    debug!("Connection pool unavailable, dialing directly: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let mut builder = Client::builder(TokioExecutor::new());
        let connector = match &pool {
            Some(pool) => {
                // The pool owns idle sockets; the client must not keep its own.
                builder.pool_max_idle_per_host(0);
                LocalConnector::Pooled {
                    pool: pool.clone(),
                    cancel: shutdown.clone(),
                }
            }
            None => LocalConnector::Direct {
                addr: Arc::from(local_addr),
                timeout: LOCAL_DIAL_TIMEOUT,
            },
        };

        Self {
            inner: Arc::new(Inner {
                local_addr: local_addr.to_string(),
                client: builder.build(connector),
                pool,
                buffers,
                shutdown,
            }),
        }
    }

    pub fn local_addr(&self) -> &str {
        &self.inner.local_addr
    }

    pub fn pool_metrics(&self) -> Option<PoolMetrics> {
        self.inner.pool.as_ref().map(ConnPool::metrics)
    }

    fn build_request(&self, request: &HttpRequest) -> Result<Request<Full<Bytes>>> {
        let method = if request.method.is_empty() {
            Method::GET
        } else {
            Method::from_bytes(request.method.as_bytes()).map_err(http::Error::from)?
        };
        let uri: Uri = format!("http://{}{}", self.inner.local_addr, request.path_and_query())
            .parse()
            .map_err(http::Error::from)?;

        let mut out = Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(request.body.clone()))?;

        let headers = out.headers_mut();
        for (name, values) in &request.headers {
            if HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)) {
                continue;
            }
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(http::Error::from)?;
            for value in &values.values {
                let value = HeaderValue::from_bytes(value.as_bytes()).map_err(http::Error::from)?;
                headers.append(name.clone(), value);
            }
        }
        if !request.remote_addr.is_empty() {
            let value =
                HeaderValue::from_bytes(request.remote_addr.as_bytes()).map_err(http::Error::from)?;
            headers.insert(HeaderName::from_static("x-forwarded-for"), value);
        }
        Ok(out)
    }

    /// Performs the request and returns the complete response.
    pub async fn forward(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let response = self.inner.client.request(self.build_request(request)?).await?;
        let (parts, body) = response.into_parts();
        let body = body.collect().await?.to_bytes();
        Ok(HttpResponse {
            status_code: i32::from(parts.status.as_u16()),
            headers: headers_to_wire(&parts.headers),
            body,
        })
    }

    /// Performs the request and streams the response through `send_chunk`.
    ///
    /// Status and headers leave on the first frame as soon as the response
    /// head arrives; that frame carries no body unless the body is empty.
    /// Every read of the body then becomes one frame of at most
    /// [`CHUNK_SIZE`] bytes. The flag marks the last frame: the one that
    /// completes a declared `Content-Length`, or an empty frame at EOF.
    pub async fn forward_chunked<F, Fut>(
        &self,
        request: &HttpRequest,
        mut send_chunk: F,
    ) -> Result<ForwardSummary>
    where
        F: FnMut(HttpResponse, bool) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let response = self.inner.client.request(self.build_request(request)?).await?;
        let (parts, body) = response.into_parts();
        let status = parts.status.as_u16();
        let content_length = parts
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let head = HttpResponse {
            status_code: i32::from(status),
            headers: headers_to_wire(&parts.headers),
            body: Bytes::new(),
        };
        if body.is_end_stream() || content_length == Some(0) {
            send_chunk(head, true).await?;
            return Ok(ForwardSummary {
                status,
                body_bytes: 0,
            });
        }
        send_chunk(head, false).await?;

        let reader = StreamReader::new(BodyDataStream::new(body).map_err(io::Error::other));
        tokio::pin!(reader);

        let mut buf = self.inner.buffers.get_for_content_length(content_length);
        let mut body_bytes = 0u64;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            for slice in buf[..n].chunks(CHUNK_SIZE) {
                body_bytes += slice.len() as u64;
                let complete = content_length == Some(body_bytes);
                send_chunk(body_frame(Bytes::copy_from_slice(slice)), complete).await?;
                if complete {
                    buf.release();
                    return Ok(ForwardSummary { status, body_bytes });
                }
            }
        }
        buf.release();

        send_chunk(body_frame(Bytes::new()), true).await?;
        Ok(ForwardSummary { status, body_bytes })
    }

    /// Relays an upgrade request over a fresh raw socket.
    pub async fn forward_websocket_upgrade(
        &self,
        request: &HttpRequest,
    ) -> Result<(HttpResponse, UpgradedConn)> {
        forward_websocket_upgrade(&self.inner.local_addr, request).await
    }

    /// Stops pool waiters and closes the pool. Idempotent.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
        if let Some(pool) = &self.inner.pool {
            pool.close();
        }
    }
}

/// Continuation frame: body only, no status or headers.
fn body_frame(body: Bytes) -> HttpResponse {
    HttpResponse {
        status_code: 0,
        headers: HashMap::new(),
        body,
    }
}

/// `Upgrade: websocket` together with a `Connection` header mentioning
/// `upgrade`, both matched case-insensitively.
pub fn is_websocket_upgrade(request: &HttpRequest) -> bool {
    let upgrade = request
        .header_values("upgrade")
        .any(|v| v.trim().eq_ignore_ascii_case("websocket"));
    let connection = request
        .header_values("connection")
        .any(|v| v.to_ascii_lowercase().contains("upgrade"));
    upgrade && connection
}
