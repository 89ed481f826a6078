//! Per-request task for inbound HTTP requests, including the WebSocket
//! bridge that follows a successful upgrade.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Protocol;
use crate::error::{Error, Result};
use crate::event::{Event, EventBus, Metrics, unix_millis};
use crate::forward::{HttpForwarder, UpgradedConn, is_websocket_upgrade};
use crate::pool::{AdaptiveBufferPool, BufferTier};
use crate::session::{FrameSender, SessionState};
use crate::transport::message::{HttpRequest, HttpResponse};

/// Inbound frames that may queue for one WebSocket before delivery stalls.
pub const WS_INBOUND_CAPACITY: usize = 100;

/// Everything a request task needs. Cheap to clone.
#[derive(Clone)]
pub struct HttpHandler {
    pub forwarder: HttpForwarder,
    pub sender: FrameSender,
    pub state: Arc<SessionState>,
    pub buffers: AdaptiveBufferPool,
    pub events: EventBus,
    pub metrics: Arc<Metrics>,
    pub protocol: Protocol,
    pub max_body_capture: usize,
    pub ws_idle_timeout: Duration,
}

/// Copy of a body for the event feed, dropped once it exceeds the limit.
struct BodyCapture {
    limit: usize,
    data: Vec<u8>,
    overflow: bool,
}

impl BodyCapture {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            data: Vec::new(),
            overflow: limit == 0,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        if self.overflow {
            return;
        }
        if self.data.len() + chunk.len() > self.limit {
            self.overflow = true;
            self.data = Vec::new();
            return;
        }
        self.data.extend_from_slice(chunk);
    }

    fn into_string(self) -> Option<String> {
        if self.overflow || self.data.is_empty() {
            return None;
        }
        Some(String::from_utf8_lossy(&self.data).into_owned())
    }
}

struct Outcome {
    status: u16,
    bytes_in: u64,
    bytes_out: u64,
    response_body: Option<String>,
    error: Option<String>,
}

impl HttpHandler {
    pub async fn handle(&self, request_id: String, request: HttpRequest, cancel: CancellationToken) {
        let started = Instant::now();
        let upgrade = is_websocket_upgrade(&request);
        self.metrics.request_started();
        self.events.publish(Event::RequestStarted {
            request_id: request_id.clone(),
            protocol: if upgrade {
                "websocket".to_string()
            } else {
                self.protocol.to_string()
            },
            method: request.method.clone(),
            path: request.path_and_query(),
            remote_addr: request.remote_addr.clone(),
            timestamp: unix_millis(),
        });

        let outcome = if upgrade {
            self.handle_upgrade(&request_id, &request, &cancel).await
        } else {
            self.handle_plain(&request_id, &request, &cancel).await
        };

        let mut request_capture = BodyCapture::new(self.max_body_capture);
        request_capture.push(&request.body);
        self.metrics
            .request_finished(outcome.error.is_some(), outcome.bytes_in, outcome.bytes_out);
        self.events.publish(Event::RequestCompleted {
            request_id,
            status: outcome.status,
            bytes_in: outcome.bytes_in,
            bytes_out: outcome.bytes_out,
            duration_ms: started.elapsed().as_millis() as u64,
            request_body: request_capture.into_string(),
            response_body: outcome.response_body,
            error: outcome.error,
        });
    }

    async fn handle_plain(
        &self,
        request_id: &str,
        request: &HttpRequest,
        cancel: &CancellationToken,
    ) -> Outcome {
        let mut capture = BodyCapture::new(self.max_body_capture);
        let forwarded = {
            let send = |frame: HttpResponse, last: bool| {
                capture.push(&frame.body);
                let sender = self.sender.clone();
                let request_id = request_id.to_string();
                async move { sender.send_http(&request_id, frame, last).await }
            };
            tokio::select! {
                _ = cancel.cancelled() => Err(Error::Cancelled),
                forwarded = self.forwarder.forward_chunked(request, send) => forwarded,
            }
        };

        let bytes_in = request.body.len() as u64;
        match forwarded {
            Ok(summary) => {
                info!(
                    "Request {}: {} {} -> {}",
                    request_id,
                    request.method,
                    request.path_and_query(),
                    summary.status
                );
                Outcome {
                    status: summary.status,
                    bytes_in,
                    bytes_out: summary.body_bytes,
                    response_body: capture.into_string(),
                    error: None,
                }
            }
            Err(e) => {
                self.report_failure(request_id, request, &e).await;
                Outcome {
                    status: 0,
                    bytes_in,
                    bytes_out: 0,
                    response_body: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn report_failure(&self, request_id: &str, request: &HttpRequest, error: &Error) {
        match error {
            Error::Cancelled | Error::SendClosed => {
                debug!("Request {}: abandoned ({})", request_id, error);
            }
            _ => {
                warn!(
                    "Request {}: {} {} failed: {}",
                    request_id,
                    request.method,
                    request.path_and_query(),
                    error
                );
                let _ = self
                    .sender
                    .send_error(request_id, error.frame_code(), error.to_string())
                    .await;
            }
        }
    }

    async fn handle_upgrade(
        &self,
        request_id: &str,
        request: &HttpRequest,
        cancel: &CancellationToken,
    ) -> Outcome {
        let upgraded = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            upgraded = self.forwarder.forward_websocket_upgrade(request) => upgraded,
        };
        let (response, conn) = match upgraded {
            Ok(upgraded) => upgraded,
            Err(e) => {
                self.report_failure(request_id, request, &e).await;
                return Outcome {
                    status: 0,
                    bytes_in: 0,
                    bytes_out: 0,
                    response_body: None,
                    error: Some(e.to_string()),
                };
            }
        };

        let status = u16::try_from(response.status_code).unwrap_or_default();
        if status != 101 {
            info!(
                "Request {}: upgrade {} refused -> {}",
                request_id,
                request.path_and_query(),
                status
            );
            let error = self
                .sender
                .send_http(request_id, response, true)
                .await
                .err()
                .map(|e| e.to_string());
            return Outcome {
                status,
                bytes_in: 0,
                bytes_out: 0,
                response_body: None,
                error,
            };
        }

        // Route inbound frames to this socket before the server learns about
        // the upgrade, so none of them can reach the TCP forwarder.
        let (tx, rx) = mpsc::channel(WS_INBOUND_CAPACITY);
        self.state.register_ws(request_id, tx).await;
        if let Err(e) = self.sender.send_http(request_id, response, false).await {
            self.state.unregister_ws(request_id).await;
            return Outcome {
                status,
                bytes_in: 0,
                bytes_out: 0,
                response_body: None,
                error: Some(e.to_string()),
            };
        }

        info!("WebSocket {}: upgraded {}", request_id, request.path_and_query());
        self.metrics.ws_opened();
        let (bytes_in, bytes_out) = self.bridge(request_id, conn, rx, cancel).await;
        self.state.unregister_ws(request_id).await;
        self.metrics.ws_closed();
        info!(
            "WebSocket {}: closed ({} bytes in, {} bytes out)",
            request_id, bytes_in, bytes_out
        );

        Outcome {
            status,
            bytes_in,
            bytes_out,
            response_body: None,
            error: None,
        }
    }

    /// Pumps bytes both ways until both sides are done, the session ends,
    /// or nothing moves for `ws_idle_timeout`. Returns (in, out) byte counts.
    async fn bridge(
        &self,
        request_id: &str,
        conn: UpgradedConn,
        mut inbound: mpsc::Receiver<Bytes>,
        cancel: &CancellationToken,
    ) -> (u64, u64) {
        let (mut reader, mut writer) = tokio::io::split(conn);
        let mut buf = self.buffers.get(BufferTier::Small);
        let idle = tokio::time::sleep(self.ws_idle_timeout);
        tokio::pin!(idle);

        let mut local_done = false;
        let mut remote_done = false;
        let mut bytes_in = 0u64;
        let mut bytes_out = 0u64;

        while !(local_done && remote_done) {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = &mut idle => {
                    debug!("WebSocket {}: idle timeout", request_id);
                    break;
                }
                read = reader.read(&mut buf), if !local_done => match read {
                    Ok(n) if n > 0 => {
                        bytes_out += n as u64;
                        idle.as_mut().reset(Instant::now() + self.ws_idle_timeout);
                        let data = Bytes::copy_from_slice(&buf[..n]);
                        if self.sender.send_tcp(request_id, data).await.is_err() {
                            break;
                        }
                    }
                    _ => {
                        local_done = true;
                        if self.sender.send_tcp(request_id, Bytes::new()).await.is_err() {
                            break;
                        }
                    }
                },
                frame = inbound.recv(), if !remote_done => match frame {
                    Some(data) if data.is_empty() => {
                        remote_done = true;
                        let _ = writer.shutdown().await;
                    }
                    Some(data) => {
                        bytes_in += data.len() as u64;
                        idle.as_mut().reset(Instant::now() + self.ws_idle_timeout);
                        if writer.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        buf.release();
        (bytes_in, bytes_out)
    }
}

/// Delivers an inbound segment to a WebSocket bridge, giving up after
/// `timeout` when its queue stays full.
pub async fn deliver_ws_frame(
    tx: &mpsc::Sender<Bytes>,
    request_id: &str,
    data: Bytes,
    timeout: Duration,
) -> Result<()> {
    match tx.send_timeout(data, timeout).await {
        Ok(()) => Ok(()),
        Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
            warn!("WebSocket {}: inbound queue full, dropping frame", request_id);
            Ok(())
        }
        Err(mpsc::error::SendTimeoutError::Closed(_)) => {
            Err(Error::ConnectionClosed(request_id.to_string()))
        }
    }
}
