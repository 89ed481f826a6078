//! Routes inbound proxy-stream frames to request handlers.
//!
//! HTTP requests get a task each. TCP segments for a WebSocket bridge go to
//! that bridge's queue; all other TCP segments go through a per-id lane that
//! feeds the TCP forwarder in arrival order.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::forward::TcpForwarder;
use crate::handler::{HttpHandler, deliver_ws_frame};
use crate::transport::message::{
    ControlMessage, ControlType, ProxyMessage, proxy_message, proxy_request,
};

/// Segments that may queue for one TCP request id.
pub const LANE_CAPACITY: usize = 100;
/// How long the reader waits on a full lane or WebSocket queue before it
/// drops the segment.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

struct Lane {
    tx: mpsc::Sender<Bytes>,
    generation: u64,
}

struct Inner {
    handler: HttpHandler,
    tcp: TcpForwarder,
    lanes: DashMap<String, Lane>,
    next_generation: AtomicU64,
}

/// The stream demultiplexer for one session.
#[derive(Clone)]
pub struct Demux {
    inner: Arc<Inner>,
}

impl Demux {
    pub fn new(handler: HttpHandler, tcp: TcpForwarder) -> Self {
        Self {
            inner: Arc::new(Inner {
                handler,
                tcp,
                lanes: DashMap::new(),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn lane_count(&self) -> usize {
        self.inner.lanes.len()
    }

    /// Reads frames until the stream ends or `cancel` fires.
    ///
    /// Returns `Ok(())` on cancellation, [`Error::StreamEof`] when the server
    /// closes the stream and [`Error::StreamRecv`] on a receive error. None of
    /// these signal connection loss by themselves.
    pub async fn receive_loop<S>(&self, inbound: S, cancel: CancellationToken) -> Result<()>
    where
        S: Stream<Item = Result<ProxyMessage, Status>>,
    {
        let mut inbound = std::pin::pin!(inbound);
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                next = inbound.next() => next,
            };
            match next {
                Some(Ok(message)) => self.dispatch(message, &cancel).await,
                Some(Err(status)) => {
                    debug!("Proxy stream receive failed: {}", status);
                    return Err(Error::StreamRecv(status));
                }
                None => {
                    debug!("Proxy stream closed by server");
                    return Err(Error::StreamEof);
                }
            }
        }
    }

    async fn dispatch(&self, message: ProxyMessage, cancel: &CancellationToken) {
        match message.message {
            Some(proxy_message::Message::Request(request)) => match request.payload {
                Some(proxy_request::Payload::Http(http)) => {
                    let handler = self.inner.handler.clone();
                    let cancel = cancel.clone();
                    let request_id = request.request_id;
                    tokio::spawn(async move { handler.handle(request_id, http, cancel).await });
                }
                Some(proxy_request::Payload::Tcp(segment)) => {
                    self.route_tcp(request.request_id, segment.data, cancel)
                        .await;
                }
                None => warn!("Request {}: no payload, dropping", request.request_id),
            },
            Some(proxy_message::Message::Control(control)) => self.control(control).await,
            Some(proxy_message::Message::Error(error)) => {
                warn!(
                    "Server error for request {}: [{}] {}",
                    error.request_id, error.code, error.message
                );
            }
            Some(proxy_message::Message::Response(response)) => {
                debug!("Request {}: unexpected response frame, dropping", response.request_id);
            }
            None => warn!("Dropping proxy frame without a message"),
        }
    }

    async fn route_tcp(&self, request_id: String, data: Bytes, cancel: &CancellationToken) {
        if let Some(tx) = self.inner.handler.state.ws_sender(&request_id).await {
            if deliver_ws_frame(&tx, &request_id, data, DELIVERY_TIMEOUT)
                .await
                .is_err()
            {
                debug!("WebSocket {}: bridge is gone, dropping frame", request_id);
            }
            return;
        }

        if data.is_empty() && !self.inner.lanes.contains_key(&request_id) {
            self.inner.tcp.close_connection(&request_id).await;
            return;
        }

        let mut data = data;
        // A lane whose worker just retired rejects the send; the retry
        // starts a fresh one.
        for _ in 0..2 {
            let (tx, generation) = match self.enqueue(&request_id, data, cancel) {
                Ok(()) => return,
                Err((tx, generation, rejected)) => {
                    data = rejected;
                    (tx, generation)
                }
            };
            match tx.send_timeout(data, DELIVERY_TIMEOUT).await {
                Ok(()) => return,
                Err(SendTimeoutError::Timeout(_)) => {
                    warn!("TCP {}: lane full, dropping segment", request_id);
                    return;
                }
                Err(SendTimeoutError::Closed(rejected)) => {
                    self.inner
                        .lanes
                        .remove_if(&request_id, |_, lane| lane.generation == generation);
                    data = rejected;
                }
            }
        }
        warn!("TCP {}: no lane accepted the segment, dropping", request_id);
    }

    /// Queues `data` on the lane for `request_id` without waiting. The map
    /// entry stays locked meanwhile, so the lane cannot retire in between.
    /// A full or closed lane hands the segment back with its sender.
    fn enqueue(
        &self,
        request_id: &str,
        data: Bytes,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), (mpsc::Sender<Bytes>, u64, Bytes)> {
        let lane = self
            .inner
            .lanes
            .entry(request_id.to_string())
            .or_insert_with(|| {
                let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = mpsc::channel(LANE_CAPACITY);
                let demux = self.clone();
                let request_id = request_id.to_string();
                let cancel = cancel.clone();
                tokio::spawn(async move { demux.run_lane(request_id, generation, rx, cancel).await });
                Lane { tx, generation }
            });
        match lane.tx.try_send(data) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(data) | TrySendError::Closed(data)) => {
                Err((lane.tx.clone(), lane.generation, data))
            }
        }
    }

    /// Feeds one request id's segments to the TCP forwarder in order. The
    /// worker retires once its queue is empty after the connection closed
    /// from either side or failed.
    async fn run_lane(
        self,
        request_id: String,
        generation: u64,
        mut rx: mpsc::Receiver<Bytes>,
        cancel: CancellationToken,
    ) {
        let mut read_loop: Option<JoinHandle<()>> = None;
        loop {
            let data = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = read_loop_ended(&mut read_loop) => {
                    read_loop = None;
                    if self.retire(&request_id, generation, &mut rx) {
                        break;
                    }
                    continue;
                }
                data = rx.recv() => match data {
                    Some(data) => data,
                    None => break,
                },
            };

            let closing = data.is_empty();
            let failed = match self.inner.tcp.forward(&request_id, data).await {
                Ok(true) => {
                    let tcp = self.inner.tcp.clone();
                    let sender = self.inner.handler.sender.clone();
                    let request_id = request_id.clone();
                    let cancel = cancel.clone();
                    read_loop = Some(tokio::spawn(async move {
                        tcp.start_read_loop(&request_id, sender, cancel).await
                    }));
                    false
                }
                Ok(false) => false,
                Err(e) => {
                    warn!("TCP {}: forward failed: {}", request_id, e);
                    let _ = self
                        .inner
                        .handler
                        .sender
                        .send_error(&request_id, e.frame_code(), e.to_string())
                        .await;
                    true
                }
            };

            if (closing || failed) && self.retire(&request_id, generation, &mut rx) {
                break;
            }
        }
        self.inner
            .lanes
            .remove_if(&request_id, |_, lane| lane.generation == generation);
    }

    /// Removes this lane from the map if nothing is queued on it.
    fn retire(&self, request_id: &str, generation: u64, rx: &mut mpsc::Receiver<Bytes>) -> bool {
        let retired = self
            .inner
            .lanes
            .remove_if(request_id, |_, lane| {
                lane.generation == generation && rx.is_empty()
            })
            .is_some();
        if retired {
            rx.close();
            while let Ok(data) = rx.try_recv() {
                debug!("TCP {}: dropping {} bytes queued after close", request_id, data.len());
            }
        }
        retired
    }

    async fn control(&self, control: ControlMessage) {
        let state = &self.inner.handler.state;
        if let Some(url) = control.metadata.get("public_url").filter(|url| !url.is_empty()) {
            if state.set_public_url(url).await {
                info!("Tunnel {}: public URL is now {}", control.tunnel_id, url);
                println!("\n✓ Public URL updated: {}", url);
            }
        }

        match ControlType::try_from(control.r#type).unwrap_or(ControlType::Unknown) {
            ControlType::TunnelClosed => {
                warn!("Tunnel {} closed by server", control.tunnel_id);
            }
            ControlType::RateLimit => {
                warn!(
                    "Tunnel {} rate limited by server{}",
                    control.tunnel_id,
                    control
                        .metadata
                        .get("reason")
                        .map(|reason| format!(": {reason}"))
                        .unwrap_or_default()
                );
            }
            ControlType::Reconnect => {
                info!("Tunnel {}: server requested a reconnect", control.tunnel_id);
                self.inner.handler.sender.close();
            }
            ControlType::Unknown => {}
        }
    }
}

async fn read_loop_ended(read_loop: &mut Option<JoinHandle<()>>) {
    match read_loop {
        Some(handle) => {
            let _ = handle.await;
        }
        None => std::future::pending().await,
    }
}
