use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::transport::message::{HttpResponse, ProxyMessage};

/// Frames that may wait for the RPC stream before writers block.
pub const OUTBOUND_CAPACITY: usize = 256;

/// The one writer of the outbound half of the proxy stream.
///
/// Every producer (HTTP handlers, TCP read loops, WebSocket pumps, the
/// demultiplexer) shares clones of this handle. Frames produced by a single
/// task leave in the order they were sent. No lock is held while a writer
/// waits for queue space, and [`FrameSender::close`] wakes such writers.
#[derive(Clone)]
pub struct FrameSender {
    tx: Arc<Mutex<Option<mpsc::Sender<ProxyMessage>>>>,
    closed: CancellationToken,
    tunnel_id: Arc<str>,
}

/// Creates the sender and the stream handed to the RPC call.
pub fn channel(capacity: usize, tunnel_id: &str) -> (FrameSender, ReceiverStream<ProxyMessage>) {
    let (tx, rx) = mpsc::channel(capacity);
    let sender = FrameSender {
        tx: Arc::new(Mutex::new(Some(tx))),
        closed: CancellationToken::new(),
        tunnel_id: Arc::from(tunnel_id),
    };
    (sender, ReceiverStream::new(rx))
}

impl FrameSender {
    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    pub async fn send(&self, frame: ProxyMessage) -> Result<()> {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(Error::SendClosed)?;
        let permit = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(Error::SendClosed),
            permit = tx.reserve() => permit.map_err(|_| Error::SendClosed)?,
        };
        permit.send(frame);
        Ok(())
    }

    pub async fn send_http(
        &self,
        request_id: &str,
        response: HttpResponse,
        end_of_stream: bool,
    ) -> Result<()> {
        self.send(ProxyMessage::http_response(
            request_id,
            &self.tunnel_id,
            response,
            end_of_stream,
        ))
        .await
    }

    /// Sends a TCP segment; an empty `data` tells the server this side is done.
    pub async fn send_tcp(&self, request_id: &str, data: Bytes) -> Result<()> {
        self.send(ProxyMessage::tcp_response(request_id, &self.tunnel_id, data))
            .await
    }

    pub async fn send_error(&self, request_id: &str, code: &str, message: String) -> Result<()> {
        self.send(ProxyMessage::error(request_id, code, message)).await
    }

    /// Half-closes the outbound stream. Frames already queued are still
    /// delivered; writers waiting for space and later sends fail with
    /// [`Error::SendClosed`]. Never waits.
    pub fn close(&self) {
        self.closed.cancel();
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
