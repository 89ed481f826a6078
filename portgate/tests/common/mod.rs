#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use portgate::config::{PoolConfig, Protocol};
use portgate::demux::Demux;
use portgate::event::{EventBus, Metrics};
use portgate::forward::{HttpForwarder, TcpForwarder};
use portgate::handler::HttpHandler;
use portgate::pool::AdaptiveBufferPool;
use portgate::session::{SessionState, outbound};
use portgate::transport::message::{
    HeaderValues, HttpRequest, HttpResponse, ProxyMessage, TcpSegment, proxy_message,
    proxy_request, proxy_response,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::Status;

/// A demultiplexer wired to in-memory streams in place of the RPC session.
pub struct Harness {
    pub inbound: mpsc::UnboundedSender<Result<ProxyMessage, Status>>,
    pub outbound: mpsc::Receiver<ProxyMessage>,
    pub state: Arc<SessionState>,
    pub cancel: CancellationToken,
    pub reader: JoinHandle<portgate::Result<()>>,
}

impl Harness {
    pub fn start(local_addr: &str) -> Self {
        Self::start_with(local_addr, PoolConfig::default())
    }

    pub fn start_with(local_addr: &str, pool: PoolConfig) -> Self {
        let (sender, frames) = outbound::channel(256, "tunnel-1");
        let buffers = AdaptiveBufferPool::new();
        let metrics = Arc::new(Metrics::default());
        let state = Arc::new(SessionState::new("tunnel-1", "https://demo.example.com"));
        let handler = HttpHandler {
            forwarder: HttpForwarder::new(local_addr, &pool, buffers.clone()),
            sender,
            state: state.clone(),
            buffers: buffers.clone(),
            events: EventBus::disabled(),
            metrics: metrics.clone(),
            protocol: Protocol::Http,
            max_body_capture: 100 * 1024,
            ws_idle_timeout: Duration::from_secs(600),
        };
        let demux = Demux::new(handler, TcpForwarder::new(local_addr, buffers, metrics));

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let reader = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                demux
                    .receive_loop(UnboundedReceiverStream::new(rx), cancel)
                    .await
            })
        };

        Self {
            inbound: tx,
            outbound: frames.into_inner(),
            state,
            cancel,
            reader,
        }
    }

    pub fn push_http(&self, request_id: &str, request: HttpRequest) {
        self.inbound
            .send(Ok(ProxyMessage::request(
                request_id,
                proxy_request::Payload::Http(request),
            )))
            .unwrap();
    }

    pub fn push_tcp(&self, request_id: &str, data: &[u8]) {
        self.inbound
            .send(Ok(ProxyMessage::request(
                request_id,
                proxy_request::Payload::Tcp(TcpSegment {
                    data: Bytes::copy_from_slice(data),
                    sequence: 0,
                }),
            )))
            .unwrap();
    }

    pub async fn next_frame(&mut self) -> Frame {
        let message = tokio::time::timeout(Duration::from_secs(10), self.outbound.recv())
            .await
            .expect("timed out waiting for an outbound frame")
            .expect("outbound stream closed");
        Frame::from(message)
    }

    /// Collects the HTTP response frames of `request_id` up to the one
    /// flagged as the end of the stream.
    pub async fn collect_http(&mut self, request_id: &str) -> Vec<HttpResponse> {
        let mut frames = Vec::new();
        loop {
            match self.next_frame().await {
                Frame::Http {
                    request_id: id,
                    response,
                    end_of_stream,
                } if id == request_id => {
                    frames.push(response);
                    if end_of_stream {
                        return frames;
                    }
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    /// Collects TCP payload for `request_id` until its empty close segment.
    pub async fn collect_tcp_until_close(&mut self, request_id: &str) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            match self.next_frame().await {
                Frame::Tcp { request_id: id, data } if id == request_id => {
                    if data.is_empty() {
                        return out;
                    }
                    out.extend_from_slice(&data);
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    /// Collects TCP payload for `request_id` until at least `len` bytes.
    pub async fn collect_tcp(&mut self, request_id: &str, len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while out.len() < len {
            match self.next_frame().await {
                Frame::Tcp { request_id: id, data } if id == request_id => {
                    assert!(!data.is_empty(), "connection closed early");
                    out.extend_from_slice(&data);
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
        out
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.reader.await;
    }
}

#[derive(Debug)]
pub enum Frame {
    Http {
        request_id: String,
        response: HttpResponse,
        end_of_stream: bool,
    },
    Tcp {
        request_id: String,
        data: Bytes,
    },
    Error {
        request_id: String,
        code: String,
        message: String,
    },
    Other(ProxyMessage),
}

impl From<ProxyMessage> for Frame {
    fn from(message: ProxyMessage) -> Self {
        match message.message {
            Some(proxy_message::Message::Response(response)) => match response.payload {
                Some(proxy_response::Payload::Http(http)) => Frame::Http {
                    request_id: response.request_id,
                    response: http,
                    end_of_stream: response.end_of_stream,
                },
                Some(proxy_response::Payload::Tcp(segment)) => Frame::Tcp {
                    request_id: response.request_id,
                    data: segment.data,
                },
                None => Frame::Other(ProxyMessage {
                    message: Some(proxy_message::Message::Response(response)),
                }),
            },
            Some(proxy_message::Message::Error(error)) => Frame::Error {
                request_id: error.request_id,
                code: error.code,
                message: error.message,
            },
            message => Frame::Other(ProxyMessage { message }),
        }
    }
}

pub fn request(method: &str, path: &str, headers: &[(&str, &str)], body: &[u8]) -> HttpRequest {
    let mut map: HashMap<String, HeaderValues> = HashMap::new();
    for (name, value) in headers {
        map.entry(name.to_string())
            .or_default()
            .values
            .push(value.to_string());
    }
    HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        headers: map,
        body: Bytes::copy_from_slice(body),
        remote_addr: "203.0.113.7".to_string(),
        ..Default::default()
    }
}

/// Reassembles a streamed response: status and headers from the first
/// frame, body from all of them.
pub fn merge(frames: Vec<HttpResponse>) -> HttpResponse {
    let mut frames = frames.into_iter();
    let mut merged = frames.next().expect("no response frames");
    let mut body = merged.body.to_vec();
    for frame in frames {
        assert_eq!(frame.status_code, 0, "status repeated on a later frame");
        assert!(frame.headers.is_empty(), "headers repeated on a later frame");
        body.extend_from_slice(&frame.body);
    }
    merged.body = Bytes::from(body);
    merged
}

pub fn header<'a>(response: &'a HttpResponse, name: &str) -> Option<&'a str> {
    response
        .headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .and_then(|(_, values)| values.values.first())
        .map(String::as_str)
}
