//! One-way event feed and counters for an external observer (dashboard,
//! log consumer). Publishing never blocks the tunnel.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::pool::PoolMetrics;

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Event {
    RequestStarted {
        request_id: String,
        protocol: String,
        method: String,
        path: String,
        remote_addr: String,
        timestamp: u64,
    },
    RequestCompleted {
        request_id: String,
        /// Zero when no response was produced.
        status: u16,
        bytes_in: u64,
        bytes_out: u64,
        duration_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_body: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        response_body: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ConnectionEstablished {
        tunnel_id: String,
        public_url: String,
        server_addr: String,
    },
    ConnectionLost {
        reason: String,
        will_reconnect: bool,
    },
    MetricsSnapshot(MetricsSnapshot),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::RequestStarted { .. } => "RequestStarted",
            Event::RequestCompleted { .. } => "RequestCompleted",
            Event::ConnectionEstablished { .. } => "ConnectionEstablished",
            Event::ConnectionLost { .. } => "ConnectionLost",
            Event::MetricsSnapshot(_) => "MetricsSnapshot",
        }
    }
}

/// Non-blocking publisher side of the event feed.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: Option<mpsc::Sender<Event>>,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let bus = Self {
            tx: Some(tx),
            dropped: Arc::default(),
        };
        (bus, rx)
    }

    /// A bus with no consumer; every publish is discarded.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            dropped: Arc::default(),
        }
    }

    pub fn publish(&self, event: Event) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Event feed is full, dropping {} event", event.name());
            }
            Err(TrySendError::Closed(event)) => {
                debug!("Event feed has no consumer, dropping {} event", event.name());
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: u64,
    pub requests_total: u64,
    pub requests_active: u64,
    pub requests_failed: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub tcp_connections_active: u64,
    pub ws_connections_active: u64,
    pub events_dropped: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolMetrics>,
}

/// Process-wide traffic counters.
#[derive(Debug, Default)]
pub struct Metrics {
    requests_total: AtomicU64,
    requests_active: AtomicU64,
    requests_failed: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    tcp_connections_active: AtomicU64,
    ws_connections_active: AtomicU64,
}

fn decrement(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        Some(v.saturating_sub(1))
    });
}

impl Metrics {
    pub fn request_started(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.requests_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_finished(&self, failed: bool, bytes_in: u64, bytes_out: u64) {
        decrement(&self.requests_active);
        if failed {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.add_bytes(bytes_in, bytes_out);
    }

    pub fn add_bytes(&self, bytes_in: u64, bytes_out: u64) {
        self.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
    }

    pub fn tcp_opened(&self) {
        self.tcp_connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tcp_closed(&self) {
        decrement(&self.tcp_connections_active);
    }

    pub fn ws_opened(&self) {
        self.ws_connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ws_closed(&self) {
        decrement(&self.ws_connections_active);
    }

    pub fn snapshot(&self, events_dropped: u64, pool: Option<PoolMetrics>) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: unix_millis(),
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_active: self.requests_active.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            tcp_connections_active: self.tcp_connections_active.load(Ordering::Relaxed),
            ws_connections_active: self.ws_connections_active.load(Ordering::Relaxed),
            events_dropped,
            pool,
        }
    }
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
