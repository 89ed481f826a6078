//! The gRPC-backed connector: dials the tunnel server, registers the tunnel
//! and runs one live session until it is lost or cancelled.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tonic::codec::Streaming;
use tracing::{debug, info, warn};

use super::heartbeat::{self, lost_channel};
use super::outbound::{self, FrameSender, OUTBOUND_CAPACITY};
use super::state::SessionState;
use super::{Connector, Phase};
use crate::config::SessionConfig;
use crate::demux::Demux;
use crate::error::{Error, Result};
use crate::event::{Event, EventBus, Metrics};
use crate::forward::{HttpForwarder, TcpForwarder};
use crate::handler::HttpHandler;
use crate::pool::AdaptiveBufferPool;
use crate::transport::message::{
    CreateTunnelRequest, ProxyMessage, TunnelProtocol, registration_sentinel,
};
use crate::transport::{ServerTransport, TunnelServiceClient};

/// How often a running session publishes a metrics snapshot.
pub const METRICS_INTERVAL: Duration = Duration::from_secs(10);

/// A registered tunnel whose proxy stream is open.
pub struct ActiveSession {
    client: TunnelServiceClient,
    tunnel_id: String,
    public_url: String,
    sender: FrameSender,
    inbound: Streaming<ProxyMessage>,
}

impl ActiveSession {
    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    pub fn public_url(&self) -> &str {
        &self.public_url
    }
}

/// Connects to the tunnel server over gRPC.
///
/// The HTTP forwarder (and its connection pool) outlives individual
/// sessions; TCP connections belong to the session that opened them.
pub struct GrpcConnector {
    config: Arc<SessionConfig>,
    transport: ServerTransport,
    http: HttpForwarder,
    buffers: AdaptiveBufferPool,
    events: EventBus,
    metrics: Arc<Metrics>,
}

impl GrpcConnector {
    /// Must be called inside a tokio runtime.
    pub fn new(config: Arc<SessionConfig>, events: EventBus, metrics: Arc<Metrics>) -> Result<Self> {
        let transport = ServerTransport::new(&config.server)?;
        let buffers = AdaptiveBufferPool::new();
        let http = HttpForwarder::new(&config.local_addr, &config.pool, buffers.clone());
        Ok(Self {
            config,
            transport,
            http,
            buffers,
            events,
            metrics,
        })
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    async fn open(&self) -> Result<ActiveSession> {
        let config = &self.config;
        let channel = self.transport.connect().await?;
        debug!("Session phase: {}", Phase::Dialed);

        let mut client = TunnelServiceClient::new(channel);
        let created = client
            .create_tunnel(CreateTunnelRequest {
                auth_token: config.auth_token.clone(),
                protocol: TunnelProtocol::from(config.protocol) as i32,
                local_address: config.local_addr.clone(),
                subdomain: config.requested_subdomain().to_string(),
                webhook_app_id: config.webhook_app_id.clone().unwrap_or_default(),
            })
            .await
            .map_err(Error::Registration)?;
        info!(
            "Tunnel {} registered at {}",
            created.tunnel_id, created.public_url
        );

        let (sender, frames) = outbound::channel(OUTBOUND_CAPACITY, &created.tunnel_id);
        // Queued before the call so the sentinel is the first frame on the wire.
        sender
            .send(ProxyMessage::registration(registration_sentinel(
                &config.subdomain,
                &config.auth_token,
                &config.local_addr,
                &created.public_url,
                config.persistent_name.as_deref().unwrap_or_default(),
            )))
            .await?;
        let inbound = client
            .proxy_stream(frames)
            .await
            .map_err(Error::Registration)?;

        Ok(ActiveSession {
            client,
            tunnel_id: created.tunnel_id,
            public_url: created.public_url,
            sender,
            inbound,
        })
    }

    async fn serve(&self, session: ActiveSession, cancel: CancellationToken) -> Result<()> {
        let ActiveSession {
            client,
            tunnel_id,
            public_url,
            sender,
            inbound,
        } = session;
        let config = &self.config;

        let state = Arc::new(SessionState::new(&tunnel_id, &public_url));
        state.set_connected().await;

        println!("\n✓ Tunnel established!");
        println!("  Public URL: {}", public_url);
        println!("  Forwarding: {} -> {}", public_url, config.local_addr);
        println!("\nPress Ctrl+C to stop the tunnel.\n");
        self.events.publish(Event::ConnectionEstablished {
            tunnel_id: tunnel_id.clone(),
            public_url: public_url.clone(),
            server_addr: config.server.addr.clone(),
        });

        let session_cancel = cancel.child_token();
        let (lost, mut lost_rx) = lost_channel();
        let heartbeat = heartbeat::spawn(
            client,
            tunnel_id.clone(),
            config.heartbeat_interval,
            lost,
            session_cancel.clone(),
        );
        let reporter = self.spawn_metrics_reporter(session_cancel.clone());

        let tcp = TcpForwarder::new(&config.local_addr, self.buffers.clone(), self.metrics.clone());
        let demux = Demux::new(
            HttpHandler {
                forwarder: self.http.clone(),
                sender: sender.clone(),
                state: state.clone(),
                buffers: self.buffers.clone(),
                events: self.events.clone(),
                metrics: self.metrics.clone(),
                protocol: config.protocol,
                max_body_capture: config.max_body_capture,
                ws_idle_timeout: config.ws_idle_timeout,
            },
            tcp.clone(),
        );
        let mut receiver = {
            let demux = demux.clone();
            let cancel = session_cancel.clone();
            tokio::spawn(async move { demux.receive_loop(inbound, cancel).await })
        };

        let result = wait_for_end(&tunnel_id, &cancel, &mut lost_rx, &mut receiver).await;

        debug!("Session phase: {}", Phase::Closing);
        sender.close();
        session_cancel.cancel();
        tcp.close().await;
        state.disconnect().await;
        heartbeat.abort();
        reporter.abort();
        receiver.abort();
        info!("Tunnel {}: session closed", tunnel_id);
        result
    }

    fn spawn_metrics_reporter(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let events = self.events.clone();
        let metrics = self.metrics.clone();
        let http = self.http.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(Instant::now() + METRICS_INTERVAL, METRICS_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let snapshot = metrics.snapshot(events.dropped(), http.pool_metrics());
                        events.publish(Event::MetricsSnapshot(snapshot));
                    }
                }
            }
        })
    }
}

/// Waits for whichever ends the session first: cancellation, a lost signal
/// from the heartbeat, or the receive loop finishing.
async fn wait_for_end(
    tunnel_id: &str,
    cancel: &CancellationToken,
    lost_rx: &mut mpsc::Receiver<String>,
    receiver: &mut JoinHandle<Result<()>>,
) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        reason = lost_rx.recv() => {
            let reason = reason.unwrap_or_else(|| "heartbeat stopped".to_string());
            warn!("Tunnel {}: connection lost: {}", tunnel_id, reason);
            Err(Error::SessionLost(reason))
        }
        ended = receiver => match ended {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!("Tunnel {}: proxy stream ended: {}", tunnel_id, e);
                Err(e)
            }
            Err(e) => Err(Error::SessionLost(format!("receive loop failed: {e}"))),
        },
    }
}

impl Connector for GrpcConnector {
    type Session = ActiveSession;

    async fn connect(&self) -> Result<ActiveSession> {
        self.open().await
    }

    async fn run(&self, session: ActiveSession, cancel: CancellationToken) -> Result<()> {
        self.serve(session, cancel).await
    }

    fn shutdown(&self) {
        self.http.close();
    }
}
