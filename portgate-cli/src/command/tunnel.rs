//! Tunnel commands - expose a local service through the tunnel server.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use portgate::event::{DEFAULT_EVENT_CAPACITY, Event, EventBus};
use portgate::{Protocol, SessionConfig, SessionManager};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, ProfileConfig};

/// Expose a local service through a tunnel
#[derive(Debug, Parser)]
pub struct Args {
    /// Local port to forward to
    #[arg(short, long)]
    port: u16,

    /// Local host (default: 127.0.0.1)
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Requested subdomain
    #[arg(short, long)]
    subdomain: Option<String>,

    /// Persistent tunnel name, used when no subdomain is requested
    #[arg(long)]
    name: Option<String>,

    /// Tunnel server address (host:port)
    #[arg(long, env = "PORTGATE_SERVER")]
    server: Option<String>,

    /// Authentication token
    #[arg(long, env = "PORTGATE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Webhook application id to attach to the tunnel
    #[arg(long)]
    webhook_app_id: Option<String>,

    /// Exit instead of reconnecting when the connection is lost
    #[arg(long)]
    no_reconnect: bool,

    /// Print request events as JSON lines on stdout
    #[arg(long)]
    events_json: bool,
}

// =============================================================================
// Execution
// =============================================================================

pub async fn execute(
    args: &Args,
    protocol: Protocol,
    profile: &str,
    config_path: Option<&Path>,
) -> Result<()> {
    let config = Config::load(config_path)?;
    let profile_config = config.profile(profile);
    let session_config = session_config(args, protocol, &profile_config)?;
    let server = session_config.server.addr.clone();

    let (events, rx) = EventBus::new(DEFAULT_EVENT_CAPACITY);
    let consumer = tokio::spawn(consume_events(
        rx,
        args.events_json || profile_config.dashboard.enabled,
    ));

    let manager = SessionManager::new(session_config, events, Arc::default())
        .context("Invalid tunnel configuration")?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutting down tunnel...");
                cancel.cancel();
            }
        });
    }

    info!("Connecting to {}...", server);
    let result = manager.start(cancel).await;
    consumer.abort();
    result.context("Tunnel stopped")?;

    info!("Tunnel closed gracefully");
    Ok(())
}

fn session_config(
    args: &Args,
    protocol: Protocol,
    profile: &ProfileConfig,
) -> Result<SessionConfig> {
    let server = args
        .server
        .clone()
        .or_else(|| profile.server.addr.clone())
        .context("No tunnel server configured. Pass --server or set server.addr in the profile.")?;

    let mut reconnect = profile.reconnect.to_policy();
    if args.no_reconnect {
        reconnect.enabled = false;
    }

    let defaults = SessionConfig::default();
    Ok(SessionConfig {
        server: profile.server.to_server_config(server),
        auth_token: args
            .token
            .clone()
            .or_else(|| profile.auth.token.clone())
            .unwrap_or_default(),
        local_addr: local_addr(&args.host, args.port),
        subdomain: args.subdomain.clone().unwrap_or_default(),
        persistent_name: args.name.clone(),
        protocol,
        webhook_app_id: args.webhook_app_id.clone(),
        reconnect,
        pool: profile.pool.to_pool_config(),
        heartbeat_interval: profile
            .heartbeat_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.heartbeat_interval),
        max_body_capture: profile
            .max_body_capture
            .unwrap_or(defaults.max_body_capture),
        ws_idle_timeout: profile
            .ws_idle_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.ws_idle_timeout),
    })
}

fn local_addr(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

// =============================================================================
// Event Feed
// =============================================================================

async fn consume_events(mut rx: mpsc::Receiver<Event>, json: bool) {
    while let Some(event) = rx.recv().await {
        if json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Failed to encode {} event: {}", event.name(), e),
            }
            continue;
        }

        match event {
            Event::RequestStarted {
                request_id,
                protocol,
                method,
                path,
                ..
            } => debug!("Request {}: {} {} {}", request_id, protocol, method, path),
            Event::RequestCompleted {
                request_id,
                duration_ms,
                error: Some(error),
                ..
            } => warn!("Request {}: failed after {} ms: {}", request_id, duration_ms, error),
            Event::RequestCompleted {
                request_id,
                status,
                bytes_out,
                duration_ms,
                ..
            } => info!(
                "Request {}: {} ({} bytes, {} ms)",
                request_id, status, bytes_out, duration_ms
            ),
            Event::ConnectionEstablished { tunnel_id, .. } => {
                debug!("Tunnel {}: connected", tunnel_id)
            }
            Event::ConnectionLost {
                reason,
                will_reconnect,
            } => warn!(
                "Connection lost: {} ({})",
                reason,
                if will_reconnect {
                    "reconnecting"
                } else {
                    "not reconnecting"
                }
            ),
            Event::MetricsSnapshot(snapshot) => debug!(
                "Metrics: {} requests ({} active, {} failed), {} TCP, {} WebSocket",
                snapshot.requests_total,
                snapshot.requests_active,
                snapshot.requests_failed,
                snapshot.tcp_connections_active,
                snapshot.ws_connections_active
            ),
        }
    }
}
