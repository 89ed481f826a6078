//! Session management: one live tunnel session at a time, re-established
//! with exponential backoff when it is lost.

pub mod active;
pub mod backoff;
pub mod heartbeat;
pub mod outbound;
pub mod state;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use self::active::{ActiveSession, GrpcConnector};
pub use self::backoff::Backoff;
pub use self::outbound::FrameSender;
pub use self::state::SessionState;
use crate::config::{ReconnectPolicy, SessionConfig};
use crate::error::{Error, Result};
use crate::event::{Event, EventBus, Metrics};

/// Phases of one connection attempt, logged at debug level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Dialed,
    Registered,
    Running,
    Closing,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Dialed => "dialed",
            Phase::Registered => "registered",
            Phase::Running => "running",
            Phase::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Opens and runs sessions for the [`SessionManager`].
pub trait Connector: Send + Sync {
    type Session: Send;

    /// Dials, registers and opens the proxy stream.
    fn connect(&self) -> impl Future<Output = Result<Self::Session>> + Send;

    /// Serves a session until it is lost (`Err`) or `cancel` fires (`Ok`).
    fn run(
        &self,
        session: Self::Session,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Releases resources that outlive single sessions.
    fn shutdown(&self) {}
}

pub struct SessionManager<C = GrpcConnector> {
    connector: C,
    policy: ReconnectPolicy,
    events: EventBus,
}

impl SessionManager<GrpcConnector> {
    /// Validates `config` and prepares the gRPC connector. Configuration and
    /// certificate problems are reported here, before any dial.
    pub fn new(config: SessionConfig, events: EventBus, metrics: Arc<Metrics>) -> Result<Self> {
        config.validate()?;
        let policy = config.reconnect.clone();
        let connector = GrpcConnector::new(Arc::new(config), events.clone(), metrics)?;
        Ok(Self::with_connector(connector, policy, events))
    }
}

impl<C: Connector> SessionManager<C> {
    pub fn with_connector(connector: C, policy: ReconnectPolicy, events: EventBus) -> Self {
        Self {
            connector,
            policy,
            events,
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Runs sessions until `cancel` fires or reconnecting is no longer
    /// allowed.
    ///
    /// Returns `Ok(())` on cancellation and [`Error::PolicyExhausted`] once
    /// `max_attempts` consecutive attempts have failed. Errors that retrying
    /// cannot fix are returned immediately.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let result = self.reconnect_loop(&cancel).await;
        self.connector.shutdown();
        result
    }

    async fn reconnect_loop(&self, cancel: &CancellationToken) -> Result<()> {
        let mut backoff = Backoff::new(self.policy.clone());

        loop {
            debug!("Session phase: {}", Phase::Idle);
            let connected = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                connected = self.connector.connect() => connected,
            };

            let delay = match connected {
                Ok(session) => {
                    debug!("Session phase: {}", Phase::Registered);
                    debug!("Session phase: {}", Phase::Running);
                    let ran = self.connector.run(session, cancel.clone()).await;
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    let reason = match ran {
                        Ok(()) => return Ok(()),
                        Err(Error::SessionLost(reason)) => reason,
                        Err(e) => e.to_string(),
                    };
                    self.events.publish(Event::ConnectionLost {
                        reason: reason.clone(),
                        will_reconnect: self.policy.enabled,
                    });
                    if !self.policy.enabled {
                        return Err(Error::SessionLost(reason));
                    }
                    backoff.sleep_after_loss()
                }
                Err(e) => {
                    if !e.is_retriable() {
                        error!("Tunnel setup failed: {}", e);
                        return Err(e);
                    }
                    if !self.policy.enabled {
                        return Err(e);
                    }
                    warn!("Connection attempt failed: {}", e);
                    let Some(delay) = backoff.next_sleep() else {
                        error!("Giving up after {} attempts: {}", backoff.attempts(), e);
                        return Err(Error::PolicyExhausted {
                            attempts: backoff.attempts(),
                            last: Box::new(e),
                        });
                    };
                    delay
                }
            };

            info!("Reconnecting in {} ms...", delay.as_millis());
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
