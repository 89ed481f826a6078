//! Core of the portgate reverse tunnel agent.
//!
//! A [`SessionManager`] keeps one registered session with the tunnel server
//! alive. Every request the server pushes down the proxy stream is handed to
//! the HTTP or TCP forwarder, which talks to the local service and streams
//! the answer back over the same session.

pub mod config;
pub mod demux;
pub mod error;
pub mod event;
pub mod forward;
pub mod handler;
pub mod pool;
pub mod session;
pub mod transport;

pub use config::{PoolConfig, Protocol, ReconnectPolicy, ServerConfig, SessionConfig};
pub use error::{Error, Result};
pub use event::{DEFAULT_EVENT_CAPACITY, Event, EventBus, Metrics, MetricsSnapshot};
pub use session::{Connector, GrpcConnector, SessionManager};
