//! Forwarders that carry inbound traffic to the local service.

pub mod http;
pub mod tcp;
pub mod websocket;

pub use self::http::{ForwardSummary, HttpForwarder, is_websocket_upgrade};
pub use self::tcp::TcpForwarder;
pub use self::websocket::UpgradedConn;
