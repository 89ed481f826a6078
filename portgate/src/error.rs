use std::io;

use thiserror::Error;

/// Wire code reported when the local listener cannot be dialed.
pub const CODE_LOCAL_UNREACHABLE: &str = "LOCAL_SERVICE_UNREACHABLE";
/// Wire code reported when the local listener fails mid-request.
pub const CODE_LOCAL_ERROR: &str = "LOCAL_SERVICE_ERROR";
/// Wire code reported when an inbound request cannot be turned into a local call.
pub const CODE_INVALID_REQUEST: &str = "INVALID_REQUEST";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to dial tunnel server: {0}")]
    TransportDial(#[source] tonic::transport::Error),

    #[error("Tunnel registration failed: {0}")]
    Registration(#[source] tonic::Status),

    #[error("Proxy stream closed by server")]
    StreamEof,

    #[error("Proxy stream receive failed: {0}")]
    StreamRecv(#[source] tonic::Status),

    #[error("Session lost: {0}")]
    SessionLost(String),

    #[error("Cannot reach local service at {addr}: {source}")]
    LocalDial {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Local service I/O failed: {0}")]
    LocalIo(#[from] io::Error),

    #[error("Local HTTP exchange failed: {0}")]
    Http(#[from] hyper_util::client::legacy::Error),

    #[error("Local HTTP body failed: {0}")]
    HttpBody(#[from] hyper::Error),

    #[error("Invalid HTTP request: {0}")]
    InvalidRequest(#[from] http::Error),

    #[error("Malformed upgrade response: {0}")]
    UpgradeResponse(String),

    #[error("Connection pool exhausted")]
    PoolExhausted,

    #[error("Connection pool closed")]
    PoolClosed,

    #[error("Connection {0} is closed")]
    ConnectionClosed(String),

    #[error("Outbound stream is closed")]
    SendClosed,

    #[error("Reconnect attempts exhausted after {attempts} attempts: {last}")]
    PolicyExhausted {
        attempts: u32,
        #[source]
        last: Box<Error>,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("Cancelled")]
    Cancelled,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether the reconnect loop may try again after this error.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::TransportDial(_)
                | Error::Registration(_)
                | Error::StreamEof
                | Error::StreamRecv(_)
                | Error::SessionLost(_)
                | Error::SendClosed
        )
    }

    /// Error code carried by the per-request error frame sent to the server.
    pub fn frame_code(&self) -> &'static str {
        match self {
            Error::LocalDial { .. } | Error::PoolExhausted | Error::PoolClosed => {
                CODE_LOCAL_UNREACHABLE
            }
            Error::Http(e) if e.is_connect() => CODE_LOCAL_UNREACHABLE,
            Error::InvalidRequest(_) => CODE_INVALID_REQUEST,
            _ => CODE_LOCAL_ERROR,
        }
    }
}
