//! Validated configuration consumed by the session manager.
//!
//! Loading and merging configuration files is the caller's job; this module
//! only describes the resulting value and checks it for consistency.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default limit for request/response bodies captured into the event feed.
pub const DEFAULT_MAX_BODY_CAPTURE: usize = 100 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Http,
    Https,
    Tcp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Tcp => "tcp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            "tcp" => Ok(Protocol::Tcp),
            other => Err(Error::Config(format!("unknown protocol '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Zero means retry forever.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            max_attempts: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerConfig {
    /// `host:port` of the tunnel server.
    pub addr: String,
    pub tls: bool,
    /// PEM bundle used as the only trust root when set.
    pub tls_cert_file: Option<PathBuf>,
    pub tls_insecure: bool,
    pub tls_server_name: Option<String>,
}

impl ServerConfig {
    /// Name used for SNI and certificate verification.
    pub fn server_name(&self) -> &str {
        if let Some(name) = self.tls_server_name.as_deref().filter(|n| !n.is_empty()) {
            return name;
        }
        split_host(&self.addr)
    }
}

/// Strips the port (and IPv6 brackets) from a `host:port` string.
pub(crate) fn split_host(addr: &str) -> &str {
    let host = match addr.rfind(':') {
        Some(idx) if !addr[idx + 1..].contains(']') => &addr[..idx],
        _ => addr,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

/// Settings of the optional connection pool to the local HTTP listener.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub enabled: bool,
    pub min_size: usize,
    pub max_size: usize,
    pub idle_timeout: Duration,
    pub health_check_interval: Duration,
    pub max_wait_time: Duration,
    pub dial_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_size: 0,
            max_size: 32,
            idle_timeout: Duration::from_secs(90),
            health_check_interval: Duration::from_secs(30),
            max_wait_time: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub server: ServerConfig,
    pub auth_token: String,
    /// `host:port` of the local service being exposed.
    pub local_addr: String,
    pub subdomain: String,
    pub persistent_name: Option<String>,
    pub protocol: Protocol,
    pub webhook_app_id: Option<String>,
    pub reconnect: ReconnectPolicy,
    pub pool: PoolConfig,
    pub heartbeat_interval: Duration,
    pub max_body_capture: usize,
    pub ws_idle_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth_token: String::new(),
            local_addr: String::new(),
            subdomain: String::new(),
            persistent_name: None,
            protocol: Protocol::Http,
            webhook_app_id: None,
            reconnect: ReconnectPolicy::default(),
            pool: PoolConfig::default(),
            heartbeat_interval: Duration::from_secs(30),
            max_body_capture: DEFAULT_MAX_BODY_CAPTURE,
            ws_idle_timeout: Duration::from_secs(600),
        }
    }
}

impl SessionConfig {
    /// Subdomain sent with `CreateTunnel`: the requested one, or the
    /// persistent name when no subdomain was requested.
    pub fn requested_subdomain(&self) -> &str {
        if self.subdomain.is_empty() {
            self.persistent_name.as_deref().unwrap_or_default()
        } else {
            &self.subdomain
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.addr.trim().is_empty() {
            return Err(Error::Config("server address is empty".into()));
        }
        if self.local_addr.trim().is_empty() {
            return Err(Error::Config("local address is empty".into()));
        }
        if self.server.tls_cert_file.is_some() && self.server.tls_insecure {
            return Err(Error::Config(
                "tls_cert_file and tls_insecure are mutually exclusive".into(),
            ));
        }
        if let Some(path) = &self.server.tls_cert_file {
            if !path.is_file() {
                return Err(Error::Config(format!(
                    "certificate file {} does not exist",
                    path.display()
                )));
            }
        }

        let policy = &self.reconnect;
        if !policy.backoff_factor.is_finite() || policy.backoff_factor < 1.0 {
            return Err(Error::Config(format!(
                "backoff factor must be >= 1, got {}",
                policy.backoff_factor
            )));
        }
        if policy.initial_delay.is_zero() {
            return Err(Error::Config("initial reconnect delay must be positive".into()));
        }
        if policy.initial_delay > policy.max_delay {
            return Err(Error::Config(
                "initial reconnect delay exceeds the maximum delay".into(),
            ));
        }

        if self.pool.enabled {
            if self.pool.max_size == 0 {
                return Err(Error::Config("pool max_size must be positive".into()));
            }
            if self.pool.min_size > self.pool.max_size {
                return Err(Error::Config("pool min_size exceeds max_size".into()));
            }
        }
        if self.heartbeat_interval.is_zero() {
            return Err(Error::Config("heartbeat interval must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> SessionConfig {
        SessionConfig {
            server: ServerConfig {
                addr: "tunnel.example.com:443".into(),
                tls: true,
                ..Default::default()
            },
            auth_token: "token".into(),
            local_addr: "127.0.0.1:3000".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_ok() {
        valid().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_cert_and_insecure() {
        let mut config = valid();
        config.server.tls_cert_file = Some(PathBuf::from("/nonexistent.pem"));
        config.server.tls_insecure = true;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_backoff() {
        let mut config = valid();
        config.reconnect.backoff_factor = 0.5;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.reconnect.initial_delay = Duration::from_secs(120);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_requested_subdomain_falls_back_to_persistent_name() {
        let mut config = valid();
        config.persistent_name = Some("my-app".into());
        assert_eq!(config.requested_subdomain(), "my-app");

        config.subdomain = "explicit".into();
        assert_eq!(config.requested_subdomain(), "explicit");
    }

    #[test]
    fn test_server_name() {
        let mut server = ServerConfig {
            addr: "tunnel.example.com:443".into(),
            ..Default::default()
        };
        assert_eq!(server.server_name(), "tunnel.example.com");

        server.addr = "[::1]:8443".into();
        assert_eq!(server.server_name(), "::1");

        server.tls_server_name = Some("override.example.com".into());
        assert_eq!(server.server_name(), "override.example.com");
    }

    #[test]
    fn test_protocol_parse() {
        assert_eq!("TCP".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert!("udp".parse::<Protocol>().is_err());
    }
}
