//! Profile-based configuration file.
//!
//! ```toml
//! [profile.default.server]
//! addr = "tunnel.example.com:443"
//! tls = true
//!
//! [profile.default.auth]
//! token = "..."
//!
//! [profile.default.reconnect]
//! initial_delay_secs = 1
//! max_delay_secs = 60
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ::config::{Config as Source, File, FileFormat};
use anyhow::{Context, Result, bail};
use portgate::{PoolConfig, ReconnectPolicy, ServerConfig};
use serde::Deserialize;

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    profile: HashMap<String, ProfileConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ProfileConfig {
    pub server: ServerSection,
    pub auth: AuthSection,
    pub reconnect: ReconnectSection,
    pub pool: PoolSection,
    pub dashboard: DashboardSection,
    pub heartbeat_interval_secs: Option<u64>,
    pub max_body_capture: Option<usize>,
    pub ws_idle_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ServerSection {
    pub addr: Option<String>,
    pub tls: bool,
    pub tls_cert_file: Option<PathBuf>,
    pub tls_insecure: bool,
    pub tls_server_name: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct AuthSection {
    pub token: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ReconnectSection {
    pub enabled: Option<bool>,
    pub initial_delay_secs: Option<u64>,
    pub max_delay_secs: Option<u64>,
    pub backoff_factor: Option<f64>,
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct PoolSection {
    pub enabled: bool,
    pub min_size: Option<usize>,
    pub max_size: Option<usize>,
    pub idle_timeout_secs: Option<u64>,
    pub health_check_interval_secs: Option<u64>,
    pub max_wait_secs: Option<u64>,
}

/// Settings of the observability dashboard. Only `enabled` is read here;
/// with it set, events are printed as JSON lines.
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct DashboardSection {
    pub enabled: bool,
}

const USER_PATH: &str = "portgate/config.toml";

#[cfg(not(target_os = "windows"))]
fn config_dir() -> Option<PathBuf> {
    std::env::var_os("XDG_CONFIG_HOME")
        .and_then(dirs_sys::is_absolute_path)
        .or_else(|| dirs_sys::home_dir().map(|h| h.join(".config")))
}

#[cfg(target_os = "windows")]
fn config_dir() -> Option<PathBuf> {
    dirs_sys::known_folder_roaming_app_data()
}

impl Config {
    pub fn user_path<'a>() -> &'a Path {
        Path::new(USER_PATH)
    }

    /// Loads `path`, or the user configuration file when `path` is `None`.
    /// A missing user file yields an empty configuration; a missing
    /// explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match config_dir() {
                Some(dir) => (dir.join(Self::user_path()), false),
                None => return Ok(Self::default()),
            },
        };
        if !path.is_file() {
            if explicit {
                bail!("Configuration file {} does not exist", path.display());
            }
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("Invalid configuration in {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let source = Source::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()?;
        Ok(source.try_deserialize()?)
    }

    pub fn profile(&self, name: &str) -> ProfileConfig {
        self.profile.get(name).cloned().unwrap_or_default()
    }
}

impl ServerSection {
    pub fn to_server_config(&self, addr: String) -> ServerConfig {
        ServerConfig {
            addr,
            tls: self.tls,
            tls_cert_file: self.tls_cert_file.clone(),
            tls_insecure: self.tls_insecure,
            tls_server_name: self.tls_server_name.clone(),
        }
    }
}

impl ReconnectSection {
    pub fn to_policy(&self) -> ReconnectPolicy {
        let mut policy = ReconnectPolicy::default();
        if let Some(enabled) = self.enabled {
            policy.enabled = enabled;
        }
        if let Some(secs) = self.initial_delay_secs {
            policy.initial_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = self.max_delay_secs {
            policy.max_delay = Duration::from_secs(secs);
        }
        if let Some(factor) = self.backoff_factor {
            policy.backoff_factor = factor;
        }
        if let Some(max_attempts) = self.max_attempts {
            policy.max_attempts = max_attempts;
        }
        policy
    }
}

impl PoolSection {
    pub fn to_pool_config(&self) -> PoolConfig {
        let mut pool = PoolConfig {
            enabled: self.enabled,
            ..Default::default()
        };
        if let Some(min_size) = self.min_size {
            pool.min_size = min_size;
        }
        if let Some(max_size) = self.max_size {
            pool.max_size = max_size;
        }
        if let Some(secs) = self.idle_timeout_secs {
            pool.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.health_check_interval_secs {
            pool.health_check_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = self.max_wait_secs {
            pool.max_wait_time = Duration::from_secs(secs);
        }
        pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[profile.default.server]
addr = "tunnel.example.com:443"
tls = true
tls_server_name = "edge.example.com"

[profile.default.auth]
token = "secret"

[profile.default.reconnect]
initial_delay_secs = 2
max_attempts = 5

[profile.staging.server]
addr = "127.0.0.1:50051"

[profile.staging.pool]
enabled = true
max_size = 4
"#;

    #[test]
    fn test_profiles() {
        let config = Config::from_toml(SAMPLE).unwrap();

        let default = config.profile("default");
        assert_eq!(default.server.addr.as_deref(), Some("tunnel.example.com:443"));
        assert!(default.server.tls);
        assert_eq!(default.auth.token.as_deref(), Some("secret"));
        let policy = default.reconnect.to_policy();
        assert_eq!(policy.initial_delay, Duration::from_secs(2));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
        assert_eq!(policy.max_attempts, 5);
        assert!(policy.enabled);

        let staging = config.profile("staging");
        assert!(!staging.server.tls);
        let pool = staging.pool.to_pool_config();
        assert!(pool.enabled);
        assert_eq!(pool.max_size, 4);

        let missing = config.profile("nope");
        assert!(missing.server.addr.is_none());
    }

    #[test]
    fn test_server_section() {
        let config = Config::from_toml(SAMPLE).unwrap();
        let server = config
            .profile("default")
            .server
            .to_server_config("override:443".to_string());
        assert_eq!(server.addr, "override:443");
        assert_eq!(server.server_name(), "edge.example.com");
    }

    #[test]
    fn test_missing_explicit_file() {
        let path = std::env::temp_dir().join("portgate-does-not-exist.toml");
        assert!(Config::load(Some(&path)).is_err());
    }
}
