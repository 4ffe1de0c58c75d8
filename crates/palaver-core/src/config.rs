//! Daemon configuration.
//!
//! Loaded from a TOML file (`palaver.toml` by default); every field has a
//! production-sensible default so an empty file is a valid configuration.
//! CLI flags may override individual values at the binary entry point.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rate_limit::{LoginThrottleConfig, SessionLimits};

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// File is not valid TOML or has invalid values.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener and connection lifecycle settings.
    pub server: ServerSection,
    /// TLS and key-rotation settings.
    pub security: SecuritySection,
    /// Per-session and login rate limits.
    pub rate_limiting: RateLimitSection,
    /// Buffer and queue sizing.
    pub performance: PerformanceSection,
    /// Metrics endpoint settings.
    pub monitoring: MonitoringSection,
}

/// `[server]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Address the listener binds.
    pub bind_address: String,
    /// Port the listener binds.
    pub port: u16,
    /// Maximum simultaneously connected sessions.
    pub max_connections: usize,
    /// TCP accept backlog.
    pub backlog: u32,
    /// Seconds a session may sit in the auth phase.
    pub auth_timeout_sec: u64,
    /// Seconds without inbound activity before an idle close.
    pub idle_timeout_sec: u64,
    /// Seconds an outbound write may stall before the session is closed.
    pub stall_timeout_sec: u64,
    /// Seconds granted to drain sessions on shutdown.
    pub graceful_shutdown_sec: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8443,
            max_connections: 1000,
            backlog: 128,
            auth_timeout_sec: 10,
            idle_timeout_sec: 60,
            stall_timeout_sec: 30,
            graceful_shutdown_sec: 10,
        }
    }
}

/// `[security]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySection {
    /// Whether accepted sockets are wrapped in TLS.
    pub enable_tls: bool,
    /// PEM certificate chain path (required when TLS is enabled).
    pub tls_cert_file: String,
    /// PEM private key path (required when TLS is enabled).
    pub tls_key_file: String,
    /// Minimum TLS version; only "1.3" is accepted.
    pub min_tls_version: String,
    /// Whether a client certificate is demanded.
    pub require_client_cert: bool,
    /// Seconds between session key rotations.
    pub key_rotation_interval_sec: u64,
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            enable_tls: false,
            tls_cert_file: "certs/server.crt".to_string(),
            tls_key_file: "certs/server.key".to_string(),
            min_tls_version: "1.3".to_string(),
            require_client_cert: false,
            key_rotation_interval_sec: 30 * 60,
        }
    }
}

/// `[rate_limiting]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    /// Message-bucket refill rate.
    pub messages_per_second: u64,
    /// Message-bucket capacity.
    pub burst_size: u64,
    /// Byte-bucket refill rate (bytes/sec); capacity is twice this.
    pub bandwidth_limit: u64,
    /// Login attempts allowed per source address per window.
    pub login_attempts: u32,
    /// Login window length in seconds.
    pub login_window_sec: u64,
    /// Lockout applied once login attempts are exhausted, in seconds.
    pub lockout_sec: u64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            messages_per_second: 100,
            burst_size: 200,
            bandwidth_limit: 1024 * 1024,
            login_attempts: 5,
            login_window_sec: 15 * 60,
            lockout_sec: 5 * 60,
        }
    }
}

/// `[performance]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceSection {
    /// Maximum record payload size in bytes.
    pub max_message_size: usize,
    /// Outbound queue capacity in frames.
    pub outbound_queue_size: usize,
    /// Initial receive buffer size in bytes.
    pub receive_buffer_size: usize,
}

impl Default for PerformanceSection {
    fn default() -> Self {
        Self {
            max_message_size: 1024 * 1024,
            outbound_queue_size: 1024,
            receive_buffer_size: 8192,
        }
    }
}

/// `[monitoring]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringSection {
    /// Whether the Prometheus endpoint is served.
    pub enable_metrics: bool,
    /// Port for the localhost metrics endpoint.
    pub metrics_port: u16,
}

impl Default for MonitoringSection {
    fn default() -> Self {
        Self {
            enable_metrics: true,
            metrics_port: 9100,
        }
    }
}

impl Config {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Listener address in `host:port` form.
    #[must_use]
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.bind_address, self.server.port)
    }

    /// Auth-phase deadline.
    #[must_use]
    pub const fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.server.auth_timeout_sec)
    }

    /// Idle close deadline.
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.server.idle_timeout_sec)
    }

    /// Outbound stall deadline.
    #[must_use]
    pub const fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.server.stall_timeout_sec)
    }

    /// Shutdown drain deadline.
    #[must_use]
    pub const fn graceful_shutdown_deadline(&self) -> Duration {
        Duration::from_secs(self.server.graceful_shutdown_sec)
    }

    /// Key-rotation interval.
    #[must_use]
    pub const fn key_rotation_interval(&self) -> Duration {
        Duration::from_secs(self.security.key_rotation_interval_sec)
    }

    /// Per-session bucket parameters.
    #[must_use]
    pub const fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            messages_per_second: self.rate_limiting.messages_per_second,
            burst_size: self.rate_limiting.burst_size,
            bandwidth_limit: self.rate_limiting.bandwidth_limit,
        }
    }

    /// Login-throttle parameters.
    #[must_use]
    pub fn login_throttle(&self) -> LoginThrottleConfig {
        LoginThrottleConfig {
            max_attempts: self.rate_limiting.login_attempts,
            window: Duration::from_secs(self.rate_limiting.login_window_sec),
            lockout: Duration::from_secs(self.rate_limiting.lockout_sec),
            ..LoginThrottleConfig::default()
        }
    }
}
