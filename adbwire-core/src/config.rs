//! Client configuration.
//!
//! Everything the engine needs from its environment lives in one immutable
//! [`AdbConfig`] handed to [`AdbClient::new`](crate::AdbClient::new).
//! Protocol code never reads environment variables itself.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AdbError, Result};

/// Environment variable naming the server host.
pub const ENV_SERVER_HOST: &str = "ANDROID_ADB_SERVER_HOST";
/// Environment variable naming the server port.
pub const ENV_SERVER_PORT: &str = "ANDROID_ADB_SERVER_PORT";
/// Environment variable naming the default device serial.
pub const ENV_SERIAL: &str = "ANDROID_SERIAL";

/// How a connection is switched to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Ask the server for its version and use `tport` when supported.
    #[default]
    Auto,
    /// Always `host:transport:<serial>`.
    Transport,
    /// Always `host:tport:serial:<serial>`.
    Tport,
}

/// Connection settings for the ADB server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdbConfig {
    /// Server host name or address.
    pub host: String,
    /// Server TCP port.
    pub port: u16,
    /// TCP connect timeout in milliseconds (0 = wait forever).
    pub connect_timeout_ms: u64,
    /// Per-read timeout in milliseconds (0 = no timeout).
    pub read_timeout_ms: u64,
    /// Serial used when a call does not name a device.
    pub default_serial: Option<String>,
    /// `TERM` sent with v2 shell requests.
    pub shell_term: String,
    /// Device binding strategy.
    pub transport_mode: TransportMode,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for AdbConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 5037,
            connect_timeout_ms: 3000,
            read_timeout_ms: 0,
            default_serial: None,
            shell_term: "xterm-256color".into(),
            transport_mode: TransportMode::Auto,
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl AdbConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by `lookup`, which maps a variable name to its
    /// value. Empty values are ignored.
    pub fn from_env_with<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut cfg = Self::default();

        if let Some(host) = get(ENV_SERVER_HOST) {
            cfg.host = host.trim().to_string();
        }
        if let Some(port) = get(ENV_SERVER_PORT) {
            cfg.port = port.trim().parse().map_err(|_| {
                AdbError::Config(format!("{ENV_SERVER_PORT}={port:?} is not a valid port"))
            })?;
        }
        if let Some(serial) = get(ENV_SERIAL) {
            cfg.default_serial = Some(serial.trim().to_string());
        }
        Ok(cfg)
    }

    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    // ── Builders ─────────────────────────────────────────────────

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout_ms = timeout.map_or(0, |d| d.as_millis().max(1) as u64);
        self
    }

    pub fn with_default_serial(mut self, serial: impl Into<String>) -> Self {
        self.default_serial = Some(serial.into());
        self
    }

    pub fn with_shell_term(mut self, term: impl Into<String>) -> Self {
        self.shell_term = term.into();
        self
    }

    pub fn with_transport_mode(mut self, mode: TransportMode) -> Self {
        self.transport_mode = mode;
        self
    }

    // ── Accessors ────────────────────────────────────────────────

    /// `host:port`, bracketing IPv6 literals.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_ms > 0).then(|| Duration::from_millis(self.connect_timeout_ms))
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_ms > 0).then(|| Duration::from_millis(self.read_timeout_ms))
    }
}

// ── Tests ────────────────────────────────────────────────────────
