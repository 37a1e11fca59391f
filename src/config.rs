//! Configuration for the roulette server.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. explicit path (`--config`)
//!   2. $ROULETTE_CONFIG
//!   3. ./roulette.toml

use serde::{Deserialize, Serialize};
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use crate::pool::memory::DEFAULT_MAX_ATTEMPTS;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouletteConfig {
    pub server: ServerConfig,
    pub pool: PoolConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: IpAddr,
    pub port: u16,
    /// How often the server pings each WebSocket.
    pub heartbeat_interval_secs: u64,
    /// Drop a socket that has not answered a ping for this long.
    pub heartbeat_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Closure runs per transaction before giving up with RetryExhausted.
    pub max_transaction_attempts: u32,
    /// Remove participants whose lease was not refreshed for this long. 0 = never.
    pub lease_ttl_secs: u64,
    pub reap_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive used when RUST_LOG is unset.
    pub filter: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8080,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 60,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_transaction_attempts: DEFAULT_MAX_ATTEMPTS,
            lease_ttl_secs: 120,
            reap_interval_secs: 30,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "ws_roulette=debug,tower_http=info".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

impl PoolConfig {
    pub fn lease_ttl(&self) -> Option<Duration> {
        (self.lease_ttl_secs > 0).then(|| Duration::from_secs(self.lease_ttl_secs))
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl RouletteConfig {
    /// Load config: env vars → file → defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = explicit
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::file_path);
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            RouletteConfig::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn file_path() -> PathBuf {
        std::env::var("ROULETTE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("roulette.toml"))
    }

    /// Apply ROULETTE_* overrides, looking each key up through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup("ROULETTE_SERVER__BIND_ADDRESS").and_then(|v| v.parse().ok()) {
            self.server.bind_address = addr;
        }
        if let Some(port) = lookup("ROULETTE_SERVER__PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let Some(secs) =
            lookup("ROULETTE_SERVER__HEARTBEAT_INTERVAL_SECS").and_then(|v| v.parse().ok())
        {
            self.server.heartbeat_interval_secs = secs;
        }
        if let Some(secs) =
            lookup("ROULETTE_SERVER__HEARTBEAT_TIMEOUT_SECS").and_then(|v| v.parse().ok())
        {
            self.server.heartbeat_timeout_secs = secs;
        }
        if let Some(attempts) =
            lookup("ROULETTE_POOL__MAX_TRANSACTION_ATTEMPTS").and_then(|v| v.parse().ok())
        {
            self.pool.max_transaction_attempts = attempts;
        }
        if let Some(ttl) = lookup("ROULETTE_POOL__LEASE_TTL_SECS").and_then(|v| v.parse().ok()) {
            self.pool.lease_ttl_secs = ttl;
        }
        if let Some(secs) = lookup("ROULETTE_POOL__REAP_INTERVAL_SECS").and_then(|v| v.parse().ok())
        {
            self.pool.reap_interval_secs = secs;
        }
        if let Some(filter) = lookup("ROULETTE_LOG__FILTER") {
            self.log.filter = filter;
        }
    }
}
