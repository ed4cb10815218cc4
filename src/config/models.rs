// src/config/models.rs
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::codec::Limits;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the client-facing listener binds to.
    pub listen: SocketAddr,
    /// The single upstream server, as `host:port`.
    pub upstream: String,
    pub pool: PoolConfig,
    pub proxy: ProxyConfig,
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            upstream: "127.0.0.1:8081".to_string(),
            pool: PoolConfig::default(),
            proxy: ProxyConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.upstream.trim().is_empty() {
            bail!("upstream address must not be empty");
        }
        if self.pool.capacity == 0 {
            bail!("pool.capacity must be greater than zero");
        }
        if self.proxy.max_head_bytes == 0 || self.proxy.max_headers == 0 {
            bail!("proxy.max_head_bytes and proxy.max_headers must be greater than zero");
        }
        if self.metrics.enabled && !self.metrics.path.starts_with('/') {
            bail!("metrics.path must start with '/'");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of idle backends kept for reuse.
    pub capacity: usize,
    /// How long an acquire waits for an idle backend before dialing a new one.
    pub acquire_timeout_ms: u64,
    /// How long a release waits for a free slot before closing the backend.
    pub release_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            acquire_timeout_ms: 100,
            release_timeout_ms: 1000,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn release_timeout(&self) -> Duration {
        Duration::from_millis(self.release_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Deadline for one backend write + read. `None` leaves backend I/O untimed.
    pub exchange_timeout_ms: Option<u64>,
    /// Deadline for dialing the upstream. `None` waits for the OS.
    pub connect_timeout_ms: Option<u64>,
    pub max_head_bytes: usize,
    pub max_headers: usize,
    pub max_body_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        let limits = Limits::default();
        Self {
            exchange_timeout_ms: Some(30_000),
            connect_timeout_ms: None,
            max_head_bytes: limits.max_head_bytes,
            max_headers: limits.max_headers,
            max_body_bytes: limits.max_body_bytes,
        }
    }
}

impl ProxyConfig {
    pub fn exchange_timeout(&self) -> Option<Duration> {
        self.exchange_timeout_ms.map(Duration::from_millis)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_head_bytes: self.max_head_bytes,
            max_headers: self.max_headers,
            max_body_bytes: self.max_body_bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
    pub path: String,
    /// Path serving the per-path byte totals as JSON.
    pub stats_path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
            path: "/metrics".to_string(),
            stats_path: "/stats".to_string(),
        }
    }
}
