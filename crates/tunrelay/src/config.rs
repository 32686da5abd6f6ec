//! Engine configuration.
//!
//! A [`Key`] is the complete, immutable configuration of one engine run.
//! It can be loaded from a TOML file and is usually overridden field by
//! field from the command line:
//!
//! ```toml
//! device = "tun://tun0?ip=198.18.0.1/15&route=10.0.0.0/8"
//! proxy = "socks5://127.0.0.1:1080"
//! mtu = 1500
//! log_level = "info"
//! ```

use crate::device::MAX_MTU;
use crate::error::{TunnelError, TunnelResult};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;

/// Engine configuration snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Key {
    /// Device MTU; 0 uses the device default.
    pub mtu: u32,
    /// Socket mark for outbound sockets; 0 disables marking.
    pub mark: u32,
    /// Proxy URI (`direct://`, `reject://`, `socks5://host:port`).
    pub proxy: String,
    /// Stats server listen address; empty disables it.
    pub stats: String,
    /// Bearer token required by the stats server.
    pub token: String,
    /// Device spec (`tun://name?ip=...&route=...` or a bare name).
    pub device: String,
    /// Log level.
    #[serde(alias = "loglevel")]
    pub log_level: String,
    /// Interface outbound sockets are bound to; empty disables binding.
    pub interface: String,
    /// Print the version instead of starting.
    pub version: bool,
}

impl Default for Key {
    fn default() -> Self {
        Self {
            mtu: 0,
            mark: 0,
            proxy: String::new(),
            stats: String::new(),
            token: String::new(),
            device: String::new(),
            log_level: "info".to_string(),
            interface: String::new(),
            version: false,
        }
    }
}

impl Key {
    /// Parse a key from TOML text.
    pub fn from_toml_str(content: &str) -> TunnelResult<Self> {
        toml::from_str(content)
            .map_err(|e| TunnelError::Configuration(format!("invalid config: {}", e)))
    }

    /// Load a key from a TOML file.
    pub fn from_toml_file(path: &Path) -> TunnelResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TunnelError::Configuration(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            TunnelError::Configuration(msg) => {
                TunnelError::Configuration(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    /// Check the fields that can be checked without touching the system.
    pub fn validate(&self) -> TunnelResult<()> {
        parse_log_level(&self.log_level)?;
        if self.mtu > MAX_MTU {
            return Err(TunnelError::Configuration(format!(
                "mtu {} exceeds maximum {}",
                self.mtu, MAX_MTU
            )));
        }
        self.stats_addr()?;
        if self.version {
            return Ok(());
        }
        if self.proxy.trim().is_empty() {
            return Err(TunnelError::Configuration("empty proxy".into()));
        }
        if self.device.trim().is_empty() {
            return Err(TunnelError::Configuration("empty device".into()));
        }
        Ok(())
    }

    /// Parse the stats listen address. `:port` listens on all interfaces.
    pub fn stats_addr(&self) -> TunnelResult<Option<SocketAddr>> {
        let raw = self.stats.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        let parsed = match raw.strip_prefix(':') {
            Some(port) => port
                .parse::<u16>()
                .map(|port| SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
                .ok(),
            None => raw.parse::<SocketAddr>().ok(),
        };
        parsed.map(Some).ok_or_else(|| {
            TunnelError::Configuration(format!("invalid stats address: {}", raw))
        })
    }
}

/// Map a log level name to a filter.
pub fn parse_log_level(level: &str) -> TunnelResult<LevelFilter> {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(LevelFilter::Trace),
        "debug" => Ok(LevelFilter::Debug),
        "" | "info" => Ok(LevelFilter::Info),
        "warn" | "warning" => Ok(LevelFilter::Warn),
        "error" => Ok(LevelFilter::Error),
        "silent" | "off" => Ok(LevelFilter::Off),
        other => Err(TunnelError::Configuration(format!(
            "unknown log level: {}",
            other
        ))),
    }
}
