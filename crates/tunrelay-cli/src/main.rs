//! tunrelay
//!
//! Redirects everything entering a TUN interface through a proxy.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use tunrelay::{Engine, Key};

#[derive(Parser)]
#[command(name = "tunrelay")]
#[command(about = "Relay TUN interface traffic through a proxy")]
struct Args {
    /// TOML config file; command line flags override its values
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Device spec, e.g. tun://tun0?ip=198.18.0.1/15&route=10.0.0.0/8
    #[arg(short, long)]
    device: Option<String>,

    /// Proxy URI: direct://, reject:// or socks5://[user:pass@]host:port
    #[arg(short, long)]
    proxy: Option<String>,

    /// Device MTU (0 uses the default of 1500)
    #[arg(short, long)]
    mtu: Option<u32>,

    /// Socket mark for outbound connections (Linux only, decimal or 0x hex)
    #[arg(long, value_parser = parse_mark)]
    fwmark: Option<u32>,

    /// Bind outbound connections to this interface
    #[arg(short, long)]
    interface: Option<String>,

    /// Log level: trace, debug, info, warn, error, silent
    #[arg(short, long)]
    loglevel: Option<String>,

    /// Serve statistics over HTTP at this address (e.g. 127.0.0.1:9090)
    #[arg(long)]
    stats: Option<String>,

    /// Bearer token required by the statistics server
    #[arg(long)]
    token: Option<String>,

    /// Print version and exit
    #[arg(short, long)]
    version: bool,
}

fn parse_mark(value: &str) -> std::result::Result<u32, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("invalid mark '{}': {}", value, e))
}

impl Args {
    /// Merge the config file (if any) with the command line.
    fn into_key(self) -> Result<Key> {
        let mut key = match self.config {
            Some(ref path) => Key::from_toml_file(path)
                .with_context(|| format!("Failed to load config file: {}", path.display()))?,
            None => Key::default(),
        };

        if let Some(device) = self.device {
            key.device = device;
        }
        if let Some(proxy) = self.proxy {
            key.proxy = proxy;
        }
        if let Some(mtu) = self.mtu {
            key.mtu = mtu;
        }
        if let Some(mark) = self.fwmark {
            key.mark = mark;
        }
        if let Some(interface) = self.interface {
            key.interface = interface;
        }
        if let Some(level) = self.loglevel {
            key.log_level = level;
        }
        if let Some(stats) = self.stats {
            key.stats = stats;
        }
        if let Some(token) = self.token {
            key.token = token;
        }
        key.version |= self.version;
        Ok(key)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // The engine narrows this to the configured level on start.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("trace")).init();

    let key = Args::parse().into_key()?;
    key.validate().context("Invalid configuration")?;
    let version_only = key.version;

    let mut engine = Engine::new();
    engine.insert(key).context("Failed to load configuration")?;
    engine.start().await.context("Failed to start engine")?;
    if version_only {
        return Ok(());
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    log::info!("Received shutdown signal, stopping...");

    engine.stop().await.context("Failed to stop engine")?;
    Ok(())
}
