//! Transparent TUN-to-proxy data plane.
//!
//! Packets entering a TUN interface are reassembled into TCP streams and UDP
//! flows by a userspace network stack and relayed through an upstream proxy:
//! - **tun**: cross-platform TUN device creation and async I/O
//! - **netstack-smoltcp**: userspace TCP/IP stack
//! - **tokio-socks**: SOCKS5 client handshake
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            tunrelay                              │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ Device ◄──► LinkEndpoint ◄──► Stack ──► Dispatcher ──► queues    │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ Tunnel workers ◄──► Proxy (direct/reject/socks5) ◄──► Dialer     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod adapter;
pub mod config;
pub mod device;
pub mod dialer;
pub mod dns;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod proxy;
pub mod stack;
pub mod stats;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use adapter::{Metadata, Network, TcpConn, TransportHandler, UdpConn};
pub use config::Key;
pub use device::{Device, DeviceParams, OsPlatform, Platform, DEFAULT_MTU};
pub use dialer::{Dialer, DialerOptions};
pub use engine::{Engine, EngineState};
pub use error::{TunnelError, TunnelResult};
pub use proxy::{parse_proxy, Proto, Proxy};
pub use stats::Statistics;

/// Crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
