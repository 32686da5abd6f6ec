//! Connection events handed from the network stack to the tunnel.

use serde::Serialize;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

/// Transport protocol of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => f.write_str("tcp"),
            Network::Udp => f.write_str("udp"),
        }
    }
}

/// Addressing of one connection, as seen on the TUN side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Metadata {
    pub network: Network,
    /// Local application address.
    pub src: SocketAddr,
    /// Address the application tried to reach.
    pub dst: SocketAddr,
}

impl Metadata {
    pub fn tcp(src: SocketAddr, dst: SocketAddr) -> Self {
        Self {
            network: Network::Tcp,
            src,
            dst,
        }
    }

    pub fn udp(src: SocketAddr, dst: SocketAddr) -> Self {
        Self {
            network: Network::Udp,
            src,
            dst,
        }
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} --> {}", self.network, self.src, self.dst)
    }
}

/// Byte stream terminated by the network stack.
pub trait LocalStream: AsyncRead + AsyncWrite + Send {}

impl<T: AsyncRead + AsyncWrite + Send + ?Sized> LocalStream for T {}

/// An accepted TCP connection.
pub struct TcpConn {
    stream: Pin<Box<dyn LocalStream>>,
    metadata: Metadata,
}

impl TcpConn {
    pub fn new(stream: impl LocalStream + 'static, metadata: Metadata) -> Self {
        Self {
            stream: Box::pin(stream),
            metadata,
        }
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Take the stream out of the event.
    pub fn into_stream(self) -> Pin<Box<dyn LocalStream>> {
        self.stream
    }
}

impl fmt::Debug for TcpConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConn")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// A datagram travelling back to the local application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpReply {
    pub payload: Vec<u8>,
    /// Remote address the datagram appears to come from.
    pub src: SocketAddr,
    /// Local application address.
    pub dst: SocketAddr,
}

/// One UDP flow, identified by its (source, destination) pair.
pub struct UdpConn {
    metadata: Metadata,
    inbound: mpsc::Receiver<Vec<u8>>,
    reply: mpsc::Sender<UdpReply>,
}

impl UdpConn {
    /// Create a flow fed by `inbound` and answering through `reply`.
    pub fn new(
        metadata: Metadata,
        inbound: mpsc::Receiver<Vec<u8>>,
        reply: mpsc::Sender<UdpReply>,
    ) -> Self {
        Self {
            metadata,
            inbound,
            reply,
        }
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Split into the receive and send directions.
    pub fn split(self) -> (UdpReceiver, UdpSender) {
        (
            UdpReceiver {
                inbound: self.inbound,
            },
            UdpSender {
                metadata: self.metadata,
                reply: self.reply,
            },
        )
    }
}

impl fmt::Debug for UdpConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpConn")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Datagrams sent by the local application on one flow.
pub struct UdpReceiver {
    inbound: mpsc::Receiver<Vec<u8>>,
}

impl UdpReceiver {
    /// Next datagram, or `None` once the stack dropped the flow.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.inbound.recv().await
    }
}

/// Reply path of one flow.
#[derive(Clone)]
pub struct UdpSender {
    metadata: Metadata,
    reply: mpsc::Sender<UdpReply>,
}

impl UdpSender {
    /// Send a datagram to the local application, sourced from the
    /// flow's destination.
    pub async fn send(&self, payload: Vec<u8>) -> io::Result<()> {
        self.reply
            .send(UdpReply {
                payload,
                src: self.metadata.dst,
                dst: self.metadata.src,
            })
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "udp reply path closed"))
    }
}

/// Capability the network stack invokes for every new TCP stream and
/// every new UDP flow.
pub trait TransportHandler: Send + Sync + 'static {
    fn handle_tcp(&self, conn: TcpConn);
    fn handle_udp(&self, conn: UdpConn);
}
