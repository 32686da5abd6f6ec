//! SOCKS5 proxy client (TCP CONNECT).

use super::{PacketConn, Proto, Proxy, ProxyStream};
use crate::adapter::Metadata;
use crate::dialer::Dialer;
use crate::dns::Resolver;
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use tokio_socks::tcp::Socks5Stream;

/// Tunnels TCP connections through a SOCKS5 server.
pub struct Socks5 {
    host: String,
    port: u16,
    auth: Option<(String, String)>,
    dialer: Arc<Dialer>,
    resolver: Arc<Resolver>,
}

impl Socks5 {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        auth: Option<(String, String)>,
        dialer: Arc<Dialer>,
        resolver: Arc<Resolver>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            auth,
            dialer,
            resolver,
        }
    }
}

#[async_trait]
impl Proxy for Socks5 {
    fn proto(&self) -> Proto {
        Proto::Socks5
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn dial_tcp(&self, metadata: &Metadata) -> io::Result<Box<dyn ProxyStream>> {
        let server = self
            .resolver
            .resolve_socket_addr(&self.host, self.port)
            .await?;
        let socket = self.dialer.connect_tcp(server).await?;

        let stream = match self.auth {
            Some((ref user, ref pass)) => {
                Socks5Stream::connect_with_password_and_socket(socket, metadata.dst, user, pass)
                    .await
            }
            None => Socks5Stream::connect_with_socket(socket, metadata.dst).await,
        }
        .map_err(|e| io::Error::other(format!("socks5 handshake with {}: {}", server, e)))?;

        Ok(Box::new(stream))
    }

    async fn dial_udp(&self, metadata: &Metadata) -> io::Result<Box<dyn PacketConn>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("socks5 UDP is not supported ({})", metadata),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal no-auth SOCKS5 server: accepts one CONNECT to an IPv4
    /// address, replies success and echoes the tunneled bytes.
    async fn serve_one(listener: TcpListener) -> SocketAddr {
        let (mut stream, _) = listener.accept().await.unwrap();

        let mut greeting = [0u8; 2];
        stream.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting[0], 0x05);
        let mut methods = vec![0u8; greeting[1] as usize];
        stream.read_exact(&mut methods).await.unwrap();
        stream.write_all(&[0x05, 0x00]).await.unwrap();

        let mut request = [0u8; 10];
        stream.read_exact(&mut request).await.unwrap();
        assert_eq!(&request[..4], &[0x05, 0x01, 0x00, 0x01]);
        let ip = std::net::Ipv4Addr::new(request[4], request[5], request[6], request[7]);
        let port = u16::from_be_bytes([request[8], request[9]]);

        stream
            .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();

        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        stream.write_all(&buf).await.unwrap();
        SocketAddr::from((ip, port))
    }

    fn proxy_for(server: SocketAddr) -> Socks5 {
        let dialer = Arc::new(Dialer::direct());
        let resolver = Arc::new(Resolver::new(dialer.clone(), Vec::new()));
        Socks5::new(server.ip().to_string(), server.port(), None, dialer, resolver)
    }

    #[tokio::test]
    async fn test_socks5_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_one(listener));

        let proxy = proxy_for(server_addr);
        let meta = Metadata::tcp(
            "198.18.0.1:40000".parse().unwrap(),
            "93.184.216.34:443".parse().unwrap(),
        );
        let mut stream = proxy.dial_tcp(&meta).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        assert_eq!(server.await.unwrap(), meta.dst);
    }

    #[tokio::test]
    async fn test_socks5_udp_unsupported() {
        let proxy = proxy_for("127.0.0.1:1080".parse().unwrap());
        let meta = Metadata::udp(
            "198.18.0.1:40000".parse().unwrap(),
            "8.8.8.8:53".parse().unwrap(),
        );
        let err = proxy.dial_udp(&meta).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }
}
