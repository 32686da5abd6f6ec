//! Test doubles shared by the unit tests.

use crate::adapter::{Metadata, TcpConn, TransportHandler, UdpConn};
use crate::device::{ForwardRoute, InterfaceInfo, Platform, TunHandle};
use crate::error::{TunnelError, TunnelResult};
use crate::proxy::{PacketConn, Proto, Proxy, ProxyStream};
use async_trait::async_trait;
use ipnet::IpNet;
use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;

// ============================================================================
// Platform
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformCall {
    CreateTun(String, u32),
    SetAddress(String, IpNet),
    ResolveInterface(IpAddr),
    AddRoute(ForwardRoute),
    RemoveRoute(ForwardRoute),
}

/// In-memory TUN: frames injected by the test are read by the device,
/// frames written by the device are collected for the test.
pub struct MemoryTun {
    name: String,
    mtu: u32,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

impl AsyncRead for MemoryTun {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().inbound.poll_recv(cx) {
            Poll::Ready(Some(frame)) => {
                let n = frame.len().min(buf.remaining());
                buf.put_slice(&frame[..n]);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for MemoryTun {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let result = self
            .outbound
            .send(buf.to_vec())
            .map(|()| buf.len())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "tun peer gone"));
        Poll::Ready(result)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl TunHandle for MemoryTun {
    fn interface_name(&self) -> io::Result<String> {
        Ok(self.name.clone())
    }

    fn negotiated_mtu(&self) -> io::Result<u32> {
        Ok(self.mtu)
    }
}

/// Test side of a [`MemoryTun`].
pub struct TunPeer {
    inject: mpsc::UnboundedSender<Vec<u8>>,
    written: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl TunPeer {
    pub fn inject(&self, frame: Vec<u8>) {
        let _ = self.inject.send(frame);
    }

    pub async fn next_written(&mut self) -> Option<Vec<u8>> {
        tokio::time::timeout(Duration::from_secs(1), self.written.recv())
            .await
            .ok()
            .flatten()
    }
}

/// [`Platform`] double recording every call.
pub struct MockPlatform {
    calls: Mutex<Vec<PlatformCall>>,
    peers: Mutex<Vec<TunPeer>>,
    interface: InterfaceInfo,
    offset: usize,
    mtu_cap: Option<u32>,
    fail_set_address: bool,
    fail_add_route: bool,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            peers: Mutex::new(Vec::new()),
            interface: InterfaceInfo {
                name: "tun0".into(),
                index: 1,
                metric: 0,
            },
            offset: 0,
            mtu_cap: None,
            fail_set_address: false,
            fail_add_route: false,
        }
    }

    pub fn with_interface(mut self, interface: InterfaceInfo) -> Self {
        self.interface = interface;
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_mtu_cap(mut self, cap: u32) -> Self {
        self.mtu_cap = Some(cap);
        self
    }

    pub fn fail_set_address(mut self) -> Self {
        self.fail_set_address = true;
        self
    }

    pub fn fail_add_route(mut self) -> Self {
        self.fail_add_route = true;
        self
    }

    pub fn calls(&self) -> Vec<PlatformCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn removed_routes(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, PlatformCall::RemoveRoute(_)))
            .count()
    }

    /// Take the peer of the oldest TUN not yet taken.
    pub fn take_peer(&self) -> Option<TunPeer> {
        let mut peers = self.peers.lock().unwrap();
        (!peers.is_empty()).then(|| peers.remove(0))
    }

    fn record(&self, call: PlatformCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Platform for MockPlatform {
    fn frame_offset(&self) -> usize {
        self.offset
    }

    fn create_tun(&self, name: &str, mtu: u32) -> TunnelResult<Box<dyn TunHandle>> {
        self.record(PlatformCall::CreateTun(name.to_string(), mtu));
        let (inject, inbound) = mpsc::unbounded_channel();
        let (outbound, written) = mpsc::unbounded_channel();
        self.peers.lock().unwrap().push(TunPeer { inject, written });

        let name = if name.is_empty() { "tun0" } else { name };
        Ok(Box::new(MemoryTun {
            name: name.to_string(),
            mtu: self.mtu_cap.map_or(mtu, |cap| mtu.min(cap)),
            inbound,
            outbound,
        }))
    }

    fn set_address(&self, tun_name: &str, addr: &IpNet) -> TunnelResult<()> {
        self.record(PlatformCall::SetAddress(tun_name.to_string(), *addr));
        if self.fail_set_address {
            return Err(TunnelError::Device("operation not permitted".into()));
        }
        Ok(())
    }

    fn resolve_interface(&self, addr: IpAddr) -> TunnelResult<InterfaceInfo> {
        self.record(PlatformCall::ResolveInterface(addr));
        Ok(self.interface.clone())
    }

    fn add_route(&self, route: &ForwardRoute) -> TunnelResult<()> {
        self.record(PlatformCall::AddRoute(route.clone()));
        if self.fail_add_route {
            return Err(TunnelError::Device("network unreachable".into()));
        }
        Ok(())
    }

    fn remove_route(&self, route: &ForwardRoute) {
        self.record(PlatformCall::RemoveRoute(route.clone()));
    }
}

// ============================================================================
// Transport handler
// ============================================================================

/// Handler keeping every event it receives.
#[derive(Default)]
pub struct RecordingHandler {
    tcp: Mutex<Vec<TcpConn>>,
    udp: Mutex<Vec<UdpConn>>,
}

impl RecordingHandler {
    pub fn take_tcp(&self) -> Vec<TcpConn> {
        std::mem::take(&mut *self.tcp.lock().unwrap())
    }

    pub fn take_udp(&self) -> Vec<UdpConn> {
        std::mem::take(&mut *self.udp.lock().unwrap())
    }
}

impl TransportHandler for RecordingHandler {
    fn handle_tcp(&self, conn: TcpConn) {
        self.tcp.lock().unwrap().push(conn);
    }

    fn handle_udp(&self, conn: UdpConn) {
        self.udp.lock().unwrap().push(conn);
    }
}

// ============================================================================
// Proxy
// ============================================================================

/// Proxy whose upstreams are in-process echo servers.
#[derive(Default)]
pub struct MockProxy {
    tcp_dials: AtomicUsize,
    udp_dials: AtomicUsize,
    failing: Mutex<HashSet<SocketAddr>>,
}

impl MockProxy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make dials to `dst` fail.
    pub fn fail_for(self, dst: SocketAddr) -> Self {
        self.failing.lock().unwrap().insert(dst);
        self
    }

    pub fn tcp_dials(&self) -> usize {
        self.tcp_dials.load(Ordering::SeqCst)
    }

    pub fn udp_dials(&self) -> usize {
        self.udp_dials.load(Ordering::SeqCst)
    }

    fn check(&self, metadata: &Metadata) -> io::Result<()> {
        if self.failing.lock().unwrap().contains(&metadata.dst) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{} refused", metadata.dst),
            ));
        }
        Ok(())
    }
}

/// Packet socket echoing every datagram back from its target.
pub struct EchoPacketConn {
    tx: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>,
}

impl EchoPacketConn {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }
}

#[async_trait]
impl PacketConn for EchoPacketConn {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.tx
            .send((buf.to_vec(), target))
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let (data, from) = self
            .rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe))?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok((n, from))
    }
}

#[async_trait]
impl Proxy for MockProxy {
    fn proto(&self) -> Proto {
        Proto::Direct
    }

    fn addr(&self) -> String {
        "mock".into()
    }

    async fn dial_tcp(&self, metadata: &Metadata) -> io::Result<Box<dyn ProxyStream>> {
        self.tcp_dials.fetch_add(1, Ordering::SeqCst);
        self.check(metadata)?;

        let (upstream, mut remote) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                match remote.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if remote.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(Box::new(upstream))
    }

    async fn dial_udp(&self, metadata: &Metadata) -> io::Result<Box<dyn PacketConn>> {
        self.udp_dials.fetch_add(1, Ordering::SeqCst);
        self.check(metadata)?;
        Ok(Box::new(EchoPacketConn::new()))
    }
}
