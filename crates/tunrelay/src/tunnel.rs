//! Handoff queues and proxy relay workers.
//!
//! The [`Dispatcher`] is the stack's [`TransportHandler`]: it only pushes
//! connection events onto two unbounded queues, so the stack never blocks
//! on a slow upstream. The [`Tunnel`] drains both queues and relays every
//! connection in its own task.

use crate::adapter::{TcpConn, TransportHandler, UdpConn};
use crate::error::{TunnelError, TunnelResult};
use crate::proxy::Proxy;
use crate::stats::{ConnectionGuard, Statistics};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Idle time after which a UDP relay is torn down.
pub const UDP_SESSION_TIMEOUT: Duration = Duration::from_secs(60);

/// Largest datagram relayed.
const UDP_BUFFER_SIZE: usize = 65535;

/// Receiving ends of the handoff queues.
pub struct Queues {
    tcp: mpsc::UnboundedReceiver<TcpConn>,
    udp: mpsc::UnboundedReceiver<UdpConn>,
}

/// Producer side of the handoff queues.
pub struct Dispatcher {
    tcp: mpsc::UnboundedSender<TcpConn>,
    udp: mpsc::UnboundedSender<UdpConn>,
}

impl Dispatcher {
    /// Create a dispatcher and the queues it feeds.
    pub fn new() -> (Self, Queues) {
        let (tcp_tx, tcp_rx) = mpsc::unbounded_channel();
        let (udp_tx, udp_rx) = mpsc::unbounded_channel();
        (
            Self {
                tcp: tcp_tx,
                udp: udp_tx,
            },
            Queues {
                tcp: tcp_rx,
                udp: udp_rx,
            },
        )
    }
}

impl TransportHandler for Dispatcher {
    fn handle_tcp(&self, conn: TcpConn) {
        if let Err(mpsc::error::SendError(conn)) = self.tcp.send(conn) {
            log::debug!("[TCP] No relay worker, closing {}", conn.metadata());
        }
    }

    fn handle_udp(&self, conn: UdpConn) {
        if let Err(mpsc::error::SendError(conn)) = self.udp.send(conn) {
            log::debug!("[UDP] No relay worker, closing {}", conn.metadata());
        }
    }
}

/// Handles of the two queue drain loops.
pub struct Workers {
    tcp: JoinHandle<()>,
    udp: JoinHandle<()>,
}

impl Workers {
    /// Wait for both drain loops to end.
    pub async fn join(self) {
        for (name, handle) in [("tcp", self.tcp), ("udp", self.udp)] {
            if let Err(e) = handle.await {
                log::error!("{} relay loop failed: {}", name, e);
            }
        }
    }
}

/// Relays connection events through a [`Proxy`].
pub struct Tunnel {
    proxy: Arc<dyn Proxy>,
    stats: Arc<Statistics>,
    udp_timeout: Duration,
}

impl Tunnel {
    pub fn new(proxy: Arc<dyn Proxy>, stats: Arc<Statistics>) -> Self {
        Self {
            proxy,
            stats,
            udp_timeout: UDP_SESSION_TIMEOUT,
        }
    }

    /// Override the UDP idle timeout.
    pub fn with_udp_timeout(mut self, timeout: Duration) -> Self {
        self.udp_timeout = timeout;
        self
    }

    /// Start draining `queues`. The loops end once every [`Dispatcher`]
    /// feeding them is dropped.
    pub fn spawn(self, queues: Queues) -> Workers {
        let tunnel = Arc::new(self);
        let Queues { tcp, udp } = queues;
        Workers {
            tcp: tokio::spawn(tunnel.clone().process_tcp(tcp)),
            udp: tokio::spawn(tunnel.process_udp(udp)),
        }
    }

    async fn process_tcp(self: Arc<Self>, mut queue: mpsc::UnboundedReceiver<TcpConn>) {
        while let Some(conn) = queue.recv().await {
            let tunnel = self.clone();
            tokio::spawn(async move {
                if let Err(e) = tunnel.relay_tcp(conn).await {
                    log::warn!("[TCP] {}", e);
                }
            });
        }
        log::debug!("[TCP] Handoff queue closed");
    }

    async fn process_udp(self: Arc<Self>, mut queue: mpsc::UnboundedReceiver<UdpConn>) {
        while let Some(conn) = queue.recv().await {
            let tunnel = self.clone();
            tokio::spawn(async move {
                if let Err(e) = tunnel.relay_udp(conn).await {
                    log::warn!("[UDP] {}", e);
                }
            });
        }
        log::debug!("[UDP] Handoff queue closed");
    }

    async fn relay_tcp(&self, conn: TcpConn) -> TunnelResult<()> {
        let metadata = *conn.metadata();
        let mut local = conn.into_stream();

        let mut remote = match self.proxy.dial_tcp(&metadata).await {
            Ok(remote) => remote,
            Err(e) => {
                self.stats.record_dial_failure();
                return Err(TunnelError::Connection(format!(
                    "dial {} via {}: {}",
                    metadata.dst,
                    self.proxy.proto(),
                    e
                )));
            }
        };

        let guard = self.stats.track(&metadata, &self.proxy.proto().to_string());
        log::info!("[TCP] {} via {}", metadata, self.proxy.proto());

        let mut local = CountedStream {
            inner: &mut local,
            guard: &guard,
        };
        match tokio::io::copy_bidirectional(&mut local, &mut remote).await {
            Ok((up, down)) => {
                log::debug!("[TCP] {} closed (up {} B, down {} B)", metadata, up, down);
                Ok(())
            }
            Err(e) => Err(TunnelError::Connection(format!("relay {}: {}", metadata, e))),
        }
    }

    async fn relay_udp(&self, conn: UdpConn) -> TunnelResult<()> {
        let metadata = *conn.metadata();

        let remote = match self.proxy.dial_udp(&metadata).await {
            Ok(remote) => remote,
            Err(e) => {
                self.stats.record_dial_failure();
                return Err(TunnelError::Connection(format!(
                    "dial {} via {}: {}",
                    metadata.dst,
                    self.proxy.proto(),
                    e
                )));
            }
        };

        let guard = self.stats.track(&metadata, &self.proxy.proto().to_string());
        log::info!("[UDP] {} via {}", metadata, self.proxy.proto());

        let (mut local_rx, local_tx) = conn.split();
        let mut buf = vec![0u8; UDP_BUFFER_SIZE];
        let (mut up, mut down) = (0u64, 0u64);

        let idle = tokio::time::sleep(self.udp_timeout);
        tokio::pin!(idle);

        let result = loop {
            tokio::select! {
                _ = &mut idle => {
                    log::debug!("[UDP] {} idle for {:?}", metadata, self.udp_timeout);
                    break Ok(());
                }
                datagram = local_rx.recv() => match datagram {
                    Some(datagram) => {
                        if let Err(e) = remote.send_to(&datagram, metadata.dst).await {
                            break Err(e);
                        }
                        guard.add_traffic(datagram.len() as u64, 0);
                        up += datagram.len() as u64;
                    }
                    None => break Ok(()),
                },
                received = remote.recv_from(&mut buf) => match received {
                    Ok((n, _from)) => {
                        if let Err(e) = local_tx.send(buf[..n].to_vec()).await {
                            break Err(e);
                        }
                        guard.add_traffic(0, n as u64);
                        down += n as u64;
                    }
                    Err(e) => break Err(e),
                },
            }
            idle.as_mut().reset(Instant::now() + self.udp_timeout);
        };

        log::debug!("[UDP] {} closed (up {} B, down {} B)", metadata, up, down);
        result.map_err(|e| TunnelError::Connection(format!("relay {}: {}", metadata, e)))
    }
}

/// Local side of a TCP relay, crediting bytes to its connection as they
/// move: reads are upload, writes are download.
struct CountedStream<'a, S> {
    inner: &'a mut S,
    guard: &'a ConnectionGuard,
}

impl<S: AsyncRead + Unpin> AsyncRead for CountedStream<'_, S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = Pin::new(&mut *this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            this.guard
                .add_traffic((buf.filled().len() - before) as u64, 0);
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CountedStream<'_, S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut *this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = result {
            this.guard.add_traffic(0, n as u64);
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Metadata, UdpReply};
    use crate::testing::MockProxy;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn tcp_conn(dst: &str) -> (TcpConn, DuplexStream) {
        let (local, app) = tokio::io::duplex(4096);
        let conn = TcpConn::new(local, Metadata::tcp(addr("198.18.0.1:40000"), addr(dst)));
        (conn, app)
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn start(proxy: Arc<MockProxy>) -> (Dispatcher, Arc<Statistics>, Workers) {
        let stats = Arc::new(Statistics::new());
        let (dispatcher, queues) = Dispatcher::new();
        let workers = Tunnel::new(proxy, stats.clone()).spawn(queues);
        (dispatcher, stats, workers)
    }

    #[tokio::test]
    async fn test_tcp_event_is_dialed_exactly_once() {
        let proxy = Arc::new(MockProxy::new());
        let (dispatcher, stats, workers) = start(proxy.clone());

        let (conn, mut app) = tcp_conn("1.1.1.1:443");
        dispatcher.handle_tcp(conn);

        app.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        app.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(proxy.tcp_dials(), 1);
        assert_eq!(stats.snapshot().active, 1);

        drop(app);
        wait_for(|| stats.snapshot().active == 0).await;
        assert_eq!(stats.snapshot().uploaded, 5);
        assert_eq!(proxy.tcp_dials(), 1);

        drop(dispatcher);
        workers.join().await;
    }

    #[tokio::test]
    async fn test_failed_dial_does_not_affect_other_connection() {
        let proxy = Arc::new(MockProxy::new().fail_for(addr("10.9.9.9:80")));
        let (dispatcher, stats, _workers) = start(proxy.clone());

        let (failing, mut failing_app) = tcp_conn("10.9.9.9:80");
        let (working, mut working_app) = tcp_conn("1.1.1.1:443");
        dispatcher.handle_tcp(failing);
        dispatcher.handle_tcp(working);

        // Failed dial closes the local side.
        let mut buf = [0u8; 8];
        assert_eq!(failing_app.read(&mut buf).await.unwrap(), 0);

        working_app.write_all(b"ok").await.unwrap();
        let mut echo = [0u8; 2];
        working_app.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"ok");

        assert_eq!(proxy.tcp_dials(), 2);
        assert_eq!(stats.snapshot().dial_failures, 1);
    }

    #[tokio::test]
    async fn test_local_close_mid_relay_ends_worker() {
        let proxy = Arc::new(MockProxy::new());
        let (dispatcher, stats, _workers) = start(proxy);

        let (conn, mut app) = tcp_conn("1.1.1.1:443");
        dispatcher.handle_tcp(conn);
        app.write_all(b"x").await.unwrap();
        wait_for(|| stats.snapshot().active == 1).await;

        // Device gone: the stack side of the stream disappears.
        drop(app);
        wait_for(|| stats.snapshot().active == 0).await;
    }

    /// Local stream that yields `data` once, then fails with a reset.
    struct ResetAfter {
        data: Option<Vec<u8>>,
    }

    impl AsyncRead for ResetAfter {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            match self.get_mut().data.take() {
                Some(data) => {
                    buf.put_slice(&data);
                    Poll::Ready(Ok(()))
                }
                None => Poll::Ready(Err(io::ErrorKind::ConnectionReset.into())),
            }
        }
    }

    impl AsyncWrite for ResetAfter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_reset_connection_keeps_relayed_bytes() {
        let proxy = Arc::new(MockProxy::new());
        let (dispatcher, stats, _workers) = start(proxy);

        let stream = ResetAfter {
            data: Some(vec![7u8; 1000]),
        };
        let meta = Metadata::tcp(addr("198.18.0.1:40000"), addr("1.1.1.1:443"));
        dispatcher.handle_tcp(TcpConn::new(stream, meta));

        wait_for(|| stats.snapshot().tcp_total == 1 && stats.snapshot().active == 0).await;
        assert_eq!(stats.snapshot().uploaded, 1000);
    }

    #[tokio::test]
    async fn test_live_connection_reports_traffic() {
        let proxy = Arc::new(MockProxy::new());
        let (dispatcher, stats, _workers) = start(proxy);

        let (conn, mut app) = tcp_conn("1.1.1.1:443");
        dispatcher.handle_tcp(conn);
        app.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        app.read_exact(&mut buf).await.unwrap();

        wait_for(|| {
            stats
                .connections()
                .first()
                .is_some_and(|c| c.upload == 5 && c.download == 5)
        })
        .await;
        assert_eq!(stats.snapshot().active, 1);
    }

    #[tokio::test]
    async fn test_dispatcher_without_workers_closes_connection() {
        let (dispatcher, queues) = Dispatcher::new();
        drop(queues);

        let (conn, mut app) = tcp_conn("1.1.1.1:443");
        dispatcher.handle_tcp(conn);
        let mut buf = [0u8; 1];
        assert_eq!(app.read(&mut buf).await.unwrap(), 0);
    }

    fn udp_conn(
        dst: &str,
    ) -> (
        UdpConn,
        mpsc::Sender<Vec<u8>>,
        mpsc::Receiver<UdpReply>,
    ) {
        let (in_tx, in_rx) = mpsc::channel(8);
        let (reply_tx, reply_rx) = mpsc::channel(8);
        let meta = Metadata::udp(addr("198.18.0.1:5353"), addr(dst));
        (UdpConn::new(meta, in_rx, reply_tx), in_tx, reply_rx)
    }

    #[tokio::test]
    async fn test_udp_relay_round_trip() {
        let proxy = Arc::new(MockProxy::new());
        let (dispatcher, stats, _workers) = start(proxy.clone());

        let (conn, in_tx, mut reply_rx) = udp_conn("8.8.8.8:53");
        dispatcher.handle_udp(conn);
        in_tx.send(vec![1, 2, 3]).await.unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(1), reply_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.payload, vec![1, 2, 3]);
        assert_eq!(reply.src, addr("8.8.8.8:53"));
        assert_eq!(reply.dst, addr("198.18.0.1:5353"));
        assert_eq!(proxy.udp_dials(), 1);

        drop(in_tx);
        wait_for(|| stats.snapshot().active == 0).await;
        assert_eq!(stats.snapshot().udp_total, 1);
    }

    #[tokio::test]
    async fn test_udp_idle_timeout() {
        let proxy = Arc::new(MockProxy::new());
        let stats = Arc::new(Statistics::new());
        let (dispatcher, queues) = Dispatcher::new();
        let _workers = Tunnel::new(proxy, stats.clone())
            .with_udp_timeout(Duration::from_millis(50))
            .spawn(queues);

        let (conn, _in_tx, _reply_rx) = udp_conn("8.8.8.8:53");
        dispatcher.handle_udp(conn);
        wait_for(|| stats.snapshot().udp_total == 1).await;
        wait_for(|| stats.snapshot().active == 0).await;
    }
}
