//! Network stack wiring.
//!
//! Builds a `netstack-smoltcp` stack on top of a [`Device`], attaches it
//! through a [`LinkEndpoint`] and turns the stack's accepted TCP streams and
//! UDP datagrams into connection events for a [`TransportHandler`].

use crate::adapter::{Metadata, TcpConn, TransportHandler, UdpConn, UdpReply};
use crate::device::{Device, DeviceInfo};
use crate::endpoint::LinkEndpoint;
use crate::error::{TunnelError, TunnelResult};
use futures::{Sink, SinkExt, Stream, StreamExt};
use netstack_smoltcp::StackBuilder;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Flow table size above which closed UDP flows are swept.
const UDP_SWEEP_THRESHOLD: usize = 1024;

/// Stack tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackOptions {
    /// Packets buffered between the endpoint and the stack.
    pub stack_buffer_size: usize,
    /// Per-socket TCP buffer size in bytes.
    pub tcp_buffer_size: usize,
    /// Datagrams buffered per UDP flow before new ones are dropped.
    pub udp_flow_capacity: usize,
}

impl Default for StackOptions {
    fn default() -> Self {
        Self {
            stack_buffer_size: 1024,
            tcp_buffer_size: 256 * 1024,
            udp_flow_capacity: 64,
        }
    }
}

/// A running network stack bound to a device.
pub struct Stack {
    endpoint: Option<LinkEndpoint>,
    tasks: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl Stack {
    /// Build the stack on top of `device` and start delivering connections
    /// to `handler`.
    pub fn new(
        device: Device,
        handler: Arc<dyn TransportHandler>,
        options: StackOptions,
    ) -> TunnelResult<Self> {
        let (stack, runner, udp_socket, tcp_listener) = StackBuilder::default()
            .enable_tcp(true)
            .enable_udp(true)
            .enable_icmp(true)
            .stack_buffer_size(options.stack_buffer_size)
            .tcp_buffer_size(options.tcp_buffer_size)
            .build()
            .map_err(|e| TunnelError::Stack(format!("build netstack: {}", e)))?;

        let runner = runner.ok_or_else(|| TunnelError::Stack("netstack runner missing".into()))?;
        let udp_socket =
            udp_socket.ok_or_else(|| TunnelError::Stack("netstack UDP socket missing".into()))?;
        let tcp_listener = tcp_listener
            .ok_or_else(|| TunnelError::Stack("netstack TCP listener missing".into()))?;

        let mut tasks = Vec::with_capacity(4);
        tasks.push(tokio::spawn(async move {
            if let Err(e) = runner.await {
                log::error!("[STACK] Netstack runner error: {}", e);
            }
        }));

        let shutdown = CancellationToken::new();
        tasks.push(tokio::spawn(accept_tcp(
            tcp_listener,
            handler.clone(),
            shutdown.clone(),
        )));

        let (udp_read, udp_write) = udp_socket.split();
        let (reply_tx, reply_rx) = mpsc::channel(options.stack_buffer_size.max(1));
        tasks.push(tokio::spawn(demux_udp(
            udp_read,
            reply_tx,
            handler,
            options.udp_flow_capacity.max(1),
        )));
        tasks.push(tokio::spawn(write_udp_replies(reply_rx, udp_write)));

        let (stack_sink, stack_stream) = stack.split();
        let endpoint = LinkEndpoint::attach(device, stack_sink, stack_stream);
        log::info!("[STACK] Network stack running on {}", endpoint.info());

        Ok(Self {
            endpoint: Some(endpoint),
            tasks,
            shutdown,
        })
    }

    /// Get the attached device description.
    pub fn device(&self) -> Option<&DeviceInfo> {
        self.endpoint.as_ref().map(LinkEndpoint::info)
    }

    /// Close the endpoint (and with it the device), then stop the stack.
    ///
    /// Accepted TCP streams read end-of-stream and fail writes from here on.
    pub async fn close(mut self) {
        self.shutdown.cancel();
        if let Some(endpoint) = self.endpoint.take() {
            endpoint.close().await;
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        log::info!("[STACK] Network stack stopped");
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        self.shutdown.cancel();
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Hand every accepted stream to the handler.
async fn accept_tcp<L, T>(
    mut listener: L,
    handler: Arc<dyn TransportHandler>,
    shutdown: CancellationToken,
) where
    L: Stream<Item = (T, SocketAddr, SocketAddr)> + Unpin,
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    while let Some((stream, local, remote)) = listener.next().await {
        let metadata = Metadata::tcp(local, remote);
        log::debug!("[TCP] Accepted {}", metadata);
        let stream = StackStream::new(stream, shutdown.clone());
        handler.handle_tcp(TcpConn::new(stream, metadata));
    }
    log::debug!("[STACK] TCP listener closed");
}

/// Stream accepted from the stack, cut off when the stack shuts down.
///
/// Once the stack is gone its sockets are never woken again, so after
/// shutdown reads return end-of-stream and writes fail with `BrokenPipe`.
struct StackStream<T> {
    inner: Pin<Box<T>>,
    token: CancellationToken,
    closed: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl<T> StackStream<T> {
    fn new(inner: T, token: CancellationToken) -> Self {
        Self {
            inner: Box::pin(inner),
            closed: Box::pin(token.clone().cancelled_owned()),
            token,
        }
    }

    /// Poll the shutdown signal, registering the waker while still open.
    fn poll_closed(&mut self, cx: &mut Context<'_>) -> bool {
        self.token.is_cancelled() || self.closed.as_mut().poll(cx).is_ready()
    }
}

impl<T: AsyncRead> AsyncRead for StackStream<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_closed(cx) {
            return Poll::Ready(Ok(()));
        }
        this.inner.as_mut().poll_read(cx, buf)
    }
}

impl<T: AsyncWrite> AsyncWrite for StackStream<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.poll_closed(cx) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "network stack closed",
            )));
        }
        this.inner.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_closed(cx) {
            return Poll::Ready(Ok(()));
        }
        this.inner.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_closed(cx) {
            return Poll::Ready(Ok(()));
        }
        this.inner.as_mut().poll_shutdown(cx)
    }
}

/// Split UDP datagrams into flows keyed by (source, destination) and
/// announce each new flow to the handler.
async fn demux_udp<R>(
    mut datagrams: R,
    reply_tx: mpsc::Sender<UdpReply>,
    handler: Arc<dyn TransportHandler>,
    flow_capacity: usize,
) where
    R: Stream<Item = (Vec<u8>, SocketAddr, SocketAddr)> + Unpin,
{
    let mut flows: HashMap<(SocketAddr, SocketAddr), mpsc::Sender<Vec<u8>>> = HashMap::new();

    while let Some((payload, src, dst)) = datagrams.next().await {
        let key = (src, dst);
        let payload = match flows.get(&key) {
            Some(tx) => match tx.try_send(payload) {
                Ok(()) => continue,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::debug!("[UDP] Flow {} --> {} is backlogged, dropping datagram", src, dst);
                    continue;
                }
                Err(mpsc::error::TrySendError::Closed(payload)) => payload,
            },
            None => payload,
        };

        if flows.len() >= UDP_SWEEP_THRESHOLD {
            flows.retain(|_, tx| !tx.is_closed());
        }

        let (tx, rx) = mpsc::channel(flow_capacity);
        // Fresh channel with capacity >= 1: cannot fail.
        let _ = tx.try_send(payload);
        flows.insert(key, tx);

        let metadata = Metadata::udp(src, dst);
        log::debug!("[UDP] New flow {}", metadata);
        handler.handle_udp(UdpConn::new(metadata, rx, reply_tx.clone()));
    }
    log::debug!("[STACK] UDP socket closed");
}

/// Write reply datagrams back into the stack.
async fn write_udp_replies<W>(mut replies: mpsc::Receiver<UdpReply>, mut writer: W)
where
    W: Sink<(Vec<u8>, SocketAddr, SocketAddr)> + Unpin,
    W::Error: fmt::Display,
{
    while let Some(reply) = replies.recv().await {
        if let Err(e) = writer.send((reply.payload, reply.src, reply.dst)).await {
            log::warn!("[UDP] Failed to write reply {} --> {}: {}", reply.src, reply.dst, e);
            break;
        }
    }
}
