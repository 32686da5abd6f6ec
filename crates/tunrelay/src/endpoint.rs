//! Link endpoint: moves packet frames between a [`Device`] and a network
//! stack.
//!
//! Two tasks are spawned per endpoint. The inbound task reads frames from
//! the device, strips the frame offset and hands the IP packet to the stack
//! sink. The outbound task takes packets from the stack stream, prepends the
//! offset header and writes them to the device. Both tasks own their device
//! half, so cancelling them releases the OS handle.

use crate::device::{Device, DeviceInfo, DeviceReader, DeviceWriter, RouteGuard, MAX_MTU};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt;
use std::io;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// BSD utun protocol family values.
const AF_INET: u32 = 2;
const AF_INET6: u32 = 30;

/// Strip the offset from a device frame and check the payload against the
/// MTU. Returns `None` for frames that must be dropped.
pub fn strip_frame(frame: &[u8], info: &DeviceInfo) -> Option<Vec<u8>> {
    if frame.len() <= info.offset {
        log::debug!("Dropping short frame ({} bytes) from {}", frame.len(), info.name);
        return None;
    }
    let payload = &frame[info.offset..];
    if payload.len() > info.mtu as usize {
        log::warn!(
            "Dropping oversized packet from {}: {} > MTU {}",
            info.name,
            payload.len(),
            info.mtu
        );
        return None;
    }
    Some(payload.to_vec())
}

/// Prepend the offset header to an outbound IP packet. Returns `None` for
/// packets larger than the MTU.
pub fn frame_packet(packet: &[u8], info: &DeviceInfo) -> Option<Vec<u8>> {
    if packet.is_empty() || packet.len() > info.mtu as usize {
        log::warn!(
            "Dropping outbound packet for {}: {} bytes, MTU {}",
            info.name,
            packet.len(),
            info.mtu
        );
        return None;
    }

    let mut frame = Vec::with_capacity(info.offset + packet.len());
    if info.offset == 4 {
        let is_v6 = packet[0] >> 4 == 6;
        if cfg!(target_os = "linux") {
            // IFF_PI: flags(2) + ethertype(2)
            let proto: u16 = if is_v6 { 0x86DD } else { 0x0800 };
            frame.extend_from_slice(&[0, 0]);
            frame.extend_from_slice(&proto.to_be_bytes());
        } else {
            let family = if is_v6 { AF_INET6 } else { AF_INET };
            frame.extend_from_slice(&family.to_be_bytes());
        }
    } else {
        frame.resize(info.offset, 0);
    }
    frame.extend_from_slice(packet);
    Some(frame)
}

/// Bridge between a device and a network stack.
pub struct LinkEndpoint {
    info: DeviceInfo,
    cancel: CancellationToken,
    inbound: Option<JoinHandle<()>>,
    outbound: Option<JoinHandle<()>>,
    route: Option<RouteGuard>,
}

impl LinkEndpoint {
    /// Attach `device` to a stack given by its packet sink (device → stack)
    /// and packet stream (stack → device).
    pub fn attach<Si, St>(device: Device, sink: Si, stream: St) -> Self
    where
        Si: Sink<Vec<u8>> + Send + Unpin + 'static,
        Si::Error: fmt::Display + Send,
        St: Stream<Item = io::Result<Vec<u8>>> + Send + Unpin + 'static,
    {
        let info = device.info().clone();
        let (reader, writer, route) = device.into_parts();
        let cancel = CancellationToken::new();

        let inbound = tokio::spawn(inbound_loop(reader, sink, info.clone(), cancel.clone()));
        let outbound = tokio::spawn(outbound_loop(stream, writer, info.clone(), cancel.clone()));
        log::info!("Attached link endpoint to {} (mtu {}, offset {})", info, info.mtu, info.offset);

        Self {
            info,
            cancel,
            inbound: Some(inbound),
            outbound: Some(outbound),
            route,
        }
    }

    /// Get the attached device description.
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Cancel both directions, wait for them, then remove the device route.
    pub async fn close(mut self) {
        self.cancel.cancel();
        for handle in [self.inbound.take(), self.outbound.take()].into_iter().flatten() {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    log::error!("Link endpoint task panicked: {}", e);
                }
            }
        }
        // Both device halves are gone at this point.
        self.route.take();
        log::info!("Closed link endpoint for {}", self.info);
    }
}

impl Drop for LinkEndpoint {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn inbound_loop<Si>(
    mut reader: DeviceReader,
    mut sink: Si,
    info: DeviceInfo,
    cancel: CancellationToken,
) where
    Si: Sink<Vec<u8>> + Unpin,
    Si::Error: fmt::Display,
{
    // Sized for the largest possible frame so oversized packets are seen
    // whole and dropped instead of truncated.
    let mut buf = vec![0u8; MAX_MTU as usize + info.offset];

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            result = reader.read(&mut buf) => match result {
                Ok(0) => {
                    log::info!("TUN device {} reached end of stream", info.name);
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    log::error!("TUN read error on {}: {}", info.name, e);
                    break;
                }
            }
        };

        let Some(packet) = strip_frame(&buf[..n], &info) else {
            continue;
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            result = sink.send(packet) => {
                if let Err(e) = result {
                    log::error!("[STACK] Failed to deliver inbound packet: {}", e);
                    break;
                }
            }
        }
    }

    if let Err(e) = sink.close().await {
        log::debug!("[STACK] Closing stack sink: {}", e);
    }
    log::debug!("Inbound loop for {} stopped", info.name);
}

async fn outbound_loop<St>(
    mut stream: St,
    mut writer: DeviceWriter,
    info: DeviceInfo,
    cancel: CancellationToken,
) where
    St: Stream<Item = io::Result<Vec<u8>>> + Unpin,
{
    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => match next {
                Some(Ok(packet)) => packet,
                Some(Err(e)) => {
                    log::warn!("[STACK] Outbound packet error: {}", e);
                    continue;
                }
                None => break,
            }
        };

        let Some(frame) = frame_packet(&packet, &info) else {
            continue;
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            result = writer.write(&frame) => {
                if let Err(e) = result {
                    log::error!("TUN write error on {}: {}", info.name, e);
                    break;
                }
            }
        }
    }
    log::debug!("Outbound loop for {} stopped", info.name);
}
