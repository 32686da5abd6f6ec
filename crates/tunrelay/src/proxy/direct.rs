//! Direct proxy: connects straight to the destination.

use super::{PacketConn, Proto, Proxy, ProxyStream};
use crate::adapter::Metadata;
use crate::dialer::Dialer;
use async_trait::async_trait;
use std::io;
use std::sync::Arc;

/// Connects to the captured destination through the dialer.
pub struct Direct {
    dialer: Arc<Dialer>,
}

impl Direct {
    pub fn new(dialer: Arc<Dialer>) -> Self {
        Self { dialer }
    }
}

#[async_trait]
impl Proxy for Direct {
    fn proto(&self) -> Proto {
        Proto::Direct
    }

    fn addr(&self) -> String {
        String::new()
    }

    async fn dial_tcp(&self, metadata: &Metadata) -> io::Result<Box<dyn ProxyStream>> {
        let stream = self.dialer.connect_tcp(metadata.dst).await?;
        Ok(Box::new(stream))
    }

    async fn dial_udp(&self, metadata: &Metadata) -> io::Result<Box<dyn PacketConn>> {
        let socket = self.dialer.bind_udp(metadata.dst).await?;
        Ok(Box::new(socket))
    }
}
