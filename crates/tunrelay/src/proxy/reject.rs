//! Reject proxy: refuses every connection.

use super::{PacketConn, Proto, Proxy, ProxyStream};
use crate::adapter::Metadata;
use async_trait::async_trait;
use std::io;

pub struct Reject;

fn rejected(metadata: &Metadata) -> io::Error {
    io::Error::new(
        io::ErrorKind::ConnectionRefused,
        format!("{} rejected", metadata),
    )
}

#[async_trait]
impl Proxy for Reject {
    fn proto(&self) -> Proto {
        Proto::Reject
    }

    fn addr(&self) -> String {
        String::new()
    }

    async fn dial_tcp(&self, metadata: &Metadata) -> io::Result<Box<dyn ProxyStream>> {
        Err(rejected(metadata))
    }

    async fn dial_udp(&self, metadata: &Metadata) -> io::Result<Box<dyn PacketConn>> {
        Err(rejected(metadata))
    }
}
