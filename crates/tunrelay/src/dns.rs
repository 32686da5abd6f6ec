//! Host name resolution over dialer-created sockets.
//!
//! Queries are plain DNS over UDP, built and parsed with `hickory-proto`.
//! Sending them through the [`Dialer`] keeps them marked and bound exactly
//! like proxied traffic.

use crate::dialer::Dialer;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Per-query timeout.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Servers used when the system configuration lists none.
pub const FALLBACK_SERVERS: [SocketAddr; 2] = [
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 53),
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53),
];

const RESOLV_CONF: &str = "/etc/resolv.conf";
const MAX_RESPONSE_SIZE: usize = 4096;

/// Extract `nameserver` entries from resolv.conf content.
pub fn parse_resolv_conf(content: &str) -> Vec<SocketAddr> {
    content
        .lines()
        .filter_map(|line| {
            let line = line.split(['#', ';']).next()?.trim();
            let mut fields = line.split_whitespace();
            if fields.next()? != "nameserver" {
                return None;
            }
            // Drop IPv6 zone ids ("fe80::1%eth0").
            let addr = fields.next()?.split('%').next()?;
            addr.parse::<IpAddr>().ok().map(|ip| SocketAddr::new(ip, 53))
        })
        .collect()
}

/// Encode a recursive query for `name`.
pub fn build_query(id: u16, name: &Name, record_type: RecordType) -> io::Result<Vec<u8>> {
    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name.clone(), record_type));
    message.to_vec().map_err(io::Error::other)
}

/// Decode a response and collect its A/AAAA answers.
///
/// Returns `Ok(None)` for a response that does not belong to query `id`.
pub fn parse_response(bytes: &[u8], id: u16) -> io::Result<Option<Vec<IpAddr>>> {
    let message = Message::from_vec(bytes)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    if message.id() != id || message.message_type() != MessageType::Response {
        return Ok(None);
    }

    match message.response_code() {
        ResponseCode::NoError => {}
        ResponseCode::NXDomain => return Ok(Some(Vec::new())),
        code => {
            return Err(io::Error::other(format!("dns server answered {}", code)));
        }
    }

    let addrs = message
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect();
    Ok(Some(addrs))
}

/// Resolves host names through a [`Dialer`].
#[derive(Debug, Clone)]
pub struct Resolver {
    dialer: Arc<Dialer>,
    servers: Vec<SocketAddr>,
}

impl Resolver {
    /// Create a resolver querying `servers` in order.
    pub fn new(dialer: Arc<Dialer>, servers: Vec<SocketAddr>) -> Self {
        let servers = if servers.is_empty() {
            FALLBACK_SERVERS.to_vec()
        } else {
            servers
        };
        Self { dialer, servers }
    }

    /// Create a resolver using the servers listed in `/etc/resolv.conf`.
    pub fn from_system(dialer: Arc<Dialer>) -> Self {
        let servers = Self::read_servers(Path::new(RESOLV_CONF));
        log::debug!("Using DNS servers {:?}", servers);
        Self::new(dialer, servers)
    }

    fn read_servers(path: &Path) -> Vec<SocketAddr> {
        match std::fs::read_to_string(path) {
            Ok(content) => parse_resolv_conf(&content),
            Err(e) => {
                log::debug!("Failed to read {}: {}", path.display(), e);
                Vec::new()
            }
        }
    }

    /// Get the configured servers.
    pub fn servers(&self) -> &[SocketAddr] {
        &self.servers
    }

    /// Resolve `host` to its addresses. IP literals are returned as is.
    pub async fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let name = Name::from_ascii(host)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        for record_type in [RecordType::A, RecordType::AAAA] {
            let addrs = self.lookup(&name, record_type).await?;
            if !addrs.is_empty() {
                return Ok(addrs);
            }
        }
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses found for {}", host),
        ))
    }

    /// Resolve `host` and pair the first address with `port`.
    pub async fn resolve_socket_addr(&self, host: &str, port: u16) -> io::Result<SocketAddr> {
        let addrs = self.resolve(host).await?;
        addrs
            .first()
            .map(|ip| SocketAddr::new(*ip, port))
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, host.to_string()))
    }

    async fn lookup(&self, name: &Name, record_type: RecordType) -> io::Result<Vec<IpAddr>> {
        let mut last_error = None;
        for server in &self.servers {
            match self.query(*server, name, record_type).await {
                Ok(addrs) => return Ok(addrs),
                Err(e) => {
                    log::debug!("DNS query {} {} via {} failed: {}", name, record_type, server, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| io::Error::other("no dns servers configured")))
    }

    async fn query(
        &self,
        server: SocketAddr,
        name: &Name,
        record_type: RecordType,
    ) -> io::Result<Vec<IpAddr>> {
        let id: u16 = rand::random();
        let request = build_query(id, name, record_type)?;

        let socket = self.dialer.bind_udp(server).await?;
        socket.connect(server).await?;
        socket.send(&request).await?;

        let mut buf = vec![0u8; MAX_RESPONSE_SIZE];
        tokio::time::timeout(QUERY_TIMEOUT, async {
            loop {
                let n = socket.recv(&mut buf).await?;
                if let Some(addrs) = parse_response(&buf[..n], id)? {
                    return Ok::<_, io::Error>(addrs);
                }
            }
        })
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("dns query to {} timed out", server)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::Record;
    use tokio::net::UdpSocket;

    fn answer(request: &[u8], ips: &[Ipv4Addr]) -> Vec<u8> {
        let query = Message::from_vec(request).unwrap();
        let mut response = Message::new();
        response
            .set_id(query.id())
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .set_response_code(ResponseCode::NoError);
        for q in query.queries() {
            response.add_query(q.clone());
            if q.query_type() == RecordType::A {
                for ip in ips {
                    response.add_answer(Record::from_rdata(
                        q.name().clone(),
                        60,
                        RData::A(A(*ip)),
                    ));
                }
            }
        }
        response.to_vec().unwrap()
    }

    #[test]
    fn test_parse_resolv_conf() {
        let content = "\
# generated
search lan
nameserver 192.168.1.1
nameserver fe80::1%eth0 # link local
nameserver not-an-ip
options edns0
";
        let servers = parse_resolv_conf(content);
        assert_eq!(
            servers,
            vec![
                "192.168.1.1:53".parse().unwrap(),
                "[fe80::1]:53".parse().unwrap(),
            ]
        );
    }

    #[test]
    fn test_parse_response_ignores_foreign_id() {
        let name = Name::from_ascii("example.com.").unwrap();
        let request = build_query(7, &name, RecordType::A).unwrap();
        let response = answer(&request, &[Ipv4Addr::new(93, 184, 216, 34)]);

        assert_eq!(parse_response(&response, 8).unwrap(), None);
        assert_eq!(
            parse_response(&response, 7).unwrap(),
            Some(vec![IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))])
        );
    }

    #[test]
    fn test_empty_server_list_uses_fallback() {
        let resolver = Resolver::new(Arc::new(Dialer::direct()), Vec::new());
        assert_eq!(resolver.servers(), &FALLBACK_SERVERS);
    }

    #[tokio::test]
    async fn test_ip_literal_bypasses_dns() {
        // Unroutable server: any query would time out.
        let resolver = Resolver::new(
            Arc::new(Dialer::direct()),
            vec!["127.0.0.1:9".parse().unwrap()],
        );
        assert_eq!(
            resolver.resolve("10.1.2.3").await.unwrap(),
            vec![IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3))]
        );
        assert_eq!(
            resolver.resolve("[::1]").await.unwrap(),
            vec!["::1".parse::<IpAddr>().unwrap()]
        );
    }

    #[tokio::test]
    async fn test_resolve_through_local_server() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            let response = answer(&buf[..n], &[Ipv4Addr::new(203, 0, 113, 9)]);
            server.send_to(&response, peer).await.unwrap();
        });

        let resolver = Resolver::new(Arc::new(Dialer::direct()), vec![server_addr]);
        let addr = resolver.resolve_socket_addr("proxy.example", 1080).await.unwrap();
        assert_eq!(addr, "203.0.113.9:1080".parse().unwrap());
    }
}
