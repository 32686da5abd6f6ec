//! Outbound socket factory.
//!
//! Every socket that leaves the host on behalf of the tunnel (proxy
//! connections, direct connections, DNS queries) is created here so that it
//! carries the configured socket mark and interface binding. Without them
//! the tunnel's own traffic would be captured by the TUN routes again.

use crate::error::{TunnelError, TunnelResult};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream, UdpSocket};

/// Upper bound for establishing an outbound TCP connection.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Socket options applied to every outbound socket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DialerOptions {
    /// `SO_MARK` value; 0 leaves sockets unmarked.
    pub mark: u32,
    /// Interface to bind to; `None` uses the routing table.
    pub interface: Option<String>,
}

impl DialerOptions {
    /// Set the socket mark.
    pub fn with_mark(mut self, mark: u32) -> Self {
        self.mark = mark;
        self
    }

    /// Set the bound interface. Empty names are ignored.
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        let interface = interface.into();
        self.interface = (!interface.is_empty()).then_some(interface);
        self
    }
}

/// Creates outbound TCP/UDP sockets with the configured options.
#[derive(Debug, Clone, Default)]
pub struct Dialer {
    options: DialerOptions,
    if_index: u32,
}

impl Dialer {
    /// Create a dialer. An unknown interface is a configuration error.
    pub fn new(options: DialerOptions) -> TunnelResult<Self> {
        let if_index = match options.interface {
            Some(ref name) => interface_index(name)?,
            None => 0,
        };

        if options.mark != 0 && !cfg!(target_os = "linux") {
            log::warn!("[DIALER] Socket mark {} is only supported on Linux", options.mark);
        }

        Ok(Self { options, if_index })
    }

    /// A dialer without mark or interface binding.
    pub fn direct() -> Self {
        Self::default()
    }

    /// Get the socket mark.
    pub fn mark(&self) -> u32 {
        self.options.mark
    }

    /// Get the bound interface name.
    pub fn interface(&self) -> Option<&str> {
        self.options.interface.as_deref()
    }

    /// Connect a TCP stream to `addr`.
    pub async fn connect_tcp(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        self.apply(&socket, addr.is_ipv6())?;
        socket.set_nonblocking(true)?;

        let socket = TcpSocket::from_std_stream(socket.into());
        let stream = tokio::time::timeout(DIAL_TIMEOUT, socket.connect(addr))
            .await
            .map_err(|_| {
                io::Error::new(io::ErrorKind::TimedOut, format!("connect {} timed out", addr))
            })??;

        if let Err(e) = stream.set_nodelay(true) {
            log::warn!("[DIALER] Failed to set TCP_NODELAY: {}", e);
        }
        log::debug!("[DIALER] Connected to {}", addr);
        Ok(stream)
    }

    /// Bind an unconnected UDP socket able to reach `target`'s family.
    pub async fn bind_udp(&self, target: SocketAddr) -> io::Result<UdpSocket> {
        let domain = Domain::for_address(target);
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        self.apply(&socket, target.is_ipv6())?;
        socket.set_nonblocking(true)?;

        let local: SocketAddr = if target.is_ipv6() {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };
        socket.bind(&local.into())?;

        UdpSocket::from_std(socket.into())
    }

    fn apply(&self, socket: &Socket, ipv6: bool) -> io::Result<()> {
        if self.options.mark != 0 {
            set_mark(socket, self.options.mark)?;
        }
        if let Some(ref interface) = self.options.interface {
            bind_interface(socket, interface, self.if_index, ipv6)?;
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn set_mark(socket: &Socket, mark: u32) -> io::Result<()> {
    socket.set_mark(mark)
}

#[cfg(not(target_os = "linux"))]
fn set_mark(_socket: &Socket, _mark: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(target_os = "linux")]
fn bind_interface(socket: &Socket, name: &str, _index: u32, _ipv6: bool) -> io::Result<()> {
    socket.bind_device(Some(name.as_bytes()))
}

#[cfg(target_os = "macos")]
fn bind_interface(socket: &Socket, _name: &str, index: u32, ipv6: bool) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let (level, option) = if ipv6 {
        (libc::IPPROTO_IPV6, libc::IPV6_BOUND_IF)
    } else {
        (libc::IPPROTO_IP, libc::IP_BOUND_IF)
    };
    let value = index as libc::c_int;
    // SAFETY: fd is valid for the lifetime of `socket` and the option value
    // points to a c_int of the advertised size.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            option,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn bind_interface(_socket: &Socket, name: &str, _index: u32, _ipv6: bool) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("binding to interface {} is not supported on this platform", name),
    ))
}

#[cfg(unix)]
fn interface_index(name: &str) -> TunnelResult<u32> {
    let c_name = std::ffi::CString::new(name)
        .map_err(|_| TunnelError::Configuration(format!("invalid interface name: {:?}", name)))?;
    // SAFETY: c_name is a valid NUL-terminated string for the duration of the call.
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if index == 0 {
        return Err(TunnelError::Configuration(format!(
            "interface {} not found",
            name
        )));
    }
    Ok(index)
}

#[cfg(not(unix))]
fn interface_index(name: &str) -> TunnelResult<u32> {
    Err(TunnelError::Configuration(format!(
        "binding to interface {} is not supported on this platform",
        name
    )))
}
