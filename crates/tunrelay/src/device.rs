//! TUN device creation and management.
//!
//! A [`Device`] owns one OS virtual interface. Opening it validates the
//! `ip`/`route` parameters, creates the TUN, assigns the address, installs the
//! optional forward route and finally reads back the MTU the OS settled on.
//! Every OS side effect goes through the [`Platform`] trait so the ordering
//! rules can be checked without privileges.

use crate::error::{TunnelError, TunnelResult};
use ipnet::IpNet;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use url::Url;

/// MTU used when the key leaves it at 0.
pub const DEFAULT_MTU: u32 = 1500;

/// Largest MTU a TUN interface accepts.
pub const MAX_MTU: u32 = u16::MAX as u32;

/// Scheme used for TUN device specs (`tun://name?ip=...`).
pub const TUN_SCHEME: &str = "tun";

/// Raw packet handle of an open TUN interface.
///
/// One `poll_read` yields exactly one frame and one `poll_write` submits
/// exactly one frame.
pub trait TunHandle: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Name the OS gave the interface.
    fn interface_name(&self) -> io::Result<String>;

    /// MTU currently configured on the interface.
    fn negotiated_mtu(&self) -> io::Result<u32>;
}

impl TunHandle for tun::AsyncDevice {
    fn interface_name(&self) -> io::Result<String> {
        use tun::AbstractDevice;
        self.tun_name().map_err(io::Error::other)
    }

    fn negotiated_mtu(&self) -> io::Result<u32> {
        use tun::AbstractDevice;
        self.mtu().map(u32::from).map_err(io::Error::other)
    }
}

/// Interface that owns a local address, as seen by the routing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    /// Interface name (e.g., "tun0").
    pub name: String,
    /// Kernel interface index.
    pub index: u32,
    /// Route metric of the interface's existing routes.
    pub metric: u32,
}

/// A forwarding route inserted at device open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRoute {
    /// Destination prefix.
    pub destination: IpNet,
    /// Next hop (the configured local address).
    pub next_hop: IpAddr,
    /// Interface the route is scoped to.
    pub interface: InterfaceInfo,
}

impl ForwardRoute {
    /// Dotted netmask of the destination (IPv4 only).
    pub fn netmask(&self) -> Option<Ipv4Addr> {
        match self.destination {
            IpNet::V4(net) => Some(subnet_mask(net.prefix_len())),
            IpNet::V6(_) => None,
        }
    }

    /// Build command args for adding the route on Linux.
    pub fn linux_add_args(&self) -> Vec<String> {
        self.linux_args("add")
    }

    /// Build command args for removing the route on Linux.
    pub fn linux_delete_args(&self) -> Vec<String> {
        self.linux_args("del")
    }

    // Linux has no gateway form for a route through one of its own
    // addresses, so the next hop becomes the preferred source.
    fn linux_args(&self, verb: &str) -> Vec<String> {
        let mut args = Vec::with_capacity(10);
        if self.destination.addr().is_ipv6() {
            args.push("-6".to_string());
        }
        args.extend([
            "route".to_string(),
            verb.to_string(),
            self.destination.trunc().to_string(),
            "dev".to_string(),
            self.interface.name.clone(),
            "src".to_string(),
            self.next_hop.to_string(),
            "metric".to_string(),
            self.interface.metric.to_string(),
        ]);
        args
    }

    /// Build command args for adding the route on macOS.
    pub fn macos_add_args(&self) -> Vec<String> {
        self.macos_args("add")
    }

    /// Build command args for removing the route on macOS.
    pub fn macos_delete_args(&self) -> Vec<String> {
        self.macos_args("delete")
    }

    fn macos_args(&self, verb: &str) -> Vec<String> {
        match self.netmask() {
            Some(mask) => vec![
                "-n".into(),
                verb.into(),
                "-net".into(),
                self.destination.network().to_string(),
                "-netmask".into(),
                mask.to_string(),
                self.next_hop.to_string(),
            ],
            None => vec![
                "-n".into(),
                verb.into(),
                "-inet6".into(),
                self.destination.trunc().to_string(),
                self.next_hop.to_string(),
            ],
        }
    }
}

impl fmt::Display for ForwardRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} via {} dev {} (index {}, metric {})",
            self.destination,
            self.next_hop,
            self.interface.name,
            self.interface.index,
            self.interface.metric
        )
    }
}

/// OS operations needed to bring a TUN device up.
pub trait Platform: Send + Sync {
    /// Bytes the OS handle prefixes to every frame.
    fn frame_offset(&self) -> usize;

    /// Create the TUN interface with the requested MTU.
    fn create_tun(&self, name: &str, mtu: u32) -> TunnelResult<Box<dyn TunHandle>>;

    /// Assign an address to the interface and bring it up.
    fn set_address(&self, tun_name: &str, addr: &IpNet) -> TunnelResult<()>;

    /// Find the interface that owns `addr`.
    fn resolve_interface(&self, addr: IpAddr) -> TunnelResult<InterfaceInfo>;

    /// Insert a forward route.
    fn add_route(&self, route: &ForwardRoute) -> TunnelResult<()>;

    /// Remove a forward route (best-effort).
    fn remove_route(&self, route: &ForwardRoute);
}

/// Derive the dotted-decimal mask for an IPv4 prefix length.
///
/// Lengths above 32 saturate to a host mask.
pub fn subnet_mask(prefix_len: u8) -> Ipv4Addr {
    let bits = match prefix_len {
        0 => 0,
        len if len >= 32 => u32::MAX,
        len => u32::MAX << (32 - u32::from(len)),
    };
    Ipv4Addr::from(bits)
}

/// Raw `ip`/`route` query parameters of a device spec.
///
/// Values stay unparsed until [`Device::open`] so that validation happens
/// in one place, before any OS mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceParams {
    /// Interface address in CIDR notation.
    pub ip: Option<String>,
    /// Extra route to install through the interface, in CIDR notation.
    pub route: Option<String>,
}

impl DeviceParams {
    /// Set the interface address.
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    /// Set the route prefix.
    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    /// Collect the recognised query parameters of a device URL.
    pub fn from_url(url: &Url) -> Self {
        let mut params = Self::default();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "ip" => params.ip = Some(value.into_owned()),
                "route" => params.route = Some(value.into_owned()),
                other => log::debug!("Ignoring unknown device parameter: {}", other),
            }
        }
        params
    }

    /// Parse both values; empty strings count as unset.
    fn validate(&self) -> TunnelResult<(Option<IpNet>, Option<IpNet>)> {
        let ip = parse_cidr("ip", self.ip.as_deref())?;
        if let Some(ref net) = ip {
            if net.addr().is_unspecified() || net.addr().is_multicast() {
                return Err(TunnelError::Configuration(format!(
                    "ip not valid: {} is not a unicast host address",
                    net
                )));
            }
        }
        let route = parse_cidr("route", self.route.as_deref())?;
        Ok((ip, route))
    }
}

fn parse_cidr(field: &str, value: Option<&str>) -> TunnelResult<Option<IpNet>> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => raw.parse::<IpNet>().map(Some).map_err(|e| {
            TunnelError::Configuration(format!("parse {}: invalid CIDR '{}': {}", field, raw, e))
        }),
    }
}

/// Parsed `type://name?params` device spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    /// Interface name; empty lets the OS pick one.
    pub name: String,
    /// Address configuration.
    pub params: DeviceParams,
}

impl DeviceSpec {
    /// Parse a device spec. A bare name is shorthand for `tun://name`.
    pub fn parse(spec: &str) -> TunnelResult<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(TunnelError::Configuration("empty device".into()));
        }

        let spec = if spec.contains("://") {
            spec.to_string()
        } else {
            format!("{}://{}", TUN_SCHEME, spec)
        };

        let url = Url::parse(&spec).map_err(|e| {
            TunnelError::Configuration(format!("invalid device '{}': {}", spec, e))
        })?;

        if !url.scheme().eq_ignore_ascii_case(TUN_SCHEME) {
            return Err(TunnelError::Configuration(format!(
                "unsupported device type: {}",
                url.scheme()
            )));
        }

        Ok(Self {
            name: url.host_str().unwrap_or_default().to_string(),
            params: DeviceParams::from_url(&url),
        })
    }
}

/// Open a device from its spec string.
pub fn parse_device(spec: &str, mtu: u32, platform: Arc<dyn Platform>) -> TunnelResult<Device> {
    let spec = DeviceSpec::parse(spec)?;
    Device::open(&spec.name, &spec.params, mtu, platform)
}

/// Static description of an open device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Device type (always "tun").
    pub kind: &'static str,
    /// Interface name.
    pub name: String,
    /// MTU negotiated with the OS.
    pub mtu: u32,
    /// Bytes prefixed to every frame.
    pub offset: usize,
}

impl DeviceInfo {
    /// Buffer size for one frame (MTU + offset).
    pub fn buffer_size(&self) -> usize {
        self.mtu as usize + self.offset
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.kind, self.name)
    }
}

/// An open TUN device.
pub struct Device {
    handle: Box<dyn TunHandle>,
    info: DeviceInfo,
    route: Option<RouteGuard>,
}

impl Device {
    /// Open and configure a TUN device.
    ///
    /// Steps run in a fixed order and stop at the first failure:
    /// parameter validation, TUN creation, address assignment, route
    /// insertion, MTU query. Route insertion is the last mutation, so a
    /// failure never leaves a route behind.
    pub fn open(
        name: &str,
        params: &DeviceParams,
        mtu: u32,
        platform: Arc<dyn Platform>,
    ) -> TunnelResult<Self> {
        if mtu > MAX_MTU {
            return Err(TunnelError::Configuration(format!(
                "mtu {} exceeds maximum {}",
                mtu, MAX_MTU
            )));
        }
        let (ip, route) = params.validate()?;

        let requested_mtu = if mtu > 0 { mtu } else { DEFAULT_MTU };
        let handle = platform.create_tun(name, requested_mtu)?;
        let tun_name = handle
            .interface_name()
            .map_err(|e| TunnelError::Device(format!("Failed to get TUN name: {}", e)))?;

        let mut route_guard = None;
        match ip {
            Some(ip) => {
                platform
                    .set_address(&tun_name, &ip)
                    .map_err(|e| TunnelError::Device(format!("SetIPAddresses: {}", e)))?;
                log::info!("Assigned {} to {}", ip, tun_name);

                if let Some(destination) = route {
                    let interface = platform
                        .resolve_interface(ip.addr())
                        .map_err(|e| TunnelError::Device(format!("ResolveInterface: {}", e)))?;
                    let forward = ForwardRoute {
                        destination,
                        next_hop: ip.addr(),
                        interface,
                    };
                    platform
                        .add_route(&forward)
                        .map_err(|e| TunnelError::Device(format!("AddRoute: {}", e)))?;
                    log::info!("Added route {}", forward);
                    route_guard = Some(RouteGuard::new(platform.clone(), forward));
                }
            }
            None => {
                if let Some(route) = route {
                    log::warn!("Ignoring route {} on {}: no ip configured", route, tun_name);
                }
            }
        }

        let negotiated = handle
            .negotiated_mtu()
            .map_err(|e| TunnelError::Device(format!("get mtu: {}", e)))?;
        if negotiated != requested_mtu {
            log::info!(
                "MTU of {} negotiated to {} (requested {})",
                tun_name,
                negotiated,
                requested_mtu
            );
        }

        Ok(Self {
            handle,
            info: DeviceInfo {
                kind: TUN_SCHEME,
                name: tun_name,
                mtu: negotiated,
                offset: platform.frame_offset(),
            },
            route: route_guard,
        })
    }

    /// Get the device description.
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Get the device name.
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Get the negotiated MTU.
    pub fn mtu(&self) -> u32 {
        self.info.mtu
    }

    /// Get the frame offset.
    pub fn offset(&self) -> usize {
        self.info.offset
    }

    /// Get the route installed at open, if any.
    pub fn route(&self) -> Option<&ForwardRoute> {
        self.route.as_ref().map(RouteGuard::route)
    }

    /// Read one frame (offset + payload) from the device.
    pub async fn read(&mut self, buf: &mut [u8]) -> TunnelResult<usize> {
        self.handle.read(buf).await.map_err(TunnelError::Network)
    }

    /// Write one frame (offset + payload) to the device.
    pub async fn write(&mut self, buf: &[u8]) -> TunnelResult<usize> {
        self.handle.write(buf).await.map_err(TunnelError::Network)
    }

    /// Split the device into its read half, write half and route guard.
    pub fn into_parts(self) -> (DeviceReader, DeviceWriter, Option<RouteGuard>) {
        let (reader, writer) = tokio::io::split(self.handle);
        (
            DeviceReader { reader },
            DeviceWriter { writer },
            self.route,
        )
    }

    /// Close the device: the handle first, then the route.
    pub fn close(self) {
        let Self { handle, info, route } = self;
        drop(handle);
        drop(route);
        log::info!("Closed TUN device: {}", info.name);
    }
}

/// Read half of a split device.
pub struct DeviceReader {
    reader: ReadHalf<Box<dyn TunHandle>>,
}

impl DeviceReader {
    /// Read one frame from the device.
    pub async fn read(&mut self, buf: &mut [u8]) -> TunnelResult<usize> {
        self.reader.read(buf).await.map_err(TunnelError::Network)
    }
}

/// Write half of a split device.
pub struct DeviceWriter {
    writer: WriteHalf<Box<dyn TunHandle>>,
}

impl DeviceWriter {
    /// Write one frame to the device.
    pub async fn write(&mut self, buf: &[u8]) -> TunnelResult<usize> {
        self.writer.write(buf).await.map_err(TunnelError::Network)
    }
}

/// Guard that removes the forward route when dropped.
pub struct RouteGuard {
    platform: Arc<dyn Platform>,
    route: ForwardRoute,
}

impl RouteGuard {
    fn new(platform: Arc<dyn Platform>, route: ForwardRoute) -> Self {
        Self { platform, route }
    }

    /// Get the route managed by this guard.
    pub fn route(&self) -> &ForwardRoute {
        &self.route
    }
}

impl Drop for RouteGuard {
    fn drop(&mut self) {
        log::info!("Removing route {}", self.route);
        self.platform.remove_route(&self.route);
    }
}

// ============================================================================
// OS Platform
// ============================================================================

/// [`Platform`] backed by the `tun` crate and the system's `ip` /
/// `ifconfig` / `route` tools.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsPlatform;

impl OsPlatform {
    /// Create the OS platform.
    pub fn new() -> Self {
        Self
    }
}

/// True when `ip` or `route` refused because the entry is already present.
fn is_already_exists_error(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    ["file exists", "eexist"].iter().any(|m| stderr.contains(m))
}

/// Run a configuration command, treating "already exists" as success.
fn run_command(program: &str, args: &[String]) -> TunnelResult<String> {
    log::debug!("Running: {} {}", program, args.join(" "));
    let output = std::process::Command::new(program)
        .args(args)
        .output()
        .map_err(|e| TunnelError::Device(format!("Failed to execute {}: {}", program, e)))?;

    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    if is_already_exists_error(&stderr) {
        log::warn!(
            "{} {}: already exists (treating as success)",
            program,
            args.join(" ")
        );
        return Ok(String::new());
    }
    Err(TunnelError::Device(format!(
        "{} {} failed: {}",
        program,
        args.join(" "),
        stderr.trim()
    )))
}

/// Parse `ip -o addr show to <addr>` output into (index, name).
///
/// Lines look like `5: tun0    inet 198.18.0.1/15 scope global tun0`.
pub fn parse_ip_addr_show(output: &str) -> Option<(u32, String)> {
    let line = output.lines().find(|l| !l.trim().is_empty())?;
    let mut fields = line.split_whitespace();
    let index = fields.next()?.trim_end_matches(':').parse().ok()?;
    let name = fields.next()?.split('@').next()?.to_string();
    Some((index, name))
}

/// Parse the first `metric N` of `ip -o route show dev <name>` output.
///
/// Routes without an explicit metric use 0.
pub fn parse_route_metric(output: &str) -> u32 {
    output
        .lines()
        .find_map(|line| {
            let mut fields = line.split_whitespace();
            while let Some(field) = fields.next() {
                if field == "metric" {
                    return fields.next().and_then(|m| m.parse().ok());
                }
            }
            None
        })
        .unwrap_or(0)
}

/// Parse the `interface:` line of macOS `route -n get <addr>` output.
pub fn parse_route_get_interface(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        line.trim()
            .strip_prefix("interface:")
            .map(|name| name.trim().to_string())
    })
}

#[cfg(target_os = "macos")]
fn interface_index(name: &str) -> TunnelResult<u32> {
    let c_name = std::ffi::CString::new(name)
        .map_err(|_| TunnelError::Device(format!("Invalid interface name: {}", name)))?;
    // SAFETY: c_name is a valid NUL-terminated string for the duration of the call.
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if index == 0 {
        return Err(TunnelError::Device(format!(
            "Interface {} not found: {}",
            name,
            io::Error::last_os_error()
        )));
    }
    Ok(index)
}

impl Platform for OsPlatform {
    fn frame_offset(&self) -> usize {
        // The tun crate strips the utun/packet-information header itself.
        0
    }

    fn create_tun(&self, name: &str, mtu: u32) -> TunnelResult<Box<dyn TunHandle>> {
        let mtu = u16::try_from(mtu)
            .map_err(|_| TunnelError::Configuration(format!("mtu {} out of range", mtu)))?;

        let mut tun_config = tun::Configuration::default();
        tun_config.mtu(mtu).up();

        if !name.is_empty() {
            tun_config.tun_name(name);
        }

        #[cfg(target_os = "linux")]
        tun_config.platform_config(|platform_config| {
            platform_config.ensure_root_privileges(true);
        });

        let device = tun::create_as_async(&tun_config)
            .map_err(|e| TunnelError::Device(format!("create tun: {}", e)))?;
        log::info!("Created TUN device: {}", device.interface_name().unwrap_or_default());
        Ok(Box::new(device))
    }

    fn set_address(&self, tun_name: &str, addr: &IpNet) -> TunnelResult<()> {
        #[cfg(target_os = "linux")]
        {
            let family = if addr.addr().is_ipv6() { "-6" } else { "-4" };
            run_command(
                "ip",
                &[
                    family.into(),
                    "addr".into(),
                    "add".into(),
                    addr.to_string(),
                    "dev".into(),
                    tun_name.into(),
                ],
            )?;
            run_command(
                "ip",
                &[
                    "link".into(),
                    "set".into(),
                    "dev".into(),
                    tun_name.into(),
                    "up".into(),
                ],
            )?;
            Ok(())
        }

        #[cfg(target_os = "macos")]
        {
            let args: Vec<String> = match addr {
                IpNet::V4(net) => vec![
                    tun_name.into(),
                    "inet".into(),
                    net.addr().to_string(),
                    net.addr().to_string(),
                    "netmask".into(),
                    subnet_mask(net.prefix_len()).to_string(),
                    "up".into(),
                ],
                IpNet::V6(net) => vec![
                    tun_name.into(),
                    "inet6".into(),
                    "add".into(),
                    net.addr().to_string(),
                    "prefixlen".into(),
                    net.prefix_len().to_string(),
                ],
            };
            run_command("ifconfig", &args)?;
            Ok(())
        }

        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        {
            let _ = (tun_name, addr);
            Err(TunnelError::Device(
                "Address configuration not supported on this platform".into(),
            ))
        }
    }

    fn resolve_interface(&self, addr: IpAddr) -> TunnelResult<InterfaceInfo> {
        #[cfg(target_os = "linux")]
        {
            let output = run_command(
                "ip",
                &[
                    "-o".into(),
                    "addr".into(),
                    "show".into(),
                    "to".into(),
                    addr.to_string(),
                ],
            )?;
            let (index, name) = parse_ip_addr_show(&output).ok_or_else(|| {
                TunnelError::Device(format!("No interface owns address {}", addr))
            })?;
            let routes = run_command(
                "ip",
                &[
                    "-o".into(),
                    "route".into(),
                    "show".into(),
                    "dev".into(),
                    name.clone(),
                ],
            )?;
            Ok(InterfaceInfo {
                name,
                index,
                metric: parse_route_metric(&routes),
            })
        }

        #[cfg(target_os = "macos")]
        {
            let output = run_command(
                "route",
                &["-n".into(), "get".into(), addr.to_string()],
            )?;
            let name = parse_route_get_interface(&output).ok_or_else(|| {
                TunnelError::Device(format!("No interface owns address {}", addr))
            })?;
            let index = interface_index(&name)?;
            Ok(InterfaceInfo {
                name,
                index,
                metric: 0,
            })
        }

        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        {
            Err(TunnelError::Device(format!(
                "Interface resolution for {} not supported on this platform",
                addr
            )))
        }
    }

    fn add_route(&self, route: &ForwardRoute) -> TunnelResult<()> {
        #[cfg(target_os = "linux")]
        {
            run_command("ip", &route.linux_add_args()).map(|_| ())
        }

        #[cfg(target_os = "macos")]
        {
            run_command("route", &route.macos_add_args()).map(|_| ())
        }

        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        {
            Err(TunnelError::Device(format!(
                "Route management not supported on this platform: {}",
                route
            )))
        }
    }

    fn remove_route(&self, route: &ForwardRoute) {
        #[cfg(target_os = "linux")]
        let result = run_command("ip", &route.linux_delete_args());

        #[cfg(target_os = "macos")]
        let result = run_command("route", &route.macos_delete_args());

        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        let result: TunnelResult<String> = Ok(String::new());

        if let Err(e) = result {
            log::warn!("Failed to remove route {}: {}", route, e);
        }
    }
}
