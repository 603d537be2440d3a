//! Route descriptors and the validated route table.
//!
//! A route maps one local listen endpoint to one remote target. Descriptors
//! arrive as loosely typed input (ports may be strings, most fields are
//! optional) and are resolved into immutable [`Route`]s:
//!
//! - Listen address: literal IP, else hostname lookup, else the host's first
//!   routable interface address (never loopback)
//! - Target host defaults to the resolved listen address
//! - Target port defaults to the listen port
//! - Name defaults to `"{listen_addr}:{listen_port}"`
//!
//! A table is rejected as a whole if any route would forward to its own
//! listen endpoint or if two routes share a name.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use super::error::ConfigError;

/// A port given either as an integer or as a numeric string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PortValue {
    Number(i64),
    Text(String),
}

impl PortValue {
    fn parse(&self) -> Option<u16> {
        match self {
            PortValue::Number(n) => u16::try_from(*n).ok(),
            PortValue::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl fmt::Display for PortValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortValue::Number(n) => write!(f, "{}", n),
            PortValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<u16> for PortValue {
    fn from(port: u16) -> Self {
        PortValue::Number(port.into())
    }
}

impl From<i32> for PortValue {
    fn from(port: i32) -> Self {
        PortValue::Number(port.into())
    }
}

impl From<&str> for PortValue {
    fn from(port: &str) -> Self {
        PortValue::Text(port.to_string())
    }
}

/// Raw route input, as produced by a configuration source.
///
/// Empty strings are treated the same as absent fields.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RouteDescriptor {
    pub name: Option<String>,
    #[serde(alias = "listenIP")]
    pub listen_ip: Option<String>,
    #[serde(alias = "listenPort")]
    pub listen_port: PortValue,
    #[serde(alias = "targetHost")]
    pub target_host: Option<String>,
    #[serde(alias = "targetPort")]
    pub target_port: Option<PortValue>,
}

impl RouteDescriptor {
    /// Create a descriptor with only the required listen port.
    pub fn new(listen_port: impl Into<PortValue>) -> Self {
        Self {
            name: None,
            listen_ip: None,
            listen_port: listen_port.into(),
            target_host: None,
            target_port: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_listen_ip(mut self, listen_ip: impl Into<String>) -> Self {
        self.listen_ip = Some(listen_ip.into());
        self
    }

    pub fn with_target(mut self, host: impl Into<String>, port: impl Into<PortValue>) -> Self {
        self.target_host = Some(host.into());
        self.target_port = Some(port.into());
        self
    }

    /// Label used in errors raised before the route name is known.
    fn label(&self) -> String {
        match non_empty(&self.name) {
            Some(name) => name.to_string(),
            None => format!(
                "{}:{}",
                non_empty(&self.listen_ip).unwrap_or("*"),
                self.listen_port
            ),
        }
    }

    /// Apply defaulting rules and resolve the listen address.
    ///
    /// This does not check the route against its own target; see
    /// [`RouteTable::load`].
    pub async fn resolve(&self, resolver: &dyn HostResolver) -> Result<Route, ConfigError> {
        let label = self.label();

        let listen_port = self
            .listen_port
            .parse()
            .ok_or_else(|| ConfigError::InvalidPort {
                route: label.clone(),
                field: "listen_port",
                value: self.listen_port.to_string(),
            })?;

        let target_port = match &self.target_port {
            Some(value) if !matches!(value, PortValue::Text(s) if s.trim().is_empty()) => value
                .parse()
                .filter(|port| *port != 0)
                .ok_or_else(|| ConfigError::InvalidPort {
                    route: label.clone(),
                    field: "target_port",
                    value: value.to_string(),
                })?,
            _ if listen_port == 0 => {
                return Err(ConfigError::InvalidPort {
                    route: label,
                    field: "target_port",
                    value: "0".to_string(),
                })
            }
            _ => listen_port,
        };

        let listen_addr = resolve_listen_addr(self, &label, resolver).await?;

        let target_host = non_empty(&self.target_host)
            .map(str::to_string)
            .unwrap_or_else(|| listen_addr.to_string());

        let name = non_empty(&self.name)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}:{}", listen_addr, listen_port));

        Ok(Route {
            name,
            listen_addr,
            listen_port,
            target_host,
            target_port,
        })
    }
}

/// An immutable, fully resolved forwarding rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub name: String,
    pub listen_addr: IpAddr,
    pub listen_port: u16,
    pub target_host: String,
    pub target_port: u16,
}

impl Route {
    /// Local endpoint the route listens on.
    pub fn listen_endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr, self.listen_port)
    }

    /// Target in `host:port` form, bracketing IPv6 literals.
    pub fn target(&self) -> String {
        match self.target_host.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, self.target_port).to_string(),
            Err(_) => format!("{}:{}", self.target_host, self.target_port),
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} <--> {})",
            self.name,
            self.listen_endpoint(),
            self.target()
        )
    }
}

/// Host name resolution used while loading routes.
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// Resolve a host name to its addresses, in resolver order.
    async fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>>;

    /// Addresses assigned to this host's interfaces.
    fn local_addresses(&self) -> io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the system resolver and interface list.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0)).await?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }

    fn local_addresses(&self) -> io::Result<Vec<IpAddr>> {
        let interfaces = local_ip_address::list_afinet_netifas().map_err(io::Error::other)?;
        Ok(interfaces.into_iter().map(|(_, ip)| ip).collect())
    }
}

/// Validated routes in load order, indexed by name.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
    by_name: HashMap<String, usize>,
}

impl RouteTable {
    /// Create an empty route table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve and validate a batch of descriptors.
    ///
    /// Any invalid descriptor rejects the whole batch.
    pub async fn load(
        descriptors: &[RouteDescriptor],
        resolver: &dyn HostResolver,
    ) -> Result<Self, ConfigError> {
        let mut table = Self::new();

        for descriptor in descriptors {
            let route = descriptor.resolve(resolver).await?;
            ensure_not_self_route(&route, resolver).await?;

            if table.by_name.contains_key(&route.name) {
                return Err(ConfigError::DuplicateName(route.name));
            }

            debug!(route = %route, "Route resolved");
            table.by_name.insert(route.name.clone(), table.routes.len());
            table.routes.push(Arc::new(route));
        }

        info!(route_count = table.routes.len(), "Route table loaded");
        Ok(table)
    }

    /// Get a route by name.
    pub fn get(&self, name: &str) -> Option<&Arc<Route>> {
        self.by_name.get(name).map(|&idx| &self.routes[idx])
    }

    /// Iterate routes in load order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Route>> {
        self.routes.iter()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

async fn resolve_host(
    host: &str,
    label: &str,
    resolver: &dyn HostResolver,
) -> Result<Vec<IpAddr>, ConfigError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![ip]);
    }

    let addrs = resolver
        .lookup(host)
        .await
        .map_err(|source| ConfigError::Resolve {
            route: label.to_string(),
            host: host.to_string(),
            source,
        })?;

    if addrs.is_empty() {
        return Err(ConfigError::Resolve {
            route: label.to_string(),
            host: host.to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses returned"),
        });
    }

    Ok(addrs)
}

async fn resolve_listen_addr(
    descriptor: &RouteDescriptor,
    label: &str,
    resolver: &dyn HostResolver,
) -> Result<IpAddr, ConfigError> {
    if let Some(host) = non_empty(&descriptor.listen_ip) {
        let addrs = resolve_host(host, label, resolver).await?;
        return Ok(addrs[0]);
    }

    let local = resolver
        .local_addresses()
        .map_err(|source| ConfigError::Resolve {
            route: label.to_string(),
            host: "local interfaces".to_string(),
            source,
        })?;

    default_listen_addr(&local).ok_or_else(|| ConfigError::NoListenAddress {
        route: label.to_string(),
    })
}

/// Pick the address to listen on when none is configured.
///
/// Loopback is never chosen: traffic to it short-circuits inside the
/// loopback adapter and would not be reachable from other hosts.
pub fn default_listen_addr(addrs: &[IpAddr]) -> Option<IpAddr> {
    addrs
        .iter()
        .copied()
        .find(is_preferred_listen_addr)
        .or_else(|| addrs.iter().copied().find(|ip| !ip.is_loopback()))
}

fn is_preferred_listen_addr(ip: &IpAddr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() {
        return false;
    }

    match ip {
        IpAddr::V4(v4) => !v4.is_link_local(),
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            let link_local = segments[0] & 0xffc0 == 0xfe80;
            let site_local = segments[0] & 0xffc0 == 0xfec0;
            let teredo = segments[0] == 0x2001 && segments[1] == 0;
            !(link_local || site_local || teredo)
        }
    }
}

async fn ensure_not_self_route(
    route: &Route,
    resolver: &dyn HostResolver,
) -> Result<(), ConfigError> {
    let listen = route.listen_endpoint();
    let targets = resolve_host(&route.target_host, &route.name, resolver).await?;

    if targets
        .iter()
        .any(|ip| SocketAddr::new(*ip, route.target_port) == listen)
    {
        return Err(ConfigError::SelfRoute {
            route: route.name.clone(),
            endpoint: listen,
        });
    }

    Ok(())
}
