//! Endpoint filters: which traffic a fault applies to.
//!
//! User entries are parsed into [`ScopeEntry`]s, hostnames are resolved into [`Endpoint`]s, and
//! the resulting [`FaultScope`] is compiled into the flower matches of the exclusion and inclusion
//! classifier groups of one fault.
//!
//! Entry grammar, each optionally followed by `:port`:
//!
//! ```text
//! 10.0.0.1          a single address
//! 10.0.0.0/8        a network
//! [fd00::1]:443     an IPv6 address with a port
//! db.internal       a hostname, resolved when the scope is built
//! *:53              any address, one port
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use netfault_tc::tc::filter::{Family, FlowerMatch, IpProto};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::config::{self, ConfigError, FaultConfig};
use crate::error::{Error, Result};

/// An IP network with its host bits cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Network {
    addr: IpAddr,
    prefix: u8,
}

impl Network {
    /// Create a network, or `None` if the prefix is too long for the address family.
    pub fn new(addr: IpAddr, prefix: u8) -> Option<Self> {
        let addr = match addr {
            IpAddr::V4(v4) if prefix <= 32 => {
                let mask = u32::MAX.checked_shl(32 - prefix as u32).unwrap_or(0);
                IpAddr::V4(Ipv4Addr::from(u32::from(v4) & mask))
            }
            IpAddr::V6(v6) if prefix <= 128 => {
                let mask = u128::MAX.checked_shl(128 - prefix as u32).unwrap_or(0);
                IpAddr::V6(Ipv6Addr::from(u128::from(v6) & mask))
            }
            _ => return None,
        };
        Some(Self { addr, prefix })
    }

    /// The network of a single host.
    pub fn host(addr: IpAddr) -> Self {
        let prefix = if addr.is_ipv4() { 32 } else { 128 };
        Self { addr, prefix }
    }

    /// The network covering a whole address family.
    pub fn any(family: Family) -> Self {
        match family {
            Family::V4 => Self { addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED), prefix: 0 },
            Family::V6 => Self { addr: IpAddr::V6(Ipv6Addr::UNSPECIFIED), prefix: 0 },
        }
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn family(&self) -> Family {
        Family::of(&self.addr)
    }

    /// The classifier matching this network.
    fn matcher(&self) -> FlowerMatch {
        let matcher = FlowerMatch::family(self.family());
        if self.prefix == 0 { matcher } else { matcher.with_destination(self.addr, self.prefix) }
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s.split_once('/') {
            Some((addr, prefix)) => {
                let addr: IpAddr = addr.parse().map_err(|_| format!("{addr:?} is not an IP address"))?;
                let prefix: u8 = prefix.parse().map_err(|_| format!("{prefix:?} is not a prefix length"))?;
                Self::new(addr, prefix).ok_or_else(|| format!("prefix /{prefix} is too long"))
            }
            None => s.parse().map(Self::host).map_err(|_| format!("{s:?} is not an IP address")),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// The host part of a scope entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Host {
    /// Any address of either family.
    Any,
    Network(Network),
    Name(String),
}

/// A parsed, unresolved scope entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeEntry {
    /// The entry as the user wrote it.
    pub raw: String,
    pub host: Host,
    pub port: Option<u16>,
}

impl FromStr for ScopeEntry {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let raw = s.trim();
        let bad = |reason: String| Error::scope(raw, reason);

        if raw.is_empty() {
            return Err(bad("empty entry".into()));
        }

        let (host, port) = if let Some(rest) = raw.strip_prefix('[') {
            let (host, rest) = rest.split_once(']').ok_or_else(|| bad("unterminated '['".into()))?;
            match rest {
                "" => (host, None),
                _ => {
                    let port = rest.strip_prefix(':').ok_or_else(|| bad(format!("unexpected {rest:?}")))?;
                    (host, Some(port))
                }
            }
        } else {
            match raw.matches(':').count() {
                0 => (raw, None),
                1 => raw.split_once(':').map(|(host, port)| (host, Some(port))).unwrap_or((raw, None)),
                // Bare IPv6 address or network.
                _ => (raw, None),
            }
        };

        let port = port.map(|port| parse_port(port).map_err(bad)).transpose()?;

        let host = if host == "*" {
            if port.is_none() {
                return Err(bad("'*' needs a port".into()));
            }
            Host::Any
        } else if host.contains('/') || host.parse::<IpAddr>().is_ok() {
            Host::Network(host.parse().map_err(bad)?)
        } else if is_hostname(host) {
            Host::Name(host.to_ascii_lowercase())
        } else {
            return Err(bad(format!("{host:?} is neither an address nor a hostname")));
        };

        Ok(Self { raw: raw.to_string(), host, port })
    }
}

fn parse_port(s: &str) -> std::result::Result<u16, String> {
    s.parse::<u16>().ok().filter(|port| *port != 0).ok_or_else(|| format!("{s:?} is not a port"))
}

/// RFC 1123 hostname check.
fn is_hostname(s: &str) -> bool {
    let s = s.strip_suffix('.').unwrap_or(s);
    !s.is_empty() &&
        s.len() <= 253 &&
        s.split('.').all(|label| {
            !label.is_empty() &&
                label.len() <= 63 &&
                !label.starts_with('-') &&
                !label.ends_with('-') &&
                label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
        })
}

/// Transport protocols a scope can be restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

impl Protocol {
    /// The classifier protocol for a family. ICMP means ICMPv6 on IPv6.
    fn ip_proto(self, family: Family) -> IpProto {
        match (self, family) {
            (Self::Tcp, _) => IpProto::Tcp,
            (Self::Udp, _) => IpProto::Udp,
            (Self::Icmp, Family::V4) => IpProto::Icmp,
            (Self::Icmp, Family::V6) => IpProto::Icmpv6,
        }
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "icmp" => Ok(Self::Icmp),
            _ => Err(Error::scope(s, "unknown protocol, expected tcp, udp or icmp")),
        }
    }
}

/// An endpoint supplied by the orchestrator that must never be faulted, typically its own
/// control channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RestrictedEndpoint {
    /// An address or a network in CIDR notation.
    pub address: String,
    #[serde(default)]
    pub port: Option<u16>,
}

impl RestrictedEndpoint {
    pub fn new(address: impl Into<String>, port: Option<u16>) -> Self {
        Self { address: address.into(), port }
    }

    fn endpoint(&self) -> Result<Endpoint> {
        let network: Network = self.address.trim().parse().map_err(|reason| Error::scope(&self.address, reason))?;
        Ok(Endpoint { source: self.address.clone(), network, port: self.port })
    }
}

/// A resolved destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// The entry this endpoint was resolved from.
    pub source: String,
    pub network: Network,
    pub port: Option<u16>,
}

/// The user's endpoint filter, parsed but not resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeConfig {
    pub include: Vec<ScopeEntry>,
    pub exclude: Vec<ScopeEntry>,
    /// Ports included traffic is restricted to.
    pub ports: Vec<u16>,
    /// Protocols included traffic is restricted to.
    pub protocols: Vec<Protocol>,
}

impl ScopeConfig {
    /// Read the endpoint filter keys of the orchestrator configuration.
    pub fn from_config(config: &FaultConfig) -> Result<Self> {
        let list = |key: &str| config.strings(key).map_err(invalid);
        let entries = |keys: [&str; 2]| -> Result<Vec<ScopeEntry>> {
            let mut entries = Vec::new();
            for key in keys {
                for raw in list(key)? {
                    entries.push(raw.parse()?);
                }
            }
            Ok(entries)
        };

        let ports = list(config::PORT)?
            .iter()
            .map(|port| parse_port(port).map_err(|reason| Error::scope(port, reason)))
            .collect::<Result<Vec<_>>>()?;
        let protocols =
            list(config::PROTOCOL)?.iter().map(|p| p.parse::<Protocol>()).collect::<Result<Vec<_>>>()?;

        Ok(Self {
            include: entries([config::IP, config::HOSTNAME])?,
            exclude: entries([config::EXCLUDE_IP, config::EXCLUDE_HOSTNAME])?,
            ports,
            protocols,
        })
    }
}

fn invalid(e: ConfigError) -> Error {
    Error::scope(e.key, e.expected)
}

/// The resolved scope of a fault.
///
/// Exclusions always win over inclusions, and the restricted endpoints are always excluded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultScope {
    /// Destinations to fault. Everything if empty.
    pub include: Vec<Endpoint>,
    /// Destinations never faulted.
    pub exclude: Vec<Endpoint>,
    pub ports: Vec<u16>,
    pub protocols: Vec<Protocol>,
}

/// Resolve a scope configuration and union the restricted endpoints into its exclusions.
pub async fn build(config: &ScopeConfig, restricted: &[RestrictedEndpoint]) -> Result<FaultScope> {
    let mut include = Vec::new();
    for entry in &config.include {
        include.extend(resolve(entry).await?);
    }

    let mut exclude = Vec::new();
    for entry in &config.exclude {
        exclude.extend(resolve(entry).await?);
    }
    for endpoint in restricted {
        exclude.push(endpoint.endpoint()?);
    }

    let scope = FaultScope {
        include: dedup(include),
        exclude: dedup(exclude),
        ports: dedup(config.ports.clone()),
        protocols: dedup(config.protocols.clone()),
    };
    tracing::debug!(
        include = scope.include.len(),
        exclude = scope.exclude.len(),
        restricted = restricted.len(),
        "built fault scope"
    );
    Ok(scope)
}

async fn resolve(entry: &ScopeEntry) -> Result<Vec<Endpoint>> {
    let endpoint = |network| Endpoint { source: entry.raw.clone(), network, port: entry.port };

    match &entry.host {
        Host::Network(network) => Ok(vec![endpoint(*network)]),
        Host::Any => Ok(vec![endpoint(Network::any(Family::V4)), endpoint(Network::any(Family::V6))]),
        Host::Name(name) => {
            let addrs = tokio::net::lookup_host((name.as_str(), 0))
                .await
                .map_err(|e| Error::scope(&entry.raw, format!("cannot resolve: {e}")))?;
            let endpoints: Vec<_> = addrs.map(|addr| endpoint(Network::host(addr.ip()))).collect();
            if endpoints.is_empty() {
                return Err(Error::scope(&entry.raw, "resolves to no address"));
            }
            tracing::debug!(host = %name, addresses = endpoints.len(), "resolved scope hostname");
            Ok(dedup(endpoints))
        }
    }
}

/// Remove duplicates, keeping the first occurrence.
fn dedup<T: Clone + Eq + std::hash::Hash>(items: Vec<T>) -> Vec<T> {
    let mut seen = FxHashSet::default();
    items.into_iter().filter(|item| seen.insert(item.clone())).collect()
}

/// The classifier matches of one fault.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledScope {
    /// Routed to the pass-through class. Evaluated first.
    pub excludes: Vec<FlowerMatch>,
    /// Routed to the fault class.
    pub includes: Vec<FlowerMatch>,
}

impl FaultScope {
    /// Whether the scope covers all traffic.
    pub fn is_everything(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty() && self.ports.is_empty() && self.protocols.is_empty()
    }

    /// Compile the scope into classifier matches, at most `budget` per group.
    pub fn compile(&self, budget: usize) -> Result<CompiledScope> {
        let mut excludes = Vec::new();
        for endpoint in &self.exclude {
            let matcher = endpoint.network.matcher();
            match endpoint.port {
                Some(port) => {
                    for proto in [IpProto::Tcp, IpProto::Udp] {
                        excludes.push((&endpoint.source, matcher.with_proto(proto).with_port(port)));
                    }
                }
                None => excludes.push((&endpoint.source, matcher)),
            }
        }

        let everything = [Family::V4, Family::V6].map(|family| Endpoint {
            source: "*".to_string(),
            network: Network::any(family),
            port: None,
        });
        let targets = if self.include.is_empty() { &everything[..] } else { &self.include[..] };

        let mut includes = Vec::new();
        for endpoint in targets {
            let matcher = endpoint.network.matcher();
            let family = endpoint.network.family();
            let ports = match endpoint.port {
                Some(port) => vec![port],
                None => self.ports.clone(),
            };

            let protocols = match (self.protocols.is_empty(), ports.is_empty()) {
                (false, _) => self.protocols.clone(),
                (true, false) => vec![Protocol::Tcp, Protocol::Udp],
                (true, true) => {
                    includes.push((&endpoint.source, matcher));
                    continue;
                }
            };

            for protocol in protocols {
                let proto = protocol.ip_proto(family);
                if !proto.has_ports() || ports.is_empty() {
                    includes.push((&endpoint.source, matcher.with_proto(proto)));
                    continue;
                }
                for port in &ports {
                    includes.push((&endpoint.source, matcher.with_proto(proto).with_port(*port)));
                }
            }
        }

        Ok(CompiledScope { excludes: within_budget(excludes, budget)?, includes: within_budget(includes, budget)? })
    }
}

fn within_budget(matches: Vec<(&String, FlowerMatch)>, budget: usize) -> Result<Vec<FlowerMatch>> {
    let mut seen = FxHashSet::default();
    let mut out = Vec::with_capacity(matches.len().min(budget));
    for (source, matcher) in matches {
        if !seen.insert(matcher) {
            continue;
        }
        if out.len() == budget {
            return Err(Error::scope(
                source.as_str(),
                format!("more than {budget} classifiers needed for this scope"),
            ));
        }
        out.push(matcher);
    }
    Ok(out)
}
