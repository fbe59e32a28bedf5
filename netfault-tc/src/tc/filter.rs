//! Flower classifier support.
//!
//! Egress classifiers are attached to the HTB root and route matching packets either into a fault
//! class or into the pass-through class. Ingress classifiers are attached to the ingress qdisc and
//! carry a `gact` action dropping or passing the packet. Classifiers are identified by their
//! preference (the kernel's `prio`), which is unique per classifier so that a single one can be
//! deleted without touching its siblings.
//!
//! The flower options are serialized by hand because port, protocol and action attributes are
//! needed in addition to the addresses.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use rtnetlink::packet_core::{NLM_F_ACK, NLM_F_CREATE, NLM_F_EXCL, NLM_F_REQUEST, NetlinkMessage};
use rtnetlink::packet_route::{
    RouteNetlinkMessage,
    tc::{TcAttribute, TcHandle, TcMessage},
};
use serde::{Deserialize, Serialize};

use super::handle::QdiscRequestInner;
use super::nla::{build_nla, build_options, nested, nla_be16, nla_u8, nla_u32};

/// EtherType for IPv4 packets (0x0800).
pub const ETH_P_IP: u16 = nix::libc::ETH_P_IP as u16;

/// EtherType for IPv6 packets (0x86DD).
pub const ETH_P_IPV6: u16 = nix::libc::ETH_P_IPV6 as u16;

// Flower TCA_OPTIONS sub-attributes (from linux/pkt_cls.h)
const TCA_FLOWER_CLASSID: u16 = 1;
const TCA_FLOWER_ACT: u16 = 3;
const TCA_FLOWER_KEY_ETH_TYPE: u16 = 8;
const TCA_FLOWER_KEY_IP_PROTO: u16 = 9;
const TCA_FLOWER_KEY_IPV4_SRC: u16 = 10;
const TCA_FLOWER_KEY_IPV4_SRC_MASK: u16 = 11;
const TCA_FLOWER_KEY_IPV4_DST: u16 = 12;
const TCA_FLOWER_KEY_IPV4_DST_MASK: u16 = 13;
const TCA_FLOWER_KEY_IPV6_SRC: u16 = 14;
const TCA_FLOWER_KEY_IPV6_SRC_MASK: u16 = 15;
const TCA_FLOWER_KEY_IPV6_DST: u16 = 16;
const TCA_FLOWER_KEY_IPV6_DST_MASK: u16 = 17;
const TCA_FLOWER_KEY_TCP_SRC: u16 = 18;
const TCA_FLOWER_KEY_TCP_DST: u16 = 19;
const TCA_FLOWER_KEY_UDP_SRC: u16 = 20;
const TCA_FLOWER_KEY_UDP_DST: u16 = 21;
const TCA_FLOWER_FLAGS: u16 = 22;

// Action attributes (from linux/pkt_cls.h and linux/tc_act/tc_gact.h)
const TCA_ACT_KIND: u16 = 1;
const TCA_ACT_OPTIONS: u16 = 2;
const TCA_GACT_PARMS: u16 = 2;
const TC_ACT_OK: i32 = 0;
const TC_ACT_SHOT: i32 = 2;

/// IP protocol numbers used as flower keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpProto {
    Tcp,
    Udp,
    Icmp,
    Icmpv6,
}

impl IpProto {
    /// The protocol number as found in the IP header.
    pub const fn number(self) -> u8 {
        match self {
            Self::Tcp => nix::libc::IPPROTO_TCP as u8,
            Self::Udp => nix::libc::IPPROTO_UDP as u8,
            Self::Icmp => nix::libc::IPPROTO_ICMP as u8,
            Self::Icmpv6 => nix::libc::IPPROTO_ICMPV6 as u8,
        }
    }

    /// Whether the protocol carries ports flower can match on.
    pub const fn has_ports(self) -> bool {
        matches!(self, Self::Tcp | Self::Udp)
    }
}

/// Address family a classifier applies to.
///
/// Non-IP traffic (ARP in particular) is never classified and always takes the pass-through
/// class, so excluded endpoints stay resolvable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// The EtherType used as classifier protocol.
    pub const fn ethertype(self) -> u16 {
        match self {
            Self::V4 => ETH_P_IP,
            Self::V6 => ETH_P_IPV6,
        }
    }

    /// The family of an address.
    pub const fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }
}

/// Match criteria of a single flower classifier.
///
/// Scopes describe remote peers, so egress classifiers match them on the destination side.
/// [`FlowerMatch::reversed`] turns such a match into its ingress counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowerMatch {
    pub family: Family,
    /// Destination network and prefix length.
    pub destination: Option<(IpAddr, u8)>,
    /// Source network and prefix length.
    #[serde(default)]
    pub source: Option<(IpAddr, u8)>,
    pub ip_proto: Option<IpProto>,
    /// Destination port. Requires `ip_proto` to be TCP or UDP.
    pub dst_port: Option<u16>,
    /// Source port. Requires `ip_proto` to be TCP or UDP.
    #[serde(default)]
    pub src_port: Option<u16>,
}

impl FlowerMatch {
    /// A classifier matching every packet of an address family.
    pub const fn family(family: Family) -> Self {
        Self { family, destination: None, source: None, ip_proto: None, dst_port: None, src_port: None }
    }

    /// Restrict the match to a destination network.
    pub fn with_destination(mut self, addr: IpAddr, prefix: u8) -> Self {
        self.family = Family::of(&addr);
        self.destination = Some((addr, prefix));
        self
    }

    /// Restrict the match to an IP protocol.
    pub const fn with_proto(mut self, proto: IpProto) -> Self {
        self.ip_proto = Some(proto);
        self
    }

    /// Restrict the match to a destination port.
    pub const fn with_port(mut self, port: u16) -> Self {
        self.dst_port = Some(port);
        self
    }

    /// The same match with source and destination swapped.
    pub const fn reversed(self) -> Self {
        Self {
            destination: self.source,
            source: self.destination,
            dst_port: self.src_port,
            src_port: self.dst_port,
            ..self
        }
    }

    /// The match selecting exactly the packets both `self` and `other` select, if any can.
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        if self.family != other.family {
            return None;
        }
        Some(Self {
            family: self.family,
            destination: narrower(self.destination, other.destination)?,
            source: narrower(self.source, other.source)?,
            ip_proto: same(self.ip_proto, other.ip_proto)?,
            dst_port: same(self.dst_port, other.dst_port)?,
            src_port: same(self.src_port, other.src_port)?,
        })
    }

    /// Whether a packet with the given header fields is selected.
    pub fn matches(&self, packet: &PacketHeader) -> bool {
        let ports = |port: Option<u16>, actual: Option<u16>| port.is_none() || port == actual;
        self.family == Family::of(&packet.destination) &&
            self.destination.is_none_or(|net| contains(net, packet.destination)) &&
            self.source.is_none_or(|net| contains(net, packet.source)) &&
            (self.ip_proto.is_none() || self.ip_proto == Some(packet.proto)) &&
            ports(self.dst_port, packet.dst_port) &&
            ports(self.src_port, packet.src_port)
    }

    /// Serialize the match keys as flower sub-attributes.
    fn key_nlas(&self) -> Vec<u8> {
        let mut buf = nla_be16(TCA_FLOWER_KEY_ETH_TYPE, self.family.ethertype());

        if let Some(proto) = self.ip_proto {
            buf.extend(nla_u8(TCA_FLOWER_KEY_IP_PROTO, proto.number()));
        }

        match self.source {
            Some((IpAddr::V4(v4), prefix)) => {
                buf.extend(build_nla(TCA_FLOWER_KEY_IPV4_SRC, &v4.octets()));
                buf.extend(build_nla(TCA_FLOWER_KEY_IPV4_SRC_MASK, &ipv4_mask(prefix).octets()));
            }
            Some((IpAddr::V6(v6), prefix)) => {
                buf.extend(build_nla(TCA_FLOWER_KEY_IPV6_SRC, &v6.octets()));
                buf.extend(build_nla(TCA_FLOWER_KEY_IPV6_SRC_MASK, &ipv6_mask(prefix).octets()));
            }
            None => {}
        }

        match self.destination {
            Some((IpAddr::V4(v4), prefix)) => {
                buf.extend(build_nla(TCA_FLOWER_KEY_IPV4_DST, &v4.octets()));
                buf.extend(build_nla(TCA_FLOWER_KEY_IPV4_DST_MASK, &ipv4_mask(prefix).octets()));
            }
            Some((IpAddr::V6(v6), prefix)) => {
                buf.extend(build_nla(TCA_FLOWER_KEY_IPV6_DST, &v6.octets()));
                buf.extend(build_nla(TCA_FLOWER_KEY_IPV6_DST_MASK, &ipv6_mask(prefix).octets()));
            }
            None => {}
        }

        let (tcp, udp) = (self.ip_proto == Some(IpProto::Tcp), self.ip_proto == Some(IpProto::Udp));
        for (port, tcp_key, udp_key) in [
            (self.src_port, TCA_FLOWER_KEY_TCP_SRC, TCA_FLOWER_KEY_UDP_SRC),
            (self.dst_port, TCA_FLOWER_KEY_TCP_DST, TCA_FLOWER_KEY_UDP_DST),
        ] {
            match port {
                Some(port) if tcp => buf.extend(nla_be16(tcp_key, port)),
                Some(port) if udp => buf.extend(nla_be16(udp_key, port)),
                _ => {}
            }
        }

        buf
    }
}

/// The header fields classifiers look at, used to evaluate matches outside the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub source: IpAddr,
    pub destination: IpAddr,
    pub proto: IpProto,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
}

impl PacketHeader {
    /// A TCP or UDP packet.
    pub fn new(proto: IpProto, source: (IpAddr, u16), destination: (IpAddr, u16)) -> Self {
        Self {
            source: source.0,
            destination: destination.0,
            proto,
            src_port: Some(source.1),
            dst_port: Some(destination.1),
        }
    }

    /// The packet travelling the other way.
    pub const fn reply(self) -> Self {
        Self {
            source: self.destination,
            destination: self.source,
            src_port: self.dst_port,
            dst_port: self.src_port,
            ..self
        }
    }
}

/// Whether `addr` lies within the network `net`.
fn contains((net, prefix): (IpAddr, u8), addr: IpAddr) -> bool {
    match (net, addr) {
        (IpAddr::V4(net), IpAddr::V4(addr)) => {
            let mask = u32::from(ipv4_mask(prefix));
            u32::from(net) & mask == u32::from(addr) & mask
        }
        (IpAddr::V6(net), IpAddr::V6(addr)) => {
            let mask = u128::from(ipv6_mask(prefix));
            u128::from(net) & mask == u128::from(addr) & mask
        }
        _ => false,
    }
}

/// The narrower of two optional networks. `None` if they are disjoint.
fn narrower(a: Option<(IpAddr, u8)>, b: Option<(IpAddr, u8)>) -> Option<Option<(IpAddr, u8)>> {
    match (a, b) {
        (None, net) | (net, None) => Some(net),
        (Some(a), Some(b)) => {
            let (wide, narrow) = if a.1 <= b.1 { (a, b) } else { (b, a) };
            contains(wide, narrow.0).then_some(Some(narrow))
        }
    }
}

/// The common value of two optional keys. `None` if they differ.
fn same<T: PartialEq>(a: Option<T>, b: Option<T>) -> Option<Option<T>> {
    match (a, b) {
        (None, value) | (value, None) => Some(value),
        (Some(a), Some(b)) => (a == b).then_some(Some(a)),
    }
}

/// What happens to a packet a classifier selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterTarget {
    /// Enqueue into a class of the qdisc the classifier is attached to.
    Class(u32),
    /// Accept the packet and stop classifying.
    Pass,
    /// Drop the packet.
    Drop,
}

impl FilterTarget {
    /// The `gact` action implementing the target, serialized as a `TCA_FLOWER_ACT` list.
    fn action_nlas(self) -> Option<Vec<u8>> {
        let verdict = match self {
            Self::Class(_) => return None,
            Self::Pass => TC_ACT_OK,
            Self::Drop => TC_ACT_SHOT,
        };

        // struct tc_gact { index, capab, action, refcnt, bindcnt }
        let mut parms = Vec::with_capacity(20);
        parms.extend(0u32.to_ne_bytes());
        parms.extend(0u32.to_ne_bytes());
        parms.extend(verdict.to_ne_bytes());
        parms.extend(0i32.to_ne_bytes());
        parms.extend(0i32.to_ne_bytes());

        let mut action = build_nla(TCA_ACT_KIND, b"gact\0");
        action.extend(nested(TCA_ACT_OPTIONS, &build_nla(TCA_GACT_PARMS, &parms)));

        // Actions are listed by their 1-based position.
        Some(nested(TCA_FLOWER_ACT, &nested(1, &action)))
    }
}

/// Compute an IPv4 netmask from a prefix length.
fn ipv4_mask(prefix_len: u8) -> Ipv4Addr {
    if prefix_len == 0 {
        return Ipv4Addr::UNSPECIFIED;
    }
    Ipv4Addr::from(u32::MAX << (32 - prefix_len.min(32)))
}

/// Compute an IPv6 netmask from a prefix length.
fn ipv6_mask(prefix_len: u8) -> Ipv6Addr {
    if prefix_len == 0 {
        return Ipv6Addr::UNSPECIFIED;
    }
    Ipv6Addr::from(u128::MAX << (128 - prefix_len.min(128)))
}

/// Builder for a flower filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowerFilterRequest {
    pub inner: QdiscRequestInner,
    /// Filter preference. Lower values are evaluated first.
    pub priority: u16,
    pub target: FilterTarget,
    pub matcher: FlowerMatch,
}

impl FlowerFilterRequest {
    /// Create a new flower filter request.
    pub fn new(
        inner: QdiscRequestInner,
        priority: u16,
        target: FilterTarget,
        matcher: FlowerMatch,
    ) -> Self {
        Self { inner, priority, target, matcher }
    }

    /// The nested `TCA_OPTIONS` payload.
    pub fn options_payload(&self) -> Vec<u8> {
        let mut options = match self.target {
            FilterTarget::Class(class_id) => nla_u32(TCA_FLOWER_CLASSID, class_id),
            _ => Vec::new(),
        };
        options.extend(nla_u32(TCA_FLOWER_FLAGS, 0));
        options.extend(self.matcher.key_nlas());
        if let Some(action) = self.target.action_nlas() {
            options.extend(action);
        }
        options
    }

    /// Build the netlink message to create this flower filter.
    pub fn build(self) -> NetlinkMessage<RouteNetlinkMessage> {
        let mut tc_msg = TcMessage::with_index(self.inner.interface_index);
        tc_msg.header.parent = self.inner.parent;
        // Let kernel auto-assign filter handle
        tc_msg.header.handle = TcHandle::from(0u32);
        tc_msg.header.info = filter_info(self.priority, self.matcher.family.ethertype());

        tc_msg.attributes.push(TcAttribute::Kind("flower".to_string()));
        tc_msg.attributes.push(TcAttribute::Other(build_options(self.options_payload())));

        let mut nl_req = NetlinkMessage::from(RouteNetlinkMessage::NewTrafficFilter(tc_msg));
        nl_req.header.flags = NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL;

        nl_req
    }
}

/// The `tcm_info` of a filter: preference in the upper half, protocol in network byte order in
/// the lower half.
pub const fn filter_info(priority: u16, ethertype: u16) -> u32 {
    ((priority as u32) << 16) | ethertype.to_be() as u32
}

/// Split a filter's `tcm_info` back into preference and EtherType.
pub const fn split_filter_info(info: u32) -> (u16, u16) {
    ((info >> 16) as u16, u16::from_be(info as u16))
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn masks_from_prefix() {
        assert_eq!(ipv4_mask(24), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(ipv4_mask(0), Ipv4Addr::UNSPECIFIED);
        assert_eq!(ipv4_mask(32), Ipv4Addr::BROADCAST);
        assert_eq!(ipv6_mask(128), Ipv6Addr::from(u128::MAX));
    }

    #[test]
    fn info_roundtrip() {
        let info = filter_info(0x0281, ETH_P_IPV6);
        assert_eq!(split_filter_info(info), (0x0281, ETH_P_IPV6));
    }

    #[test]
    fn port_match_carries_protocol_and_port() {
        let matcher = FlowerMatch::family(Family::V4)
            .with_destination(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 32)
            .with_proto(IpProto::Tcp)
            .with_port(8080);
        let keys = matcher.key_nlas();
        // eth type (8) + ip proto (8) + dst (8) + mask (8) + tcp dst (8)
        assert_eq!(keys.len(), 40);
        assert_eq!(u16::from_ne_bytes([keys[34], keys[35]]), TCA_FLOWER_KEY_TCP_DST);
        assert_eq!(&keys[36..38], &8080u16.to_be_bytes());
    }

    #[test]
    fn reversed_match_keys_the_source() {
        let matcher = FlowerMatch::family(Family::V4)
            .with_destination(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 32)
            .with_proto(IpProto::Udp)
            .with_port(53)
            .reversed();
        assert_eq!(matcher.destination, None);
        assert_eq!(matcher.src_port, Some(53));

        let keys = matcher.key_nlas();
        assert_eq!(u16::from_ne_bytes([keys[18], keys[19]]), TCA_FLOWER_KEY_IPV4_SRC);
        assert_eq!(u16::from_ne_bytes([keys[34], keys[35]]), TCA_FLOWER_KEY_UDP_SRC);
    }

    #[test]
    fn intersections() {
        let v4 = FlowerMatch::family(Family::V4);
        let ten = v4.with_destination("10.0.0.0".parse().unwrap(), 8);
        let host = v4.with_destination("10.1.2.3".parse().unwrap(), 32);
        let other = v4.with_destination("192.168.0.0".parse().unwrap(), 16);

        assert_eq!(v4.intersect(&ten), Some(ten));
        assert_eq!(ten.intersect(&host), Some(host));
        assert_eq!(host.intersect(&ten), Some(host));
        assert_eq!(ten.intersect(&other), None);
        assert_eq!(v4.intersect(&FlowerMatch::family(Family::V6)), None);

        let tcp = ten.with_proto(IpProto::Tcp).with_port(443);
        assert_eq!(tcp.intersect(&ten.with_proto(IpProto::Udp)), None);
        assert_eq!(tcp.intersect(&host), Some(host.with_proto(IpProto::Tcp).with_port(443)));
    }

    #[test]
    fn packet_matching() {
        let peer: IpAddr = "10.1.2.3".parse().unwrap();
        let local: IpAddr = "172.17.0.2".parse().unwrap();
        let out = PacketHeader::new(IpProto::Tcp, (local, 40000), (peer, 443));

        let https = FlowerMatch::family(Family::V4)
            .with_destination("10.0.0.0".parse().unwrap(), 8)
            .with_proto(IpProto::Tcp)
            .with_port(443);
        assert!(https.matches(&out));
        assert!(!https.matches(&out.reply()));
        assert!(https.reversed().matches(&out.reply()));
        assert!(!FlowerMatch::family(Family::V6).matches(&out));
    }

    #[test]
    fn drop_target_carries_gact() {
        let request = FlowerFilterRequest::new(
            QdiscRequestInner::new(2),
            1,
            FilterTarget::Drop,
            FlowerMatch::family(Family::V4),
        );
        let options = request.options_payload();
        // No class id: flags first.
        assert_eq!(u16::from_ne_bytes([options[2], options[3]]), TCA_FLOWER_FLAGS);
        // gact parms end with action, refcnt, bindcnt.
        let action = &options[options.len() - 12..options.len() - 8];
        assert_eq!(i32::from_ne_bytes(action.try_into().unwrap()), TC_ACT_SHOT);
        assert!(options.windows(5).any(|w| w == b"gact\0"));

        let class = FlowerFilterRequest::new(
            QdiscRequestInner::new(2),
            1,
            FilterTarget::Class(0x0001_0011),
            FlowerMatch::family(Family::V4),
        );
        assert_eq!(u16::from_ne_bytes([class.options_payload()[2], class.options_payload()[3]]), TCA_FLOWER_CLASSID);
    }

    #[test]
    fn family_match_only_carries_ethertype() {
        let keys = FlowerMatch::family(Family::V6).key_nlas();
        assert_eq!(keys.len(), 8);
        assert_eq!(&keys[4..6], &ETH_P_IPV6.to_be_bytes());
    }
}
