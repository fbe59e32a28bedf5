//! Typed model of the traffic-control objects `netfault` creates, and their kernel identities.
//!
//! A [`TcObject`] knows how to build the request that creates it. Its [`TcObjectId`] is the
//! minimal information needed to delete exactly that object later, and is what gets recorded in
//! applied handles.

use std::fmt;

use rtnetlink::packet_core::{NLM_F_ACK, NLM_F_REQUEST, NetlinkMessage};
use rtnetlink::packet_route::{
    RouteNetlinkMessage,
    tc::{TcHandle, TcMessage},
};
use serde::{Deserialize, Serialize};

use super::fifo::QdiscFifoRequest;
use super::filter::{FilterTarget, FlowerFilterRequest, FlowerMatch, filter_info};
use super::handle::{QdiscRequestInner, display};
use super::htb::{HtbClassRequest, QdiscHtbRequest};
use super::ingress::QdiscIngressRequest;
use super::netem::{NetemOptions, QdiscNetemRequest};
use super::tbf::{QdiscTbfRequest, TbfOptions};

/// Qdisc flavours, with their parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum QdiscKind {
    Htb,
    Netem(NetemOptions),
    Tbf(TbfOptions),
    Pfifo { limit: u32 },
    Ingress,
}

impl QdiscKind {
    /// The kind string the kernel reports in dumps.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Htb => "htb",
            Self::Netem(_) => "netem",
            Self::Tbf(_) => "tbf",
            Self::Pfifo { .. } => "pfifo",
            Self::Ingress => "ingress",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QdiscSpec {
    pub parent: u32,
    pub handle: u32,
    pub kind: QdiscKind,
}

/// An HTB class with unlimited rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassSpec {
    pub parent: u32,
    pub handle: u32,
}

/// A flower classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub parent: u32,
    pub priority: u16,
    pub target: FilterTarget,
    pub matcher: FlowerMatch,
}

/// A traffic-control object to be created on an interface.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "object", rename_all = "lowercase")]
pub enum TcObject {
    Qdisc(QdiscSpec),
    Class(ClassSpec),
    Filter(FilterSpec),
}

impl TcObject {
    /// The identity of this object in the kernel.
    pub const fn id(&self) -> TcObjectId {
        match self {
            Self::Qdisc(q) => TcObjectId::Qdisc { parent: q.parent, handle: q.handle },
            Self::Class(c) => TcObjectId::Class { parent: c.parent, handle: c.handle },
            Self::Filter(f) => TcObjectId::Filter {
                parent: f.parent,
                priority: f.priority,
                protocol: f.matcher.family.ethertype(),
            },
        }
    }

    /// Build the netlink request creating this object on the given interface.
    pub fn add_request(&self, if_index: i32) -> NetlinkMessage<RouteNetlinkMessage> {
        match *self {
            Self::Qdisc(QdiscSpec { parent, handle, kind }) => {
                let inner = QdiscRequestInner::new(if_index)
                    .with_parent(TcHandle::from(parent))
                    .with_handle(TcHandle::from(handle));
                match kind {
                    QdiscKind::Htb => QdiscHtbRequest::new(inner).build(),
                    QdiscKind::Netem(options) => QdiscNetemRequest::new(inner, options).build(),
                    QdiscKind::Tbf(options) => QdiscTbfRequest::new(inner, options).build(),
                    QdiscKind::Pfifo { limit } => QdiscFifoRequest::new(inner, limit).build(),
                    QdiscKind::Ingress => QdiscIngressRequest::new(if_index).build(),
                }
            }
            Self::Class(ClassSpec { parent, handle }) => HtbClassRequest::new(
                QdiscRequestInner::new(if_index)
                    .with_parent(TcHandle::from(parent))
                    .with_handle(TcHandle::from(handle)),
            )
            .build(),
            Self::Filter(FilterSpec { parent, priority, target, matcher }) => {
                FlowerFilterRequest::new(
                    QdiscRequestInner::new(if_index).with_parent(TcHandle::from(parent)),
                    priority,
                    target,
                    matcher,
                )
                .build()
            }
        }
    }
}

impl fmt::Display for TcObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Qdisc(q) => write!(f, "{} {}", q.kind.as_str(), self.id()),
            Self::Class(_) => write!(f, "htb {}", self.id()),
            Self::Filter(spec) => match spec.target {
                FilterTarget::Class(class_id) => write!(f, "{} flowid {}", self.id(), display(class_id)),
                FilterTarget::Pass => write!(f, "{} action pass", self.id()),
                FilterTarget::Drop => write!(f, "{} action drop", self.id()),
            },
        }
    }
}

/// Kernel identity of a traffic-control object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "object", rename_all = "lowercase")]
pub enum TcObjectId {
    Qdisc { parent: u32, handle: u32 },
    Class { parent: u32, handle: u32 },
    /// Filters are addressed by parent, preference and protocol, deleting the whole chain
    /// registered at that preference.
    Filter { parent: u32, priority: u16, protocol: u16 },
}

impl TcObjectId {
    /// Build the netlink request deleting this object from the given interface.
    pub fn delete_request(&self, if_index: i32) -> NetlinkMessage<RouteNetlinkMessage> {
        let mut tc_message = TcMessage::with_index(if_index);

        let message = match *self {
            Self::Qdisc { parent, handle } => {
                tc_message.header.parent = TcHandle::from(parent);
                tc_message.header.handle = TcHandle::from(handle);
                RouteNetlinkMessage::DelQueueDiscipline(tc_message)
            }
            Self::Class { parent, handle } => {
                tc_message.header.parent = TcHandle::from(parent);
                tc_message.header.handle = TcHandle::from(handle);
                RouteNetlinkMessage::DelTrafficClass(tc_message)
            }
            Self::Filter { parent, priority, protocol } => {
                tc_message.header.parent = TcHandle::from(parent);
                tc_message.header.info = filter_info(priority, protocol);
                RouteNetlinkMessage::DelTrafficFilter(tc_message)
            }
        };

        let mut nl_req = NetlinkMessage::from(message);
        nl_req.header.flags = NLM_F_REQUEST | NLM_F_ACK;
        nl_req
    }
}

impl fmt::Display for TcObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Qdisc { parent, handle } => {
                write!(f, "qdisc {} parent {}", display(*handle), display(*parent))
            }
            Self::Class { parent, handle } => {
                write!(f, "class {} parent {}", display(*handle), display(*parent))
            }
            Self::Filter { parent, priority, protocol } => {
                write!(f, "filter parent {} pref {priority} protocol {protocol:#06x}", display(*parent))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rtnetlink::packet_core::NetlinkPayload;

    use super::*;
    use crate::tc::filter::{ETH_P_IP, Family};
    use crate::tc::handle::{INGRESS_HANDLE, ROOT_HANDLE, fault_class, fault_leaf};

    #[test]
    fn filter_identity_uses_family_protocol() {
        let object = TcObject::Filter(FilterSpec {
            parent: ROOT_HANDLE,
            priority: 1,
            target: FilterTarget::Class(fault_class(1)),
            matcher: FlowerMatch::family(Family::V4),
        });
        assert_eq!(
            object.id(),
            TcObjectId::Filter { parent: ROOT_HANDLE, priority: 1, protocol: ETH_P_IP }
        );

        let v6 = TcObject::Filter(FilterSpec {
            parent: INGRESS_HANDLE,
            priority: 2,
            target: FilterTarget::Drop,
            matcher: FlowerMatch::family(Family::V6),
        });
        assert_eq!(v6.to_string(), "filter parent ffff:0 pref 2 protocol 0x86dd action drop");
    }

    #[test]
    fn object_ids_serialize() {
        let id = TcObjectId::Qdisc { parent: fault_class(3), handle: fault_leaf(3) };
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(serde_json::from_str::<TcObjectId>(&json).unwrap(), id);
    }

    #[test]
    fn delete_request_targets_exact_class() {
        let request =
            TcObjectId::Class { parent: ROOT_HANDLE, handle: fault_class(2) }.delete_request(4);
        let NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelTrafficClass(message)) =
            &request.payload
        else {
            panic!("expected class deletion, got {request:?}");
        };
        assert_eq!(message.header.index, 4);
        assert_eq!(crate::tc::handle::raw(message.header.handle), fault_class(2));
    }
}
