//! Ingress qdisc support.
//!
//! The ingress qdisc does not queue anything: it is the attachment point of classifiers acting on
//! packets received by the interface. The blackhole fault drops inbound traffic there.

use rtnetlink::packet_core::{
    NLM_F_ACK, NLM_F_CREATE, NLM_F_EXCL, NLM_F_REQUEST, NetlinkMessage,
};
use rtnetlink::packet_route::{
    RouteNetlinkMessage,
    tc::{TcAttribute, TcHandle, TcMessage},
};

use super::handle::{INGRESS_HANDLE, INGRESS_PARENT};

/// Builder for the ingress qdisc of an interface. Its parent and handle are fixed.
#[derive(Debug, Clone, Copy)]
pub struct QdiscIngressRequest {
    pub interface_index: i32,
}

impl QdiscIngressRequest {
    pub fn new(interface_index: i32) -> Self {
        Self { interface_index }
    }

    /// Build the netlink message. The ingress qdisc takes no options.
    pub fn build(self) -> NetlinkMessage<RouteNetlinkMessage> {
        let mut tc_message = TcMessage::with_index(self.interface_index);
        tc_message.header.parent = TcHandle::from(INGRESS_PARENT);
        tc_message.header.handle = TcHandle::from(INGRESS_HANDLE);
        tc_message.attributes.push(TcAttribute::Kind("ingress".to_string()));

        let mut nl_req = NetlinkMessage::from(RouteNetlinkMessage::NewQueueDiscipline(tc_message));
        nl_req.header.flags = NLM_F_CREATE | NLM_F_EXCL | NLM_F_REQUEST | NLM_F_ACK;

        nl_req
    }
}
