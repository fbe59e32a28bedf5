//! Packet FIFO (`pfifo`) qdisc support.
//!
//! A `pfifo` with a limit of zero packets rejects every enqueue, which makes it the leaf of the
//! blackhole fault: whatever the classifiers route into it is dropped unconditionally.

use rtnetlink::packet_core::{
    NLM_F_ACK, NLM_F_CREATE, NLM_F_EXCL, NLM_F_REQUEST, NetlinkMessage,
};
use rtnetlink::packet_route::{
    RouteNetlinkMessage,
    tc::{TcAttribute, TcMessage},
};

use super::handle::QdiscRequestInner;
use super::nla::build_options;

/// Builder for a `pfifo` qdisc.
#[derive(Debug, Clone)]
pub struct QdiscFifoRequest {
    pub inner: QdiscRequestInner,
    /// Queue limit in packets.
    pub limit: u32,
}

impl QdiscFifoRequest {
    /// Create a `pfifo` request with the given packet limit.
    pub fn new(inner: QdiscRequestInner, limit: u32) -> Self {
        Self { inner, limit }
    }

    /// Build the netlink message. The options are the raw `struct tc_fifo_qopt { __u32 limit; }`.
    pub fn build(self) -> NetlinkMessage<RouteNetlinkMessage> {
        let mut tc_message = TcMessage::with_index(self.inner.interface_index);
        tc_message.header.parent = self.inner.parent;
        tc_message.header.handle = self.inner.handle;

        tc_message.attributes.push(TcAttribute::Kind("pfifo".to_string()));
        tc_message
            .attributes
            .push(TcAttribute::Other(build_options(self.limit.to_ne_bytes().to_vec())));

        let mut nl_req = NetlinkMessage::from(RouteNetlinkMessage::NewQueueDiscipline(tc_message));
        nl_req.header.flags = NLM_F_CREATE | NLM_F_EXCL | NLM_F_REQUEST | NLM_F_ACK;

        nl_req
    }
}
