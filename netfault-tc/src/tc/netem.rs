//! Netem (Network Emulator) qdisc support.
//!
//! Netem provides the latency, jitter, packet loss and packet corruption faults.

use rtnetlink::packet_core::{
    NLM_F_ACK, NLM_F_CREATE, NLM_F_EXCL, NLM_F_REQUEST, NetlinkMessage,
};
use rtnetlink::packet_route::{
    RouteNetlinkMessage,
    tc::{TcAttribute, TcMessage},
};
use serde::{Deserialize, Serialize};

use super::core::usec_to_ticks;
use super::handle::QdiscRequestInner;
use super::nla::{build_nla, build_options};

/// Netem's default fifo limit, in packets.
pub const NETEM_DEFAULT_LIMIT: u32 = 1_000;

/// `TCA_NETEM_CORRUPT` attribute type (from linux/pkt_sched.h).
const TCA_NETEM_CORRUPT: u16 = 4;

/// User facing netem parameters. Percentages are in the `0.0..=100.0` range, times are in
/// microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NetemOptions {
    /// Base latency added to every packet, in microseconds.
    pub latency_us: u32,
    /// Random variation of the latency, in microseconds.
    pub jitter_us: u32,
    /// Packet loss percentage.
    pub loss: f64,
    /// Single bit corruption percentage.
    pub corrupt: f64,
    /// Maximum number of packets queued in netem.
    pub limit: u32,
}

impl Default for NetemOptions {
    fn default() -> Self {
        Self { latency_us: 0, jitter_us: 0, loss: 0.0, corrupt: 0.0, limit: NETEM_DEFAULT_LIMIT }
    }
}

/// The kernel's `tc_netem_qopt` structure. Field order matters.
///
/// From `<linux/pkt_sched.h>`:
///
/// ```c
/// struct tc_netem_qopt {
///     __u32 latency;    /* Delay in scheduler ticks */
///     __u32 limit;      /* Queue size limit in packets */
///     __u32 loss;       /* Loss probability (0 to 2^32-1) */
///     __u32 gap;        /* Reordering gap */
///     __u32 duplicate;  /* Duplication probability */
///     __u32 jitter;     /* Jitter in scheduler ticks */
/// };
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetemQopt {
    /// Latency in packet scheduler ticks (not microseconds!).
    pub latency: u32,
    /// Maximum packets in queue.
    pub limit: u32,
    /// Loss probability, scaled to u32 range.
    pub loss: u32,
    /// Reordering gap.
    pub gap: u32,
    /// Duplication probability, scaled to u32 range.
    pub duplicate: u32,
    /// Jitter in packet scheduler ticks.
    pub jitter: u32,
}

impl NetemQopt {
    /// Convert a percentage (0-100) to the kernel's probability representation, where
    /// [`u32::MAX`] represents 100%.
    pub fn u32_probability(percent: f64) -> u32 {
        (percent.clamp(0.0, 100.0) / 100.0 * u32::MAX as f64) as u32
    }

    /// Serialize this structure in native endian order.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut vec = Vec::with_capacity(4 * 6);
        vec.extend_from_slice(&self.latency.to_ne_bytes());
        vec.extend_from_slice(&self.limit.to_ne_bytes());
        vec.extend_from_slice(&self.loss.to_ne_bytes());
        vec.extend_from_slice(&self.gap.to_ne_bytes());
        vec.extend_from_slice(&self.duplicate.to_ne_bytes());
        vec.extend_from_slice(&self.jitter.to_ne_bytes());
        vec
    }
}

impl From<&NetemOptions> for NetemQopt {
    fn from(value: &NetemOptions) -> Self {
        Self {
            latency: usec_to_ticks(value.latency_us),
            limit: value.limit,
            loss: Self::u32_probability(value.loss),
            gap: 0,
            duplicate: 0,
            jitter: usec_to_ticks(value.jitter_us),
        }
    }
}

/// Builder for creating a netem qdisc below a fault class.
#[derive(Debug)]
pub struct QdiscNetemRequest {
    pub inner: QdiscRequestInner,
    pub options: NetemOptions,
}

impl QdiscNetemRequest {
    /// Create a new netem qdisc request.
    pub fn new(inner: QdiscRequestInner, options: NetemOptions) -> Self {
        Self { inner, options }
    }

    /// The `TCA_OPTIONS` payload: the fixed `tc_netem_qopt` header, followed by the optional
    /// nested attributes the kernel parses after it.
    pub fn options_payload(&self) -> Vec<u8> {
        let mut payload = NetemQopt::from(&self.options).to_bytes();

        if self.options.corrupt > 0.0 {
            // struct tc_netem_corrupt { __u32 probability; __u32 correlation; };
            let mut corrupt = Vec::with_capacity(8);
            corrupt.extend_from_slice(
                &NetemQopt::u32_probability(self.options.corrupt).to_ne_bytes(),
            );
            corrupt.extend_from_slice(&0u32.to_ne_bytes());
            payload.extend(build_nla(TCA_NETEM_CORRUPT, &corrupt));
        }

        payload
    }

    /// Build the netlink message to create this netem qdisc.
    pub fn build(self) -> NetlinkMessage<RouteNetlinkMessage> {
        let mut tc_message = TcMessage::with_index(self.inner.interface_index);
        tc_message.header.parent = self.inner.parent;
        tc_message.header.handle = self.inner.handle;

        tc_message.attributes.push(TcAttribute::Kind("netem".to_string()));
        tc_message.attributes.push(TcAttribute::Other(build_options(self.options_payload())));

        let mut nl_req = NetlinkMessage::from(RouteNetlinkMessage::NewQueueDiscipline(tc_message));
        nl_req.header.flags = NLM_F_CREATE | NLM_F_EXCL | NLM_F_REQUEST | NLM_F_ACK;

        nl_req
    }
}
