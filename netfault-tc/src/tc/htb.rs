//! HTB (Hierarchical Token Bucket) root qdisc and class support.
//!
//! HTB is used purely as a classifier here: the root `1:0` sends unclassified traffic to the
//! pass-through class `1:1`, and every fault owns its own class with an effectively unlimited
//! rate. Unlike prio or DRR, HTB moves on to the next class when a non-work-conserving child
//! (netem with latency) has nothing to dequeue yet, so one fault never stalls the others.

use rtnetlink::packet_core::{
    NLM_F_ACK, NLM_F_CREATE, NLM_F_EXCL, NLM_F_REQUEST, NetlinkMessage,
};
use rtnetlink::packet_route::{
    RouteNetlinkMessage,
    tc::{TcAttribute, TcMessage},
};

use super::core::TICK_IN_USEC;
use super::handle::{PASS_THROUGH_CLASS, QdiscRequestInner};
use super::nla::{build_nla, build_options};
use super::tbf::{DEFAULT_RATE_TABLE, TcRateSpec};

// HTB-specific TCA_OPTIONS sub-attributes (from linux/pkt_sched.h)
const TCA_HTB_PARMS: u16 = 1;
const TCA_HTB_INIT: u16 = 2;
const TCA_HTB_CTAB: u16 = 3;
const TCA_HTB_RTAB: u16 = 4;

/// HTB protocol version.
const HTB_VERSION: u32 = 3;

/// Rate to quantum conversion factor, `quantum = rate / rate2quantum`.
const HTB_RATE2QUANTUM: u32 = 10;

/// Effectively unlimited rate in bytes per second (~10 Gbit/s).
const HTB_UNLIMITED_RATE_BPS: u32 = 1_250_000_000;

/// Burst used for the buffer tick computation (1 MiB).
const HTB_DEFAULT_BURST_BYTES: u32 = 1024 * 1024;

/// The kernel's `tc_htb_glob` structure, passed as `TCA_HTB_INIT` when creating the root.
///
/// ```c
/// struct tc_htb_glob {
///     __u32 version;
///     __u32 rate2quantum;
///     __u32 defcls;
///     __u32 debug;
///     __u32 direct_pkts;
/// };
/// ```
#[derive(Debug, Clone, Copy)]
struct HtbGlob {
    version: u32,
    rate2quantum: u32,
    defcls: u32,
    debug: u32,
    direct_pkts: u32,
}

impl HtbGlob {
    fn as_bytes(self) -> Vec<u8> {
        let mut vec = Vec::with_capacity(20);
        vec.extend_from_slice(&self.version.to_ne_bytes());
        vec.extend_from_slice(&self.rate2quantum.to_ne_bytes());
        vec.extend_from_slice(&self.defcls.to_ne_bytes());
        vec.extend_from_slice(&self.debug.to_ne_bytes());
        vec.extend_from_slice(&self.direct_pkts.to_ne_bytes());
        vec
    }
}

impl Default for HtbGlob {
    fn default() -> Self {
        Self {
            version: HTB_VERSION,
            rate2quantum: HTB_RATE2QUANTUM,
            defcls: PASS_THROUGH_CLASS & 0xFFFF,
            debug: 0,
            direct_pkts: 0,
        }
    }
}

/// The kernel's `tc_htb_opt` structure for class configuration.
///
/// ```c
/// struct tc_htb_opt {
///     struct tc_ratespec rate;
///     struct tc_ratespec ceil;
///     __u32 buffer;
///     __u32 cbuffer;
///     __u32 quantum;
///     __u32 level;
///     __u32 prio;
/// };
/// ```
#[derive(Debug, Clone, Copy)]
struct HtbOpt {
    rate: TcRateSpec,
    ceil: TcRateSpec,
    buffer: u32,
    cbuffer: u32,
    quantum: u32,
    level: u32,
    prio: u32,
}

impl HtbOpt {
    /// Options of a leaf class with an effectively unlimited rate.
    fn unlimited() -> Self {
        let buffer = (HTB_DEFAULT_BURST_BYTES as f64 * *TICK_IN_USEC * 1_000_000.0
            / HTB_UNLIMITED_RATE_BPS as f64) as u32;

        let rate = TcRateSpec {
            rate: HTB_UNLIMITED_RATE_BPS,
            linklayer: 1, // TC_LINKLAYER_ETHERNET
            cell_align: -1,
            ..Default::default()
        };

        Self { rate, ceil: rate, buffer, cbuffer: buffer, quantum: 0, level: 0, prio: 0 }
    }

    fn as_bytes(self) -> Vec<u8> {
        let mut vec = Vec::with_capacity(44);
        vec.extend_from_slice(&self.rate.to_bytes());
        vec.extend_from_slice(&self.ceil.to_bytes());
        vec.extend_from_slice(&self.buffer.to_ne_bytes());
        vec.extend_from_slice(&self.cbuffer.to_ne_bytes());
        vec.extend_from_slice(&self.quantum.to_ne_bytes());
        vec.extend_from_slice(&self.level.to_ne_bytes());
        vec.extend_from_slice(&self.prio.to_ne_bytes());
        vec
    }
}

/// An `htb` tc message carrying `options` as `TCA_OPTIONS`.
fn htb_message(inner: &QdiscRequestInner, options: Vec<u8>) -> TcMessage {
    let mut message = TcMessage::with_index(inner.interface_index);
    message.header.parent = inner.parent;
    message.header.handle = inner.handle;
    message.attributes.push(TcAttribute::Kind("htb".to_string()));
    message.attributes.push(TcAttribute::Other(build_options(options)));
    message
}

/// Wrap a route message into an exclusive create request.
fn exclusive_create(message: RouteNetlinkMessage) -> NetlinkMessage<RouteNetlinkMessage> {
    let mut request = NetlinkMessage::from(message);
    request.header.flags = NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL;
    request
}

/// Builder for the HTB root qdisc.
///
/// Creation is exclusive: an existing root is never replaced, since it may carry the classes of
/// sibling faults.
#[derive(Debug, Clone)]
pub struct QdiscHtbRequest {
    pub inner: QdiscRequestInner,
}

impl QdiscHtbRequest {
    /// The parent and handle are taken from `inner`.
    pub fn new(inner: QdiscRequestInner) -> Self {
        Self { inner }
    }

    pub fn build(self) -> NetlinkMessage<RouteNetlinkMessage> {
        let init = build_nla(TCA_HTB_INIT, &HtbGlob::default().as_bytes());
        exclusive_create(RouteNetlinkMessage::NewQueueDiscipline(htb_message(&self.inner, init)))
    }
}

/// Builder for an HTB class with unlimited rate and ceil.
#[derive(Debug, Clone)]
pub struct HtbClassRequest {
    pub inner: QdiscRequestInner,
}

impl HtbClassRequest {
    pub fn new(inner: QdiscRequestInner) -> Self {
        Self { inner }
    }

    pub fn build(self) -> NetlinkMessage<RouteNetlinkMessage> {
        let mut options = build_nla(TCA_HTB_PARMS, &HtbOpt::unlimited().as_bytes());
        options.extend(build_nla(TCA_HTB_RTAB, &DEFAULT_RATE_TABLE));
        options.extend(build_nla(TCA_HTB_CTAB, &DEFAULT_RATE_TABLE));
        exclusive_create(RouteNetlinkMessage::NewTrafficClass(htb_message(&self.inner, options)))
    }
}
