//! Token Bucket Filter (TBF) qdisc support.
//!
//! TBF is the leaf qdisc of the bandwidth limiting fault. Tokens accumulate at the configured
//! rate, each transmitted byte consumes one token, and packets wait (up to the queue limit) when
//! the bucket is empty.

use rtnetlink::packet_core::{
    NLM_F_ACK, NLM_F_CREATE, NLM_F_EXCL, NLM_F_REQUEST, NetlinkMessage,
};
use rtnetlink::packet_route::{
    RouteNetlinkMessage,
    tc::{TcAttribute, TcMessage},
};
use serde::{Deserialize, Serialize};

use super::core::{MTU_ETHERNET, TICK_IN_USEC};
use super::handle::QdiscRequestInner;
use super::nla::{build_nla, build_options};

/// Zeroed rate table (256 x 4-byte entries).
///
/// Modern kernels compute transmission times from `mult`/`shift` reciprocals. The table is only
/// inspected for linklayer detection, and `rtab[0] == 0` short-circuits that to Ethernet.
pub(crate) const DEFAULT_RATE_TABLE: [u8; 1024] = [0u8; 1024];

// TBF-specific TCA_OPTIONS sub-attributes (from linux/pkt_sched.h)
/// TBF parameters attribute type.
const TCA_TBF_PARMS: u16 = 1;
/// TBF rate table attribute type.
const TCA_TBF_RTAB: u16 = 2;
/// 64-bit rate, for rates that don't fit the ratespec.
const TCA_TBF_RATE64: u16 = 4;
/// TBF burst size in bytes (required by modern kernels).
const TCA_TBF_BURST: u16 = 6;

/// Default time a packet may wait in the TBF queue before it is dropped.
pub const DEFAULT_QUEUE_LATENCY_MS: u32 = 200;

/// User facing TBF parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TbfOptions {
    /// The rate limit in bytes per second.
    pub rate_bytes_per_sec: u64,
    /// Bucket size in bytes. Derived from the rate if unset.
    pub burst_bytes: Option<u32>,
    /// Maximum queueing latency, in milliseconds.
    pub queue_latency_ms: u32,
}

impl TbfOptions {
    /// Create options for the given rate, with the default burst and queue latency.
    pub const fn new(rate_bytes_per_sec: u64) -> Self {
        Self { rate_bytes_per_sec, burst_bytes: None, queue_latency_ms: DEFAULT_QUEUE_LATENCY_MS }
    }

    /// Effective burst in bytes: `max(rate / 8, 10 * MTU)` unless set explicitly.
    pub fn effective_burst_bytes(&self) -> u32 {
        self.burst_bytes.unwrap_or_else(|| {
            let one_eighth_second = (self.rate_bytes_per_sec / 8).min(u32::MAX as u64) as u32;
            one_eighth_second.max(MTU_ETHERNET * 10)
        })
    }

    /// Effective queue limit in bytes: `rate x queue_latency + burst`, as iproute2 computes it.
    pub fn effective_limit_bytes(&self) -> u32 {
        let queued = self.rate_bytes_per_sec / 1000 * self.queue_latency_ms as u64;
        (queued + self.effective_burst_bytes() as u64).min(u32::MAX as u64) as u32
    }
}

/// The kernel's `tc_ratespec` structure.
///
/// From `<linux/pkt_sched.h>`:
///
/// ```c
/// struct tc_ratespec {
///     unsigned char cell_log;
///     __u8 linklayer;
///     unsigned short overhead;
///     short cell_align;
///     unsigned short mpu;
///     __u32 rate;
/// };
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcRateSpec {
    /// Log2 of the cell size. Unused by modern kernels but must be consistent with the MTU.
    pub cell_log: u8,
    /// Link layer type (0 = unaware, 1 = ethernet, 2 = ATM).
    pub linklayer: u8,
    /// Overhead added by link layer framing (bytes).
    pub overhead: u16,
    /// Cell alignment, -1 for Ethernet.
    pub cell_align: i16,
    /// Minimum packet unit.
    pub mpu: u16,
    /// Rate in bytes per second, saturated at [`u32::MAX`].
    pub rate: u32,
}

impl TcRateSpec {
    /// Create a rate spec for the given rate in bytes per second.
    pub fn new(rate_bytes_per_sec: u64, mtu: u32) -> Self {
        Self {
            rate: rate_bytes_per_sec.min(u32::MAX as u64) as u32,
            linklayer: 0,
            cell_log: Self::compute_cell_log(mtu),
            cell_align: -1,
            ..Default::default()
        }
    }

    /// Smallest `cell_log` such that `mtu >> cell_log <= 255`.
    pub fn compute_cell_log(mtu: u32) -> u8 {
        let mut cell_log = 0u8;
        while (mtu >> cell_log) > 255 {
            cell_log += 1;
        }
        cell_log
    }

    /// Serialize to bytes in kernel format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut vec = Vec::with_capacity(12);
        vec.push(self.cell_log);
        vec.push(self.linklayer);
        vec.extend_from_slice(&self.overhead.to_ne_bytes());
        vec.extend_from_slice(&self.cell_align.to_ne_bytes());
        vec.extend_from_slice(&self.mpu.to_ne_bytes());
        vec.extend_from_slice(&self.rate.to_ne_bytes());
        vec
    }
}

/// The kernel's `tc_tbf_qopt` structure.
///
/// ```c
/// struct tc_tbf_qopt {
///     struct tc_ratespec rate;
///     struct tc_ratespec peakrate;
///     __u32 limit;
///     __u32 buffer;
///     __u32 mtu;
/// };
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TbfQopt {
    pub rate: TcRateSpec,
    pub peakrate: TcRateSpec,
    /// Maximum bytes that can queue waiting for tokens.
    pub limit: u32,
    /// Burst size, expressed in scheduler ticks.
    pub buffer: u32,
    pub mtu: u32,
}

impl TbfQopt {
    /// Serialize this structure to bytes for the netlink message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut vec = Vec::with_capacity(12 + 12 + 4 + 4 + 4);
        vec.extend_from_slice(&self.rate.to_bytes());
        vec.extend_from_slice(&self.peakrate.to_bytes());
        vec.extend_from_slice(&self.limit.to_ne_bytes());
        vec.extend_from_slice(&self.buffer.to_ne_bytes());
        vec.extend_from_slice(&self.mtu.to_ne_bytes());
        vec
    }
}

impl From<&TbfOptions> for TbfQopt {
    fn from(options: &TbfOptions) -> Self {
        let rate = options.rate_bytes_per_sec.max(1);
        // buffer_ticks = burst_bytes * TICK_IN_USEC * 1_000_000 / rate_bytes_per_sec
        let buffer = (options.effective_burst_bytes() as f64 * *TICK_IN_USEC * 1_000_000.0
            / rate as f64)
            .min(u32::MAX as f64) as u32;

        Self {
            rate: TcRateSpec::new(rate, MTU_ETHERNET),
            peakrate: TcRateSpec::default(),
            limit: options.effective_limit_bytes(),
            buffer,
            mtu: MTU_ETHERNET,
        }
    }
}

/// Builder for creating a TBF qdisc below a fault class.
#[derive(Debug, Clone)]
pub struct QdiscTbfRequest {
    pub inner: QdiscRequestInner,
    pub options: TbfOptions,
}

impl QdiscTbfRequest {
    /// Create a new TBF qdisc request.
    pub fn new(inner: QdiscRequestInner, options: TbfOptions) -> Self {
        Self { inner, options }
    }

    /// The nested `TCA_OPTIONS` attributes: parameters, rate table, burst and, for rates above
    /// what `tc_ratespec` can carry, the 64-bit rate.
    pub fn options_payload(&self) -> Vec<u8> {
        let qopt = TbfQopt::from(&self.options);

        let mut combined = build_nla(TCA_TBF_PARMS, &qopt.to_bytes());
        combined.extend(build_nla(TCA_TBF_RTAB, &DEFAULT_RATE_TABLE));
        combined.extend(build_nla(
            TCA_TBF_BURST,
            &self.options.effective_burst_bytes().to_ne_bytes(),
        ));
        if self.options.rate_bytes_per_sec > u32::MAX as u64 {
            combined.extend(build_nla(
                TCA_TBF_RATE64,
                &self.options.rate_bytes_per_sec.to_ne_bytes(),
            ));
        }

        combined
    }

    /// Build the netlink message to create this TBF qdisc.
    pub fn build(self) -> NetlinkMessage<RouteNetlinkMessage> {
        let mut tc_message = TcMessage::with_index(self.inner.interface_index);
        tc_message.header.parent = self.inner.parent;
        tc_message.header.handle = self.inner.handle;

        tc_message.attributes.push(TcAttribute::Kind("tbf".to_string()));
        tc_message.attributes.push(TcAttribute::Other(build_options(self.options_payload())));

        let mut nl_req = NetlinkMessage::from(RouteNetlinkMessage::NewQueueDiscipline(tc_message));
        nl_req.header.flags = NLM_F_CREATE | NLM_F_EXCL | NLM_F_REQUEST | NLM_F_ACK;

        nl_req
    }
}
