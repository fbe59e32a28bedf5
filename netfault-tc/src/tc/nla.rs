//! Netlink attribute building utilities.
//!
//! Netlink uses a TLV (Type-Length-Value) format for attributes. Most of the tc options we need
//! are not modelled by `netlink-packet-route`, so they are serialized here by hand.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  Length (2 bytes) │  Type (2 bytes)     │  <- NLA header (4 bytes)
//! ├─────────────────────────────────────────┤
//! │  Value (variable length, padded to 4)   │
//! └─────────────────────────────────────────┘
//! ```

use nix::libc::TCA_OPTIONS;
use rtnetlink::packet_utils::nla::{DefaultNla, NLA_F_NESTED, NLA_HEADER_SIZE};

/// Build a single NLA (header + value + padding).
pub(crate) fn build_nla(nla_type: u16, value: &[u8]) -> Vec<u8> {
    let nla_len = NLA_HEADER_SIZE + value.len();
    let padded_len = (nla_len + 3) & !3;

    let mut buf = vec![0u8; padded_len];
    buf[0..2].copy_from_slice(&(nla_len as u16).to_ne_bytes());
    buf[2..4].copy_from_slice(&nla_type.to_ne_bytes());
    buf[NLA_HEADER_SIZE..NLA_HEADER_SIZE + value.len()].copy_from_slice(value);

    buf
}

/// Build an NLA carrying a native endian `u32`.
pub(crate) fn nla_u32(nla_type: u16, value: u32) -> Vec<u8> {
    build_nla(nla_type, &value.to_ne_bytes())
}

/// Build an NLA carrying a single byte.
pub(crate) fn nla_u8(nla_type: u16, value: u8) -> Vec<u8> {
    build_nla(nla_type, &[value])
}

/// Build an NLA carrying a network byte order `u16` (ports, ethertypes).
pub(crate) fn nla_be16(nla_type: u16, value: u16) -> Vec<u8> {
    build_nla(nla_type, &value.to_be_bytes())
}

/// Build a nested NLA around already serialized sub-attributes.
pub(crate) fn nested(nla_type: u16, payload: &[u8]) -> Vec<u8> {
    build_nla(nla_type | NLA_F_NESTED, payload)
}

/// Wrap an options payload in a `TCA_OPTIONS` attribute.
///
/// Depending on the object kind, the payload is either a list of already formatted
/// sub-attributes (htb, tbf, flower) or a raw kernel struct (`tc_fifo_qopt`, `tc_netem_qopt`).
pub(crate) fn build_options(payload: Vec<u8>) -> DefaultNla {
    DefaultNla::new(TCA_OPTIONS, payload)
}
