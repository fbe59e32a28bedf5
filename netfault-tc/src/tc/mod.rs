//! # Traffic Control
//!
//! Request builders and a typed object model for the traffic-control trees `netfault` installs.
//!
//! ## Architecture Overview
//!
//! Every interface carrying at least one fault gets a single HTB root. Below it, each combination
//! of faults some packet is subject to gets a class, and a leaf implementing all of them at once:
//! one netem carrying latency, loss and corruption together, with a TBF chained below it when the
//! bandwidth is limited too. Flower classifiers attached to the root form an ordered decision list
//! routing each packet to the class of the faults whose scopes select it; anything they don't
//! claim falls through to the default class `1:1`, which is left untouched.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                        HTB Root Qdisc (1:0), defcls 1                       │
//! │                                                                             │
//! │   flower pref 1  dst 10.0.0.5        ──▶ 1:1   (excluded from everything)   │
//! │   flower pref 2  dst 10.0.0.0/8      ──▶ 1:1c  (delay and loss)             │
//! │   flower pref 3  ipv4                ──▶ 1:14  (delay only)                 │
//! └─────────────────────────────────────────────────────────────────────────────┘
//!            │                       │                       │
//!            ▼                       ▼                       ▼
//! ┌──────────────────┐    ┌──────────────────┐    ┌──────────────────┐
//! │  Class 1:1       │    │  Class 1:1c      │    │  Class 1:14      │
//! │  (pass-through)  │    │  (mask 0b1100)   │    │  (mask 0b0100)   │
//! └──────────────────┘    └──────────────────┘    └──────────────────┘
//!                                    │                       │
//!                                    ▼                       ▼
//!                         ┌──────────────────┐    ┌──────────────────┐
//!                         │  netem (1c:0)    │    │  netem (14:0)    │
//!                         │  latency, loss   │    │  latency         │
//!                         └──────────────────┘    └──────────────────┘
//! ```
//!
//! The blackhole fault also attaches drop classifiers to the ingress qdisc `ffff:`, matching the
//! same peers on the source side. See [`handle`] for the numbering scheme.

pub mod core;
pub mod fifo;
pub mod filter;
pub mod handle;
pub mod htb;
pub mod ingress;
pub mod netem;
pub(crate) mod nla;
pub mod object;
pub mod snapshot;
pub mod tbf;
