//! Kernel-facing plumbing for `netfault`.
//!
//! This crate knows how to describe a traffic control tree as typed objects ([`tc::object`]),
//! how to turn those objects into rtnetlink requests, and how to execute those requests inside a
//! foreign network namespace ([`namespace`], [`session`]). It has no notion of faults or
//! experiments: that lives in the `netfault` crate.
#![doc(issue_tracker_base_url = "https://github.com/chainbound/netfault/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub mod dynch;
pub mod error;
pub mod namespace;
pub mod session;
pub mod tc;
pub mod wrappers;

pub use error::{Error, Result};
