//! Point-in-time view of the traffic-control tree of one interface.
//!
//! Snapshots are decoded from qdisc/class/filter dumps and normalized (sorted, deduplicated), so
//! two snapshots of the same tree compare equal.

use rtnetlink::packet_route::tc::{TcAttribute, TcMessage};
use serde::{Deserialize, Serialize};

use super::filter::split_filter_info;
use super::handle::{
    INGRESS_HANDLE, INGRESS_PARENT, PASS_THROUGH_CLASS, ROOT_HANDLE, ROOT_PARENT, mask_of_class, raw,
};
use super::object::{TcObject, TcObjectId};

/// A qdisc as reported by the kernel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QdiscEntry {
    pub parent: u32,
    pub handle: u32,
    pub kind: String,
}

/// A class as reported by the kernel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClassEntry {
    pub parent: u32,
    pub handle: u32,
    pub kind: String,
}

/// A classifier chain as reported by the kernel, one entry per preference and protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FilterEntry {
    pub parent: u32,
    pub priority: u16,
    pub protocol: u16,
    pub kind: String,
}

/// State of the root qdisc of an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootState {
    /// The kernel default root (handle `0:`), or no root at all.
    Absent,
    /// An HTB root at `1:0`, as installed by `netfault`.
    Ours,
    /// Some other root qdisc, installed by someone else.
    Foreign(QdiscEntry),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcSnapshot {
    pub qdiscs: Vec<QdiscEntry>,
    pub classes: Vec<ClassEntry>,
    pub filters: Vec<FilterEntry>,
}

impl TcSnapshot {
    /// Build a snapshot from raw dump messages.
    pub fn from_messages(
        qdiscs: impl IntoIterator<Item = TcMessage>,
        classes: impl IntoIterator<Item = TcMessage>,
        filters: impl IntoIterator<Item = TcMessage>,
    ) -> Self {
        let mut snapshot = Self {
            qdiscs: qdiscs
                .into_iter()
                .map(|m| QdiscEntry {
                    parent: raw(m.header.parent),
                    handle: raw(m.header.handle),
                    kind: kind_of(&m),
                })
                .collect(),
            classes: classes
                .into_iter()
                .map(|m| ClassEntry {
                    parent: raw(m.header.parent),
                    handle: raw(m.header.handle),
                    kind: kind_of(&m),
                })
                .collect(),
            filters: filters
                .into_iter()
                .map(|m| {
                    let (priority, protocol) = split_filter_info(m.header.info);
                    FilterEntry { parent: raw(m.header.parent), priority, protocol, kind: kind_of(&m) }
                })
                .collect(),
        };
        snapshot.normalize();
        snapshot
    }

    /// Sort and deduplicate all entries. The kernel reports one filter message per chain head
    /// and one per filter handle; they collapse into a single entry.
    pub fn normalize(&mut self) {
        self.qdiscs.sort();
        self.qdiscs.dedup();
        self.classes.sort();
        self.classes.dedup();
        self.filters.sort();
        self.filters.dedup();
    }

    /// Classify the root qdisc.
    pub fn root_state(&self) -> RootState {
        match self.qdiscs.iter().find(|q| q.parent == ROOT_PARENT) {
            None => RootState::Absent,
            Some(q) if q.handle == 0 => RootState::Absent,
            Some(q) if q.handle == ROOT_HANDLE && q.kind == "htb" => RootState::Ours,
            Some(q) => RootState::Foreign(q.clone()),
        }
    }

    /// Whether the pass-through class exists below the root.
    pub fn has_pass_through(&self) -> bool {
        self.classes.iter().any(|c| c.parent == ROOT_HANDLE && c.handle == PASS_THROUGH_CLASS)
    }

    /// Masks of the fault classes currently installed below the root.
    pub fn fault_masks(&self) -> Vec<u8> {
        self.classes
            .iter()
            .filter(|c| c.parent == ROOT_HANDLE)
            .filter_map(|c| mask_of_class(c.handle))
            .collect()
    }

    /// The ingress qdisc, if the interface has one.
    pub fn ingress(&self) -> Option<&QdiscEntry> {
        self.qdiscs.iter().find(|q| q.parent == INGRESS_PARENT)
    }

    /// Number of classifiers attached to the ingress qdisc.
    pub fn ingress_filters(&self) -> usize {
        self.filters.iter().filter(|f| f.parent == INGRESS_HANDLE).count()
    }

    /// Number of classifiers attached to the root.
    pub fn root_filters(&self) -> usize {
        self.filters.iter().filter(|f| f.parent == ROOT_HANDLE).count()
    }

    /// Whether the root carries nothing but the pass-through class, and can be removed.
    pub fn root_is_idle(&self) -> bool {
        self.fault_masks().is_empty() && self.root_filters() == 0
    }

    /// Whether an object with the given identity is present.
    pub fn contains(&self, id: &TcObjectId) -> bool {
        match *id {
            TcObjectId::Qdisc { parent, handle } => {
                self.qdiscs.iter().any(|q| q.parent == parent && q.handle == handle)
            }
            TcObjectId::Class { parent, handle } => {
                self.classes.iter().any(|c| c.parent == parent && c.handle == handle)
            }
            TcObjectId::Filter { parent, priority, protocol } => self
                .filters
                .iter()
                .any(|f| f.parent == parent && f.priority == priority && f.protocol == protocol),
        }
    }

    /// Record an object as present. Used by in-memory trees.
    pub fn insert(&mut self, object: &TcObject) {
        match object {
            TcObject::Qdisc(q) => self.qdiscs.push(QdiscEntry {
                parent: q.parent,
                handle: q.handle,
                kind: q.kind.as_str().to_string(),
            }),
            TcObject::Class(c) => {
                self.classes.push(ClassEntry { parent: c.parent, handle: c.handle, kind: "htb".into() })
            }
            TcObject::Filter(f) => self.filters.push(FilterEntry {
                parent: f.parent,
                priority: f.priority,
                protocol: f.matcher.family.ethertype(),
                kind: "flower".into(),
            }),
        }
        self.normalize();
    }

    /// Remove an object, returning whether it was present.
    pub fn remove(&mut self, id: &TcObjectId) -> bool {
        let before = self.len();
        match *id {
            TcObjectId::Qdisc { parent, handle } => {
                self.qdiscs.retain(|q| !(q.parent == parent && q.handle == handle))
            }
            TcObjectId::Class { parent, handle } => {
                self.classes.retain(|c| !(c.parent == parent && c.handle == handle))
            }
            TcObjectId::Filter { parent, priority, protocol } => self.filters.retain(|f| {
                !(f.parent == parent && f.priority == priority && f.protocol == protocol)
            }),
        }
        self.len() != before
    }

    /// Total number of objects.
    pub fn len(&self) -> usize {
        self.qdiscs.len() + self.classes.len() + self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn kind_of(message: &TcMessage) -> String {
    message
        .attributes
        .iter()
        .find_map(|attr| match attr {
            TcAttribute::Kind(kind) => Some(kind.clone()),
            _ => None,
        })
        .unwrap_or_default()
}
