//! Composition of the faults active on one interface into a single tc tree.
//!
//! Several kinds can be active on an interface at once, each with its own scope. A packet must
//! undergo every kind whose scope selects it, so the tree is built per *combination* of kinds:
//! the scopes are folded into one ordered list of [`Rule`]s, each mapping a flower match to the
//! mask of kinds its packets get. Every mask in use has a class below the root with a leaf
//! implementing all of its kinds at once, and the rules become classifiers on the root in order.
//!
//! Blackholes also drop what arrives from their scope. They get the same rules, with matches
//! reversed, as drop classifiers on the ingress qdisc.

use std::collections::{BTreeMap, BTreeSet};

use netfault_tc::tc::filter::{Family, FilterTarget, FlowerMatch, PacketHeader};
use netfault_tc::tc::handle::{
    INGRESS_HANDLE, INGRESS_PARENT, MAX_RULES, PASS_THROUGH_CLASS, ROOT_HANDLE, ROOT_PARENT,
    fault_class, fault_leaf, rate_leaf, rate_parent, rule_pref,
};
use netfault_tc::tc::netem::NetemOptions;
use netfault_tc::tc::object::{ClassSpec, FilterSpec, QdiscKind, QdiscSpec, TcObject};
use rustc_hash::FxHashSet;

use crate::discipline::{Discipline, DisciplineKind};
use crate::error::KernelError;
use crate::scope::CompiledScope;

/// A fault applied to an interface.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveFault {
    pub discipline: Discipline,
    pub scope: CompiledScope,
}

impl ActiveFault {
    pub fn new(discipline: Discipline, scope: CompiledScope) -> Self {
        Self { discipline, scope }
    }
}

/// Packets selected by `matcher`, and not by an earlier rule, get the kinds in `mask`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rule {
    pub matcher: FlowerMatch,
    pub mask: u8,
}

/// Fold scopes into a decision list, first match wins.
///
/// Each scope refines every rule of the list built so far: the part of a rule its excludes
/// select keeps the rule's mask, the part its includes select gets the scope's bit added, the
/// rest keeps the mask. Rules selecting nothing new are dropped, as are trailing rules without
/// any fault since unmatched traffic is passed through anyway.
pub fn rules<'a>(scopes: impl IntoIterator<Item = (u8, &'a CompiledScope)>) -> Vec<Rule> {
    let mut rules: Vec<_> =
        [Family::V4, Family::V6].map(|family| Rule { matcher: FlowerMatch::family(family), mask: 0 }).into();

    for (bit, scope) in scopes {
        let mut refined = Vec::with_capacity(rules.len());
        for rule in rules {
            let groups = [(&scope.excludes, rule.mask), (&scope.includes, rule.mask | bit)];
            let mut shadowed = false;

            'groups: for (matches, mask) in groups {
                for matcher in matches {
                    let Some(narrowed) = rule.matcher.intersect(matcher) else { continue };
                    refined.push(Rule { matcher: narrowed, mask });
                    if narrowed == rule.matcher {
                        shadowed = true;
                        break 'groups;
                    }
                }
            }
            if !shadowed {
                refined.push(rule);
            }
        }
        rules = refined;
    }

    let mut seen = FxHashSet::default();
    rules.retain(|rule| seen.insert(rule.matcher));
    while rules.last().is_some_and(|rule| rule.mask == 0) {
        rules.pop();
    }
    rules
}

/// The leaf implementing every kind of `mask` at once, below the mask's class.
fn leaves(mask: u8, faults: &BTreeMap<DisciplineKind, ActiveFault>) -> Vec<TcObject> {
    let class = fault_class(mask);
    let leaf = |parent, handle, kind| TcObject::Qdisc(QdiscSpec { parent, handle, kind });

    let disciplines: Vec<_> = DisciplineKind::in_mask(mask)
        .filter_map(|kind| faults.get(&kind))
        .map(|fault| fault.discipline)
        .collect();

    if disciplines.contains(&Discipline::Blackhole) {
        return vec![leaf(class, fault_leaf(mask), Discipline::Blackhole.leaf())];
    }

    let mut netem: Option<NetemOptions> = None;
    let mut rate = None;
    for discipline in &disciplines {
        match discipline.leaf() {
            QdiscKind::Netem(options) => {
                let merged = netem.get_or_insert_with(NetemOptions::default);
                merged.latency_us = merged.latency_us.max(options.latency_us);
                merged.jitter_us = merged.jitter_us.max(options.jitter_us);
                merged.loss = merged.loss.max(options.loss);
                merged.corrupt = merged.corrupt.max(options.corrupt);
            }
            kind @ QdiscKind::Tbf(_) => rate = Some(kind),
            _ => {}
        }
    }

    match (netem, rate) {
        (Some(options), Some(rate)) => vec![
            leaf(class, fault_leaf(mask), QdiscKind::Netem(options)),
            leaf(rate_parent(mask), rate_leaf(mask), rate),
        ],
        (Some(options), None) => vec![leaf(class, fault_leaf(mask), QdiscKind::Netem(options))],
        (None, Some(rate)) => vec![leaf(class, fault_leaf(mask), rate)],
        (None, None) => Vec::new(),
    }
}

fn classifiers(
    parent: u32,
    rules: &[Rule],
    target: impl Fn(u8) -> FilterTarget,
) -> Result<Vec<TcObject>, KernelError> {
    if rules.len() > MAX_RULES {
        return Err(KernelError::Classifiers { needed: rules.len(), limit: MAX_RULES });
    }
    Ok(rules
        .iter()
        .enumerate()
        .filter_map(|(index, rule)| {
            let priority = rule_pref(index)?;
            Some(TcObject::Filter(FilterSpec { parent, priority, target: target(rule.mask), matcher: rule.matcher }))
        })
        .collect())
}

pub fn root_qdisc() -> TcObject {
    TcObject::Qdisc(QdiscSpec { parent: ROOT_PARENT, handle: ROOT_HANDLE, kind: QdiscKind::Htb })
}

pub fn pass_through_class() -> TcObject {
    TcObject::Class(ClassSpec { parent: ROOT_HANDLE, handle: PASS_THROUGH_CLASS })
}

pub fn ingress_qdisc() -> TcObject {
    TcObject::Qdisc(QdiscSpec { parent: INGRESS_PARENT, handle: INGRESS_HANDLE, kind: QdiscKind::Ingress })
}

/// The complete tree implementing `faults` on one interface. Empty without faults.
pub fn build(faults: &BTreeMap<DisciplineKind, ActiveFault>) -> Result<Vec<TcObject>, KernelError> {
    if faults.is_empty() {
        return Ok(Vec::new());
    }

    let egress = rules(faults.iter().map(|(kind, fault)| (kind.bit(), &fault.scope)));
    let masks: BTreeSet<u8> = egress.iter().map(|rule| rule.mask).filter(|mask| *mask != 0).collect();

    let mut objects = vec![root_qdisc(), pass_through_class()];
    for mask in masks {
        objects.push(TcObject::Class(ClassSpec { parent: ROOT_HANDLE, handle: fault_class(mask) }));
        objects.extend(leaves(mask, faults));
    }
    objects.extend(classifiers(ROOT_HANDLE, &egress, |mask| match mask {
        0 => FilterTarget::Class(PASS_THROUGH_CLASS),
        mask => FilterTarget::Class(fault_class(mask)),
    })?);

    if let Some(blackhole) = faults.get(&DisciplineKind::Blackhole) {
        let reversed = CompiledScope {
            excludes: blackhole.scope.excludes.iter().map(|m| m.reversed()).collect(),
            includes: blackhole.scope.includes.iter().map(|m| m.reversed()).collect(),
        };
        let ingress = rules([(DisciplineKind::Blackhole.bit(), &reversed)]);
        objects.push(ingress_qdisc());
        objects.extend(classifiers(INGRESS_HANDLE, &ingress, |mask| match mask {
            0 => FilterTarget::Pass,
            _ => FilterTarget::Drop,
        })?);
    }

    Ok(objects)
}

/// Objects several faults, or someone else, may rely on. Created only when absent.
pub fn is_shared(object: &TcObject) -> bool {
    *object == root_qdisc() || *object == pass_through_class() || *object == ingress_qdisc()
}

/// Creation order: parents before children, classifiers last. Deletion runs in reverse.
pub fn rank(object: &TcObject) -> u8 {
    match object {
        TcObject::Qdisc(q) if q.parent == ROOT_PARENT || q.parent == INGRESS_PARENT => 0,
        TcObject::Class(_) => 1,
        TcObject::Qdisc(q) if q.parent >> 16 == ROOT_HANDLE >> 16 => 2,
        TcObject::Qdisc(_) => 3,
        TcObject::Filter(_) => 4,
    }
}

/// What the classifiers below `parent` do with a packet, in preference order.
pub fn classify(objects: &[TcObject], parent: u32, packet: &PacketHeader) -> Option<FilterTarget> {
    objects
        .iter()
        .filter_map(|object| match object {
            TcObject::Filter(f) if f.parent == parent && f.matcher.matches(packet) => Some(f),
            _ => None,
        })
        .min_by_key(|f| f.priority)
        .map(|f| f.target)
}

/// The qdiscs an outgoing packet passes through below the root, outermost first.
pub fn egress_path(objects: &[TcObject], packet: &PacketHeader) -> Vec<QdiscKind> {
    let class = match classify(objects, ROOT_HANDLE, packet) {
        Some(FilterTarget::Class(class)) => class,
        _ => PASS_THROUGH_CLASS,
    };

    let mut path = Vec::new();
    let mut parent = class;
    while let Some(q) = objects.iter().find_map(|object| match object {
        TcObject::Qdisc(q) if q.parent == parent => Some(q),
        _ => None,
    }) {
        path.push(q.kind);
        parent = q.handle | 1;
    }
    path
}
