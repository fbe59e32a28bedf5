//! Which faults are active where.
//!
//! The [`ActiveFaultRegistry`] decides admission: a blackhole tolerates nothing else on an
//! interface, every other kind tolerates other kinds but not a second instance of itself. It also
//! tracks the objects installed on each interface, and hands out the per-interface lock
//! serializing all kernel work on that interface.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use netfault_tc::tc::object::{TcObject, TcObjectId};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;

use crate::discipline::DisciplineKind;
use crate::error::{Error, Result};
use crate::runtime::ContainerId;
use crate::tree::ActiveFault;

/// A network interface of a container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FaultKey {
    pub container: ContainerId,
    pub interface: String,
}

impl FaultKey {
    pub fn new(container: ContainerId, interface: impl Into<String>) -> Self {
        Self { container, interface: interface.into() }
    }
}

impl fmt::Display for FaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.interface)
    }
}

#[derive(Debug, Default)]
struct Entry {
    /// Admitted kinds, with their fault once applied.
    faults: BTreeMap<DisciplineKind, Option<ActiveFault>>,
    /// The objects netfault created on the interface and has not deleted yet.
    installed: Vec<TcObject>,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Entry {
    /// The active kind preventing `kind` from being admitted, if any.
    fn conflict(&self, kind: DisciplineKind) -> Option<DisciplineKind> {
        self.faults.keys().copied().find(|active| {
            *active == kind || active.is_exclusive() || kind.is_exclusive()
        })
    }

    fn is_idle(&self) -> bool {
        self.faults.is_empty() && self.installed.is_empty()
    }
}

/// A snapshot of the faults active on one interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub key: FaultKey,
    pub kinds: Vec<DisciplineKind>,
    /// Identities of the objects installed for them, in creation order.
    pub objects: Vec<TcObjectId>,
}

/// Process-wide record of the active faults, keyed by container interface.
#[derive(Debug, Default)]
pub struct ActiveFaultRegistry {
    entries: Mutex<FxHashMap<FaultKey, Entry>>,
}

impl ActiveFaultRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically register `kind` on every key, or on none of them.
    ///
    /// Fails with [`Error::ConflictingFault`] naming the first colliding key.
    pub fn admit(&self, keys: &[FaultKey], kind: DisciplineKind) -> Result<()> {
        let mut entries = self.entries.lock();

        for key in keys {
            if let Some(active) = entries.get(key).and_then(|entry| entry.conflict(kind)) {
                tracing::info!(%key, %kind, %active, "fault rejected");
                return Err(Error::ConflictingFault { key: key.clone(), kind, active });
            }
        }

        for key in keys {
            entries.entry(key.clone()).or_default().faults.insert(kind, None);
        }
        tracing::debug!(keys = keys.len(), %kind, "fault admitted");
        Ok(())
    }

    /// Record an admitted fault as applied.
    pub fn record(&self, key: &FaultKey, fault: ActiveFault) {
        let kind = fault.discipline.kind();
        if let Some(slot) = self.entries.lock().get_mut(key).and_then(|entry| entry.faults.get_mut(&kind)) {
            *slot = Some(fault);
        }
    }

    /// Remove `kind` from a key. The entry disappears with its last fault and object.
    pub fn release(&self, key: &FaultKey, kind: DisciplineKind) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.faults.remove(&kind);
            if entry.is_idle() {
                entries.remove(key);
            }
        }
    }

    /// The applied faults of a key, without those only admitted.
    pub fn applied(&self, key: &FaultKey) -> BTreeMap<DisciplineKind, ActiveFault> {
        self.entries
            .lock()
            .get(key)
            .map(|entry| {
                entry
                    .faults
                    .iter()
                    .filter_map(|(kind, fault)| Some((*kind, fault.clone()?)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The objects installed on a key, in creation order.
    pub fn installed(&self, key: &FaultKey) -> Vec<TcObject> {
        self.entries.lock().get(key).map(|entry| entry.installed.clone()).unwrap_or_default()
    }

    /// Record an object as installed. Called before it is created.
    pub fn install(&self, key: &FaultKey, object: TcObject) {
        self.entries.lock().entry(key.clone()).or_default().installed.push(object);
    }

    /// Forget an installed object.
    pub fn uninstall(&self, key: &FaultKey, object: &TcObject) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            if let Some(index) = entry.installed.iter().rposition(|installed| installed == object) {
                entry.installed.remove(index);
            }
        }
    }

    /// Forget every object installed on a key, as when its interface disappeared.
    pub fn clear_installed(&self, key: &FaultKey) {
        if let Some(entry) = self.entries.lock().get_mut(key) {
            entry.installed.clear();
        }
    }

    /// Whether this process has faults or objects on a key.
    pub fn tracks(&self, key: &FaultKey) -> bool {
        self.entries.lock().get(key).is_some_and(|entry| !entry.is_idle())
    }

    /// Acquire the exclusive section of a key. Kernel work on the interface happens under it.
    pub async fn lock(&self, key: &FaultKey) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(&self.entries.lock().entry(key.clone()).or_default().lock);
        lock.lock_owned().await
    }

    /// The kinds active on a container interface.
    pub fn active(&self, container: &ContainerId, interface: &str) -> Vec<DisciplineKind> {
        let key = FaultKey::new(container.clone(), interface);
        self.entries
            .lock()
            .get(&key)
            .map(|entry| entry.faults.keys().copied().collect())
            .unwrap_or_default()
    }

    /// All keys with an active fault or an installed object, sorted by key.
    pub fn entries(&self) -> Vec<RegistryEntry> {
        let mut entries: Vec<_> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, entry)| !entry.is_idle())
            .map(|(key, entry)| RegistryEntry {
                key: key.clone(),
                kinds: entry.faults.keys().copied().collect(),
                objects: entry.installed.iter().map(TcObject::id).collect(),
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discipline::Discipline;
    use crate::discipline::DisciplineKind::*;
    use crate::scope::CompiledScope;
    use crate::tree;

    fn key(interface: &str) -> FaultKey {
        FaultKey::new(ContainerId::new("c1"), interface)
    }

    #[test]
    fn blackhole_is_exclusive() {
        let registry = ActiveFaultRegistry::new();
        registry.admit(&[key("eth0")], Blackhole).unwrap();

        for kind in [Corrupt, Delay, Blackhole] {
            let err = registry.admit(&[key("eth0")], kind).unwrap_err();
            assert!(
                matches!(&err, Error::ConflictingFault { key: k, kind: rejected, active: Blackhole }
                    if *k == key("eth0") && *rejected == kind),
                "{err}"
            );
        }

        // And the other way around.
        registry.admit(&[key("eth1")], Loss).unwrap();
        assert!(registry.admit(&[key("eth1")], Blackhole).is_err());
    }

    #[test]
    fn one_instance_per_kind() {
        let registry = ActiveFaultRegistry::new();
        registry.admit(&[key("eth0")], Delay).unwrap();
        registry.admit(&[key("eth0")], Loss).unwrap();
        assert_eq!(registry.active(&ContainerId::new("c1"), "eth0"), vec![Delay, Loss]);

        let err = registry.admit(&[key("eth0")], Delay).unwrap_err();
        assert!(matches!(err, Error::ConflictingFault { active: Delay, .. }));
    }

    #[test]
    fn admission_is_all_or_nothing() {
        let registry = ActiveFaultRegistry::new();
        registry.admit(&[key("eth1")], Corrupt).unwrap();

        assert!(registry.admit(&[key("eth0"), key("eth1")], Corrupt).is_err());
        assert!(registry.active(&ContainerId::new("c1"), "eth0").is_empty());
        assert_eq!(registry.entries().len(), 1);
    }

    #[test]
    fn release_removes_empty_entries() {
        let registry = ActiveFaultRegistry::new();
        registry.admit(&[key("eth0")], Delay).unwrap();
        registry.admit(&[key("eth0")], Loss).unwrap();
        registry.record(&key("eth0"), ActiveFault::new(Discipline::Loss { percentage: 5 }, CompiledScope::default()));
        assert_eq!(registry.applied(&key("eth0")).keys().copied().collect::<Vec<_>>(), vec![Loss]);

        registry.release(&key("eth0"), Delay);
        let entries = registry.entries();
        assert_eq!(entries[0].kinds, vec![Loss]);

        registry.release(&key("eth0"), Loss);
        assert!(registry.is_empty());
        // Releasing twice is harmless.
        registry.release(&key("eth0"), Loss);
    }

    #[test]
    fn installed_objects_outlive_their_faults() {
        let registry = ActiveFaultRegistry::new();
        registry.admit(&[key("eth0")], Delay).unwrap();
        registry.install(&key("eth0"), tree::root_qdisc());
        registry.install(&key("eth0"), tree::pass_through_class());

        // Until they are deleted, the key is still tracked.
        registry.release(&key("eth0"), Delay);
        assert!(registry.tracks(&key("eth0")));
        let entries = registry.entries();
        assert!(entries[0].kinds.is_empty());
        assert_eq!(entries[0].objects, vec![tree::root_qdisc().id(), tree::pass_through_class().id()]);

        registry.uninstall(&key("eth0"), &tree::pass_through_class());
        assert_eq!(registry.installed(&key("eth0")), vec![tree::root_qdisc()]);
        registry.clear_installed(&key("eth0"));
        assert!(!registry.tracks(&key("eth0")));
        assert!(registry.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_admission_admits_exactly_one() {
        let registry = Arc::new(ActiveFaultRegistry::new());

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.admit(&[key("eth0")], Corrupt).is_ok() })
            })
            .collect();

        let mut admitted = 0;
        for task in tasks {
            admitted += task.await.unwrap() as usize;
        }
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn key_lock_serializes() {
        let registry = ActiveFaultRegistry::new();
        let guard = registry.lock(&key("eth0")).await;

        let lock = registry.entries.lock().get(&key("eth0")).map(|e| Arc::clone(&e.lock)).unwrap();
        assert!(lock.try_lock().is_err());
        drop(guard);
        assert!(lock.try_lock().is_ok());

        // A lock alone is no active fault.
        assert!(registry.is_empty());
    }
}
