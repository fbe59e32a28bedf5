//! Applies faults to container interfaces and reverts them.
//!
//! The faults active on an interface share one tree, built by [`tree::build`]: an HTB root `1:0`
//! whose default class `1:1` passes traffic through untouched, a class per combination of faults
//! with a leaf implementing all of them, flower classifiers on the root routing each packet to the
//! combination of faults whose scopes select it, and for blackholes, drop classifiers on the
//! ingress qdisc.
//!
//! Applying or reverting a fault rebuilds the desired tree of the interface and converges the
//! installed objects towards it: stale objects are deleted, missing ones created. The registry
//! records every object before it is created and forgets it once deleted, so reverting removes
//! exactly what netfault installed. The root, the pass-through class and the ingress qdisc are
//! only created when absent, and the root is removed by the revert that leaves it idle.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use netfault_tc::tc::handle::display;
use netfault_tc::tc::object::{TcObject, TcObjectId};
use netfault_tc::tc::snapshot::RootState;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::Instrument as _;

use crate::config::EngineOptions;
use crate::discipline::DisciplineKind;
use crate::error::{Error, KernelError, Result};
use crate::interfaces;
use crate::registry::{ActiveFaultRegistry, FaultKey};
use crate::runtime::{ContainerId, ContainerRuntime, NamespaceHandle, NamespaceSession};
use crate::spec::{ContainerTarget, FaultSpec};
use crate::tree::{self, ActiveFault};

/// The objects one apply created on one interface, in creation order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedInterface {
    pub interface: String,
    pub objects: Vec<TcObjectId>,
}

/// Everything needed to revert an applied fault, independent of the process that applied it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedHandle {
    pub container: ContainerId,
    pub namespace: NamespaceHandle,
    pub kind: DisciplineKind,
    pub interfaces: Vec<AppliedInterface>,
}

impl AppliedHandle {
    pub fn keys(&self) -> Vec<FaultKey> {
        self.interfaces
            .iter()
            .map(|applied| FaultKey::new(self.container.clone(), applied.interface.as_str()))
            .collect()
    }

    /// Number of kernel objects recorded.
    pub fn len(&self) -> usize {
        self.interfaces.iter().map(|applied| applied.objects.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Applies and reverts faults.
#[derive(Debug)]
pub struct Engine<R> {
    runtime: Arc<R>,
    registry: Arc<ActiveFaultRegistry>,
    options: EngineOptions,
}

impl<R> Clone for Engine<R> {
    fn clone(&self) -> Self {
        Self {
            runtime: Arc::clone(&self.runtime),
            registry: Arc::clone(&self.registry),
            options: self.options.clone(),
        }
    }
}

impl<R: ContainerRuntime> Engine<R> {
    /// Create an engine with default options. Engines sharing a registry share admission.
    pub fn new(runtime: R, registry: Arc<ActiveFaultRegistry>) -> Self {
        Self::with_options(runtime, registry, EngineOptions::default())
    }

    pub fn with_options(runtime: R, registry: Arc<ActiveFaultRegistry>, options: EngineOptions) -> Self {
        Self { runtime: Arc::new(runtime), registry, options }
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn registry(&self) -> &ActiveFaultRegistry {
        &self.registry
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// The interfaces of the target's namespace. `include_loopback` overrides the engine default.
    pub async fn interfaces(
        &self,
        target: &ContainerTarget,
        include_loopback: Option<bool>,
    ) -> Result<Vec<String>> {
        let include_loopback = include_loopback.unwrap_or(self.options.include_loopback);
        interfaces::enumerate(self.runtime.as_ref(), target, include_loopback, self.options.deadline)
            .await
    }

    /// Admit a fault and build its tc trees.
    ///
    /// If any step fails, whatever this call created is reverted before the error is returned.
    /// If the returned future is dropped before completion, the revert runs in the background.
    pub async fn apply(&self, spec: &FaultSpec) -> Result<AppliedHandle> {
        let kind = spec.discipline.kind();
        spec.discipline.validate()?;
        let fault = ActiveFault::new(spec.discipline, spec.scope.compile(self.options.max_classifiers)?);
        if spec.interfaces.is_empty() {
            return Err(Error::NoInterfaces(spec.target.id().to_string()));
        }

        let namespace = timeout(self.options.deadline, spec.target.namespace(self.runtime.as_ref()))
            .await
            .map_err(|_| self.runtime_timeout())??
            .clone();

        let keys = spec.keys();
        self.registry.admit(&keys, kind)?;

        let mut partial = PartialApply {
            engine: self.clone(),
            handle: AppliedHandle {
                container: spec.target.id().clone(),
                namespace,
                kind,
                interfaces: keys
                    .iter()
                    .map(|key| AppliedInterface { interface: key.interface.clone(), objects: Vec::new() })
                    .collect(),
            },
            armed: true,
        };

        let session = match timeout(self.options.deadline, self.runtime.enter(&partial.handle.namespace)).await {
            Ok(Ok(session)) => session,
            failed => {
                // Nothing was created yet.
                let handle = partial.disarm();
                for key in handle.keys() {
                    self.registry.release(&key, kind);
                }
                return Err(match failed {
                    Ok(Err(e)) => e.into(),
                    _ => self.runtime_timeout(),
                });
            }
        };

        for (index, key) in keys.iter().enumerate() {
            let span = tracing::debug_span!("apply", container = %key.container, interface = %key.interface, %kind);

            let result = async {
                let _guard = self.registry.lock(key).await;
                let before = self.registry.installed(key);

                let mut faults = self.registry.applied(key);
                faults.insert(kind, fault.clone());
                self.reconcile(session.as_ref(), key, &faults).await?;
                self.registry.record(key, fault.clone());

                Ok::<_, KernelError>(
                    self.registry
                        .installed(key)
                        .iter()
                        .filter(|object| !before.contains(object))
                        .map(TcObject::id)
                        .collect(),
                )
            }
            .instrument(span)
            .await;

            match result {
                Ok(created) => partial.handle.interfaces[index].objects = created,
                Err(source) => {
                    let handle = partial.disarm();
                    tracing::warn!(interface = %key.interface, %kind, error = %source, "apply failed, reverting");
                    let cleanup = match self.revert_in(Some(session.as_ref()), &handle).await {
                        Ok(()) => None,
                        Err(e) => {
                            // The caller never sees this handle, so the kind must not stay admitted.
                            tracing::error!(error = %e, "failed to revert partially applied fault, fault state may have leaked");
                            for key in handle.keys() {
                                self.registry.release(&key, kind);
                            }
                            Some(Box::new(e))
                        }
                    };
                    return Err(Error::Apply { interface: key.interface.clone(), kind, source, cleanup });
                }
            }
        }

        let handle = partial.disarm();
        tracing::info!(
            container = %handle.container,
            discipline = %spec.discipline,
            interfaces = ?spec.interfaces,
            objects = handle.len(),
            "fault applied"
        );
        Ok(handle)
    }

    /// Converge the tree of an interface towards the one implementing `faults`.
    async fn reconcile(
        &self,
        session: &dyn NamespaceSession,
        key: &FaultKey,
        faults: &BTreeMap<DisciplineKind, ActiveFault>,
    ) -> std::result::Result<(), KernelError> {
        let interface = key.interface.as_str();
        let snapshot = self.bounded(session.snapshot(interface)).await?;
        let installed = self.registry.installed(key);

        if !faults.is_empty() {
            if let RootState::Foreign(root) = snapshot.root_state() {
                return Err(KernelError::ForeignRoot(format!("{} {}", root.kind, display(root.handle))));
            }
        }
        if faults.contains_key(&DisciplineKind::Blackhole) {
            if let Some(ingress) = snapshot.ingress().filter(|q| q.kind != "ingress") {
                return Err(KernelError::ForeignIngress(format!("{} {}", ingress.kind, display(ingress.handle))));
            }
        }

        let mut desired = tree::build(faults)?;
        // Shared objects someone else created are used as they are.
        desired.retain(|object| {
            !tree::is_shared(object) || installed.contains(object) || !snapshot.contains(&object.id())
        });

        let mut stale: Vec<_> = installed.iter().filter(|object| !desired.contains(object)).collect();
        stale.sort_by_key(|object| Reverse(tree::rank(object)));
        for object in stale {
            let id = object.id();
            match self.bounded(session.delete(interface, &id)).await {
                Ok(()) => tracing::trace!(%id, "deleted"),
                Err(e) if e.is_gone() => tracing::debug!(%id, "already gone"),
                Err(e) => return Err(e),
            }
            self.registry.uninstall(key, object);
        }

        let mut missing: Vec<_> = desired.iter().filter(|object| !installed.contains(object)).collect();
        missing.sort_by_key(|object| tree::rank(object));
        for object in missing {
            // Recorded first: a timed out create may still have reached the kernel.
            self.registry.install(key, *object);
            if let Err(e) = self.bounded(session.create(interface, object)).await {
                if e.is_exists() {
                    // Not ours to delete.
                    self.registry.uninstall(key, object);
                }
                return Err(e);
            }
            tracing::trace!(%object, "created");
        }
        Ok(())
    }

    /// Remove a fault, and the root if nothing else uses it anymore.
    ///
    /// A container or namespace that no longer exists counts as reverted. Interfaces that could
    /// not be reverted stay registered as active.
    pub async fn revert(&self, handle: &AppliedHandle) -> Result<()> {
        let session = match timeout(self.options.deadline, self.runtime.enter(&handle.namespace)).await {
            Ok(Ok(session)) => Some(session),
            Ok(Err(e)) if e.is_gone() => {
                tracing::info!(container = %handle.container, "namespace is gone, nothing to revert");
                None
            }
            failed => {
                let source = match failed {
                    Ok(Err(e)) => KernelError::Runtime(e),
                    _ => KernelError::Timeout(self.options.deadline),
                };
                let interface =
                    handle.interfaces.iter().map(|a| a.interface.as_str()).collect::<Vec<_>>().join(",");
                tracing::error!(container = %handle.container, %interface, error = %source, "cannot enter namespace to revert");
                return Err(Error::Revert { interface, kind: handle.kind, source });
            }
        };

        self.revert_in(session.as_deref(), handle).await
    }

    async fn revert_in(&self, session: Option<&dyn NamespaceSession>, handle: &AppliedHandle) -> Result<()> {
        let mut first_error = None;

        for (applied, key) in handle.interfaces.iter().zip(handle.keys()) {
            let span = tracing::debug_span!("revert", container = %key.container, interface = %key.interface, kind = %handle.kind);

            let result = async {
                let _guard = self.registry.lock(&key).await;
                match session {
                    Some(session) => self.revert_interface(session, &key, handle.kind, applied).await?,
                    None => self.registry.clear_installed(&key),
                }
                self.registry.release(&key, handle.kind);
                Ok::<_, KernelError>(())
            }
            .instrument(span)
            .await;

            if let Err(source) = result {
                tracing::error!(%key, kind = %handle.kind, error = %source, "failed to revert fault, fault state leaked");
                if first_error.is_none() {
                    first_error =
                        Some(Error::Revert { interface: applied.interface.clone(), kind: handle.kind, source });
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::info!(container = %handle.container, kind = %handle.kind, "fault reverted");
                Ok(())
            }
        }
    }

    async fn revert_interface(
        &self,
        session: &dyn NamespaceSession,
        key: &FaultKey,
        kind: DisciplineKind,
        applied: &AppliedInterface,
    ) -> std::result::Result<(), KernelError> {
        let interface = key.interface.as_str();

        let mut remaining = self.registry.applied(key);
        remaining.remove(&kind);

        if self.registry.tracks(key) {
            if remaining.is_empty() && self.registry.installed(key).is_empty() {
                tracing::debug!("nothing installed");
                return Ok(());
            }
            match self.reconcile(session, key, &remaining).await {
                Err(e) if e.is_gone() => {
                    tracing::debug!("interface is gone");
                    self.registry.clear_installed(key);
                    return Ok(());
                }
                result => result?,
            }
        } else {
            // Applied by another process: delete what the handle recorded.
            for id in applied.objects.iter().rev() {
                match self.bounded(session.delete(interface, id)).await {
                    Ok(()) => {}
                    Err(e) if e.is_gone() => tracing::debug!(%id, "already gone"),
                    Err(e) => return Err(e),
                }
            }
        }

        if !remaining.is_empty() {
            return Ok(());
        }

        let snapshot = match self.bounded(session.snapshot(interface)).await {
            Ok(snapshot) => snapshot,
            Err(e) if e.is_gone() => return Ok(()),
            Err(e) => return Err(e),
        };

        if snapshot.root_state() == RootState::Ours && snapshot.root_is_idle() {
            tracing::debug!("root is idle, removing it");
            match self.bounded(session.delete(interface, &tree::root_qdisc().id())).await {
                Err(e) if !e.is_gone() => return Err(e),
                _ => {}
            }
        }
        Ok(())
    }

    /// Run a kernel operation under the engine deadline.
    async fn bounded<T>(
        &self,
        operation: impl Future<Output = netfault_tc::Result<T>>,
    ) -> std::result::Result<T, KernelError> {
        match timeout(self.options.deadline, operation).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(KernelError::Timeout(self.options.deadline)),
        }
    }

    fn runtime_timeout(&self) -> Error {
        Error::RuntimeUnavailable(format!("timed out after {:?}", self.options.deadline))
    }
}

/// Reverts a fault whose apply was abandoned midway, when dropped while armed.
struct PartialApply<R: ContainerRuntime> {
    engine: Engine<R>,
    handle: AppliedHandle,
    armed: bool,
}

impl<R: ContainerRuntime> PartialApply<R> {
    fn disarm(&mut self) -> AppliedHandle {
        self.armed = false;
        self.handle.clone()
    }
}

impl<R: ContainerRuntime> Drop for PartialApply<R> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let engine = self.engine.clone();
        let handle = self.handle.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::warn!(container = %handle.container, kind = %handle.kind, "apply cancelled, reverting");
                runtime.spawn(async move {
                    if let Err(e) = engine.revert(&handle).await {
                        tracing::error!(error = %e, "failed to revert cancelled apply");
                    }
                });
            }
            Err(_) => {
                tracing::error!(container = %handle.container, kind = %handle.kind, "apply cancelled outside of a runtime, fault state leaked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;
    use std::time::Duration;

    use netfault_tc::tc::filter::{ETH_P_IP, IpProto, PacketHeader};
    use netfault_tc::tc::handle::{INGRESS_HANDLE, ROOT_HANDLE, fault_class, fault_leaf};
    use netfault_tc::tc::object::{ClassSpec, QdiscKind};
    use netfault_tc::tc::snapshot::TcSnapshot;

    use super::*;
    use crate::discipline::Discipline;
    use crate::runtime::fake::FakeRuntime;
    use crate::scope::{Endpoint, FaultScope};

    fn engine() -> (Engine<FakeRuntime>, FakeRuntime) {
        let runtime = FakeRuntime::new();
        runtime.add_container("c1", &["eth0", "eth1"]);
        let engine = Engine::new(runtime.clone(), Arc::new(ActiveFaultRegistry::new()));
        (engine, runtime)
    }

    fn spec(discipline: Discipline, interfaces: &[&str]) -> FaultSpec {
        FaultSpec {
            target: ContainerTarget::new("c1"),
            discipline,
            scope: FaultScope::default(),
            interfaces: interfaces.iter().map(|i| i.to_string()).collect(),
        }
    }

    fn endpoint(source: &str) -> Endpoint {
        Endpoint { source: source.into(), network: source.parse().unwrap(), port: None }
    }

    fn tree(runtime: &FakeRuntime, interface: &str) -> TcSnapshot {
        runtime.tree("c1", interface).unwrap()
    }

    fn to(destination: &str) -> PacketHeader {
        let destination: IpAddr = destination.parse().unwrap();
        PacketHeader::new(IpProto::Tcp, ("172.17.0.2".parse().unwrap(), 40000), (destination, 80))
    }

    #[tokio::test]
    async fn blackhole_tree_shape() {
        let _ = tracing_subscriber::fmt::try_init();
        let (engine, runtime) = engine();

        let mut spec = spec(Discipline::Blackhole, &["eth0"]);
        spec.scope.exclude.push(endpoint("10.0.0.5"));
        let handle = engine.apply(&spec).await.unwrap();

        // Root, pass-through, class, leaf, an exclusion and an inclusion per family, and the same
        // three classifiers on a new ingress qdisc.
        assert_eq!(handle.len(), 11);
        let tree = tree(&runtime, "eth0");
        assert_eq!(tree.root_state(), RootState::Ours);
        assert!(tree.has_pass_through());
        assert_eq!(tree.fault_masks(), vec![DisciplineKind::Blackhole.bit()]);
        assert!(tree.qdiscs.iter().any(|q| q.handle == fault_leaf(1) && q.kind == "pfifo"));

        let prefs: Vec<_> = tree.filters.iter().filter(|f| f.parent == ROOT_HANDLE).map(|f| f.priority).collect();
        assert_eq!(prefs, vec![1, 2, 3]);
        assert!(tree.contains(&TcObjectId::Filter { parent: ROOT_HANDLE, priority: 1, protocol: ETH_P_IP }));
        assert_eq!(tree.ingress_filters(), 3);

        // eth1 is untouched.
        assert_eq!(runtime.tree("c1", "eth1").unwrap().root_state(), RootState::Absent);
    }

    #[tokio::test]
    async fn blackhole_drops_incoming_traffic() {
        let (engine, runtime) = engine();
        let before = tree(&runtime, "eth0");

        let mut spec = spec(Discipline::Blackhole, &["eth0"]);
        spec.scope.include.push(endpoint("10.0.0.0/24"));
        spec.scope.exclude.push(endpoint("10.0.0.5"));
        let handle = engine.apply(&spec).await.unwrap();

        assert!(runtime.drops_ingress("c1", "eth0", &to("10.0.0.7").reply()));
        assert!(!runtime.drops_ingress("c1", "eth0", &to("10.0.0.5").reply()));
        assert!(!runtime.drops_ingress("c1", "eth0", &to("192.168.1.1").reply()));
        let ingress = handle.interfaces[0].objects.iter().filter(|id| {
            matches!(id, TcObjectId::Filter { parent, .. } if *parent == INGRESS_HANDLE)
        });
        assert_eq!(ingress.count(), 2);

        engine.revert(&handle).await.unwrap();
        assert_eq!(tree(&runtime, "eth0"), before);
        assert!(!runtime.drops_ingress("c1", "eth0", &to("10.0.0.7").reply()));
    }

    #[tokio::test]
    async fn existing_ingress_qdisc_is_shared() {
        let (engine, runtime) = engine();
        runtime.set_foreign_ingress("c1", "eth0", "ingress");
        let before = tree(&runtime, "eth0");

        let handle = engine.apply(&spec(Discipline::Blackhole, &["eth0"])).await.unwrap();
        assert!(!handle.interfaces[0].objects.contains(&tree::ingress_qdisc().id()));
        assert_eq!(tree(&runtime, "eth0").ingress_filters(), 2);

        engine.revert(&handle).await.unwrap();
        assert_eq!(tree(&runtime, "eth0"), before);

        runtime.add_container("c2", &["eth0"]);
        runtime.set_foreign_ingress("c2", "eth0", "clsact");
        let mut spec = spec(Discipline::Blackhole, &["eth0"]);
        spec.target = ContainerTarget::new("c2");
        let err = engine.apply(&spec).await.unwrap_err();
        assert!(matches!(err, Error::Apply { source: KernelError::ForeignIngress(_), .. }), "{err}");
    }

    #[tokio::test]
    async fn apply_then_revert_restores_the_tree() {
        let (engine, runtime) = engine();
        let before = tree(&runtime, "eth0");

        let discipline = Discipline::Delay { delay: Duration::from_millis(50), jitter: Duration::ZERO };
        let handle = engine.apply(&spec(discipline, &["eth0", "eth1"])).await.unwrap();
        assert_ne!(tree(&runtime, "eth0"), before);

        engine.revert(&handle).await.unwrap();
        assert_eq!(tree(&runtime, "eth0"), before);
        assert_eq!(tree(&runtime, "eth1"), before);
        assert!(engine.registry().is_empty());
    }

    #[tokio::test]
    async fn kinds_share_the_root() {
        let (engine, runtime) = engine();
        let before = tree(&runtime, "eth0");
        let (delay_bit, loss_bit) = (DisciplineKind::Delay.bit(), DisciplineKind::Loss.bit());

        let delay = engine
            .apply(&spec(Discipline::Delay { delay: Duration::from_millis(10), jitter: Duration::ZERO }, &["eth0"]))
            .await
            .unwrap();
        let loss = engine.apply(&spec(Discipline::Loss { percentage: 5 }, &["eth0"])).await.unwrap();
        // Both scopes cover everything, so every packet gets both.
        assert_eq!(tree(&runtime, "eth0").fault_masks(), vec![delay_bit | loss_bit]);

        let entries = engine.registry().entries();
        assert_eq!(entries[0].kinds, vec![DisciplineKind::Delay, DisciplineKind::Loss]);
        assert!(entries[0].objects.contains(&TcObjectId::Class { parent: ROOT_HANDLE, handle: fault_class(delay_bit | loss_bit) }));

        // The root stays while the loss fault uses it.
        engine.revert(&delay).await.unwrap();
        let during = tree(&runtime, "eth0");
        assert_eq!(during.root_state(), RootState::Ours);
        assert_eq!(during.fault_masks(), vec![loss_bit]);

        engine.revert(&loss).await.unwrap();
        assert_eq!(tree(&runtime, "eth0"), before);
        assert!(engine.registry().is_empty());
    }

    #[tokio::test]
    async fn overlapping_scopes_compose() {
        let (engine, runtime) = engine();

        let mut delay = spec(Discipline::Delay { delay: Duration::from_millis(100), jitter: Duration::ZERO }, &["eth0"]);
        delay.scope.include.push(endpoint("10.0.0.0/8"));
        let mut loss = spec(Discipline::Loss { percentage: 30 }, &["eth0"]);
        loss.scope.include.push(endpoint("10.1.0.0/16"));
        loss.scope.include.push(endpoint("192.168.0.0/16"));
        engine.apply(&delay).await.unwrap();
        let loss = engine.apply(&loss).await.unwrap();

        let netem = |destination| match runtime.egress_path("c1", "eth0", &to(destination))[..] {
            [QdiscKind::Netem(options)] => Some((options.latency_us, options.loss)),
            _ => None,
        };
        assert_eq!(netem("10.1.2.3"), Some((100_000, 30.0)));
        assert_eq!(netem("10.2.0.1"), Some((100_000, 0.0)));
        assert_eq!(netem("192.168.1.1"), Some((0, 30.0)));
        assert_eq!(netem("172.16.0.1"), None);

        engine.revert(&loss).await.unwrap();
        assert_eq!(netem("10.1.2.3"), Some((100_000, 0.0)));
        assert_eq!(netem("192.168.1.1"), None);
    }

    #[tokio::test]
    async fn foreign_root_is_left_alone() {
        let (engine, runtime) = engine();
        runtime.set_foreign_root("c1", "eth0", "fq_codel");
        let before = tree(&runtime, "eth0");

        let err = engine.apply(&spec(Discipline::Loss { percentage: 5 }, &["eth0"])).await.unwrap_err();
        assert!(matches!(err, Error::Apply { source: KernelError::ForeignRoot(_), cleanup: None, .. }), "{err}");
        assert_eq!(tree(&runtime, "eth0"), before);
        assert_eq!(runtime.mutations(), 0);
        assert!(engine.registry().is_empty());
    }

    #[tokio::test]
    async fn existing_objects_are_not_taken_over() {
        let (engine, runtime) = engine();
        let class = TcObject::Class(ClassSpec { parent: ROOT_HANDLE, handle: fault_class(DisciplineKind::Loss.bit()) });

        // Someone else already built a loss class.
        let namespace = runtime.resolve(&ContainerId::new("c1")).await.unwrap();
        let session = runtime.enter(&namespace).await.unwrap();
        for object in [tree::root_qdisc(), tree::pass_through_class(), class] {
            session.create("eth0", &object).await.unwrap();
        }
        let before = tree(&runtime, "eth0");

        let err = engine.apply(&spec(Discipline::Loss { percentage: 5 }, &["eth0"])).await.unwrap_err();
        assert!(matches!(&err, Error::Apply { source, cleanup: None, .. } if source.is_exists()), "{err}");

        // The failed apply deleted nothing it did not create.
        assert_eq!(tree(&runtime, "eth0"), before);
        assert!(tree(&runtime, "eth0").contains(&class.id()));
        assert!(engine.registry().is_empty());
    }

    #[tokio::test]
    async fn partial_failure_is_rolled_back() {
        let (engine, runtime) = engine();
        let before = tree(&runtime, "eth0");

        // eth0 takes root, pass-through, class, leaf and two filters. Fail on eth1's leaf.
        runtime.fail_nth_create(10);
        let err = engine
            .apply(&spec(Discipline::Corrupt { percentage: 10 }, &["eth0", "eth1"]))
            .await
            .unwrap_err();
        assert!(matches!(&err, Error::Apply { interface, cleanup: None, .. } if interface == "eth1"), "{err}");
        assert!(!err.is_leak());

        assert_eq!(tree(&runtime, "eth0"), before);
        assert_eq!(tree(&runtime, "eth1"), before);
        assert!(engine.registry().is_empty());
    }

    #[tokio::test]
    async fn failed_cleanup_is_reported() {
        let (engine, runtime) = engine();

        runtime.fail_nth_create(10);
        runtime.fail_nth_delete(1);
        let err = engine
            .apply(&spec(Discipline::Corrupt { percentage: 10 }, &["eth0", "eth1"]))
            .await
            .unwrap_err();
        let Error::Apply { interface, cleanup: Some(cleanup), .. } = &err else { panic!("{err}") };
        assert_eq!(interface, "eth1");
        assert!(matches!(**cleanup, Error::Revert { .. }), "{cleanup}");
        assert!(err.is_leak());

        // The kind is released, what could not be deleted stays tracked and goes with the next
        // revert on that interface.
        assert!(engine.registry().active(&ContainerId::new("c1"), "eth0").is_empty());
        assert!(!engine.registry().is_empty());

        let before = tree(&runtime, "eth1");
        let handle = engine.apply(&spec(Discipline::Loss { percentage: 1 }, &["eth0"])).await.unwrap();
        engine.revert(&handle).await.unwrap();
        assert_eq!(tree(&runtime, "eth0"), before);
        assert!(engine.registry().is_empty());
    }

    #[tokio::test]
    async fn revert_after_container_exit() {
        let (engine, runtime) = engine();
        let handle = engine.apply(&spec(Discipline::Blackhole, &["eth0"])).await.unwrap();

        runtime.remove_container("c1");
        engine.revert(&handle).await.unwrap();
        assert!(engine.registry().is_empty());
    }

    #[tokio::test]
    async fn revert_after_pid_reuse_touches_nothing() {
        let (engine, runtime) = engine();
        let handle = engine.apply(&spec(Discipline::Loss { percentage: 20 }, &["eth0"])).await.unwrap();

        // The container exits and its pid goes to a process with a fault of its own.
        runtime.recycle_pid("c1", "host", &["eth0"]);
        let mut other = spec(Discipline::Loss { percentage: 20 }, &["eth0"]);
        other.target = ContainerTarget::new("host");
        engine.apply(&other).await.unwrap();
        let before = runtime.tree("host", "eth0").unwrap();
        let mutations = runtime.mutations();

        engine.revert(&handle).await.unwrap();
        assert_eq!(runtime.tree("host", "eth0").unwrap(), before);
        assert_eq!(runtime.mutations(), mutations);
        assert_eq!(engine.registry().entries().len(), 1);
        assert_eq!(engine.registry().entries()[0].key.container, ContainerId::new("host"));
    }

    #[tokio::test]
    async fn revert_from_another_process() {
        let (engine, runtime) = engine();
        let before = tree(&runtime, "eth0");
        let handle = engine.apply(&spec(Discipline::Corrupt { percentage: 5 }, &["eth0"])).await.unwrap();

        // A fresh registry knows nothing, the handle is all there is.
        let handle: AppliedHandle = serde_json::from_str(&serde_json::to_string(&handle).unwrap()).unwrap();
        let restarted = Engine::new(runtime.clone(), Arc::new(ActiveFaultRegistry::new()));
        restarted.revert(&handle).await.unwrap();
        assert_eq!(tree(&runtime, "eth0"), before);
    }

    #[tokio::test]
    async fn unreachable_runtime_fails_revert_loudly() {
        let (engine, runtime) = engine();
        let handle = engine.apply(&spec(Discipline::Blackhole, &["eth0"])).await.unwrap();

        runtime.set_unavailable(true);
        let err = engine.revert(&handle).await.unwrap_err();
        assert!(matches!(err, Error::Revert { source: KernelError::Runtime(_), .. }), "{err}");
        // The fault is still there, and still registered.
        assert_eq!(engine.registry().active(&handle.container, "eth0"), vec![DisciplineKind::Blackhole]);

        runtime.set_unavailable(false);
        engine.revert(&handle).await.unwrap();
        assert!(engine.registry().is_empty());
    }

    #[tokio::test]
    async fn cancelled_apply_is_reverted() {
        let (engine, runtime) = engine();
        let before = tree(&runtime, "eth0");
        runtime.set_op_delay(Duration::from_millis(10));

        let task = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.apply(&spec(Discipline::Blackhole, &["eth0"])).await })
        };
        tokio::time::sleep(Duration::from_millis(45)).await;
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        for _ in 0..100 {
            if engine.registry().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(engine.registry().is_empty());
        assert_eq!(tree(&runtime, "eth0"), before);
    }

    #[tokio::test]
    async fn malformed_specs_do_not_touch_anything() {
        let (engine, runtime) = engine();

        let err = engine.apply(&spec(Discipline::Corrupt { percentage: 101 }, &["eth0"])).await.unwrap_err();
        assert!(err.is_user_error());

        let err = engine.apply(&spec(Discipline::Blackhole, &[])).await.unwrap_err();
        assert!(matches!(err, Error::NoInterfaces(_)));

        let mut missing = spec(Discipline::Blackhole, &["eth0"]);
        missing.target = ContainerTarget::new("c2");
        assert!(matches!(engine.apply(&missing).await.unwrap_err(), Error::ContainerNotFound(_)));

        assert_eq!(runtime.mutations(), 0);
        assert!(engine.registry().is_empty());
    }
}
