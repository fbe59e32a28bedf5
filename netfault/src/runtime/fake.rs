//! An in-memory container runtime.
//!
//! [`FakeRuntime`] holds containers with interfaces and a tc tree per interface, and enforces the
//! kernel rules the engine depends on: objects are created exclusively, parents must exist, a
//! class cannot be deleted while a qdisc or a classifier still refers to it, deleting a qdisc takes
//! its children and classifiers with it, and deleting the root leaves the ingress side alone.
//! Failures can be injected to exercise cleanup paths.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use netfault_tc::Error as TcError;
use netfault_tc::namespace::NamespaceId;
use netfault_tc::session::Link;
use netfault_tc::tc::filter::{FilterTarget, PacketHeader};
use netfault_tc::tc::handle::{INGRESS_HANDLE, INGRESS_PARENT, ROOT_PARENT};
use netfault_tc::tc::object::{QdiscKind, TcObject, TcObjectId};
use netfault_tc::tc::snapshot::{QdiscEntry, TcSnapshot};
use nix::errno::Errno;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::{ContainerId, ContainerRuntime, NamespaceHandle, NamespaceSession, RuntimeError};
use crate::tree;

/// Kind of the root qdisc of a fresh interface.
const DEFAULT_ROOT_KIND: &str = "noqueue";

/// Device number of the fake nsfs.
const NSFS_DEV: u64 = 4;

/// The tc tree of one interface.
#[derive(Debug, Clone)]
struct Tree {
    snapshot: TcSnapshot,
    /// Everything created, with parameters.
    objects: Vec<TcObject>,
}

impl Tree {
    fn new() -> Self {
        let mut snapshot = TcSnapshot::default();
        snapshot.qdiscs.push(default_root(DEFAULT_ROOT_KIND));
        Self { snapshot, objects: Vec::new() }
    }

    fn qdisc_exists(&self, handle: u32) -> bool {
        self.snapshot.qdiscs.iter().any(|q| q.handle == handle && handle != 0)
    }

    fn class_exists(&self, handle: u32) -> bool {
        self.snapshot.classes.iter().any(|c| c.handle == handle)
    }

    /// Whether `parent` is the single child slot of a classful netem.
    fn netem_slot(&self, parent: u32) -> bool {
        parent & 0xFFFF == 1 &&
            self.objects.iter().any(|object| {
                matches!(object, TcObject::Qdisc(q) if q.handle == parent & 0xFFFF_0000 && matches!(q.kind, QdiscKind::Netem(_)))
            })
    }

    fn create(&mut self, object: &TcObject) -> netfault_tc::Result<()> {
        match object {
            TcObject::Qdisc(q) if q.parent == ROOT_PARENT => {
                let root = self.snapshot.qdiscs.iter().position(|q| q.parent == ROOT_PARENT);
                match root {
                    // Default qdiscs are replaced silently.
                    Some(i) if self.snapshot.qdiscs[i].handle == 0 => {
                        self.snapshot.qdiscs.remove(i);
                    }
                    Some(_) => return Err(Errno::EEXIST.into()),
                    None => {}
                }
            }
            TcObject::Qdisc(q) if q.parent == INGRESS_PARENT => {
                if self.snapshot.ingress().is_some() {
                    return Err(Errno::EEXIST.into());
                }
                if q.handle != INGRESS_HANDLE {
                    return Err(Errno::EINVAL.into());
                }
            }
            TcObject::Qdisc(q) => {
                if !self.class_exists(q.parent) && !self.netem_slot(q.parent) {
                    return Err(Errno::ENOENT.into());
                }
                if self.qdisc_exists(q.handle) || self.snapshot.qdiscs.iter().any(|e| e.parent == q.parent) {
                    return Err(Errno::EEXIST.into());
                }
            }
            TcObject::Class(c) => {
                if !self.qdisc_exists(c.parent) {
                    return Err(Errno::ENOENT.into());
                }
                if self.class_exists(c.handle) {
                    return Err(Errno::EEXIST.into());
                }
            }
            TcObject::Filter(f) => {
                if !self.qdisc_exists(f.parent) {
                    return Err(Errno::ENOENT.into());
                }
                if self.snapshot.contains(&object.id()) {
                    return Err(Errno::EEXIST.into());
                }
            }
        }
        self.snapshot.insert(object);
        self.objects.push(*object);
        Ok(())
    }

    fn delete(&mut self, id: &TcObjectId) -> netfault_tc::Result<()> {
        if !self.snapshot.contains(id) {
            return Err(Errno::ENOENT.into());
        }

        match *id {
            TcObjectId::Qdisc { parent: ROOT_PARENT, handle } => {
                if handle == 0 {
                    return Err(Errno::ENOENT.into());
                }
                // The ingress side hangs off the device, not the root.
                let ingress = |parent: u32| parent == INGRESS_PARENT || parent == INGRESS_HANDLE;
                let mut fresh = Self::new();
                fresh.snapshot.qdiscs.extend(self.snapshot.qdiscs.iter().filter(|q| ingress(q.parent)).cloned());
                fresh.snapshot.filters.extend(self.snapshot.filters.iter().filter(|f| ingress(f.parent)).cloned());
                fresh.snapshot.normalize();
                fresh.objects = self.objects.iter().filter(|o| ingress(parent_of(o))).copied().collect();
                *self = fresh;
                return Ok(());
            }
            TcObjectId::Class { handle, .. } => {
                let referenced = self.snapshot.qdiscs.iter().any(|q| q.parent == handle) ||
                    self.objects.iter().any(|object| {
                        matches!(object, TcObject::Filter(f) if f.target == FilterTarget::Class(handle))
                    });
                if referenced {
                    return Err(Errno::EBUSY.into());
                }
            }
            TcObjectId::Qdisc { handle, .. } => {
                // Children and classifiers go with their qdisc.
                let owned = |parent: u32| parent == handle || parent & 0xFFFF_0000 == handle;
                let children: Vec<_> = self.objects.iter().filter(|o| owned(parent_of(o))).map(TcObject::id).collect();
                for child in children {
                    self.remove(&child);
                }
            }
            TcObjectId::Filter { .. } => {}
        }

        self.remove(id);
        Ok(())
    }

    fn remove(&mut self, id: &TcObjectId) {
        self.snapshot.remove(id);
        self.objects.retain(|object| object.id() != *id);
    }
}

fn parent_of(object: &TcObject) -> u32 {
    match object {
        TcObject::Qdisc(q) => q.parent,
        TcObject::Class(c) => c.parent,
        TcObject::Filter(f) => f.parent,
    }
}

fn default_root(kind: &str) -> QdiscEntry {
    QdiscEntry { parent: ROOT_PARENT, handle: 0, kind: kind.to_string() }
}

#[derive(Debug)]
struct Container {
    id: ContainerId,
    pid: u32,
    namespace: NamespaceId,
    links: Vec<Link>,
    trees: FxHashMap<String, Tree>,
}

#[derive(Debug, Default)]
struct State {
    containers: Vec<Container>,
    next_pid: u32,
    next_namespace: u64,
    unavailable: bool,
    /// Remaining creates until an injected failure.
    fail_create_in: Option<usize>,
    /// Remaining deletes until an injected failure.
    fail_delete_in: Option<usize>,
    op_delay: Duration,
    resolves: usize,
    mutations: usize,
}

impl State {
    fn container(&mut self, pid: u32) -> netfault_tc::Result<&mut Container> {
        self.containers
            .iter_mut()
            .find(|c| c.pid == pid)
            .ok_or_else(|| TcError::NamespaceGone(namespace_path(pid)))
    }

    fn tree(&mut self, pid: u32, interface: &str) -> netfault_tc::Result<&mut Tree> {
        self.container(pid)?
            .trees
            .get_mut(interface)
            .ok_or_else(|| TcError::InterfaceNotFound(interface.to_string()))
    }

    fn tree_of(&mut self, id: &str, interface: &str) -> Option<&mut Tree> {
        let id = ContainerId::new(id);
        self.containers.iter_mut().find(|c| c.id == id)?.trees.get_mut(interface)
    }

    fn push_container(&mut self, id: &str, pid: u32, interfaces: &[&str]) {
        self.next_namespace += 1;
        let namespace = NamespaceId { dev: NSFS_DEV, ino: 0xF000_0000 + self.next_namespace };

        let names = std::iter::once("lo").chain(interfaces.iter().copied());
        let links: Vec<_> = names
            .enumerate()
            .map(|(i, name)| Link {
                index: i as u32 + 1,
                name: name.to_string(),
                loopback: name == "lo",
                up: true,
            })
            .collect();
        let trees = links.iter().map(|link| (link.name.clone(), Tree::new())).collect();

        self.containers.push(Container { id: ContainerId::new(id), pid, namespace, links, trees });
    }

    /// Count down an injected failure, returning whether it fires now.
    fn injected(remaining: &mut Option<usize>) -> bool {
        match remaining.as_mut() {
            Some(n) => {
                *n = n.saturating_sub(1);
                if *n == 0 {
                    *remaining = None;
                    return true;
                }
                false
            }
            None => false,
        }
    }
}

fn namespace_path(pid: u32) -> PathBuf {
    PathBuf::from(format!("/fake/{pid}/ns/net"))
}

/// An in-memory [`ContainerRuntime`]. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct FakeRuntime {
    state: Arc<Mutex<State>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a running container with a loopback interface and the given interfaces.
    pub fn add_container(&self, id: &str, interfaces: &[&str]) -> &Self {
        let mut state = self.state.lock();
        state.next_pid += 1;
        let pid = 1000 + state.next_pid;
        state.push_container(id, pid, interfaces);
        self
    }

    /// Let a container exit. Its namespace disappears with it.
    pub fn remove_container(&self, id: &str) {
        let id = ContainerId::new(id);
        self.state.lock().containers.retain(|c| c.id != id);
    }

    /// Let a container exit and hand its pid to a new container `successor`, which lives in a
    /// namespace of its own.
    pub fn recycle_pid(&self, id: &str, successor: &str, interfaces: &[&str]) {
        let id = ContainerId::new(id);
        let mut state = self.state.lock();
        let Some(index) = state.containers.iter().position(|c| c.id == id) else { return };
        let pid = state.containers.remove(index).pid;
        state.push_container(successor, pid, interfaces);
    }

    /// Make every runtime call fail as if the runtime could not be reached.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Fail the `n`-th object creation from now on, counting from 1.
    pub fn fail_nth_create(&self, n: usize) {
        self.state.lock().fail_create_in = Some(n);
    }

    /// Fail the `n`-th object deletion from now on, counting from 1.
    pub fn fail_nth_delete(&self, n: usize) {
        self.state.lock().fail_delete_in = Some(n);
    }

    /// Delay every kernel operation.
    pub fn set_op_delay(&self, delay: Duration) {
        self.state.lock().op_delay = delay;
    }

    /// Replace the default root qdisc of an interface with one netfault does not manage.
    pub fn set_foreign_root(&self, id: &str, interface: &str, kind: &str) {
        if let Some(installed) = self.state.lock().tree_of(id, interface) {
            let snapshot = &mut installed.snapshot;
            snapshot.qdiscs.retain(|q| q.parent != ROOT_PARENT);
            snapshot.qdiscs.push(QdiscEntry { parent: ROOT_PARENT, handle: 0x8001_0000, kind: kind.into() });
            snapshot.normalize();
        }
    }

    /// Install a qdisc netfault does not manage on the ingress side of an interface.
    pub fn set_foreign_ingress(&self, id: &str, interface: &str, kind: &str) {
        if let Some(installed) = self.state.lock().tree_of(id, interface) {
            let snapshot = &mut installed.snapshot;
            snapshot.qdiscs.push(QdiscEntry { parent: INGRESS_PARENT, handle: INGRESS_HANDLE, kind: kind.into() });
            snapshot.normalize();
        }
    }

    /// The tc tree of a container interface.
    pub fn tree(&self, id: &str, interface: &str) -> Option<TcSnapshot> {
        self.state.lock().tree_of(id, interface).map(|tree| tree.snapshot.clone())
    }

    /// The qdiscs an outgoing packet of a container interface passes through, outermost first.
    /// Empty when it is passed through untouched.
    pub fn egress_path(&self, id: &str, interface: &str, packet: &PacketHeader) -> Vec<QdiscKind> {
        self.state
            .lock()
            .tree_of(id, interface)
            .map(|installed| tree::egress_path(&installed.objects, packet))
            .unwrap_or_default()
    }

    /// Whether an incoming packet of a container interface is dropped.
    pub fn drops_ingress(&self, id: &str, interface: &str, packet: &PacketHeader) -> bool {
        self.state.lock().tree_of(id, interface).is_some_and(|installed| {
            tree::classify(&installed.objects, INGRESS_HANDLE, packet) == Some(FilterTarget::Drop)
        })
    }

    /// Number of successful creations and deletions so far.
    pub fn mutations(&self) -> usize {
        self.state.lock().mutations
    }

    /// Number of resolve calls so far.
    pub fn resolves(&self) -> usize {
        self.state.lock().resolves
    }

    async fn delay(&self) {
        let delay = self.state.lock().op_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn resolve(&self, id: &ContainerId) -> Result<NamespaceHandle, RuntimeError> {
        let mut state = self.state.lock();
        state.resolves += 1;
        if state.unavailable {
            return Err(RuntimeError::Unavailable("fake runtime is unreachable".into()));
        }
        let container = state
            .containers
            .iter()
            .find(|c| &c.id == id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        Ok(NamespaceHandle {
            pid: container.pid,
            path: namespace_path(container.pid),
            id: Some(container.namespace),
        })
    }

    async fn enter(
        &self,
        namespace: &NamespaceHandle,
    ) -> Result<Box<dyn NamespaceSession>, RuntimeError> {
        let state = self.state.lock();
        if state.unavailable {
            return Err(RuntimeError::Unavailable("fake runtime is unreachable".into()));
        }
        let container = state
            .containers
            .iter()
            .find(|c| c.pid == namespace.pid)
            .ok_or_else(|| RuntimeError::NamespaceGone(namespace.path.clone()))?;
        if namespace.id.is_some_and(|id| id != container.namespace) {
            tracing::debug!(pid = namespace.pid, "pid now belongs to another namespace");
            return Err(RuntimeError::NamespaceGone(namespace.path.clone()));
        }
        Ok(Box::new(FakeSession { runtime: self.clone(), pid: namespace.pid }))
    }
}

/// A session into a fake container's namespace.
#[derive(Debug)]
struct FakeSession {
    runtime: FakeRuntime,
    pid: u32,
}

#[async_trait]
impl NamespaceSession for FakeSession {
    async fn links(&self) -> netfault_tc::Result<Vec<Link>> {
        self.runtime.delay().await;
        let mut state = self.runtime.state.lock();
        Ok(state.container(self.pid)?.links.clone())
    }

    async fn snapshot(&self, interface: &str) -> netfault_tc::Result<TcSnapshot> {
        self.runtime.delay().await;
        let mut state = self.runtime.state.lock();
        Ok(state.tree(self.pid, interface)?.snapshot.clone())
    }

    async fn create(&self, interface: &str, object: &TcObject) -> netfault_tc::Result<()> {
        self.runtime.delay().await;
        let mut state = self.runtime.state.lock();

        if State::injected(&mut state.fail_create_in) {
            tracing::debug!(%interface, %object, "injected create failure");
            return Err(Errno::EIO.into());
        }

        state.tree(self.pid, interface)?.create(object)?;
        state.mutations += 1;
        Ok(())
    }

    async fn delete(&self, interface: &str, id: &TcObjectId) -> netfault_tc::Result<()> {
        self.runtime.delay().await;
        let mut state = self.runtime.state.lock();

        if State::injected(&mut state.fail_delete_in) {
            tracing::debug!(%interface, %id, "injected delete failure");
            return Err(Errno::EIO.into());
        }

        state.tree(self.pid, interface)?.delete(id)?;
        state.mutations += 1;
        Ok(())
    }
}
