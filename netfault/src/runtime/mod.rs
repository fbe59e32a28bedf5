//! The container runtime capability: resolve a container to its network namespace and operate
//! inside that namespace.
//!
//! [`runc::RuncRuntime`] is the production implementation. [`fake::FakeRuntime`] keeps the tc
//! trees in memory, for tests.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use netfault_tc::namespace::NamespaceId;
use netfault_tc::session::{Link, TcSession};
use netfault_tc::tc::object::{TcObject, TcObjectId};
use netfault_tc::tc::snapshot::TcSnapshot;
use serde::{Deserialize, Serialize};

pub mod fake;
pub mod runc;

/// Failure to resolve or enter a container.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    /// The runtime does not know the container, or it is not running.
    #[error("container {0} not found")]
    NotFound(String),
    /// The runtime could not be queried.
    #[error("runtime unavailable: {0}")]
    Unavailable(String),
    /// The container's namespace disappeared between resolution and entry.
    #[error("network namespace {} is gone", .0.display())]
    NamespaceGone(PathBuf),
}

impl RuntimeError {
    /// Whether the container, and with it its namespace, no longer exists.
    pub const fn is_gone(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::NamespaceGone(_))
    }
}

/// A container identifier without runtime scheme.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    /// Normalize a raw identifier by stripping any `<scheme>://` prefix, as in
    /// `docker://3f4e...` or `containerd://3f4e...`.
    pub fn new(raw: &str) -> Self {
        let raw = raw.trim();
        let id = raw.split_once("://").map_or(raw, |(_, id)| id);
        Self(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContainerId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// Where a container's network namespace lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NamespaceHandle {
    /// The container's init process.
    pub pid: u32,
    /// The namespace file, `/proc/<pid>/ns/net`.
    pub path: PathBuf,
    /// Identity of the namespace when it was resolved. Entering fails with
    /// [`RuntimeError::NamespaceGone`] if `path` has come to name another namespace since.
    #[serde(default)]
    pub id: Option<NamespaceId>,
}

/// Resolves containers and enters their network namespace.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Locate the network namespace of a container. Has no side effects.
    async fn resolve(&self, id: &ContainerId) -> Result<NamespaceHandle, RuntimeError>;

    /// Enter a namespace to inspect and modify its interfaces and tc trees.
    async fn enter(
        &self,
        namespace: &NamespaceHandle,
    ) -> Result<Box<dyn NamespaceSession>, RuntimeError>;
}

/// Operations inside one network namespace.
#[async_trait]
pub trait NamespaceSession: Send + Sync {
    /// The interfaces of the namespace.
    async fn links(&self) -> netfault_tc::Result<Vec<Link>>;

    /// The tc tree of an interface.
    async fn snapshot(&self, interface: &str) -> netfault_tc::Result<TcSnapshot>;

    /// Create one tc object. Fails if it already exists.
    async fn create(&self, interface: &str, object: &TcObject) -> netfault_tc::Result<()>;

    /// Delete one tc object.
    async fn delete(&self, interface: &str, id: &TcObjectId) -> netfault_tc::Result<()>;
}

#[async_trait]
impl NamespaceSession for TcSession {
    async fn links(&self) -> netfault_tc::Result<Vec<Link>> {
        TcSession::links(self).await
    }

    async fn snapshot(&self, interface: &str) -> netfault_tc::Result<TcSnapshot> {
        TcSession::snapshot(self, interface).await
    }

    async fn create(&self, interface: &str, object: &TcObject) -> netfault_tc::Result<()> {
        TcSession::create(self, interface, object).await
    }

    async fn delete(&self, interface: &str, id: &TcObjectId) -> netfault_tc::Result<()> {
        TcSession::delete(self, interface, id).await
    }
}
