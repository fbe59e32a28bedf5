use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::discipline::Discipline;
use crate::registry::FaultKey;
use crate::runtime::{ContainerId, ContainerRuntime, NamespaceHandle, RuntimeError};
use crate::scope::FaultScope;

/// The container under test.
///
/// The namespace is resolved on first use and cached from then on. Clones share the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerTarget {
    id: ContainerId,
    #[serde(skip)]
    namespace: Arc<OnceCell<NamespaceHandle>>,
}

impl ContainerTarget {
    /// Target a container by raw identifier. Runtime schemes such as `docker://` are stripped.
    pub fn new(raw: &str) -> Self {
        Self { id: ContainerId::new(raw), namespace: Default::default() }
    }

    pub fn id(&self) -> &ContainerId {
        &self.id
    }

    /// The container's namespace, resolving it through `runtime` on first use.
    pub async fn namespace<R>(&self, runtime: &R) -> Result<&NamespaceHandle, RuntimeError>
    where
        R: ContainerRuntime + ?Sized,
    {
        self.namespace.get_or_try_init(|| runtime.resolve(&self.id)).await
    }

    /// The namespace, if already resolved.
    pub fn resolved(&self) -> Option<&NamespaceHandle> {
        self.namespace.get()
    }
}

impl PartialEq for ContainerTarget {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ContainerTarget {}

/// One fault on one container: what, where, and on which interfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultSpec {
    pub target: ContainerTarget,
    pub discipline: Discipline,
    pub scope: FaultScope,
    /// Interfaces to fault, fixed when the fault is prepared.
    pub interfaces: Vec<String>,
}

impl FaultSpec {
    /// The registry keys this fault occupies, one per distinct interface.
    pub fn keys(&self) -> Vec<FaultKey> {
        let mut keys: Vec<FaultKey> = Vec::with_capacity(self.interfaces.len());
        for interface in &self.interfaces {
            if !keys.iter().any(|key| key.interface == *interface) {
                keys.push(FaultKey::new(self.target.id().clone(), interface.as_str()));
            }
        }
        keys
    }
}
