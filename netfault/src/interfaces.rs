//! Enumerates the interfaces a fault applies to when the user names none.

use std::time::Duration;

use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::runtime::{ContainerRuntime, NamespaceSession};
use crate::spec::ContainerTarget;

/// The interface names of a namespace, loopback only if asked for.
pub async fn list(
    session: &dyn NamespaceSession,
    include_loopback: bool,
) -> netfault_tc::Result<Vec<String>> {
    let links = session.links().await?;
    Ok(links
        .into_iter()
        .filter(|link| include_loopback || !link.loopback)
        .map(|link| link.name)
        .collect())
}

/// Resolve the target and list its interfaces. Fails with [`Error::NoInterfaces`] when nothing
/// usable is left.
pub async fn enumerate<R>(
    runtime: &R,
    target: &ContainerTarget,
    include_loopback: bool,
    deadline: Duration,
) -> Result<Vec<String>>
where
    R: ContainerRuntime + ?Sized,
{
    let unavailable = || Error::RuntimeUnavailable(format!("timed out after {deadline:?}"));

    let namespace = timeout(deadline, target.namespace(runtime)).await.map_err(|_| unavailable())??;
    let session = timeout(deadline, runtime.enter(namespace)).await.map_err(|_| unavailable())??;

    let interfaces = match timeout(deadline, list(session.as_ref(), include_loopback)).await {
        Ok(Ok(interfaces)) => interfaces,
        Ok(Err(e)) if e.is_not_found() => return Err(Error::ContainerNotFound(target.id().to_string())),
        Ok(Err(e)) => return Err(Error::RuntimeUnavailable(e.to_string())),
        Err(_) => return Err(unavailable()),
    };

    if interfaces.is_empty() {
        return Err(Error::NoInterfaces(target.id().to_string()));
    }
    tracing::debug!(container = %target.id(), ?interfaces, "enumerated interfaces");
    Ok(interfaces)
}
