//! Container resolution through `runc`.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use netfault_tc::namespace::NamespaceId;
use netfault_tc::session::TcSession;
use serde::Deserialize;
use tokio::process::Command;

use super::{ContainerId, ContainerRuntime, NamespaceHandle, NamespaceSession, RuntimeError};

/// Default state root of the runc instance used by Docker.
pub const DEFAULT_RUNC_ROOT: &str = "/run/docker/runtime-runc/moby";

#[derive(Debug, Clone)]
pub struct RuncOptions {
    /// The `runc` binary.
    binary: PathBuf,
    /// The runc state directory, `--root`.
    root: PathBuf,
    /// Mount point of the host procfs.
    proc_root: PathBuf,
}

impl Default for RuncOptions {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("runc"),
            root: PathBuf::from(DEFAULT_RUNC_ROOT),
            proc_root: PathBuf::from("/proc"),
        }
    }
}

impl RuncOptions {
    /// Sets the path of the `runc` binary.
    pub fn binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Sets the runc state root, e.g. `/run/containerd/runc/k8s.io` for containerd.
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Sets the procfs mount point. Useful when running in a container with the host's procfs
    /// mounted elsewhere.
    pub fn proc_root(mut self, proc_root: impl Into<PathBuf>) -> Self {
        self.proc_root = proc_root.into();
        self
    }
}

/// Output of a finished command.
#[derive(Debug, Clone)]
struct Output {
    status: ExitStatus,
    stdout: String,
    stderr: String,
}

impl From<std::process::Output> for Output {
    fn from(value: std::process::Output) -> Self {
        Self {
            status: value.status,
            stdout: String::from_utf8_lossy(&value.stdout).to_string(),
            stderr: String::from_utf8_lossy(&value.stderr).to_string(),
        }
    }
}

/// The fields of `runc state` we care about.
#[derive(Debug, Deserialize)]
struct RuncState {
    pid: u32,
    status: String,
}

/// A [`ContainerRuntime`] querying `runc` for container state, and entering namespaces through
/// procfs.
#[derive(Debug, Clone, Default)]
pub struct RuncRuntime {
    options: RuncOptions,
}

impl RuncRuntime {
    pub fn new(options: RuncOptions) -> Self {
        Self { options }
    }

    async fn state(&self, id: &ContainerId) -> Result<Output, RuntimeError> {
        let mut cmd = Command::new(&self.options.binary);
        cmd.arg("--root")
            .arg(&self.options.root)
            .arg("state")
            .arg(id.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(?cmd, "running command");

        let output: Output = cmd
            .output()
            .await
            .map_err(|e| {
                RuntimeError::Unavailable(format!("{}: {e}", self.options.binary.display()))
            })?
            .into();

        if !output.status.success() {
            tracing::debug!(?output.stderr, ?output.status, "command returned non-zero status");
        }
        Ok(output)
    }
}

#[async_trait]
impl ContainerRuntime for RuncRuntime {
    async fn resolve(&self, id: &ContainerId) -> Result<NamespaceHandle, RuntimeError> {
        let output = self.state(id).await?;
        let mut handle = parse_state(id, &output, &self.options.proc_root)?;
        handle.id = Some(NamespaceId::of(&handle.path).map_err(|e| {
            if e.is_not_found() {
                RuntimeError::NotFound(id.to_string())
            } else {
                RuntimeError::Unavailable(e.to_string())
            }
        })?);
        tracing::debug!(container = %id, pid = handle.pid, namespace = ?handle.id, "resolved container");
        Ok(handle)
    }

    async fn enter(
        &self,
        namespace: &NamespaceHandle,
    ) -> Result<Box<dyn NamespaceSession>, RuntimeError> {
        let session = match namespace.id {
            Some(id) => TcSession::open_verified(&namespace.path, id).await,
            None => TcSession::open(&namespace.path).await,
        };
        match session {
            Ok(session) => Ok(Box::new(session)),
            Err(e) if e.is_not_found() => Err(RuntimeError::NamespaceGone(namespace.path.clone())),
            Err(e) => Err(RuntimeError::Unavailable(e.to_string())),
        }
    }
}

/// Classify the output of `runc state <id>`.
fn parse_state(
    id: &ContainerId,
    output: &Output,
    proc_root: &Path,
) -> Result<NamespaceHandle, RuntimeError> {
    if !output.status.success() {
        let stderr = output.stderr.to_ascii_lowercase();
        if stderr.contains("does not exist") || stderr.contains("not found") {
            return Err(RuntimeError::NotFound(id.to_string()));
        }
        return Err(RuntimeError::Unavailable(format!(
            "runc state {id} exited with {}: {}",
            output.status,
            output.stderr.trim()
        )));
    }

    let state: RuncState = serde_json::from_str(&output.stdout)
        .map_err(|e| RuntimeError::Unavailable(format!("invalid runc state output: {e}")))?;

    if state.status != "running" || state.pid == 0 {
        tracing::debug!(container = %id, status = %state.status, "container is not running");
        return Err(RuntimeError::NotFound(id.to_string()));
    }

    Ok(NamespaceHandle {
        pid: state.pid,
        path: proc_root.join(state.pid.to_string()).join("ns").join("net"),
        id: None,
    })
}
