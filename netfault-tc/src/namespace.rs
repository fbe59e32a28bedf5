//! Execute asynchronous work inside a foreign network namespace.
//!
//! Network namespaces are a per-thread property, so entering one from a tokio worker would leak
//! the namespace into unrelated tasks. A [`NetworkNamespace`] instead spawns a dedicated OS thread
//! which `setns`es into the target namespace, starts its own current-thread runtime, builds a
//! context (typically a netlink connection, which binds to the namespace it is created in) and
//! then serves [`dynch`] requests until every sender is dropped.

use std::io;
use std::os::fd::{AsFd, AsRawFd};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sched::CloneFlags;
use nix::sys::stat::FileStat;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::dynch::{self, DynFuture, DynRequestSender};
use crate::error::{Error, Result};

/// Capacity of the request channel of a namespace thread.
const REQUEST_BUFFER: usize = 16;

/// Identity of a namespace: the device and inode of its nsfs file. Stable for the lifetime of the
/// namespace, whatever path it is reached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NamespaceId {
    pub dev: u64,
    pub ino: u64,
}

impl NamespaceId {
    /// The identity of the namespace at `path`.
    pub fn of(path: &Path) -> Result<Self> {
        nix::sys::stat::stat(path).map(Self::from).map_err(|e| match e {
            Errno::ENOENT => Error::NamespaceGone(path.to_path_buf()),
            e => Error::Nix(e),
        })
    }
}

impl From<FileStat> for NamespaceId {
    fn from(stat: FileStat) -> Self {
        Self { dev: stat.st_dev as u64, ino: stat.st_ino as u64 }
    }
}

/// Handle to a thread living in a network namespace.
///
/// Dropping the handle stops the thread once in-flight requests complete.
#[derive(Debug)]
pub struct NetworkNamespace<Ctx> {
    path: PathBuf,
    sender: DynRequestSender<Ctx>,
}

impl<Ctx: 'static> NetworkNamespace<Ctx> {
    /// Enter the namespace at `path` (e.g. `/proc/<pid>/ns/net`) on a new thread and build the
    /// thread context with `make_ctx`, which runs inside the namespace and inside the thread's
    /// runtime.
    pub async fn open<F>(path: impl Into<PathBuf>, make_ctx: F) -> Result<Self>
    where
        F: FnOnce() -> Result<Ctx> + Send + 'static,
    {
        Self::open_verified(path, None, make_ctx).await
    }

    /// Like [`NetworkNamespace::open`], but only enters the namespace if the opened file is the
    /// namespace identified by `expected`. A different namespace behind the same path, as after
    /// pid reuse, counts as [`Error::NamespaceGone`].
    pub async fn open_verified<F>(
        path: impl Into<PathBuf>,
        expected: Option<NamespaceId>,
        make_ctx: F,
    ) -> Result<Self>
    where
        F: FnOnce() -> Result<Ctx> + Send + 'static,
    {
        let path = path.into();
        let file = std::fs::File::open(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::NamespaceGone(path.clone()),
            _ => Error::Io(e),
        })?;

        if let Some(expected) = expected {
            // Checked on the open descriptor, which is what gets entered.
            let actual = NamespaceId::from(nix::sys::stat::fstat(file.as_raw_fd())?);
            if actual != expected {
                tracing::debug!(path = %path.display(), ?expected, ?actual, "namespace was replaced");
                return Err(Error::NamespaceGone(path));
            }
        }

        let (sender, mut rx) = dynch::channel::<Ctx>(REQUEST_BUFFER);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();

        let span = tracing::debug_span!("namespace", path = %path.display());

        std::thread::Builder::new().name("netfault-netns".to_string()).spawn(move || {
            let _entered = span.enter();

            let setup = || -> Result<tokio::runtime::Runtime> {
                nix::sched::setns(file.as_fd(), CloneFlags::CLONE_NEWNET)?;
                Ok(tokio::runtime::Builder::new_current_thread().enable_all().build()?)
            };

            let rt = match setup() {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            rt.block_on(async move {
                let mut ctx = match make_ctx() {
                    Ok(ctx) => ctx,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                let _ = ready_tx.send(Ok(()));
                tracing::debug!("namespace thread ready");

                while let Some(request) = rx.recv().await {
                    request.run(&mut ctx).await;
                }

                tracing::debug!("all senders dropped, namespace thread exiting");
            });
        })?;

        ready_rx.await.map_err(|_| Error::NamespaceStopped)??;

        Ok(Self { path, sender })
    }

    /// Run a task with access to the namespace context, and wait for its output.
    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut Ctx) -> DynFuture<'a, T> + Send + 'static,
    {
        self.sender.call(f).await
    }

    /// The namespace file this thread entered.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the namespace thread has exited.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}
