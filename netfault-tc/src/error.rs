use std::io;
use std::path::PathBuf;

use nix::errno::Errno;

/// Errors raised while talking to the kernel or to a namespace thread.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),
    #[error("rtnetlink error: {0}")]
    RtNetlink(#[from] rtnetlink::Error),
    #[error("interface not found: {0}")]
    InterfaceNotFound(String),
    #[error("network namespace {} no longer exists", .0.display())]
    NamespaceGone(PathBuf),
    #[error("namespace thread stopped")]
    NamespaceStopped,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The errno carried by a kernel error reply, or by a failed syscall.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::RtNetlink(rtnetlink::Error::NetlinkError(message)) => {
                message.code.map(|code| Errno::from_raw(code.get().abs()))
            }
            Self::Nix(errno) => Some(*errno),
            Self::Io(e) => e.raw_os_error().map(Errno::from_raw),
            _ => None,
        }
    }

    /// Whether the error means the targeted object, interface or namespace does not exist
    /// (anymore).
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::InterfaceNotFound(_) | Self::NamespaceGone(_) => true,
            _ => matches!(self.errno(), Some(Errno::ENOENT | Errno::ENODEV)),
        }
    }

    /// Whether the kernel refused to create an object because it already exists.
    pub fn is_exists(&self) -> bool {
        self.errno() == Some(Errno::EEXIST)
    }
}
