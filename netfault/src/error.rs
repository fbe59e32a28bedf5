use std::time::Duration;

use crate::action::ExperimentState;
use crate::discipline::DisciplineKind;
use crate::registry::FaultKey;
use crate::runtime::RuntimeError;

/// Failure of a kernel traffic-control operation.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error(transparent)]
    Tc(#[from] netfault_tc::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("root qdisc {0} is not managed by netfault")]
    ForeignRoot(String),
    #[error("ingress qdisc {0} is not managed by netfault")]
    ForeignIngress(String),
    #[error("the active faults need {needed} classifiers, at most {limit} fit")]
    Classifiers { needed: usize, limit: usize },
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl KernelError {
    /// Whether the error means the interface or namespace is gone.
    pub fn is_gone(&self) -> bool {
        match self {
            Self::Tc(e) => e.is_not_found(),
            Self::Runtime(e) => e.is_gone(),
            _ => false,
        }
    }

    /// Whether the kernel refused a create because the object already exists.
    pub fn is_exists(&self) -> bool {
        matches!(self, Self::Tc(e) if e.is_exists())
    }
}

/// Errors surfaced to the orchestration layer.
///
/// [`Error::InvalidScopeEntry`] and [`Error::InvalidDiscipline`] are user configuration errors,
/// [`Error::RuntimeUnavailable`] is transient. [`Error::Revert`], and [`Error::Apply`] carrying a
/// cleanup failure, mean fault state may have leaked and must not be ignored.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid scope entry {entry:?}: {reason}")]
    InvalidScopeEntry { entry: String, reason: String },
    #[error("invalid discipline: {0}")]
    InvalidDiscipline(String),
    #[error("container {0} not found")]
    ContainerNotFound(String),
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),
    #[error("no usable network interfaces in container {0}")]
    NoInterfaces(String),
    #[error("{kind} conflicts with active {active} on {key}")]
    ConflictingFault { key: FaultKey, kind: DisciplineKind, active: DisciplineKind },
    #[error("failed to apply {kind} on {interface}: {source}{}", cleanup_note(.cleanup))]
    Apply {
        interface: String,
        kind: DisciplineKind,
        #[source]
        source: KernelError,
        /// Set when removing what the failed apply had created failed as well.
        cleanup: Option<Box<Error>>,
    },
    #[error("failed to revert {kind} on {interface}: {source}")]
    Revert {
        interface: String,
        kind: DisciplineKind,
        #[source]
        source: KernelError,
    },
    /// A lifecycle call out of order, such as starting an experiment twice.
    #[error("experiment cannot move from {from} to {to}")]
    InvalidTransition { from: ExperimentState, to: ExperimentState },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn scope(entry: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidScopeEntry { entry: entry.into(), reason: reason.into() }
    }

    /// Malformed user configuration. Never worth retrying.
    pub const fn is_user_error(&self) -> bool {
        matches!(self, Self::InvalidScopeEntry { .. } | Self::InvalidDiscipline(_))
    }

    /// Transient failure the caller may retry a bounded number of times.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::RuntimeUnavailable(_))
    }

    /// Whether kernel state may have been left behind.
    pub const fn is_leak(&self) -> bool {
        matches!(self, Self::Revert { .. } | Self::Apply { cleanup: Some(_), .. })
    }
}

fn cleanup_note(cleanup: &Option<Box<Error>>) -> String {
    match cleanup {
        Some(e) => format!(" (cleanup failed too: {e})"),
        None => String::new(),
    }
}

impl From<RuntimeError> for Error {
    fn from(value: RuntimeError) -> Self {
        match value {
            RuntimeError::NotFound(id) => Self::ContainerNotFound(id),
            RuntimeError::NamespaceGone(path) => Self::ContainerNotFound(path.display().to_string()),
            RuntimeError::Unavailable(reason) => Self::RuntimeUnavailable(reason),
        }
    }
}
