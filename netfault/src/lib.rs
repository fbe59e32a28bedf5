//! Scoped network fault injection into container network namespaces.
//!
//! A fault ([`Discipline`]) is applied to interfaces of a container, restricted to the traffic
//! selected by a [`scope::FaultScope`]. The [`Engine`] admits faults through the
//! [`ActiveFaultRegistry`], builds the traffic control trees implementing them and reverts exactly
//! what it built. The orchestration layer drives it through [`FaultAction`] and [`Experiment`].
//!
//! ```no_run
//! # async fn run() -> netfault::Result<()> {
//! use std::sync::Arc;
//!
//! use netfault::runtime::runc::RuncRuntime;
//! use netfault::{ActiveFaultRegistry, DisciplineKind, Engine, ExecutionContext, FaultAction, FaultConfig};
//!
//! let engine = Engine::new(RuncRuntime::default(), Arc::new(ActiveFaultRegistry::new()));
//! let action = FaultAction::new(DisciplineKind::Corrupt, engine);
//!
//! let config = FaultConfig::new().with("networkCorruption", 15).with("ip", "10.0.0.0/8");
//! let spec = action.prepare("docker://3f4e", &ExecutionContext::default(), &config).await?;
//! let handle = action.start(&spec).await?;
//! // ...
//! action.stop(&handle).await?;
//! # Ok(())
//! # }
//! ```
#![doc(issue_tracker_base_url = "https://github.com/chainbound/netfault/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub mod action;
pub mod config;
pub mod discipline;
pub mod engine;
pub mod error;
pub mod interfaces;
pub mod registry;
pub mod runtime;
pub mod scope;
pub mod spec;
pub mod tree;

pub use action::{ExecutionContext, Experiment, ExperimentState, FaultAction};
pub use config::{EngineOptions, FaultConfig};
pub use discipline::{Discipline, DisciplineKind, Rate};
pub use engine::{AppliedHandle, AppliedInterface, Engine};
pub use error::{Error, KernelError, Result};
pub use registry::{ActiveFaultRegistry, FaultKey, RegistryEntry};
pub use runtime::{ContainerId, ContainerRuntime, NamespaceHandle, RuntimeError};
pub use scope::{FaultScope, RestrictedEndpoint};
pub use spec::{ContainerTarget, FaultSpec};
