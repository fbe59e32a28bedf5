//! The lifecycle the orchestration layer drives: `prepare`, `start`, `stop`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::{self, FaultConfig};
use crate::discipline::{Discipline, DisciplineKind};
use crate::engine::{AppliedHandle, Engine};
use crate::error::{Error, Result};
use crate::runtime::ContainerRuntime;
use crate::scope::{self, RestrictedEndpoint, ScopeConfig};
use crate::spec::{ContainerTarget, FaultSpec};

/// What the orchestrator tells us about the environment of a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    #[serde(default)]
    restricted_endpoints: Vec<RestrictedEndpoint>,
}

impl ExecutionContext {
    pub fn new(restricted_endpoints: Vec<RestrictedEndpoint>) -> Self {
        Self { restricted_endpoints }
    }

    /// Endpoints that must never be faulted.
    pub fn restricted_endpoints(&self) -> &[RestrictedEndpoint] {
        &self.restricted_endpoints
    }
}

/// One fault type as offered to the orchestrator.
#[derive(Debug)]
pub struct FaultAction<R> {
    kind: DisciplineKind,
    engine: Engine<R>,
}

impl<R> Clone for FaultAction<R> {
    fn clone(&self) -> Self {
        Self { kind: self.kind, engine: self.engine.clone() }
    }
}

impl<R: ContainerRuntime> FaultAction<R> {
    pub fn new(kind: DisciplineKind, engine: Engine<R>) -> Self {
        Self { kind, engine }
    }

    /// One action per discipline kind, all sharing `engine`.
    pub fn all(engine: &Engine<R>) -> Vec<Self> {
        DisciplineKind::ALL.into_iter().map(|kind| Self::new(kind, engine.clone())).collect()
    }

    pub const fn kind(&self) -> DisciplineKind {
        self.kind
    }

    pub fn engine(&self) -> &Engine<R> {
        &self.engine
    }

    /// Decode and resolve a request into a [`FaultSpec`].
    ///
    /// Without `networkInterface`, the fault targets every interface of the container,
    /// loopback only with `includeLoopback`. Nothing is modified.
    pub async fn prepare(
        &self,
        target: &str,
        context: &ExecutionContext,
        config: &FaultConfig,
    ) -> Result<FaultSpec> {
        let discipline = Discipline::from_config(self.kind, config)?;
        let scope_config = ScopeConfig::from_config(config)?;
        let scope = scope::build(&scope_config, context.restricted_endpoints()).await?;

        let target = ContainerTarget::new(target);
        let requested = config
            .strings(config::NETWORK_INTERFACE)
            .map_err(|e| Error::InvalidDiscipline(e.to_string()))?;

        let interfaces = if requested.is_empty() {
            let include_loopback = config
                .boolean(config::INCLUDE_LOOPBACK)
                .map_err(|e| Error::InvalidDiscipline(e.to_string()))?;
            self.engine.interfaces(&target, include_loopback).await?
        } else {
            let mut interfaces: Vec<String> = Vec::with_capacity(requested.len());
            for interface in requested {
                if !interfaces.contains(&interface) {
                    interfaces.push(interface);
                }
            }
            interfaces
        };

        tracing::debug!(container = %target.id(), %discipline, ?interfaces, "prepared fault");
        Ok(FaultSpec { target, discipline, scope, interfaces })
    }

    pub async fn start(&self, spec: &FaultSpec) -> Result<AppliedHandle> {
        if spec.discipline.kind() != self.kind {
            return Err(Error::InvalidDiscipline(format!(
                "{} action cannot start a {} fault",
                self.kind,
                spec.discipline.kind()
            )));
        }
        self.engine.apply(spec).await
    }

    pub async fn stop(&self, handle: &AppliedHandle) -> Result<()> {
        self.engine.revert(handle).await
    }
}

/// Where an experiment is in its lifecycle.
///
/// ```text
/// Pending ──start──> Applied ──stop──> Reverted
///    │  └──start, conflict──> Rejected
///    └──stop──> Cancelled
/// ```
///
/// Admission is internal to [`Engine::apply`]: there is no observable admitted state, a started
/// experiment moves straight from `Pending` to `Applied` or `Rejected`. An experiment stopped
/// before it ever applied is `Cancelled`, never `Reverted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentState {
    Pending,
    Applied,
    Reverted,
    Rejected,
    Cancelled,
}

impl ExperimentState {
    /// No further transition is possible.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Reverted | Self::Rejected | Self::Cancelled)
    }
}

impl fmt::Display for ExperimentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Applied => "applied",
            Self::Reverted => "reverted",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        })
    }
}

/// Drives one [`FaultSpec`] through its lifecycle. Stopping reverts at most once.
#[derive(Debug)]
pub struct Experiment<R> {
    action: FaultAction<R>,
    spec: FaultSpec,
    state: ExperimentState,
    handle: Option<AppliedHandle>,
}

impl<R: ContainerRuntime> Experiment<R> {
    pub fn new(action: FaultAction<R>, spec: FaultSpec) -> Self {
        Self { action, spec, state: ExperimentState::Pending, handle: None }
    }

    pub const fn state(&self) -> ExperimentState {
        self.state
    }

    pub fn spec(&self) -> &FaultSpec {
        &self.spec
    }

    /// The applied fault, while it is applied.
    pub fn handle(&self) -> Option<&AppliedHandle> {
        self.handle.as_ref()
    }

    /// Apply the fault.
    ///
    /// A conflict rejects the experiment for good. Other failures leave it pending: nothing is
    /// applied and the caller may start again.
    pub async fn start(&mut self) -> Result<&AppliedHandle> {
        if self.state != ExperimentState::Pending {
            return Err(Error::InvalidTransition { from: self.state, to: ExperimentState::Applied });
        }

        match self.action.start(&self.spec).await {
            Ok(handle) => {
                self.state = ExperimentState::Applied;
                Ok(&*self.handle.insert(handle))
            }
            Err(e @ Error::ConflictingFault { .. }) => {
                self.state = ExperimentState::Rejected;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Revert the fault.
    ///
    /// Stopping a pending experiment cancels it without touching anything, stopping an ended one
    /// does nothing. If the revert fails the experiment stays applied so that stop can be retried.
    pub async fn stop(&mut self) -> Result<()> {
        match self.state {
            ExperimentState::Pending => {
                tracing::debug!("experiment cancelled before it started");
                self.state = ExperimentState::Cancelled;
                Ok(())
            }
            ExperimentState::Reverted | ExperimentState::Rejected | ExperimentState::Cancelled => {
                tracing::debug!(state = %self.state, "experiment already ended");
                Ok(())
            }
            ExperimentState::Applied => {
                let Some(handle) = self.handle.as_ref() else {
                    return Err(Error::InvalidTransition {
                        from: self.state,
                        to: ExperimentState::Reverted,
                    });
                };
                self.action.stop(handle).await?;
                self.handle = None;
                self.state = ExperimentState::Reverted;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::registry::ActiveFaultRegistry;
    use crate::runtime::fake::FakeRuntime;

    fn setup() -> (FakeRuntime, Engine<FakeRuntime>) {
        let _ = tracing_subscriber::fmt::try_init();
        let runtime = FakeRuntime::new();
        runtime.add_container("c1", &["eth0", "eth1"]);
        let engine = Engine::new(runtime.clone(), Arc::new(ActiveFaultRegistry::new()));
        (runtime, engine)
    }

    #[tokio::test]
    async fn prepare_enumerates_interfaces() {
        let (_, engine) = setup();
        let action = FaultAction::new(DisciplineKind::Loss, engine);
        let config = FaultConfig::new().with(config::NETWORK_LOSS, 20);

        let spec = action.prepare("docker://c1", &ExecutionContext::default(), &config).await.unwrap();
        assert_eq!(spec.interfaces, ["eth0", "eth1"]);
        assert_eq!(spec.discipline, Discipline::Loss { percentage: 20 });

        let config = config.with(config::INCLUDE_LOOPBACK, true);
        let spec = action.prepare("c1", &ExecutionContext::default(), &config).await.unwrap();
        assert_eq!(spec.interfaces, ["lo", "eth0", "eth1"]);
    }

    #[tokio::test]
    async fn prepare_keeps_requested_interfaces() {
        let (runtime, engine) = setup();
        let action = FaultAction::new(DisciplineKind::Blackhole, engine);
        let config = FaultConfig::new().with(config::NETWORK_INTERFACE, vec!["eth1", "eth1"]);

        let spec = action.prepare("c1", &ExecutionContext::default(), &config).await.unwrap();
        assert_eq!(spec.interfaces, ["eth1"]);
        assert_eq!(runtime.resolves(), 0);
    }

    #[tokio::test]
    async fn prepare_rejects_bad_config() {
        let (runtime, engine) = setup();
        let action = FaultAction::new(DisciplineKind::Corrupt, engine);
        let ctx = ExecutionContext::default();

        let err = action.prepare("c1", &ctx, &FaultConfig::new()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidDiscipline(_)), "{err}");

        let config = FaultConfig::new().with(config::NETWORK_CORRUPTION, 10).with(config::IP, "10.0.0.0/40");
        let err = action.prepare("c1", &ctx, &config).await.unwrap_err();
        assert!(err.is_user_error(), "{err}");
        assert_eq!(runtime.mutations(), 0);
    }

    #[tokio::test]
    async fn start_checks_kind() {
        let (_, engine) = setup();
        let loss = FaultAction::new(DisciplineKind::Loss, engine.clone());
        let delay = FaultAction::new(DisciplineKind::Delay, engine);

        let spec =
            loss.prepare("c1", &ExecutionContext::default(), &FaultConfig::new().with(config::NETWORK_LOSS, 5)).await.unwrap();
        assert!(matches!(delay.start(&spec).await, Err(Error::InvalidDiscipline(_))));
    }

    #[tokio::test]
    async fn experiment_lifecycle() {
        let (runtime, engine) = setup();
        let action = FaultAction::new(DisciplineKind::Delay, engine.clone());
        let config = FaultConfig::new().with(config::NETWORK_DELAY, 50).with(config::NETWORK_DELAY_JITTER, true);
        let spec = action.prepare("c1", &ExecutionContext::default(), &config).await.unwrap();

        let mut experiment = Experiment::new(action, spec);
        assert_eq!(experiment.state(), ExperimentState::Pending);

        experiment.start().await.unwrap();
        assert_eq!(experiment.state(), ExperimentState::Applied);
        assert!(matches!(
            experiment.start().await,
            Err(Error::InvalidTransition { from: ExperimentState::Applied, .. })
        ));

        experiment.stop().await.unwrap();
        assert_eq!(experiment.state(), ExperimentState::Reverted);
        assert!(experiment.handle().is_none());
        assert!(engine.registry().is_empty());

        let mutations = runtime.mutations();
        experiment.stop().await.unwrap();
        assert_eq!(runtime.mutations(), mutations, "stop reverts only once");
    }

    #[tokio::test]
    async fn conflicting_experiment_is_rejected() {
        let (_, engine) = setup();
        let actions = FaultAction::all(&engine);
        let ctx = ExecutionContext::default();
        let config = FaultConfig::new().with(config::NETWORK_CORRUPTION, 10);

        let blackhole = actions[0].prepare("c1", &ctx, &config).await.unwrap();
        let corrupt = actions[1].prepare("c1", &ctx, &config).await.unwrap();

        let mut first = Experiment::new(actions[0].clone(), blackhole);
        let mut second = Experiment::new(actions[1].clone(), corrupt);
        first.start().await.unwrap();

        assert!(matches!(second.start().await, Err(Error::ConflictingFault { .. })));
        assert_eq!(second.state(), ExperimentState::Rejected);
        assert!(second.state().is_terminal());
        second.stop().await.unwrap();

        first.stop().await.unwrap();
        assert!(engine.registry().is_empty());
    }

    #[tokio::test]
    async fn transient_failure_leaves_experiment_pending() {
        let (runtime, engine) = setup();
        let action = FaultAction::new(DisciplineKind::Blackhole, engine);
        let config = FaultConfig::new().with(config::NETWORK_INTERFACE, "eth0");
        let spec = action.prepare("c1", &ExecutionContext::default(), &config).await.unwrap();

        let mut experiment = Experiment::new(action, spec);
        runtime.set_unavailable(true);
        assert!(experiment.start().await.unwrap_err().is_retryable());
        assert_eq!(experiment.state(), ExperimentState::Pending);

        runtime.set_unavailable(false);
        experiment.start().await.unwrap();
        experiment.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stopping_a_pending_experiment_cancels_it() {
        let (runtime, engine) = setup();
        let action = FaultAction::new(DisciplineKind::Blackhole, engine);
        let spec = action.prepare("c1", &ExecutionContext::default(), &FaultConfig::new()).await.unwrap();

        let mut experiment = Experiment::new(action, spec);
        experiment.stop().await.unwrap();
        assert_eq!(experiment.state(), ExperimentState::Cancelled);
        assert!(experiment.state().is_terminal());

        let err = experiment.start().await.unwrap_err();
        assert!(
            matches!(err, Error::InvalidTransition { from: ExperimentState::Cancelled, to: ExperimentState::Applied }),
            "{err}"
        );
        // Stopping again is harmless.
        experiment.stop().await.unwrap();
        assert_eq!(experiment.state(), ExperimentState::Cancelled);
        assert_eq!(runtime.mutations(), 0);
    }

    #[test]
    fn context_serde() {
        let ctx: ExecutionContext = serde_json::from_str(
            r#"{"restricted_endpoints":[{"address":"10.0.0.1"},{"address":"10.1.0.0/16","port":443}]}"#,
        )
        .unwrap();
        assert_eq!(ctx.restricted_endpoints()[1], RestrictedEndpoint::new("10.1.0.0/16", Some(443)));
        assert_eq!(serde_json::from_str::<ExecutionContext>("{}").unwrap(), ExecutionContext::default());
    }
}
