use std::sync::Arc;
use std::time::Duration;

use netfault::config::{self, FaultConfig};
use netfault::runtime::fake::FakeRuntime;
use netfault::{
    ActiveFaultRegistry, AppliedHandle, DisciplineKind, Engine, EngineOptions, Error, ExecutionContext,
    Experiment, ExperimentState, FaultAction, FaultSpec,
};

fn runtime() -> FakeRuntime {
    let _ = tracing_subscriber::fmt::try_init();
    let runtime = FakeRuntime::new();
    runtime.add_container("c1", &["eth0", "eth1"]);
    runtime
}

/// The handle is all a later process needs to revert a fault.
#[tokio::test]
async fn persisted_handle_reverts_in_a_fresh_engine() {
    let runtime = runtime();
    let before = runtime.tree("c1", "eth1").unwrap();

    let engine = Engine::new(runtime.clone(), Arc::new(ActiveFaultRegistry::new()));
    let action = FaultAction::new(DisciplineKind::BandwidthLimit, engine);
    let config = FaultConfig::new()
        .with(config::BANDWIDTH, "512kbit")
        .with(config::NETWORK_INTERFACE, "eth1")
        .with(config::PORT, vec!["443", "8443"])
        .with(config::PROTOCOL, "tcp");

    let spec = action.prepare("c1", &ExecutionContext::default(), &config).await.unwrap();
    let spec: FaultSpec = serde_json::from_str(&serde_json::to_string(&spec).unwrap()).unwrap();
    let handle = action.start(&spec).await.unwrap();
    let saved = serde_json::to_string(&handle).unwrap();
    drop(action);

    let engine = Engine::new(runtime.clone(), Arc::new(ActiveFaultRegistry::new()));
    let handle: AppliedHandle = serde_json::from_str(&saved).unwrap();
    engine.revert(&handle).await.unwrap();
    assert_eq!(runtime.tree("c1", "eth1").unwrap(), before);
}

#[tokio::test]
async fn experiments_on_separate_interfaces() {
    let runtime = runtime();
    let engine = Engine::new(runtime.clone(), Arc::new(ActiveFaultRegistry::new()));
    let actions = FaultAction::all(&engine);
    let blackhole = &actions[0];
    let ctx = ExecutionContext::default();

    let mut experiments = Vec::new();
    for interface in ["eth0", "eth1"] {
        let config = FaultConfig::new().with(config::NETWORK_INTERFACE, interface);
        let spec = blackhole.prepare("c1", &ctx, &config).await.unwrap();
        experiments.push(Experiment::new(blackhole.clone(), spec));
    }
    for experiment in &mut experiments {
        experiment.start().await.unwrap();
    }
    assert_eq!(engine.registry().entries().len(), 2);

    // A blackhole over both interfaces conflicts with both, and is rejected as a whole.
    let spec = blackhole.prepare("c1", &ctx, &FaultConfig::new()).await.unwrap();
    let mut both = Experiment::new(blackhole.clone(), spec);
    assert!(matches!(both.start().await, Err(Error::ConflictingFault { .. })));
    assert_eq!(both.state(), ExperimentState::Rejected);

    for experiment in &mut experiments {
        experiment.stop().await.unwrap();
        assert_eq!(experiment.state(), ExperimentState::Reverted);
    }
    assert!(engine.registry().is_empty());
}

/// A kernel that stops answering fails the apply within the deadline, and leaves nothing behind
/// once it recovers.
#[tokio::test]
async fn stalled_kernel_times_out() {
    let runtime = runtime();
    let options = EngineOptions::default().deadline(Duration::from_millis(50));
    let engine = Engine::with_options(runtime.clone(), Arc::new(ActiveFaultRegistry::new()), options);
    let action = FaultAction::new(DisciplineKind::Loss, engine.clone());
    let config = FaultConfig::new().with(config::NETWORK_LOSS, 10).with(config::NETWORK_INTERFACE, "eth0");
    let spec = action.prepare("c1", &ExecutionContext::default(), &config).await.unwrap();
    let before = runtime.tree("c1", "eth0").unwrap();

    runtime.set_op_delay(Duration::from_secs(60));
    let mut experiment = Experiment::new(action, spec);
    let err = experiment.start().await.unwrap_err();
    assert!(matches!(err, Error::Apply { .. }), "{err}");
    assert_eq!(experiment.state(), ExperimentState::Pending);
    assert!(engine.registry().is_empty());

    runtime.set_op_delay(Duration::ZERO);
    experiment.start().await.unwrap();
    experiment.stop().await.unwrap();
    assert_eq!(runtime.tree("c1", "eth0").unwrap(), before);
}
