use std::sync::Arc;
use std::time::Duration;

use netfault::config::{self, FaultConfig};
use netfault::runtime::fake::FakeRuntime;
use netfault::{
    ActiveFaultRegistry, ContainerId, ContainerTarget, Discipline, DisciplineKind, Engine, Error,
    ExecutionContext, FaultAction, FaultSpec, RestrictedEndpoint,
};
use netfault_tc::tc::filter::{IpProto, PacketHeader};
use netfault_tc::tc::object::QdiscKind;
use netfault_tc::tc::snapshot::RootState;

fn setup(interfaces: &[&str]) -> (FakeRuntime, Engine<FakeRuntime>) {
    let _ = tracing_subscriber::fmt::try_init();
    let runtime = FakeRuntime::new();
    runtime.add_container("c1", interfaces);
    let engine = Engine::new(runtime.clone(), Arc::new(ActiveFaultRegistry::new()));
    (runtime, engine)
}

fn spec(discipline: Discipline, interface: &str) -> FaultSpec {
    FaultSpec {
        target: ContainerTarget::new("c1"),
        discipline,
        scope: Default::default(),
        interfaces: vec![interface.to_string()],
    }
}

fn udp(destination: &str) -> PacketHeader {
    PacketHeader::new(IpProto::Udp, ("172.17.0.2".parse().unwrap(), 5000), (destination.parse().unwrap(), 53))
}

/// Blackhole excludes everything else on its interface, and only there.
#[tokio::test]
async fn blackhole_then_corrupt_then_delay() {
    let (runtime, engine) = setup(&["eth0", "eth1"]);
    let c1 = ContainerId::new("c1");

    let blackhole = engine.apply(&spec(Discipline::Blackhole, "eth0")).await.unwrap();
    assert_eq!(engine.registry().active(&c1, "eth0"), vec![DisciplineKind::Blackhole]);

    let err = engine.apply(&spec(Discipline::Corrupt { percentage: 10 }, "eth0")).await.unwrap_err();
    match err {
        Error::ConflictingFault { key, kind, active } => {
            assert_eq!(key.to_string(), "c1/eth0");
            assert_eq!(kind, DisciplineKind::Corrupt);
            assert_eq!(active, DisciplineKind::Blackhole);
        }
        other => panic!("unexpected error: {other}"),
    }

    let corrupt = engine.apply(&spec(Discipline::Corrupt { percentage: 10 }, "eth1")).await.unwrap();
    assert_eq!(engine.registry().active(&c1, "eth1"), vec![DisciplineKind::Corrupt]);

    engine.revert(&blackhole).await.unwrap();
    assert!(engine.registry().active(&c1, "eth0").is_empty());
    assert_eq!(engine.registry().entries().len(), 1);
    assert_eq!(runtime.tree("c1", "eth0").unwrap().root_state(), RootState::Absent);

    let delay = Discipline::Delay { delay: Duration::from_millis(50), jitter: Duration::ZERO };
    let delay = engine.apply(&spec(delay, "eth0")).await.unwrap();
    assert_eq!(runtime.tree("c1", "eth0").unwrap().fault_masks(), vec![DisciplineKind::Delay.bit()]);

    engine.revert(&delay).await.unwrap();
    engine.revert(&corrupt).await.unwrap();
    assert!(engine.registry().is_empty());
}

#[tokio::test]
async fn corruption_without_interfaces_targets_all_of_them() {
    let (runtime, engine) = setup(&["eth0"]);
    let action = FaultAction::new(DisciplineKind::Corrupt, engine);
    let config = FaultConfig::new().with(config::NETWORK_CORRUPTION, 15);

    let spec = action.prepare("c1", &ExecutionContext::default(), &config).await.unwrap();
    assert_eq!(spec.interfaces, ["eth0"]);
    assert_eq!(spec.discipline, Discipline::Corrupt { percentage: 15 });
    assert_eq!(runtime.mutations(), 0);
}

#[tokio::test]
async fn no_interfaces_means_no_mutation() {
    let (runtime, engine) = setup(&[]);
    let action = FaultAction::new(DisciplineKind::Loss, engine.clone());
    let config = FaultConfig::new().with(config::NETWORK_LOSS, 50);

    let err = action.prepare("c1", &ExecutionContext::default(), &config).await.unwrap_err();
    assert!(matches!(err, Error::NoInterfaces(_)), "{err}");
    assert_eq!(runtime.mutations(), 0);
    assert!(engine.registry().is_empty());
}

/// Every discipline round-trips to the exact tree it started from.
#[tokio::test]
async fn every_discipline_round_trips() {
    let (runtime, engine) = setup(&["eth0"]);
    let before = runtime.tree("c1", "eth0").unwrap();

    let disciplines = [
        Discipline::Blackhole,
        Discipline::Corrupt { percentage: 1 },
        Discipline::Delay { delay: Duration::from_millis(200), jitter: Duration::from_millis(60) },
        Discipline::Loss { percentage: 100 },
        Discipline::BandwidthLimit { rate: "1mbit".parse().unwrap() },
    ];
    for discipline in disciplines {
        let handle = engine.apply(&spec(discipline, "eth0")).await.unwrap();
        assert!(!handle.is_empty(), "{discipline}");
        engine.revert(&handle).await.unwrap();
        assert_eq!(runtime.tree("c1", "eth0").unwrap(), before, "{discipline}");
    }
    assert!(engine.registry().is_empty());
}

/// Restricted endpoints are excluded whether or not the user also includes or excludes them.
#[tokio::test]
async fn restricted_endpoints_are_always_excluded() {
    let (runtime, engine) = setup(&["eth0"]);
    let action = FaultAction::new(DisciplineKind::Corrupt, engine.clone());
    let context = ExecutionContext::new(vec![
        RestrictedEndpoint::new("10.0.0.1", None),
        RestrictedEndpoint::new("10.0.0.2", None),
        RestrictedEndpoint::new("192.168.1.1", Some(22)),
    ]);
    let config = FaultConfig::new()
        .with(config::NETWORK_CORRUPTION, 5)
        .with(config::IP, vec!["10.0.0.0/8", "10.0.0.1"])
        .with(config::EXCLUDE_IP, "10.0.0.2");

    let spec = action.prepare("c1", &context, &config).await.unwrap();
    let excluded: Vec<_> = spec.scope.exclude.iter().map(|e| e.network.to_string()).collect();
    for restricted in ["10.0.0.1/32", "10.0.0.2/32", "192.168.1.1/32"] {
        assert!(excluded.iter().any(|e| e == restricted), "{restricted} missing from {excluded:?}");
    }

    let handle = action.start(&spec).await.unwrap();
    let tree = runtime.tree("c1", "eth0").unwrap();
    let prefs: Vec<_> = tree.filters.iter().map(|f| f.priority).collect();
    // Two address exclusions plus tcp and udp for the restricted port, then the network. The
    // included 10.0.0.1 is shadowed by its exclusion.
    assert_eq!(prefs, vec![1, 2, 3, 4, 5]);
    assert!(runtime.egress_path("c1", "eth0", &udp("10.0.0.1")).is_empty());
    assert!(!runtime.egress_path("c1", "eth0", &udp("10.0.0.3")).is_empty());

    action.stop(&handle).await.unwrap();
    assert!(runtime.tree("c1", "eth0").unwrap().filters.is_empty());
}

#[tokio::test]
async fn revert_after_the_container_is_gone() {
    let (runtime, engine) = setup(&["eth0", "eth1"]);
    let action = FaultAction::new(DisciplineKind::Loss, engine.clone());
    let config = FaultConfig::new().with(config::NETWORK_LOSS, 30);

    let spec = action.prepare("docker://c1", &ExecutionContext::default(), &config).await.unwrap();
    let handle = action.start(&spec).await.unwrap();
    assert_eq!(handle.interfaces.len(), 2);

    runtime.remove_container("c1");
    action.stop(&handle).await.unwrap();
    assert!(engine.registry().is_empty());
}

/// Engines sharing a registry admit exactly one of concurrent identical faults.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_applies_admit_one() {
    let (runtime, engine) = setup(&["eth0"]);
    runtime.set_op_delay(Duration::from_millis(1));

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..8 {
        let engine = engine.clone();
        tasks.spawn(async move { engine.apply(&spec(Discipline::Loss { percentage: 10 }, "eth0")).await });
    }

    let mut handles = Vec::new();
    while let Some(result) = tasks.join_next().await {
        match result.unwrap() {
            Ok(handle) => handles.push(handle),
            Err(e) => assert!(matches!(e, Error::ConflictingFault { .. }), "{e}"),
        }
    }
    assert_eq!(handles.len(), 1);
    assert_eq!(runtime.tree("c1", "eth0").unwrap().fault_masks(), vec![DisciplineKind::Loss.bit()]);

    engine.revert(&handles[0]).await.unwrap();
    assert!(engine.registry().is_empty());
}

/// Different kinds on the same interface are built and torn down independently.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_kinds_share_an_interface() {
    let (runtime, engine) = setup(&["eth0"]);
    let before = runtime.tree("c1", "eth0").unwrap();

    let disciplines = [
        Discipline::Corrupt { percentage: 3 },
        Discipline::Delay { delay: Duration::from_millis(5), jitter: Duration::ZERO },
        Discipline::Loss { percentage: 4 },
        Discipline::BandwidthLimit { rate: "10mbit".parse().unwrap() },
    ];
    let applies = disciplines.iter().map(|d| {
        let engine = engine.clone();
        let spec = spec(*d, "eth0");
        async move { engine.apply(&spec).await }
    });
    let handles: Vec<_> = futures::future::join_all(applies)
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();

    // Every packet gets all four.
    let all = DisciplineKind::ALL.iter().filter(|k| **k != DisciplineKind::Blackhole).fold(0, |m, k| m | k.bit());
    assert_eq!(runtime.tree("c1", "eth0").unwrap().fault_masks(), vec![all]);
    assert_eq!(engine.registry().entries()[0].kinds.len(), 4);
    let path = runtime.egress_path("c1", "eth0", &udp("10.0.0.1"));
    match path[..] {
        [QdiscKind::Netem(netem), QdiscKind::Tbf(_)] => {
            assert_eq!((netem.corrupt, netem.latency_us, netem.loss), (3.0, 5_000, 4.0));
        }
        _ => panic!("unexpected path {path:?}"),
    }

    let reverts = handles.iter().map(|handle| engine.revert(handle));
    for result in futures::future::join_all(reverts).await {
        result.unwrap();
    }
    assert_eq!(runtime.tree("c1", "eth0").unwrap(), before);
    assert!(engine.registry().is_empty());
}

/// A packet selected by two faults gets both, and keeps the other when one is stopped.
#[tokio::test]
async fn overlapping_faults_compose() {
    let (runtime, engine) = setup(&["eth0"]);
    let ctx = ExecutionContext::default();
    let delay_action = FaultAction::new(DisciplineKind::Delay, engine.clone());
    let loss_action = FaultAction::new(DisciplineKind::Loss, engine.clone());

    let config = FaultConfig::new().with(config::NETWORK_DELAY, 80).with(config::IP, "10.0.0.0/8");
    let delay = delay_action.start(&delay_action.prepare("c1", &ctx, &config).await.unwrap()).await.unwrap();
    let config = FaultConfig::new().with(config::NETWORK_LOSS, 25).with(config::IP, "10.0.0.9");
    let loss = loss_action.start(&loss_action.prepare("c1", &ctx, &config).await.unwrap()).await.unwrap();

    let netem = |destination| match runtime.egress_path("c1", "eth0", &udp(destination))[..] {
        [QdiscKind::Netem(netem)] => Some((netem.latency_us, netem.loss)),
        _ => None,
    };
    assert_eq!(netem("10.0.0.9"), Some((80_000, 25.0)));
    assert_eq!(netem("10.0.0.8"), Some((80_000, 0.0)));
    assert_eq!(netem("192.168.0.1"), None);

    loss_action.stop(&loss).await.unwrap();
    assert_eq!(netem("10.0.0.9"), Some((80_000, 0.0)));

    delay_action.stop(&delay).await.unwrap();
    assert_eq!(netem("10.0.0.9"), None);
    assert!(engine.registry().is_empty());
}
