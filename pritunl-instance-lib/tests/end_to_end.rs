mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use pritunl_instance_lib::bus::{Bus, Message, MemoryBus};
use pritunl_instance_lib::control::CONTROL_CHANNEL;
use pritunl_instance_lib::events::EventCoalescer;
use pritunl_instance_lib::instance::{Instance, InstanceRow};
use pritunl_instance_lib::orchestrator::{self, Collaborators, StopReason};
use pritunl_instance_lib::registry::ResourceRegistry;
use pritunl_instance_lib::store::{ClaimOutcome, MemoryStore};

fn build_collaborators(kernel: Arc<dyn pritunl_instance_lib::firewall::KernelFilter>, openvpn_binary: PathBuf, temp_root: PathBuf) -> Collaborators {
    Collaborators {
        registry: ResourceRegistry::new(),
        store: Arc::new(MemoryStore::new()),
        bus: Arc::new(MemoryBus::new()),
        kernel,
        network_tool: Arc::new(common::NoopNetworkTool),
        route_table: Arc::new(common::EmptyRouteTable),
        instance_link: Arc::new(orchestrator::LoggingInstanceLink),
        openvpn_binary: openvpn_binary.display().to_string(),
        temp_root,
        host_id: "host-a".to_string(),
        apply_sysctl: false,
    }
}

#[test]
fn run_installs_firewall_rules_and_tears_them_down_on_stop() {
    let dir = tempfile::tempdir().unwrap();
    let openvpn = common::fake_long_running_openvpn(dir.path());
    let kernel = Arc::new(common::RecordingKernel::default());
    let collaborators = Arc::new(build_collaborators(kernel.clone(), openvpn, dir.path().to_path_buf()));

    let server = common::sample_server(1);
    let mut instance = Instance::new(server.id, "host-a".to_string(), &collaborators.temp_root);
    let instance_id = instance.instance_id;
    let temp_dir = instance.temp_dir.clone();

    let bus = collaborators.bus.clone();
    let run_collaborators = collaborators.clone();
    let run_server = server.clone();
    let handle = std::thread::spawn(move || {
        let coalescer = EventCoalescer::spawn(run_collaborators.bus.clone(), "events".to_string());
        orchestrator::run(&run_collaborators, &run_server, &mut instance, &coalescer, true, &std::collections::HashSet::new(), None)
    });

    // give bring-up time to render the config, install rules, and spawn the child
    std::thread::sleep(Duration::from_millis(300));
    assert!(!kernel.installed.lock().unwrap().is_empty(), "expected firewall rules to be installed while running");
    assert!(temp_dir.exists(), "expected the instance temp directory to exist while running");

    bus.publish(Message { channel: CONTROL_CHANNEL.to_string(), resource_id: instance_id.to_string(), payload: "stop".to_string() });

    let result = handle.join().unwrap();
    assert!(matches!(result, Ok(StopReason::Requested)), "expected a clean requested stop, got {result:?}");
    assert!(kernel.installed.lock().unwrap().is_empty(), "expected all rules to be removed after teardown");
    assert!(!temp_dir.exists(), "expected the instance temp directory to be cleaned up after teardown");
}

#[test]
fn run_reports_crashed_when_the_child_exits_on_its_own() {
    let dir = tempfile::tempdir().unwrap();
    let openvpn = common::fake_crashing_openvpn(dir.path());
    let kernel = Arc::new(common::RecordingKernel::default());
    let collaborators = build_collaborators(kernel, openvpn, dir.path().to_path_buf());

    let server = common::sample_server(2);
    let mut instance = Instance::new(server.id, "host-a".to_string(), &collaborators.temp_root);
    let coalescer = EventCoalescer::spawn(collaborators.bus.clone(), "events".to_string());

    let result = orchestrator::run(&collaborators, &server, &mut instance, &coalescer, true, &std::collections::HashSet::new(), None);
    assert!(matches!(result, Ok(StopReason::Crashed)), "expected a crashed stop reason, got {result:?}");
    assert!(!instance.clean_exit);
}

#[test]
fn force_stop_escalates_past_the_grace_period() {
    let dir = tempfile::tempdir().unwrap();
    let openvpn = common::fake_long_running_openvpn(dir.path());
    let kernel = Arc::new(common::RecordingKernel::default());
    let collaborators = Arc::new(build_collaborators(kernel, openvpn, dir.path().to_path_buf()));

    let server = common::sample_server(3);
    let mut instance = Instance::new(server.id, "host-a".to_string(), &collaborators.temp_root);
    let instance_id = instance.instance_id;

    let bus = collaborators.bus.clone();
    let run_collaborators = collaborators.clone();
    let run_server = server.clone();
    let handle = std::thread::spawn(move || {
        let coalescer = EventCoalescer::spawn(run_collaborators.bus.clone(), "events".to_string());
        orchestrator::run(&run_collaborators, &run_server, &mut instance, &coalescer, true, &std::collections::HashSet::new(), None)
    });

    std::thread::sleep(Duration::from_millis(300));
    bus.publish(Message { channel: CONTROL_CHANNEL.to_string(), resource_id: instance_id.to_string(), payload: "force_stop".to_string() });

    let result = handle.join().unwrap();
    assert!(matches!(result, Ok(StopReason::Forced)), "expected a forced stop reason, got {result:?}");
}

#[test]
fn claim_contention_across_replicas_admits_exactly_one() {
    let store = Arc::new(MemoryStore::new());
    let server = common::sample_server(4);
    let collaborators = build_collaborators(Arc::new(common::RecordingKernel::default()), PathBuf::from("true"), std::env::temp_dir());
    let collaborators = Collaborators { store: store.clone(), ..collaborators };

    let ping_timeout = Duration::from_secs(60);
    let now = SystemTime::now();

    let replicas: Vec<_> = (0..5)
        .map(|i| {
            let row = InstanceRow { instance_id: Instance::new(server.id, format!("host-{i}"), &collaborators.temp_root).instance_id, host_id: format!("host-{i}"), ping_timestamp: now };
            collaborators.store.claim(server.id, &row, server.replica_count, ping_timeout, now)
        })
        .collect();

    let claimed = replicas.iter().filter(|r| matches!(r, Ok(ClaimOutcome::Claimed { .. }))).count();
    let missed = replicas.iter().filter(|r| matches!(r, Ok(ClaimOutcome::Missed))).count();
    assert_eq!(claimed, 1, "exactly one replica should win the claim");
    assert_eq!(missed, 4);
}

#[test]
fn claim_contention_with_replica_count_two_admits_exactly_two() {
    let store = Arc::new(MemoryStore::new());
    let mut server = common::sample_server(4);
    server.replica_count = 2;
    let collaborators = build_collaborators(Arc::new(common::RecordingKernel::default()), PathBuf::from("true"), std::env::temp_dir());
    let collaborators = Collaborators { store: store.clone(), ..collaborators };

    let ping_timeout = Duration::from_secs(60);
    let now = SystemTime::now();

    let replicas: Vec<_> = (0..5)
        .map(|i| {
            let row = InstanceRow { instance_id: Instance::new(server.id, format!("host-{i}"), &collaborators.temp_root).instance_id, host_id: format!("host-{i}"), ping_timestamp: now };
            collaborators.store.claim(server.id, &row, server.replica_count, ping_timeout, now)
        })
        .collect();

    let claimed = replicas.iter().filter(|r| matches!(r, Ok(ClaimOutcome::Claimed { .. }))).count();
    let missed = replicas.iter().filter(|r| matches!(r, Ok(ClaimOutcome::Missed))).count();
    assert_eq!(claimed, 2, "exactly replica_count replicas should win the claim");
    assert_eq!(missed, 3);
}

#[test]
fn send_events_fans_out_servers_and_per_organization_updates() {
    use pritunl_instance_lib::events::{SERVERS_UPDATED, USERS_UPDATED};

    let dir = tempfile::tempdir().unwrap();
    let openvpn = common::fake_long_running_openvpn(dir.path());
    let kernel = Arc::new(common::RecordingKernel::default());
    let collaborators = Arc::new(build_collaborators(kernel, openvpn, dir.path().to_path_buf()));

    let mut server = common::sample_server(5);
    server.organization_ids = vec!["org-a".to_string(), "org-b".to_string()];
    let mut instance = Instance::new(server.id, "host-a".to_string(), &collaborators.temp_root);
    let instance_id = instance.instance_id;

    let bus = collaborators.bus.clone();
    let mut events_sub = bus.subscribe("events");
    let run_collaborators = collaborators.clone();
    let run_server = server.clone();
    let handle = std::thread::spawn(move || {
        let coalescer = EventCoalescer::spawn(run_collaborators.bus.clone(), "events".to_string());
        orchestrator::run(&run_collaborators, &run_server, &mut instance, &coalescer, true, &std::collections::HashSet::new(), None)
    });

    let mut seen = std::collections::HashSet::new();
    for _ in 0..4 {
        if let Some(message) = events_sub.recv_timeout(Duration::from_secs(2)) {
            seen.insert((message.payload, message.resource_id));
        }
    }

    assert!(seen.contains(&(SERVERS_UPDATED.to_string(), String::new())), "expected a servers_updated event, got {seen:?}");
    assert!(seen.contains(&(USERS_UPDATED.to_string(), "org-a".to_string())), "expected a users_updated event for org-a, got {seen:?}");
    assert!(seen.contains(&(USERS_UPDATED.to_string(), "org-b".to_string())), "expected a users_updated event for org-b, got {seen:?}");

    bus.publish(Message { channel: CONTROL_CHANNEL.to_string(), resource_id: instance_id.to_string(), payload: "stop".to_string() });
    handle.join().unwrap().unwrap();
}

#[test]
fn claimed_row_is_released_once_the_run_stops() {
    use pritunl_instance_lib::store::InstanceStore;

    let dir = tempfile::tempdir().unwrap();
    let openvpn = common::fake_long_running_openvpn(dir.path());
    let store = Arc::new(MemoryStore::new());
    let collaborators = build_collaborators(Arc::new(common::RecordingKernel::default()), openvpn, dir.path().to_path_buf());
    let collaborators = Arc::new(Collaborators { store: store.clone(), ..collaborators });

    let server = common::sample_server(6);
    let mut instance = Instance::new(server.id, "host-a".to_string(), &collaborators.temp_root);
    let instance_id = instance.instance_id;

    let row = InstanceRow { instance_id, host_id: "host-a".to_string(), ping_timestamp: SystemTime::now() };
    store.claim(server.id, &row, server.replica_count, Duration::from_secs(60), SystemTime::now()).unwrap();

    let bus = collaborators.bus.clone();
    let run_collaborators = collaborators.clone();
    let run_server = server.clone();
    let handle = std::thread::spawn(move || {
        let coalescer = EventCoalescer::spawn(run_collaborators.bus.clone(), "events".to_string());
        orchestrator::run(&run_collaborators, &run_server, &mut instance, &coalescer, true, &std::collections::HashSet::new(), None)
    });

    std::thread::sleep(Duration::from_millis(300));
    bus.publish(Message { channel: CONTROL_CHANNEL.to_string(), resource_id: instance_id.to_string(), payload: "stop".to_string() });
    handle.join().unwrap().unwrap();

    let outcome = store.heartbeat(server.id, instance_id, SystemTime::now()).unwrap();
    assert_eq!(outcome, pritunl_instance_lib::store::HeartbeatOutcome::Evicted, "the row should be gone once teardown released it");
}

#[test]
fn run_starts_and_stops_a_worker_for_each_lower_id_linked_peer() {
    use pritunl_instance_lib::server::{LinkPeer, ServerId};

    let dir = tempfile::tempdir().unwrap();
    let openvpn = common::fake_long_running_openvpn(dir.path());
    let kernel = Arc::new(common::RecordingKernel::default());
    let link = Arc::new(common::RecordingInstanceLink::default());
    let collaborators = build_collaborators(kernel, openvpn, dir.path().to_path_buf());
    let collaborators = Arc::new(Collaborators { instance_link: link.clone(), ..collaborators });

    let mut server = common::sample_server(5);
    server.links = vec![
        LinkPeer { server_id: ServerId(2), network: "10.1.0.0/24".parse().unwrap(), routes: vec![] },
        LinkPeer { server_id: ServerId(9), network: "10.2.0.0/24".parse().unwrap(), routes: vec![] },
    ];
    let mut instance = Instance::new(server.id, "host-a".to_string(), &collaborators.temp_root);
    let instance_id = instance.instance_id;

    let bus = collaborators.bus.clone();
    let run_collaborators = collaborators.clone();
    let run_server = server.clone();
    let handle = std::thread::spawn(move || {
        let coalescer = EventCoalescer::spawn(run_collaborators.bus.clone(), "events".to_string());
        orchestrator::run(&run_collaborators, &run_server, &mut instance, &coalescer, true, &std::collections::HashSet::new(), None)
    });

    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(*link.started.lock().unwrap(), vec![ServerId(2)], "only the lower-id peer should get a worker");

    bus.publish(Message { channel: CONTROL_CHANNEL.to_string(), resource_id: instance_id.to_string(), payload: "stop".to_string() });
    handle.join().unwrap().unwrap();

    assert_eq!(*link.stopped.lock().unwrap(), vec![ServerId(2)], "the started worker should be stopped on teardown");
}
