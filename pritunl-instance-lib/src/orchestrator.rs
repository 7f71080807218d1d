//! Drives a single instance run through its full lifecycle: claim,
//! resource acquisition, bring-up, steady-state supervision, and teardown.
//!
//! Grounded in `instance.py`'s `run()` (the claim) and `_run_thread` (the
//! staged bring-up / teardown sequence), restructured around owned Rust
//! collaborators instead of a single God-object instance method.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::bridge::{BridgeManager, NetworkTool};
use crate::bus::Bus;
use crate::config_render;
use crate::control::{ControlCommand, ControlSubscriber};
use crate::error::OrchestratorError;
use crate::events::{Event as CoalescedEvent, EventCoalescer};
use crate::firewall::rules::RouteTable;
use crate::firewall::{self, FirewallManager, KernelFilter};
use crate::heartbeat::{Event as HeartbeatEvent, HeartbeatWriter};
use crate::instance::Instance;
use crate::instance::InstanceRow;
use crate::process::{AuxProcess, Output, SupervisedProcess};
use crate::registry::{AcquiredResources, ResourceRegistry};
use crate::server::{NetworkMode, Server};
use crate::store::{ClaimOutcome, InstanceStore};

/// An instance's position in its run, in the order a successful run visits
/// them: `New` at construction, `Claimed` once the slot is admitted,
/// `Resourced` once the interface is allocated, `Running` once the process is
/// up, `Stopping` once something ends the supervision loop, `Removed` once
/// teardown has released everything. Any stage can jump straight to
/// `Stopping` on error.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum State {
    New,
    Claimed,
    Resourced,
    Running,
    Stopping,
    Removed,
}

/// Why a run ended, for logging and for the caller deciding whether to retry.
#[derive(Debug)]
pub enum StopReason {
    /// A `stop` control command.
    Requested,
    /// `force_stop`: escalate straight to SIGKILL.
    Forced,
    /// The heartbeat writer found our row gone.
    Evicted,
    /// The openvpn process's stdout closed on its own (it exited).
    Crashed,
}

pub struct Collaborators {
    pub registry: ResourceRegistry,
    pub store: Arc<dyn InstanceStore>,
    pub bus: Arc<dyn Bus>,
    pub kernel: Arc<dyn KernelFilter>,
    pub network_tool: Arc<dyn NetworkTool>,
    pub route_table: Arc<dyn RouteTable>,
    pub instance_link: Arc<dyn InstanceLink>,
    pub openvpn_binary: String,
    pub temp_root: PathBuf,
    pub host_id: String,
    /// Whether [`bring_up`] should shell out to `sysctl` to enable kernel IP
    /// forwarding. Off in standalone mode and in tests, where there is no
    /// real tunnel to route traffic for and mutating the host's kernel
    /// parameters would be both unnecessary and, without root, fatal.
    pub apply_sysctl: bool,
}

/// Establishes and maintains the tunnel to one linked peer server.
/// The cross-host link protocol itself is a separate component; this trait
/// is the seam the orchestrator starts and stops it through.
pub trait InstanceLink: Send + Sync {
    fn start(&self, server: &Server, peer_id: crate::server::ServerId) -> Box<dyn InstanceLinkHandle>;
}

pub trait InstanceLinkHandle: Send {
    fn stop(self: Box<Self>);
}

/// Default [`InstanceLink`]: logs the worker's lifetime but opens no actual
/// tunnel, for use until a real link-protocol component is wired in.
pub struct LoggingInstanceLink;

impl InstanceLink for LoggingInstanceLink {
    fn start(&self, server: &Server, peer_id: crate::server::ServerId) -> Box<dyn InstanceLinkHandle> {
        tracing::info!(server_id = %server.id, peer_id = %peer_id, "starting linked-peer worker");
        Box::new(LoggingInstanceLinkHandle { server_id: server.id, peer_id })
    }
}

struct LoggingInstanceLinkHandle {
    server_id: crate::server::ServerId,
    peer_id: crate::server::ServerId,
}

impl InstanceLinkHandle for LoggingInstanceLinkHandle {
    fn stop(self: Box<Self>) {
        tracing::info!(server_id = %self.server_id, peer_id = %self.peer_id, "stopping linked-peer worker");
    }
}

const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(500);
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// A single non-blocking claim attempt. A missed claim means another
/// replica already owns the slot, which the caller treats as "nothing to
/// do," not an error.
pub fn claim_slot(collaborators: &Collaborators, server: &Server, instance: &Instance, ping_timeout: Duration) -> ClaimOutcome {
    let row = InstanceRow { instance_id: instance.instance_id, host_id: collaborators.host_id.clone(), ping_timestamp: SystemTime::now() };
    collaborators.store.claim(server.id, &row, server.replica_count, ping_timeout, SystemTime::now()).unwrap_or(ClaimOutcome::Missed)
}

/// Polls `claim_slot` until a free slot opens up or `deadline` passes.
/// Mirrors the original's blocking `collection.update` retried by the
/// caller's own loop rather than an unbounded spin.
pub fn claim_slot_blocking(
    collaborators: &Collaborators,
    server: &Server,
    instance: &Instance,
    ping_timeout: Duration,
    deadline: std::time::Instant,
) -> ClaimOutcome {
    loop {
        match claim_slot(collaborators, server, instance, ping_timeout) {
            ClaimOutcome::Claimed { stale_evicted } => return ClaimOutcome::Claimed { stale_evicted },
            ClaimOutcome::Missed if std::time::Instant::now() >= deadline => return ClaimOutcome::Missed,
            ClaimOutcome::Missed => std::thread::sleep(CLAIM_POLL_INTERVAL),
        }
    }
}

/// Everything acquired while bringing an instance up, owned together so
/// [`tear_down`] can release it in the right order from one place.
struct RunHandles {
    resources: AcquiredResources,
    firewall: FirewallManager,
    bridge_handle: Option<crate::bridge::BridgeHandle>,
    process: SupervisedProcess,
    /// Secondary child handle (`auth_log_process` in the original). No
    /// collaborator in this crate produces one yet; teardown still honors
    /// it so a future `InstanceCom` integration only needs to populate it.
    auth_log_process: Option<AuxProcess>,
    heartbeat: HeartbeatWriter,
    heartbeat_events: crossbeam_channel::Receiver<HeartbeatEvent>,
    control: ControlSubscriber,
    control_commands: crossbeam_channel::Receiver<ControlCommand>,
    /// One worker per outbound peer link started by [`run`], populated after
    /// bring-up succeeds and stopped in reverse by [`tear_down`].
    peer_links: Vec<Box<dyn InstanceLinkHandle>>,
}

/// Tears the bridge back down if `bring_up` fails after creating it but
/// before handing it off to [`RunHandles`], mirroring [`crate::registry::ServerLockGuard`]'s
/// release-on-drop shape rather than leaving a stray bridge interface on the
/// host after a later step in `bring_up` fails.
struct BridgeGuard {
    tool: Arc<dyn NetworkTool>,
    handle: Option<crate::bridge::BridgeHandle>,
    armed: bool,
}

impl Drop for BridgeGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Some(handle) = &self.handle {
                BridgeManager::new(self.tool.clone()).stop(&handle.bridge_interface);
            }
        }
    }
}

/// Enables kernel IP forwarding ahead of rendering rules: IPv4 is fatal on
/// failure (nothing will route without it), IPv6 is logged and tolerated,
/// matching `instance.py::enable_ip_forwarding`.
fn enable_ip_forwarding(server: &Server) -> Result<(), OrchestratorError> {
    tracing::debug!(server_id = %server.id, "enabling ip forwarding");
    crate::shell::run_sync("sysctl", &["-w".to_string(), "net.ipv4.ip_forward=1".to_string()])?;

    if server.ipv6 {
        if let Err(err) = crate::shell::run_sync("sysctl", &["-w".to_string(), "net.ipv6.conf.all.forwarding=1".to_string()]) {
            tracing::error!(server_id = %server.id, error = %err, "failed to enable IPv6 forwarding");
        }
    }
    Ok(())
}

fn bring_up(collaborators: &Collaborators, server: &Server, instance: &mut Instance) -> Result<RunHandles, OrchestratorError> {
    if collaborators.apply_sysctl {
        enable_ip_forwarding(server)?;
    } else {
        tracing::debug!(server_id = %server.id, "skipping ip forwarding (disabled for this collaborator set)");
    }

    let lock = collaborators.registry.server_lock(server.id);
    let resources = collaborators.registry.acquire_resources(server.adapter_type, &lock)?;
    instance.interface = Some(resources.interface.clone());
    instance.state = State::Resourced;

    let mut bridge_guard = if server.network_mode == NetworkMode::Bridge {
        let bridge_manager = BridgeManager::new(collaborators.network_tool.clone());
        let bridge_name = format!("br_pritunl{}", server.id);
        let handle = bridge_manager.start(&server.network, &resources.interface, &bridge_name)?;
        instance.bridge_interface = Some(handle.bridge_interface.clone());
        instance.host_interface_data = Some(handle.host_interface_data.clone());
        Some(BridgeGuard { tool: collaborators.network_tool.clone(), handle: Some(handle), armed: true })
    } else {
        None
    };

    std::fs::create_dir_all(&instance.temp_dir)?;
    let config_text = config_render::render(server, &resources.interface, &instance.management_socket_path, instance.host_interface_data.as_ref())?;
    let config_path = instance.temp_dir.join("server.conf");
    config_render::write_atomic(&config_path, &config_text)?;

    let firewall = FirewallManager::new(server.id, collaborators.kernel.clone());
    let rules = firewall::rules::generate(server, &resources.interface, &*collaborators.route_table);
    firewall.append(&rules)?;

    let process = match SupervisedProcess::spawn(&collaborators.openvpn_binary, &config_path) {
        Ok(process) => process,
        Err(err) => {
            firewall.clear();
            return Err(err.into());
        }
    };

    // past this point bring_up cannot fail, so the bridge (like `resources`)
    // is handed off to RunHandles for tear_down to release instead of being
    // torn down here on drop.
    let bridge_handle = bridge_guard.take().map(|mut guard| {
        guard.armed = false;
        guard.handle.take().expect("bridge guard handle present while armed")
    });

    let (control_tx, control_commands) = crossbeam_channel::unbounded();
    let control = ControlSubscriber::spawn(collaborators.bus.clone(), instance.instance_id, control_tx);

    let (heartbeat_tx, heartbeat_events) = crossbeam_channel::unbounded();
    let heartbeat =
        HeartbeatWriter::spawn(collaborators.store.clone(), server.id, instance.instance_id, Duration::from_secs(server.ping_interval as u64), heartbeat_tx);

    instance.state = State::Running;
    Ok(RunHandles { resources, firewall, bridge_handle, process, auth_log_process: None, heartbeat, heartbeat_events, control, control_commands, peer_links: Vec::new() })
}

/// Runs one instance end to end: bring-up, steady-state supervision until
/// something requests a stop, then teardown in reverse order. Publishes
/// `started`/`stopped` events around the supervised window.
///
/// `on_running`, if given, fires once bring-up succeeds and before the
/// supervision loop blocks, so a caller tracking instance status (e.g. the
/// daemon's control-socket status map) learns the allocated interface as
/// soon as it exists rather than only after the run ends.
///
/// `send_events`, when true, additionally fans out a [`crate::events::SERVERS_UPDATED`]
/// event and one [`crate::events::USERS_UPDATED`] event per entry in
/// `server.organization_ids` once the instance is up. A freshly-admitted
/// server passes `true`; a peer rediscovered already running at daemon
/// startup passes `false`, since nothing about it has actually changed.
///
/// `locally_running` is the set of server ids already running on this host,
/// used to decide which of `server`'s linked peers still need an outbound
/// [`InstanceLink`] worker started — see [`linked_peer_server_ids`].
pub fn run(
    collaborators: &Collaborators,
    server: &Server,
    instance: &mut Instance,
    coalescer: &EventCoalescer,
    send_events: bool,
    locally_running: &HashSet<crate::server::ServerId>,
    on_running: Option<&dyn Fn(&Instance)>,
) -> Result<StopReason, OrchestratorError> {
    let mut handles = bring_up(collaborators, server, instance)?;

    if let Some(on_running) = on_running {
        on_running(instance);
    }

    coalescer.publish(CoalescedEvent { event_type: "started".to_string(), resource_id: server.id.to_string() });

    if send_events {
        coalescer.publish(CoalescedEvent { event_type: crate::events::SERVERS_UPDATED.to_string(), resource_id: String::new() });
        for organization_id in &server.organization_ids {
            coalescer.publish(CoalescedEvent { event_type: crate::events::USERS_UPDATED.to_string(), resource_id: organization_id.clone() });
        }
    }

    handles.peer_links = linked_peer_server_ids(server, locally_running)
        .into_iter()
        .map(|peer_id| collaborators.instance_link.start(server, peer_id))
        .collect();

    let stop_reason = loop {
        crossbeam_channel::select! {
            recv(handles.control_commands) -> command => match command {
                Ok(ControlCommand::Stop) => break StopReason::Requested,
                Ok(ControlCommand::ForceStop) => break StopReason::Forced,
                Err(_) => break StopReason::Requested,
            },
            recv(handles.heartbeat_events) -> event => match event {
                Ok(HeartbeatEvent::Evicted) => break StopReason::Evicted,
                Err(_) => {}
            },
            recv(handles.process.output) -> output => match output {
                Ok(Output::Line(line)) => tracing::debug!(server_id = %server.id, line, "openvpn output"),
                Err(_) => break StopReason::Crashed,
            },
        }
    };

    instance.state = State::Stopping;
    tear_down(collaborators, server, instance, handles, &stop_reason);

    coalescer.publish(CoalescedEvent { event_type: "stopped".to_string(), resource_id: server.id.to_string() });

    if !instance.clean_exit {
        coalescer.publish(CoalescedEvent { event_type: crate::events::SERVERS_UPDATED.to_string(), resource_id: String::new() });
    }

    Ok(stop_reason)
}

fn tear_down(collaborators: &Collaborators, server: &Server, instance: &mut Instance, mut handles: RunHandles, reason: &StopReason) {
    match reason {
        StopReason::Forced => handles.process.force_kill(),
        _ => {
            handles.process.stop();
            let deadline = std::time::Instant::now() + STOP_GRACE_PERIOD;
            loop {
                if matches!(handles.process.try_wait(), Ok(Some(_))) {
                    break;
                }
                if std::time::Instant::now() >= deadline {
                    handles.process.force_kill();
                    break;
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }

    if let Some(auth_log_process) = &mut handles.auth_log_process {
        auth_log_process.interrupt();
    }

    for peer_link in handles.peer_links.drain(..) {
        peer_link.stop();
    }

    handles.control.stop();
    handles.heartbeat.stop();
    handles.firewall.clear();
    drop(handles.resources);

    if let Some(bridge_handle) = handles.bridge_handle {
        let bridge_manager = BridgeManager::new(collaborators.network_tool.clone());
        bridge_manager.stop(&bridge_handle.bridge_interface);
    }

    if let Err(err) = std::fs::remove_dir_all(&instance.temp_dir) {
        tracing::warn!(server_id = %server.id, error = %err, "failed to remove instance temp directory");
    }

    match collaborators.store.release(server.id, instance.instance_id) {
        Ok(outcome) if !outcome.row_removed => {
            tracing::debug!(server_id = %server.id, "instance row already gone at release time");
        }
        Err(err) => tracing::error!(server_id = %server.id, error = %err, "failed to release instance row"),
        _ => {}
    }

    instance.clean_exit = matches!(reason, StopReason::Requested | StopReason::Forced);
    instance.state = State::Removed;
}

/// Of a server's linked peers, the ones not already running locally whose
/// id is less than ours — the tie-break that ensures exactly one side of a
/// bidirectional link starts the redundant worker for the other, matching
/// `instance.py`'s `self.server.id > link_doc['server_id']`.
pub fn linked_peer_server_ids(server: &Server, locally_running: &HashSet<crate::server::ServerId>) -> Vec<crate::server::ServerId> {
    server.links.iter().map(|link| link.server_id).filter(|id| !locally_running.contains(id) && *id < server.id).collect()
}
