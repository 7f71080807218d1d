use ctrlc::Error as CtrlcError;
use std::collections::{HashMap, HashSet};
use std::os::unix::net;
use std::path::Path;
use std::process;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pritunl_instance_lib::bridge::{self, NetworkTool};
use pritunl_instance_lib::bus::{Bus, Message, MemoryBus};
use pritunl_instance_lib::command::{Command, InstanceStatus, Response};
use pritunl_instance_lib::control::CONTROL_CHANNEL;
use pritunl_instance_lib::events::EventCoalescer;
use pritunl_instance_lib::firewall::rules::{self, RouteTable};
use pritunl_instance_lib::firewall::{IpFamily, IptablesFilter, KernelFilter};
use pritunl_instance_lib::instance::{HostInterfaceData, Instance};
use pritunl_instance_lib::orchestrator::{self, Collaborators};
use pritunl_instance_lib::registry::ResourceRegistry;
use pritunl_instance_lib::server::{Server, ServerId};
use pritunl_instance_lib::socket;
use pritunl_instance_lib::store::{ClaimOutcome, MemoryStore};
use pritunl_instance_lib::{config, logging};

mod cli;

#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const CLAIM_RETRY_WINDOW: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct RunningInfo {
    instance_id: String,
    interface: Option<String>,
}

type StatusMap = Arc<Mutex<HashMap<ServerId, RunningInfo>>>;

fn ctrlc_channel() -> Result<crossbeam_channel::Receiver<()>, exitcode::ExitCode> {
    let (sender, receiver) = crossbeam_channel::bounded(2);
    match ctrlc::set_handler(move || match sender.send(()) {
        Ok(_) => (),
        Err(e) => tracing::error!(error = ?e, "sending shutdown signal"),
    }) {
        Ok(_) => Ok(receiver),
        Err(CtrlcError::NoSuchSignal(signal_type)) => {
            tracing::error!(?signal_type, "no such signal");
            Err(exitcode::OSERR)
        }
        Err(CtrlcError::MultipleHandlers) => {
            tracing::error!("multiple handlers");
            Err(exitcode::UNAVAILABLE)
        }
        Err(CtrlcError::System(e)) => {
            tracing::error!(error = ?e, "system error");
            Err(exitcode::IOERR)
        }
    }
}

fn socket_channel(socket_path: &Path) -> Result<crossbeam_channel::Receiver<net::UnixStream>, exitcode::ExitCode> {
    match socket_path.try_exists() {
        Ok(true) => {
            tracing::error!("socket path already exists");
            return Err(exitcode::TEMPFAIL);
        }
        Ok(false) => (),
        Err(e) => {
            tracing::error!(error = ?e, "error checking socket path");
            return Err(exitcode::IOERR);
        }
    };

    let listener = match net::UnixListener::bind(socket_path) {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = ?e, "error binding socket");
            return Err(exitcode::OSFILE);
        }
    };

    Ok(socket::incoming_channel(listener))
}

/// `--standalone` swaps the firewall, bridge, and route-table collaborators
/// for no-ops so a developer can exercise the claim/heartbeat/control
/// machinery without mutating the host's iptables rules or network
/// interfaces. The datastore and bus are in-memory either way: this crate
/// has no real backend for either (see [`pritunl_instance_lib::store`] and
/// [`pritunl_instance_lib::bus`]).
fn build_collaborators(standalone: bool, config: &config::Config) -> Collaborators {
    let (kernel, network_tool, route_table): (Arc<dyn KernelFilter>, Arc<dyn NetworkTool>, Arc<dyn RouteTable>) = if standalone {
        tracing::info!("standalone mode: firewall, bridge, and route collaborators are no-ops");
        (Arc::new(NoopKernel), Arc::new(NoopNetworkTool), Arc::new(EmptyRouteTable))
    } else {
        (Arc::new(IptablesFilter::new(true)), Arc::new(bridge::IpNetworkTool::new()), Arc::new(rules::SystemRouteTable::new()))
    };

    Collaborators {
        registry: ResourceRegistry::new(),
        store: Arc::new(MemoryStore::new()),
        bus: Arc::new(MemoryBus::new()),
        kernel,
        network_tool,
        route_table,
        instance_link: Arc::new(orchestrator::LoggingInstanceLink),
        openvpn_binary: config.openvpn_binary.clone(),
        temp_root: config.temp_root.clone(),
        host_id: config.host_id.clone(),
        apply_sysctl: !standalone,
    }
}

/// Keeps one server claimed and running for as long as the daemon lives:
/// claim, run to completion, then immediately try to reclaim the slot
/// (another replica may have taken it in the meantime, or the run may have
/// ended because an operator asked for a stop).
fn worker_loop(collaborators: Arc<Collaborators>, server: Server, status: StatusMap, host_id: String) {
    let coalescer = EventCoalescer::spawn(collaborators.bus.clone(), "events".to_string());
    let ping_timeout = Duration::from_secs(server.ping_timeout as u64);

    loop {
        let instance = Instance::new(server.id, host_id.clone(), &collaborators.temp_root);
        let deadline = Instant::now() + CLAIM_RETRY_WINDOW;
        match orchestrator::claim_slot_blocking(&collaborators, &server, &instance, ping_timeout, deadline) {
            ClaimOutcome::Missed => continue,
            ClaimOutcome::Claimed { stale_evicted } if !stale_evicted.is_empty() => {
                tracing::info!(server_id = %server.id, evicted = stale_evicted.len(), "swept stale instance rows on claim");
            }
            ClaimOutcome::Claimed { .. } => {}
        }

        let mut instance = instance;
        instance.state = orchestrator::State::Claimed;
        let instance_id = instance.instance_id.to_string();
        let on_running = {
            let status = status.clone();
            let server_id = server.id;
            let instance_id = instance_id.clone();
            move |running: &Instance| {
                status.lock().expect("status map poisoned").insert(server_id, RunningInfo { instance_id: instance_id.clone(), interface: running.interface.clone() });
            }
        };

        // this daemon's in-memory store starts empty on every process start, so
        // every successful claim is a fresh admission, never a rediscovery of an
        // already-running peer.
        let locally_running: HashSet<ServerId> = status.lock().expect("status map poisoned").keys().copied().collect();
        let result = orchestrator::run(&collaborators, &server, &mut instance, &coalescer, true, &locally_running, Some(&on_running));
        status.lock().expect("status map poisoned").remove(&server.id);

        match result {
            Ok(reason) => tracing::info!(server_id = %server.id, instance_id = %instance_id, ?reason, "instance run ended"),
            Err(err) => tracing::error!(server_id = %server.id, instance_id = %instance_id, error = %err, "instance run failed"),
        }
    }
}

fn handle_connection(stream: &mut net::UnixStream, bus: &Arc<dyn Bus>, status: &StatusMap) {
    let command = match socket::read_command(stream) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "failed to read control command");
            return;
        }
    };

    tracing::debug!(command = %command, "incoming control command");

    let response = match command {
        Command::Status { server_id } => Response::Status(list_status(status, server_id)),
        Command::Stop { server_id } => dispatch(bus, status, server_id, "stop"),
        Command::ForceStop { server_id } => dispatch(bus, status, server_id, "force_stop"),
    };

    if let Err(e) = socket::write_response(stream, &response) {
        tracing::warn!(error = %e, "failed to write control response");
    }
}

fn list_status(status: &StatusMap, filter: Option<ServerId>) -> Vec<InstanceStatus> {
    status
        .lock()
        .expect("status map poisoned")
        .iter()
        .filter(|(id, _)| match filter {
            Some(target) => **id == target,
            None => true,
        })
        .map(|(id, info)| InstanceStatus { server_id: *id, instance_id: info.instance_id.clone(), state: "running".to_string(), interface: info.interface.clone() })
        .collect()
}

fn dispatch(bus: &Arc<dyn Bus>, status: &StatusMap, server_id: ServerId, payload: &str) -> Response {
    let instance_id = status.lock().expect("status map poisoned").get(&server_id).map(|info| info.instance_id.clone());
    match instance_id {
        Some(instance_id) => {
            bus.publish(Message { channel: CONTROL_CHANNEL.to_string(), resource_id: instance_id, payload: payload.to_string() });
            Response::Ok
        }
        None => Response::Error(format!("no running instance for server {server_id}")),
    }
}

fn daemon(args: &cli::Cli, config: config::Config) -> exitcode::ExitCode {
    let ctrlc_receiver = match ctrlc_channel() {
        Ok(receiver) => receiver,
        Err(exit) => return exit,
    };

    let socket_receiver = match socket_channel(&args.socket_path) {
        Ok(receiver) => receiver,
        Err(exit) => return exit,
    };

    if config.servers.is_empty() {
        tracing::warn!("no servers configured, daemon will idle with no active instances");
    }

    let collaborators = Arc::new(build_collaborators(args.standalone, &config));
    let bus = collaborators.bus.clone();
    let status: StatusMap = Arc::new(Mutex::new(HashMap::new()));

    for server in config.servers.clone() {
        let collaborators = collaborators.clone();
        let status = status.clone();
        let host_id = config.host_id.clone();
        std::thread::Builder::new()
            .name(format!("server-{}", server.id))
            .spawn(move || worker_loop(collaborators, server, status, host_id))
            .expect("failed to spawn server worker thread");
    }

    let exit_code = loop_daemon(&ctrlc_receiver, &socket_receiver, &bus, &status);

    match std::fs::remove_file(&args.socket_path) {
        Ok(_) => (),
        Err(e) => tracing::warn!(error = %e, "failed removing socket"),
    }

    exit_code
}

/// Runs until a shutdown signal arrives. Running instances are not drained
/// on the way out: each worker thread's openvpn child is left to its own
/// devices (and the init system's reaping) rather than this loop joining
/// every worker, matching the daemon's "one shot, no state to flush"
/// exit path.
fn loop_daemon(
    ctrlc_receiver: &crossbeam_channel::Receiver<()>,
    socket_receiver: &crossbeam_channel::Receiver<net::UnixStream>,
    bus: &Arc<dyn Bus>,
    status: &StatusMap,
) -> exitcode::ExitCode {
    tracing::info!("enter listening mode");
    loop {
        crossbeam_channel::select! {
            recv(ctrlc_receiver) -> _ => {
                tracing::info!("shutdown requested");
                return exitcode::OK;
            }
            recv(socket_receiver) -> stream => match stream {
                Ok(mut s) => handle_connection(&mut s, bus, status),
                Err(e) => tracing::error!(error = ?e, "error receiving control connection"),
            },
        }
    }
}

fn main() {
    let args = cli::parse();

    let (_log_reload, log_path) = match logging::init() {
        Ok(v) => v,
        Err(e) => {
            eprintln!("failed to initialize logging: {e}");
            process::exit(exitcode::SOFTWARE);
        }
    };
    tracing::info!(version = env!("CARGO_PKG_VERSION"), log_path = %log_path, "starting {}", env!("CARGO_PKG_NAME"));

    let config = match config::load(&args.config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            process::exit(exitcode::CONFIG);
        }
    };

    let exit = daemon(&args, config);

    if exit != exitcode::OK {
        tracing::warn!("abnormal exit");
    }

    process::exit(exit)
}

struct NoopKernel;

impl KernelFilter for NoopKernel {
    fn check(&self, _family: IpFamily, _argv: &[String]) -> bool {
        true
    }
    fn insert(&self, _family: IpFamily, _argv: &[String]) -> bool {
        true
    }
    fn delete(&self, _family: IpFamily, _argv: &[String]) -> bool {
        true
    }
}

struct NoopNetworkTool;

impl NetworkTool for NoopNetworkTool {
    fn find_host_interface(&self, _network: &ipnetwork::IpNetwork) -> Option<(String, HostInterfaceData)> {
        None
    }
    fn create_bridge(&self, _bridge_name: &str) -> Result<(), bridge::Error> {
        Ok(())
    }
    fn enslave(&self, _bridge_name: &str, _member: &str) -> Result<(), bridge::Error> {
        Ok(())
    }
    fn set_address(&self, _interface: &str, _data: &HostInterfaceData) -> Result<(), bridge::Error> {
        Ok(())
    }
    fn set_up(&self, _interface: &str) -> Result<(), bridge::Error> {
        Ok(())
    }
    fn destroy_bridge(&self, _bridge_name: &str) -> Result<(), bridge::Error> {
        Ok(())
    }
}

struct EmptyRouteTable;

impl RouteTable for EmptyRouteTable {
    fn ipv4(&self) -> Vec<rules::RouteTableEntry> {
        Vec::new()
    }
    fn ipv6(&self) -> Vec<rules::RouteTableEntry> {
        Vec::new()
    }
}
