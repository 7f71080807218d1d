//! Per-run instance bookkeeping.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::path::PathBuf;
use std::time::SystemTime;

use crate::orchestrator::State;
use crate::server::ServerId;

/// Identifies a single run of a single replica. Fresh every run, never reused.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub uuid::Uuid);

impl InstanceId {
    pub fn new() -> Self {
        InstanceId(uuid::Uuid::new_v4())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The row tracked in the shared datastore's `servers.instances` array.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstanceRow {
    pub instance_id: InstanceId,
    pub host_id: String,
    pub ping_timestamp: SystemTime,
}

/// Host-interface data discovered by the Bridge Manager, needed by the
/// Config Renderer when `network_mode = bridge`. Threaded explicitly through
/// the call chain rather than read back off a side-effect field on `Instance`,
/// so the renderer stays a pure function of its arguments.
#[derive(Clone, Debug, PartialEq)]
pub struct HostInterfaceData {
    pub address: std::net::IpAddr,
    pub netmask: std::net::IpAddr,
}

/// Mutable per-run bookkeeping the orchestrator threads through the run.
///
/// Not `Clone`: this is the single owner of the acquired resources and must
/// be torn down exactly once.
pub struct Instance {
    pub instance_id: InstanceId,
    pub server_id: ServerId,
    pub host_id: String,

    pub interface: Option<String>,
    pub bridge_interface: Option<String>,
    pub host_interface_data: Option<HostInterfaceData>,

    pub interrupt: bool,
    pub sock_interrupt: bool,
    pub clean_exit: bool,

    pub state: State,

    pub temp_dir: PathBuf,
    pub management_socket_path: PathBuf,
}

impl Instance {
    pub fn new(server_id: ServerId, host_id: String, temp_root: &std::path::Path) -> Self {
        let instance_id = InstanceId::new();
        let temp_dir = temp_root.join(format!("pritunl-instance-{instance_id}"));
        let management_socket_path = temp_dir.join("management.sock");
        Instance {
            instance_id,
            server_id,
            host_id,
            interface: None,
            bridge_interface: None,
            host_interface_data: None,
            interrupt: false,
            sock_interrupt: false,
            clean_exit: false,
            state: State::New,
            temp_dir,
            management_socket_path,
        }
    }
}
