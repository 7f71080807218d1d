use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Mutex;

use pritunl_instance_lib::bridge::NetworkTool;
use pritunl_instance_lib::firewall::rules::{RouteTable, RouteTableEntry};
use pritunl_instance_lib::firewall::{IpFamily, KernelFilter};
use pritunl_instance_lib::instance::HostInterfaceData;
use pritunl_instance_lib::orchestrator::{InstanceLink, InstanceLinkHandle};
use pritunl_instance_lib::server::{AdapterType, Crypto, LzoCompression, NetworkMode, Protocol, Server, ServerId};

/// A minimal, fully-populated server definition, cheap to tweak per test.
pub fn sample_server(id: u64) -> Server {
    Server {
        id: ServerId(id),
        name: "test".to_string(),
        port: 1194,
        protocol: Protocol::Udp,
        ipv6: false,
        network: "10.8.0.0/24".parse().unwrap(),
        network6: None,
        network_mode: NetworkMode::Tun,
        network_start: None,
        network_end: None,
        adapter_type: AdapterType::Tun,
        replica_count: 1,
        crypto: Crypto {
            cipher: "aes-256-gcm".to_string(),
            hash: "sha256".to_string(),
            ca_certificate: String::new(),
            dh_params: String::new(),
            tls_auth_key: None,
            primary_user_certificate: String::new(),
            primary_user_private_key: String::new(),
        },
        max_clients: 10,
        ping_interval: 10,
        ping_timeout: 60,
        lzo_compression: LzoCompression::Off,
        jumbo_frames: false,
        inter_client: true,
        multi_device: true,
        debug: false,
        ipv6_firewall: false,
        bind_address: None,
        routes: vec![],
        links: vec![],
        organization_ids: vec![],
    }
}

/// Writes an executable shell script standing in for the `openvpn` binary:
/// it ignores its `--config <path>` arguments and sleeps, so a test can
/// drive a full bring-up and steady-state supervision without a real
/// OpenVPN install.
pub fn fake_long_running_openvpn(dir: &std::path::Path) -> PathBuf {
    let path = dir.join("fake-openvpn");
    std::fs::write(&path, "#!/bin/sh\nexec sleep 60\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Writes an executable shell script standing in for an `openvpn` that
/// crashes the moment it starts.
pub fn fake_crashing_openvpn(dir: &std::path::Path) -> PathBuf {
    let path = dir.join("fake-openvpn-crash");
    std::fs::write(&path, "#!/bin/sh\nexit 1\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

pub struct NoopNetworkTool;

impl NetworkTool for NoopNetworkTool {
    fn find_host_interface(&self, _network: &ipnetwork::IpNetwork) -> Option<(String, HostInterfaceData)> {
        None
    }
    fn create_bridge(&self, _bridge_name: &str) -> Result<(), pritunl_instance_lib::bridge::Error> {
        Ok(())
    }
    fn enslave(&self, _bridge_name: &str, _member: &str) -> Result<(), pritunl_instance_lib::bridge::Error> {
        Ok(())
    }
    fn set_address(&self, _interface: &str, _data: &HostInterfaceData) -> Result<(), pritunl_instance_lib::bridge::Error> {
        Ok(())
    }
    fn set_up(&self, _interface: &str) -> Result<(), pritunl_instance_lib::bridge::Error> {
        Ok(())
    }
    fn destroy_bridge(&self, _bridge_name: &str) -> Result<(), pritunl_instance_lib::bridge::Error> {
        Ok(())
    }
}

pub struct EmptyRouteTable;

impl RouteTable for EmptyRouteTable {
    fn ipv4(&self) -> Vec<RouteTableEntry> {
        Vec::new()
    }
    fn ipv6(&self) -> Vec<RouteTableEntry> {
        Vec::new()
    }
}

/// Records every peer-link worker started and stopped, so a test can assert
/// which peers got one and that teardown stops all of them.
#[derive(Default)]
pub struct RecordingInstanceLink {
    pub started: Mutex<Vec<ServerId>>,
    pub stopped: std::sync::Arc<Mutex<Vec<ServerId>>>,
}

impl InstanceLink for RecordingInstanceLink {
    fn start(&self, _server: &Server, peer_id: ServerId) -> Box<dyn InstanceLinkHandle> {
        self.started.lock().unwrap().push(peer_id);
        Box::new(RecordingInstanceLinkHandle { peer_id, stopped: self.stopped.clone() })
    }
}

struct RecordingInstanceLinkHandle {
    peer_id: ServerId,
    stopped: std::sync::Arc<Mutex<Vec<ServerId>>>,
}

impl InstanceLinkHandle for RecordingInstanceLinkHandle {
    fn stop(self: Box<Self>) {
        self.stopped.lock().unwrap().push(self.peer_id);
    }
}

/// Records every insert/delete so a test can assert the firewall rule set
/// left behind after teardown is empty again.
#[derive(Default)]
pub struct RecordingKernel {
    pub installed: Mutex<Vec<(IpFamily, Vec<String>)>>,
}

impl KernelFilter for RecordingKernel {
    fn check(&self, family: IpFamily, argv: &[String]) -> bool {
        self.installed.lock().unwrap().iter().any(|(f, a)| *f == family && a == argv)
    }
    fn insert(&self, family: IpFamily, argv: &[String]) -> bool {
        self.installed.lock().unwrap().push((family, argv.to_vec()));
        true
    }
    fn delete(&self, family: IpFamily, argv: &[String]) -> bool {
        let mut installed = self.installed.lock().unwrap();
        let before = installed.len();
        installed.retain(|(f, a)| !(*f == family && a == argv));
        installed.len() != before
    }
}
