//! Bridge networking support for `network_mode = bridge` servers.
//!
//! A bridge server shares the host's existing network segment rather than
//! routing a dedicated tunnel subnet: the tap interface is enslaved to a
//! bridge alongside the host's own link, and the bridge inherits the host
//! interface's address so clients appear as ordinary hosts on that segment.
//! Grounded in `instance.py`'s `bridge_start`/`bridge_stop`.

use std::sync::Arc;

use crate::instance::HostInterfaceData;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no host interface found for bridged network {0}")]
    NoHostInterface(String),
    #[error("network tool invocation failed: {0}")]
    ToolFailed(String),
}

/// Collaborator over host interface enumeration and bridge/tap wiring
/// commands (`ip link`, `ip addr`, `brctl` or `ip link ... type bridge`).
/// Production code backs this with [`crate::shell`] invocations; tests back
/// it with an in-memory fake.
pub trait NetworkTool: Send + Sync {
    /// Finds the host's existing, non-tunnel interface carrying `network`,
    /// along with its current address/netmask.
    fn find_host_interface(&self, network: &ipnetwork::IpNetwork) -> Option<(String, HostInterfaceData)>;
    fn create_bridge(&self, bridge_name: &str) -> Result<(), Error>;
    fn enslave(&self, bridge_name: &str, member: &str) -> Result<(), Error>;
    fn set_address(&self, interface: &str, data: &HostInterfaceData) -> Result<(), Error>;
    fn set_up(&self, interface: &str) -> Result<(), Error>;
    fn destroy_bridge(&self, bridge_name: &str) -> Result<(), Error>;
}

/// Shells out to `ip` (iproute2) for interface discovery and bridge/tap
/// wiring. No concrete equivalent exists in the retained original source
/// (only `instance.py` was kept, not `bridge.py`), so this follows the
/// crate's own [`crate::shell`] invocation style rather than a literal port.
pub struct IpNetworkTool;

impl IpNetworkTool {
    pub fn new() -> Self {
        IpNetworkTool
    }
}

impl Default for IpNetworkTool {
    fn default() -> Self {
        Self::new()
    }
}

fn mask_bits(addr: std::net::IpAddr) -> u8 {
    match addr {
        std::net::IpAddr::V4(v4) => u32::from(v4).count_ones() as u8,
        std::net::IpAddr::V6(v6) => v6.octets().iter().map(|b| b.count_ones()).sum::<u32>() as u8,
    }
}

/// Parses `ip -o addr show` output, returning the first interface whose
/// address falls inside `network`.
fn find_in_addr_show(output: &str, network: &ipnetwork::IpNetwork) -> Option<(String, HostInterfaceData)> {
    for line in output.lines() {
        let columns: Vec<&str> = line.split_whitespace().collect();
        let Some(inet_pos) = columns.iter().position(|c| *c == "inet" || *c == "inet6") else { continue };
        let interface = columns.get(1)?.to_string();
        let cidr = columns.get(inet_pos + 1)?;
        let parsed: ipnetwork::IpNetwork = cidr.parse().ok()?;
        if !network.contains(parsed.ip()) {
            continue;
        }
        let netmask = match parsed {
            ipnetwork::IpNetwork::V4(n) => std::net::IpAddr::V4(n.mask()),
            ipnetwork::IpNetwork::V6(n) => std::net::IpAddr::V6(n.mask()),
        };
        return Some((interface, HostInterfaceData { address: parsed.ip(), netmask }));
    }
    None
}

impl NetworkTool for IpNetworkTool {
    fn find_host_interface(&self, network: &ipnetwork::IpNetwork) -> Option<(String, HostInterfaceData)> {
        let output = crate::shell::run_sync("ip", &["-o".to_string(), "addr".to_string(), "show".to_string()]).ok()?;
        find_in_addr_show(&output, network)
    }

    fn create_bridge(&self, bridge_name: &str) -> Result<(), Error> {
        crate::shell::run_sync("ip", &["link".to_string(), "add".to_string(), "name".to_string(), bridge_name.to_string(), "type".to_string(), "bridge".to_string()])
            .map(|_| ())
            .map_err(|e| Error::ToolFailed(e.to_string()))
    }

    fn enslave(&self, bridge_name: &str, member: &str) -> Result<(), Error> {
        crate::shell::run_sync(
            "ip",
            &["link".to_string(), "set".to_string(), "dev".to_string(), member.to_string(), "master".to_string(), bridge_name.to_string()],
        )
        .map(|_| ())
        .map_err(|e| Error::ToolFailed(e.to_string()))
    }

    fn set_address(&self, interface: &str, data: &HostInterfaceData) -> Result<(), Error> {
        let cidr = format!("{}/{}", data.address, mask_bits(data.netmask));
        crate::shell::run_sync("ip", &["addr".to_string(), "add".to_string(), cidr, "dev".to_string(), interface.to_string()])
            .map(|_| ())
            .map_err(|e| Error::ToolFailed(e.to_string()))
    }

    fn set_up(&self, interface: &str) -> Result<(), Error> {
        crate::shell::run_sync("ip", &["link".to_string(), "set".to_string(), "dev".to_string(), interface.to_string(), "up".to_string()])
            .map(|_| ())
            .map_err(|e| Error::ToolFailed(e.to_string()))
    }

    fn destroy_bridge(&self, bridge_name: &str) -> Result<(), Error> {
        crate::shell::run_sync("ip", &["link".to_string(), "delete".to_string(), bridge_name.to_string(), "type".to_string(), "bridge".to_string()])
            .map(|_| ())
            .map_err(|e| Error::ToolFailed(e.to_string()))
    }
}

pub struct BridgeManager {
    tool: Arc<dyn NetworkTool>,
}

#[derive(Debug)]
pub struct BridgeHandle {
    pub bridge_interface: String,
    pub host_interface_data: HostInterfaceData,
}

impl BridgeManager {
    pub fn new(tool: Arc<dyn NetworkTool>) -> Self {
        BridgeManager { tool }
    }

    /// Brings up a bridge carrying `network`, enslaves both the host's
    /// existing interface and the freshly allocated tap interface to it, and
    /// migrates the host interface's address onto the bridge.
    pub fn start(&self, network: &ipnetwork::IpNetwork, tap_interface: &str, bridge_name: &str) -> Result<BridgeHandle, Error> {
        let (host_interface, host_interface_data) =
            self.tool.find_host_interface(network).ok_or_else(|| Error::NoHostInterface(network.to_string()))?;

        self.tool.create_bridge(bridge_name)?;
        self.tool.enslave(bridge_name, &host_interface)?;
        self.tool.enslave(bridge_name, tap_interface)?;
        self.tool.set_address(bridge_name, &host_interface_data)?;
        self.tool.set_up(bridge_name)?;
        self.tool.set_up(tap_interface)?;

        Ok(BridgeHandle { bridge_interface: bridge_name.to_string(), host_interface_data })
    }

    /// Tears the bridge down. Best-effort: the tap interface disappears with
    /// the OpenVPN process exit regardless, so a failure here is logged, not
    /// propagated.
    pub fn stop(&self, bridge_name: &str) {
        if let Err(err) = self.tool.destroy_bridge(bridge_name) {
            tracing::error!(bridge = bridge_name, error = %err, "failed to tear down bridge interface");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeNetworkTool {
        hosts: HashMap<String, (String, HostInterfaceData)>,
        calls: Mutex<Vec<String>>,
    }

    impl NetworkTool for FakeNetworkTool {
        fn find_host_interface(&self, network: &ipnetwork::IpNetwork) -> Option<(String, HostInterfaceData)> {
            self.hosts.get(&network.to_string()).cloned()
        }
        fn create_bridge(&self, bridge_name: &str) -> Result<(), Error> {
            self.calls.lock().unwrap().push(format!("create_bridge {bridge_name}"));
            Ok(())
        }
        fn enslave(&self, bridge_name: &str, member: &str) -> Result<(), Error> {
            self.calls.lock().unwrap().push(format!("enslave {bridge_name} {member}"));
            Ok(())
        }
        fn set_address(&self, interface: &str, _data: &HostInterfaceData) -> Result<(), Error> {
            self.calls.lock().unwrap().push(format!("set_address {interface}"));
            Ok(())
        }
        fn set_up(&self, interface: &str) -> Result<(), Error> {
            self.calls.lock().unwrap().push(format!("set_up {interface}"));
            Ok(())
        }
        fn destroy_bridge(&self, bridge_name: &str) -> Result<(), Error> {
            self.calls.lock().unwrap().push(format!("destroy_bridge {bridge_name}"));
            Ok(())
        }
    }

    #[test]
    fn find_in_addr_show_matches_interface_inside_network() {
        let output = "1: lo    inet 127.0.0.1/8 scope host lo\n\
2: eth0    inet 192.168.1.5/24 brd 192.168.1.255 scope global eth0\n";
        let network: ipnetwork::IpNetwork = "192.168.1.0/24".parse().unwrap();
        let (interface, data) = find_in_addr_show(output, &network).unwrap();
        assert_eq!(interface, "eth0");
        assert_eq!(data.address.to_string(), "192.168.1.5");
    }

    #[test]
    fn find_in_addr_show_returns_none_when_no_match() {
        let output = "1: lo    inet 127.0.0.1/8 scope host lo\n";
        let network: ipnetwork::IpNetwork = "192.168.1.0/24".parse().unwrap();
        assert!(find_in_addr_show(output, &network).is_none());
    }

    #[test]
    fn start_enslaves_host_and_tap_then_migrates_address() {
        let network: ipnetwork::IpNetwork = "192.168.1.0/24".parse().unwrap();
        let mut tool = FakeNetworkTool::default();
        tool.hosts.insert(
            network.to_string(),
            ("eth0".to_string(), HostInterfaceData { address: "192.168.1.5".parse().unwrap(), netmask: "255.255.255.0".parse().unwrap() }),
        );

        let tool = Arc::new(tool);
        let manager = BridgeManager::new(tool.clone());
        let handle = manager.start(&network, "tap0", "br_pritunl0").unwrap();
        assert_eq!(handle.bridge_interface, "br_pritunl0");

        let calls = tool.calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec![
                "create_bridge br_pritunl0".to_string(),
                "enslave br_pritunl0 eth0".to_string(),
                "enslave br_pritunl0 tap0".to_string(),
                "set_address br_pritunl0".to_string(),
                "set_up br_pritunl0".to_string(),
                "set_up tap0".to_string(),
            ]
        );
    }

    #[test]
    fn start_fails_when_no_host_interface_matches() {
        let network: ipnetwork::IpNetwork = "10.5.0.0/24".parse().unwrap();
        let tool = Arc::new(FakeNetworkTool::default());
        let manager = BridgeManager::new(tool);
        let err = manager.start(&network, "tap0", "br_pritunl0").unwrap_err();
        assert!(matches!(err, Error::NoHostInterface(_)));
    }
}
