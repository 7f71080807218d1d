//! Static, immutable-during-a-run server configuration.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Unique identifier of a configured server, stable across replicas and hosts.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerId(pub u64);

impl Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Protocol {
    Udp,
    Tcp,
}

impl Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Udp => write!(f, "udp"),
            Protocol::Tcp => write!(f, "tcp"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum NetworkMode {
    Tun,
    Bridge,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum LzoCompression {
    Off,
    On,
    Adaptive,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum AdapterType {
    Tun,
    Tap,
}

/// A route advertised or installed by a server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub network: ipnetwork::IpNetwork,
    pub nat: bool,
    pub virtual_network: bool,
    pub network_link: bool,
}

impl Route {
    pub fn is_default(&self) -> bool {
        self.network.prefix() == 0
    }
}

/// A linked peer server, referenced by id, carrying the fields this core needs
/// to render routes and firewall rules for the link (full peer server lookup
/// is a collaborator concern; this crate only needs its routable networks).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinkPeer {
    pub server_id: ServerId,
    pub network: ipnetwork::IpNetwork,
    pub routes: Vec<Route>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Crypto {
    pub cipher: String,
    pub hash: String,
    pub ca_certificate: String,
    pub dh_params: String,
    pub tls_auth_key: Option<String>,
    pub primary_user_certificate: String,
    pub primary_user_private_key: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: ServerId,
    pub name: String,

    pub port: u16,
    pub protocol: Protocol,
    pub ipv6: bool,

    pub network: ipnetwork::IpNetwork,
    pub network6: Option<ipnetwork::Ipv6Network>,
    pub network_mode: NetworkMode,
    pub network_start: Option<std::net::IpAddr>,
    pub network_end: Option<std::net::IpAddr>,
    pub adapter_type: AdapterType,

    pub replica_count: u32,

    pub crypto: Crypto,

    pub max_clients: u32,
    pub ping_interval: u32,
    pub ping_timeout: u32,
    pub lzo_compression: LzoCompression,
    pub jumbo_frames: bool,
    pub inter_client: bool,
    pub multi_device: bool,
    pub debug: bool,
    pub ipv6_firewall: bool,
    pub bind_address: Option<std::net::IpAddr>,

    pub routes: Vec<Route>,
    pub links: Vec<LinkPeer>,

    /// Organizations whose users are pushed this server's config. Only used
    /// to target the per-organization cache-invalidation event fired on
    /// startup; this crate doesn't otherwise resolve organizations or users.
    #[serde(default)]
    pub organization_ids: Vec<String>,
}

impl Server {
    /// Non-default routes that are not virtual, for client push / peer-link emission.
    pub fn routable_routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter().filter(|r| !r.is_default() && !r.virtual_network)
    }
}
