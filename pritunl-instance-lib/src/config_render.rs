//! Renders a `Server` into an OpenVPN server-mode configuration file, and
//! writes it atomically with owner-only permissions.
//!
//! Directive order and the push/no-push distinction between virtual,
//! NAT'd, and linked-peer routes follow `instance.py`'s
//! `generate_ovpn_conf`.

use std::io::Write as _;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

use ipnetwork::IpNetwork;

use crate::instance::HostInterfaceData;
use crate::server::{AdapterType, LzoCompression, NetworkMode, Protocol, Route, Server};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bridge server is missing host interface data")]
    MissingHostInterfaceData,
    #[error("IO error writing config file: {0}")]
    IO(#[from] std::io::Error),
}

fn inline_block(tag: &str, contents: &str) -> String {
    format!("<{tag}>\n{}\n</{tag}>", contents.trim_end())
}

/// First usable address of `network`, used as the gateway for non-push
/// `route`/`route-ipv6` lines. Mirrors the original's network-address-plus-one
/// convention for the OpenVPN server's own tun/tap gateway.
fn gateway_address(network: &IpNetwork) -> IpAddr {
    match network.network() {
        IpAddr::V4(addr) => IpAddr::V4(Ipv4Addr::from(u32::from(addr) + 1)),
        IpAddr::V6(addr) => IpAddr::V6(Ipv6Addr::from(u128::from(addr) + 1)),
    }
}

/// Renders a non-default, non-virtual route as a non-push `route`/`route-ipv6`
/// line with an explicit gateway — this server routes it locally rather than
/// handing it to the client.
fn gateway_route_line(network: &IpNetwork) -> String {
    match network {
        IpNetwork::V4(_) => format!("route {} {} {}", network.network(), network.mask(), gateway_address(network)),
        IpNetwork::V6(_) => format!("route-ipv6 {} {}", network, gateway_address(network)),
    }
}

/// Renders a single non-default, non-virtual route as either a pushed line
/// (client routes it) or a non-push `route`/`route-ipv6` line with an
/// explicit gateway (this server routes it locally), per `network_link`.
fn route_line(route: &Route) -> String {
    if route.network_link {
        gateway_route_line(&route.network)
    } else {
        format!("push \"route {} {}\"", route.network.network(), route.network.mask())
    }
}

/// Renders the full OpenVPN server-mode config text. Does not touch the
/// filesystem; see [`write_atomic`] for that.
pub fn render(
    server: &Server,
    interface: &str,
    management_socket_path: &Path,
    host_interface_data: Option<&HostInterfaceData>,
) -> Result<String, Error> {
    let mut lines: Vec<String> = Vec::new();

    lines.push("dev-type tun".to_string().replace("tun", match server.adapter_type {
        AdapterType::Tun => "tun",
        AdapterType::Tap => "tap",
    }));
    lines.push(format!("dev {interface}"));
    lines.push(format!("port {}", server.port));
    lines.push(format!(
        "proto {}{}",
        match server.protocol {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp-server",
        },
        if server.ipv6 { "6" } else { "" }
    ));
    if let Some(bind) = server.bind_address {
        lines.push(format!("local {bind}"));
    }

    match server.network_mode {
        NetworkMode::Tun => {
            lines.push(format!("server {} {}", server.network.network(), server.network.mask()));
            if server.ipv6
                && let Some(network6) = &server.network6
            {
                lines.push(format!("server-ipv6 {network6}"));
            }
        }
        NetworkMode::Bridge => {
            let host_data = host_interface_data.ok_or(Error::MissingHostInterfaceData)?;
            let start = server.network_start.map(|a| a.to_string()).unwrap_or_default();
            let end = server.network_end.map(|a| a.to_string()).unwrap_or_default();
            lines.push(format!("server-bridge {} {} {} {}", host_data.address, host_data.netmask, start, end));
        }
    }

    for route in server.routable_routes() {
        lines.push(route_line(route));
    }
    // A peer's own base network is never routed or pushed here — only one
    // side of a link renders a peer's *non-default* routes, the side whose
    // id is greater, so a bidirectional link doesn't duplicate them.
    for link in server.links.iter().filter(|link| link.server_id > server.id) {
        for route in link.routes.iter().filter(|r| !r.is_default() && !r.virtual_network) {
            lines.push(gateway_route_line(&route.network));
        }
    }

    lines.push(format!("keepalive {} {}", server.ping_interval, server.ping_timeout + 20));

    match server.lzo_compression {
        LzoCompression::Off => lines.push("comp-lzo no".to_string()),
        LzoCompression::On => lines.push("comp-lzo yes".to_string()),
        LzoCompression::Adaptive => lines.push("comp-lzo adaptive".to_string()),
    }

    if server.jumbo_frames {
        lines.push("tun-mtu 9000".to_string());
        lines.push("mssfix 0".to_string());
    }

    lines.push(format!("max-clients {}", server.max_clients));
    if server.inter_client {
        lines.push("client-to-client".to_string());
    }
    if server.multi_device {
        lines.push("duplicate-cn".to_string());
    }
    if server.protocol == Protocol::Udp {
        lines.push("replay-window 128".to_string());
    }

    lines.push(format!("cipher {}", server.crypto.cipher));
    lines.push(format!("auth {}", server.crypto.hash));

    lines.push(inline_block("ca", &server.crypto.ca_certificate));
    lines.push(inline_block("cert", &server.crypto.primary_user_certificate));
    lines.push(inline_block("key", &server.crypto.primary_user_private_key));
    lines.push(inline_block("dh", &server.crypto.dh_params));
    if let Some(tls_auth_key) = &server.crypto.tls_auth_key {
        lines.push(inline_block("tls-auth", tls_auth_key));
        lines.push("key-direction 0".to_string());
    }

    lines.push(format!("management {} unix", management_socket_path.display()));
    lines.push("management-client-auth".to_string());

    lines.push(format!("verb {}", if server.debug { 4 } else { 3 }));
    lines.push("persist-tun".to_string());
    lines.push("persist-key".to_string());

    lines.push(String::new());
    Ok(lines.join("\n"))
}

/// Writes `contents` to `path` via a same-directory temp file plus rename,
/// so a concurrent reader (OpenVPN re-reading on SIGHUP) never observes a
/// partially written file, with permissions restricted to the owner.
pub fn write_atomic(path: &Path, contents: &str) -> Result<(), Error> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file().set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    tmp.write_all(contents.as_bytes())?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
