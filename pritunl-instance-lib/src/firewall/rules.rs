//! Rule generation: turns a [`Server`] plus the host's routing table into the
//! IPv4/IPv6 rule set the [`super::FirewallManager`] installs.
//!
//! Grounded directly in the egress-selection and rule-shape of
//! `generate_iptables_rules`: base accept rules for the tunnel interface, an
//! optional IPv6 default-drop posture, then a MASQUERADE + symmetric FORWARD
//! triple per NAT'd route, with the egress interface chosen by longest-prefix
//! match against the host's routing table rather than assumed to be the
//! default route.

use std::net::Ipv4Addr;

use ipnetwork::{IpNetwork, Ipv4Network};

use super::{IpFamily, Rule};
use crate::server::Server;

/// One entry of the host's IPv4 or IPv6 routing table, as reported by `route
/// -n` / `route -n -A inet6` (or their netlink equivalents).
#[derive(Clone, Debug, PartialEq)]
pub struct RouteTableEntry {
    pub destination: IpNetwork,
    pub interface: String,
}

/// Collaborator over the host's routing tables. Production code parses `ip
/// route` output; tests supply a fixed table.
pub trait RouteTable: Send + Sync {
    fn ipv4(&self) -> Vec<RouteTableEntry>;
    fn ipv6(&self) -> Vec<RouteTableEntry>;
}

/// Shells out to `route -n` / `route -n -A inet6`, following
/// `generate_iptables_rules`'s table parsing: malformed or short lines
/// (headers included) are silently skipped rather than failing the pass.
pub struct SystemRouteTable;

impl SystemRouteTable {
    pub fn new() -> Self {
        SystemRouteTable
    }
}

impl Default for SystemRouteTable {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_ipv4_table(output: &str) -> Vec<RouteTableEntry> {
    let mut entries = Vec::new();
    for line in output.lines() {
        let columns: Vec<&str> = line.split_whitespace().collect();
        if columns.len() < 8 {
            continue;
        }
        let (Ok(destination), Ok(genmask)) = (columns[0].parse::<Ipv4Addr>(), columns[2].parse::<Ipv4Addr>()) else {
            continue;
        };
        let prefix = u32::from(genmask).count_ones() as u8;
        let Ok(network) = Ipv4Network::new(destination, prefix) else {
            continue;
        };
        entries.push(RouteTableEntry { destination: IpNetwork::V4(network), interface: columns[7].to_string() });
    }
    entries
}

fn parse_ipv6_table(output: &str) -> Vec<RouteTableEntry> {
    let mut entries = Vec::new();
    for line in output.lines() {
        let columns: Vec<&str> = line.split_whitespace().collect();
        if columns.len() < 7 {
            continue;
        }
        let Ok(destination) = columns[0].parse::<IpNetwork>() else {
            continue;
        };
        entries.push(RouteTableEntry { destination, interface: columns[6].to_string() });
    }
    entries
}

impl RouteTable for SystemRouteTable {
    fn ipv4(&self) -> Vec<RouteTableEntry> {
        match crate::shell::run_sync("route", &["-n".to_string()]) {
            Ok(output) => parse_ipv4_table(&output),
            Err(err) => {
                tracing::error!(error = %err, "failed to read IPv4 routing table");
                Vec::new()
            }
        }
    }

    fn ipv6(&self) -> Vec<RouteTableEntry> {
        match crate::shell::run_sync("route", &["-n".to_string(), "-A".to_string(), "inet6".to_string()]) {
            Ok(output) => parse_ipv6_table(&output),
            Err(err) => {
                tracing::error!(error = %err, "failed to read IPv6 routing table");
                Vec::new()
            }
        }
    }
}

fn is_default_route(entry: &RouteTableEntry) -> bool {
    entry.destination.prefix() == 0
}

/// Picks the egress interface for `target`: the narrowest routing-table entry
/// whose destination contains `target`'s network address, excluding the
/// default route, falling back to the default route's interface.
///
/// Permissive by design: a malformed or sparse routing table (common in
/// containers and CI) degrades to "use the default interface" rather than
/// failing the whole rule-generation pass.
pub fn resolve_egress_interface(entries: &[RouteTableEntry], target: &IpNetwork) -> Option<String> {
    let default_interface = entries.iter().find(|e| is_default_route(e)).map(|e| e.interface.clone());

    let mut best: Option<&RouteTableEntry> = None;
    for entry in entries {
        if is_default_route(entry) {
            continue;
        }
        if entry.destination.contains(target.network()) {
            best = match best {
                Some(current) if current.destination.prefix() >= entry.destination.prefix() => Some(current),
                _ => Some(entry),
            };
        }
    }

    best.map(|e| e.interface.clone()).or(default_interface)
}

fn comment_arg(server_id: &crate::server::ServerId) -> Vec<String> {
    vec!["-m".to_string(), "comment".to_string(), "--comment".to_string(), format!("pritunl_{server_id}")]
}

fn accept(family: IpFamily, chain: &str, iface_flag: &str, interface: &str, server_id: &crate::server::ServerId) -> Rule {
    let mut argv = vec![chain.to_string(), iface_flag.to_string(), interface.to_string(), "-j".to_string(), "ACCEPT".to_string()];
    argv.extend(comment_arg(server_id));
    Rule::new(family, argv)
}

/// Builds the complete rule set for a running instance.
///
/// `tun_interface` is the allocated adapter name; `route_table` supplies the
/// host's current routing tables for egress resolution.
pub fn generate(server: &Server, tun_interface: &str, route_table: &dyn RouteTable) -> Vec<Rule> {
    let mut rules = Vec::new();

    rules.push(accept(IpFamily::V4, "INPUT", "-i", tun_interface, &server.id));
    rules.push(accept(IpFamily::V4, "FORWARD", "-i", tun_interface, &server.id));

    if server.ipv6 {
        rules.push(accept(IpFamily::V6, "INPUT", "-i", tun_interface, &server.id));
        rules.push(accept(IpFamily::V6, "FORWARD", "-i", tun_interface, &server.id));

        if server.ipv6_firewall {
            let mut drop = vec!["FORWARD".to_string(), "-o".to_string(), tun_interface.to_string(), "-j".to_string(), "DROP".to_string()];
            drop.extend(comment_arg(&server.id));
            rules.push(Rule::new(IpFamily::V6, drop));

            let mut established = vec![
                "FORWARD".to_string(),
                "-o".to_string(),
                tun_interface.to_string(),
                "-m".to_string(),
                "state".to_string(),
                "--state".to_string(),
                "ESTABLISHED,RELATED".to_string(),
                "-j".to_string(),
                "ACCEPT".to_string(),
            ];
            established.extend(comment_arg(&server.id));
            rules.push(Rule::new(IpFamily::V6, established));

            let mut icmpv6 = vec![
                "FORWARD".to_string(),
                "-o".to_string(),
                tun_interface.to_string(),
                "-p".to_string(),
                "icmpv6".to_string(),
                "-j".to_string(),
                "ACCEPT".to_string(),
            ];
            icmpv6.extend(comment_arg(&server.id));
            rules.push(Rule::new(IpFamily::V6, icmpv6));
        }
    }

    let ipv4_table = route_table.ipv4();
    let ipv6_table = route_table.ipv6();

    for route in server.routes.iter().filter(|r| r.nat && !r.is_default()) {
        let family = match route.network {
            IpNetwork::V4(_) => IpFamily::V4,
            IpNetwork::V6(_) => IpFamily::V6,
        };
        let table = match family {
            IpFamily::V4 => &ipv4_table,
            IpFamily::V6 => &ipv6_table,
        };
        let Some(egress) = resolve_egress_interface(table, &route.network) else {
            tracing::warn!(server_id = %server.id, route = %route.network, "no egress interface found for NAT route, skipping");
            continue;
        };

        let mut masquerade = vec![
            "POSTROUTING".to_string(),
            "-t".to_string(),
            "nat".to_string(),
            "-s".to_string(),
            route.network.to_string(),
            "-o".to_string(),
            egress,
            "-j".to_string(),
            "MASQUERADE".to_string(),
        ];
        masquerade.extend(comment_arg(&server.id));
        rules.push(Rule::new(family, masquerade));

        let mut fwd_out = vec![
            "FORWARD".to_string(),
            "-s".to_string(),
            route.network.to_string(),
            "-i".to_string(),
            tun_interface.to_string(),
            "-j".to_string(),
            "ACCEPT".to_string(),
        ];
        fwd_out.extend(comment_arg(&server.id));
        rules.push(Rule::new(family, fwd_out));

        let mut fwd_in = vec![
            "FORWARD".to_string(),
            "-d".to_string(),
            route.network.to_string(),
            "-o".to_string(),
            tun_interface.to_string(),
            "-m".to_string(),
            "state".to_string(),
            "--state".to_string(),
            "ESTABLISHED,RELATED".to_string(),
            "-j".to_string(),
            "ACCEPT".to_string(),
        ];
        fwd_in.extend(comment_arg(&server.id));
        rules.push(Rule::new(family, fwd_in));
    }

    // Linked-peer networks are source-NATed out the same egress a NAT'd
    // route would use, so return traffic to the peer's clients isn't
    // dropped for lacking a route back, plus a symmetric FORWARD accept.
    for link in &server.links {
        let family = match link.network {
            IpNetwork::V4(_) => IpFamily::V4,
            IpNetwork::V6(_) => IpFamily::V6,
        };
        let table = match family {
            IpFamily::V4 => &ipv4_table,
            IpFamily::V6 => &ipv6_table,
        };

        if let Some(egress) = resolve_egress_interface(table, &link.network) {
            let mut masquerade = vec![
                "POSTROUTING".to_string(),
                "-t".to_string(),
                "nat".to_string(),
                "-s".to_string(),
                link.network.to_string(),
                "-o".to_string(),
                egress,
                "-j".to_string(),
                "MASQUERADE".to_string(),
            ];
            masquerade.extend(comment_arg(&server.id));
            rules.push(Rule::new(family, masquerade));
        } else {
            tracing::warn!(server_id = %server.id, link = %link.network, "no egress interface found for linked-peer network, skipping masquerade");
        }

        let mut fwd_out = vec![
            "FORWARD".to_string(),
            "-s".to_string(),
            link.network.to_string(),
            "-i".to_string(),
            tun_interface.to_string(),
            "-j".to_string(),
            "ACCEPT".to_string(),
        ];
        fwd_out.extend(comment_arg(&server.id));
        rules.push(Rule::new(family, fwd_out));

        let mut fwd_in = vec![
            "FORWARD".to_string(),
            "-d".to_string(),
            link.network.to_string(),
            "-o".to_string(),
            tun_interface.to_string(),
            "-j".to_string(),
            "ACCEPT".to_string(),
        ];
        fwd_in.extend(comment_arg(&server.id));
        rules.push(Rule::new(family, fwd_in));
    }

    rules
}
