//! Forward zone rendering: A/AAAA, CNAME, and autogenerated records.

use std::net::IpAddr;

use netgrove_realm::{Domain, NodeId, Realm};

use crate::{ip_domain, rrtype, subnet_domain};

/// Renders the forward zone for a domain.
///
/// Hosts contribute records in registry order, addresses within a host in
/// canonical-string order. A host with an `fqdn` attribute appears only in
/// the zone its fqdn belongs to, under the relative label; otherwise the
/// `hostname` attribute is used and each address is matched against its
/// effective domain. `cname` labels alias whatever label the host
/// contributed. Finally, v4 subnets carrying `dns-autogen-pattern` fill
/// their unclaimed addresses with generated A records.
pub(crate) fn render(realm: &Realm, domain: &Domain) -> String {
    let zone = domain.name();
    let suffix = format!(".{zone}");

    let mut lines = vec![
        format!("$ORIGIN {zone}."),
        "$TTL 600".to_string(),
        domain.soa_line(),
        String::new(),
    ];

    for ns in domain.ns() {
        lines.push(format!("@ IN NS {ns}."));
    }
    if !domain.ns().is_empty() {
        lines.push(String::new());
    }
    for rr in domain.rr() {
        lines.push(rr.clone());
    }
    if !domain.rr().is_empty() {
        lines.push(String::new());
    }

    for (_, host) in realm.hosts().iter() {
        let label: String;
        if let Some(fqdn) = host.attr("fqdn").filter(|s| !s.is_empty()) {
            let Some(stripped) = fqdn.strip_suffix(suffix.as_str()) else {
                // The host lives in some other zone entirely.
                continue;
            };
            label = stripped.to_string();
            for addr in host.sorted_addrs() {
                lines.push(format!("{label} IN {} {addr}", rrtype(addr)));
            }
        } else {
            let Some(hostname) = host.attr("hostname").filter(|s| !s.is_empty()) else {
                continue;
            };
            label = hostname.to_string();
            for addr in host.sorted_addrs() {
                let effective = ip_domain(realm, host, addr).filter(|s| !s.is_empty());
                if effective == Some(zone) {
                    lines.push(format!("{label} IN {} {addr}", rrtype(addr)));
                }
            }
        }

        if let Some(cnames) = host.attr("cname").filter(|s| !s.is_empty()) {
            for cname in cnames.split(',') {
                lines.push(format!("{cname} IN CNAME {label}"));
            }
        }
    }

    for &root in realm.prefixes().roots() {
        autogen(realm, root, zone, &mut lines);
    }

    lines.join("\n")
}

/// Emits generated A records for one subtree.
///
/// A v4 subnet with a pattern, a matching effective domain, and at most 8
/// host bits claims its whole block and is not descended into; every other
/// subnet just passes through to its children.
fn autogen(realm: &Realm, node: NodeId, zone: &str, lines: &mut Vec<String>) {
    let tree = realm.prefixes();
    let cidr = *tree.cidr(node);
    if !cidr.family().is_v4() {
        return;
    }

    let host_bits = 32 - cidr.len();
    let pattern = tree
        .attr(node, "dns-autogen-pattern")
        .filter(|p| !p.is_empty())
        .filter(|_| host_bits <= 8 && subnet_domain(realm, Some(node)) == Some(zone));

    let Some(pattern) = pattern else {
        for &child in tree.children(node) {
            autogen(realm, child, zone, lines);
        }
        return;
    };

    lines.push(String::new());
    for addr in cidr.iter_addrs() {
        if realm.find_host_by_ip(addr).is_some() {
            continue;
        }
        if let IpAddr::V4(v4) = addr {
            let last_octet = v4.octets()[3].to_string();
            lines.push(format!("{} IN A {addr}", pattern.replace('$', &last_octet)));
        }
    }
}
