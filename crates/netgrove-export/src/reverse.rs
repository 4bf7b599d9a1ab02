//! Reverse zone rendering: PTR records under `in-addr.arpa` / `ip6.arpa`.

use std::net::IpAddr;

use netgrove_cidr::CidrPrefix;
use netgrove_realm::{Domain, Realm};

use crate::{ip_domain, ExportError, Result};

/// Renders the reverse zone for a CIDR-named domain.
///
/// The zone origin is the reversed network part of the prefix; each record
/// label is the reversed host part of an address. Both constructions slice
/// on octet boundaries, so the prefix length must be a multiple of 8.
pub(crate) fn render(realm: &Realm, domain: &Domain, prefix: &CidrPrefix) -> Result<String> {
    if prefix.len() % 8 != 0 {
        return Err(ExportError::ReverseNotOctetAligned { prefix: *prefix });
    }

    let mut lines = vec![
        format!("$ORIGIN {}", arpa_zone(prefix)),
        "$TTL 600".to_string(),
        domain.soa_line(),
        String::new(),
    ];

    for (_, host) in realm.hosts().iter() {
        for addr in host.sorted_addrs() {
            if !prefix.contains_ip(addr) {
                continue;
            }
            if let Some(fqdn) = host.attr("fqdn").filter(|s| !s.is_empty()) {
                lines.push(format!("{} IN PTR {fqdn}.", arpa_host(prefix, addr)));
            } else if let Some(hostname) = host.attr("hostname").filter(|s| !s.is_empty()) {
                if let Some(domain) = ip_domain(realm, host, addr).filter(|s| !s.is_empty()) {
                    lines.push(format!(
                        "{} IN PTR {hostname}.{domain}.",
                        arpa_host(prefix, addr)
                    ));
                }
            }
        }
    }

    Ok(lines.join("\n"))
}

/// The `.arpa` origin label for a reverse zone prefix: the network octets
/// reversed for v4, the network nibbles reversed (low nibble first) for v6.
fn arpa_zone(prefix: &CidrPrefix) -> String {
    let network_octets = usize::from(prefix.len() / 8);
    let mut parts: Vec<String> = Vec::new();
    match prefix.first_addr() {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            for i in (0..network_octets).rev() {
                parts.push(octets[i].to_string());
            }
            parts.push("in-addr.arpa.".to_string());
        }
        IpAddr::V6(v6) => {
            let octets = v6.octets();
            for i in (0..network_octets).rev() {
                parts.push(format!("{:x}", octets[i] & 0xf));
                parts.push(format!("{:x}", octets[i] >> 4));
            }
            parts.push("ip6.arpa.".to_string());
        }
    }
    parts.join(".")
}

/// The record label for an address: its octets (v4) or nibbles (v6) above
/// the zone prefix, reversed.
fn arpa_host(prefix: &CidrPrefix, addr: IpAddr) -> String {
    let network_octets = usize::from(prefix.len() / 8);
    let mut parts: Vec<String> = Vec::new();
    match addr {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            for i in (network_octets..4).rev() {
                parts.push(octets[i].to_string());
            }
        }
        IpAddr::V6(v6) => {
            let octets = v6.octets();
            for i in (network_octets..16).rev() {
                parts.push(format!("{:x}", octets[i] & 0xf));
                parts.push(format!("{:x}", octets[i] >> 4));
            }
        }
    }
    parts.join(".")
}

#[cfg(test)]
mod tests {
    use super::*;
    use netgrove_realm::{Attrs, DomainSettings};

    fn cidr(s: &str) -> CidrPrefix {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn attrs(pairs: &[(&str, &str)]) -> Attrs {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn realm_with_reverse(name: &str) -> Realm {
        let mut realm = Realm::new("test");
        realm
            .add_domain(
                name,
                DomainSettings {
                    primary_ns: Some("ns1.example.com".into()),
                    email: Some("hostmaster@example.com".into()),
                    ..DomainSettings::default()
                },
            )
            .unwrap();
        realm
    }

    fn render_zone(realm: &Realm, name: &str) -> Result<String> {
        let domain = realm.domains().get(name).unwrap();
        let prefix = domain.reverse_prefix().unwrap();
        render(realm, domain, &prefix)
    }

    #[test]
    fn test_v4_zone_origin_and_ptr() {
        let mut realm = realm_with_reverse("192.168.144.0/24");
        realm
            .add_host(
                "vega",
                vec![ip("192.168.144.1")],
                attrs(&[("fqdn", "vega.example.com")]),
            )
            .unwrap();
        let zone = render_zone(&realm, "192.168.144.0/24").unwrap();
        assert!(zone.contains("$ORIGIN 144.168.192.in-addr.arpa."));
        assert!(zone.contains("1 IN PTR vega.example.com."));
    }

    #[test]
    fn test_v4_wider_zone_labels() {
        let mut realm = realm_with_reverse("192.168.0.0/16");
        realm
            .add_host(
                "vega",
                vec![ip("192.168.144.1")],
                attrs(&[("fqdn", "vega.example.com")]),
            )
            .unwrap();
        let zone = render_zone(&realm, "192.168.0.0/16").unwrap();
        assert!(zone.contains("$ORIGIN 168.192.in-addr.arpa."));
        assert!(zone.contains("1.144 IN PTR vega.example.com."));
    }

    #[test]
    fn test_hostname_needs_effective_domain() {
        let mut realm = realm_with_reverse("192.168.144.0/24");
        realm
            .add_prefix(
                cidr("192.168.144.0/26"),
                "lab",
                attrs(&[("domain", "example.com")]),
            )
            .unwrap();
        realm
            .add_host(
                "rigel",
                vec![ip("192.168.144.2")],
                attrs(&[("hostname", "rigel")]),
            )
            .unwrap();
        // No containing prefix carries a domain for this one.
        realm
            .add_host(
                "mute",
                vec![ip("192.168.144.200")],
                attrs(&[("hostname", "mute")]),
            )
            .unwrap();
        let zone = render_zone(&realm, "192.168.144.0/24").unwrap();
        assert!(zone.contains("2 IN PTR rigel.example.com."));
        assert!(!zone.contains("mute"));
    }

    #[test]
    fn test_addresses_outside_zone_are_skipped() {
        let mut realm = realm_with_reverse("192.168.144.0/24");
        realm
            .add_host(
                "dual",
                vec![ip("192.168.144.5"), ip("10.0.0.5")],
                attrs(&[("fqdn", "dual.example.com")]),
            )
            .unwrap();
        let zone = render_zone(&realm, "192.168.144.0/24").unwrap();
        assert!(zone.contains("5 IN PTR dual.example.com."));
        assert!(!zone.contains("10.0.0.5"));
    }

    #[test]
    fn test_misaligned_zone_fails() {
        let realm = realm_with_reverse("192.168.144.0/22");
        let err = render_zone(&realm, "192.168.144.0/22").unwrap_err();
        assert!(matches!(err, ExportError::ReverseNotOctetAligned { .. }));
    }

    #[test]
    fn test_v6_zone_nibbles() {
        let mut realm = realm_with_reverse("2001:db8::/32");
        realm
            .add_host(
                "six",
                vec![ip("2001:db8::1")],
                attrs(&[("fqdn", "six.example.com")]),
            )
            .unwrap();
        let zone = render_zone(&realm, "2001:db8::/32").unwrap();
        assert!(zone.contains("$ORIGIN 8.b.d.0.1.0.0.2.ip6.arpa."));
        // 24 host nibbles, low nibble of the last byte read first.
        let label = format!("1{}", ".0".repeat(23));
        assert!(zone.contains(&format!("{label} IN PTR six.example.com.")));
    }

    #[test]
    fn test_v6_ptr_label_splits_high_nibble() {
        let mut realm = realm_with_reverse("2001:db8::/32");
        // The trailing byte 0xab has distinct nibbles, so a label built
        // from unshifted high nibbles cannot sneak past this one.
        realm
            .add_host(
                "seven",
                vec![ip("2001:db8::ab")],
                attrs(&[("fqdn", "seven.example.com")]),
            )
            .unwrap();
        let zone = render_zone(&realm, "2001:db8::/32").unwrap();
        let label = format!("b.a{}", ".0".repeat(22));
        assert!(zone.contains(&format!("{label} IN PTR seven.example.com.")));
    }
}
