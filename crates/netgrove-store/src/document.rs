//! The document profile: one JSON document per realm.
//!
//! The document nests prefixes the way the tree nests them, so containment
//! is visible in the structure itself. Hosts carry their address lists at
//! the realm level; the address index and the per-address back-references
//! are derived data and are rebuilt on load, then cross-checked against
//! the document's own nesting.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use netgrove_cidr::CidrPrefix;
use netgrove_realm::{Attrs, Domain, DomainSettings, NodeId, Realm, RealmError, ZoneSerial};

use crate::{Result, StoreError};

#[derive(Debug, Serialize, Deserialize)]
struct RealmDoc {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Description", default, skip_serializing_if = "String::is_empty")]
    description: String,
    #[serde(rename = "Subnets", default, skip_serializing_if = "Vec::is_empty")]
    subnets: Vec<SubnetDoc>,
    #[serde(rename = "Hosts", default, skip_serializing_if = "Vec::is_empty")]
    hosts: Vec<HostDoc>,
    #[serde(rename = "Domains", default, skip_serializing_if = "BTreeMap::is_empty")]
    domains: BTreeMap<String, DomainDoc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SubnetDoc {
    #[serde(rename = "Net")]
    net: CidrPrefix,
    #[serde(rename = "Name", default, skip_serializing_if = "String::is_empty")]
    name: String,
    #[serde(rename = "Attrs", default, skip_serializing_if = "BTreeMap::is_empty")]
    attrs: Attrs,
    #[serde(rename = "Subnets", default, skip_serializing_if = "Vec::is_empty")]
    subnets: Vec<SubnetDoc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct HostDoc {
    #[serde(rename = "Name", default, skip_serializing_if = "String::is_empty")]
    name: String,
    #[serde(rename = "Addrs")]
    addrs: Vec<IpAddr>,
    #[serde(rename = "Attrs", default, skip_serializing_if = "BTreeMap::is_empty")]
    attrs: Attrs,
}

#[derive(Debug, Serialize, Deserialize)]
struct DomainDoc {
    #[serde(rename = "PrimaryNS")]
    primary_ns: String,
    #[serde(rename = "Email")]
    email: String,
    #[serde(rename = "SlaveRefresh")]
    refresh_secs: u64,
    #[serde(rename = "SlaveRetry")]
    retry_secs: u64,
    #[serde(rename = "SlaveExpiry")]
    expiry_secs: u64,
    #[serde(rename = "NXDomainTTL")]
    nxdomain_ttl_secs: u64,
    #[serde(rename = "Serial")]
    serial: ZoneSerial,
    #[serde(rename = "LastHash", default, skip_serializing_if = "Option::is_none")]
    last_hash: Option<String>,
    #[serde(rename = "NS", default, skip_serializing_if = "Vec::is_empty")]
    ns: Vec<String>,
    #[serde(rename = "RR", default, skip_serializing_if = "Vec::is_empty")]
    rr: Vec<String>,
}

/// Serializes a realm to a pretty-printed JSON document.
pub fn dump_realm(realm: &Realm) -> Result<String> {
    let doc = to_doc(realm);
    Ok(serde_json::to_string_pretty(&doc)?)
}

/// Deserializes a realm from a JSON document, rebuilding all indexes and
/// validating every invariant. Corrupt documents are refused.
pub fn load_realm(text: &str) -> Result<Realm> {
    let doc: RealmDoc = serde_json::from_str(text)?;
    from_doc(doc)
}

/// Writes a realm document to a file.
pub fn save_file(realm: &Realm, path: impl AsRef<Path>) -> Result<()> {
    let text = dump_realm(realm)?;
    std::fs::write(path.as_ref(), text)?;
    debug!(realm = realm.name(), path = %path.as_ref().display(), "realm saved");
    Ok(())
}

/// Reads a realm document from a file.
pub fn load_file(path: impl AsRef<Path>) -> Result<Realm> {
    let text = std::fs::read_to_string(path)?;
    load_realm(&text)
}

fn to_doc(realm: &Realm) -> RealmDoc {
    let tree = realm.prefixes();
    RealmDoc {
        name: realm.name().to_string(),
        description: realm.description().to_string(),
        subnets: tree.roots().iter().map(|&r| subnet_doc(realm, r)).collect(),
        hosts: realm
            .hosts()
            .iter()
            .map(|(_, host)| HostDoc {
                name: host.name().to_string(),
                addrs: host.addrs().to_vec(),
                attrs: host.attrs().clone(),
            })
            .collect(),
        domains: realm
            .domains()
            .iter()
            .map(|domain| (domain.name().to_string(), domain_doc(domain)))
            .collect(),
    }
}

fn subnet_doc(realm: &Realm, node: NodeId) -> SubnetDoc {
    let tree = realm.prefixes();
    SubnetDoc {
        net: *tree.cidr(node),
        name: tree.name(node).to_string(),
        attrs: tree.attrs(node).clone(),
        subnets: tree
            .children(node)
            .iter()
            .map(|&c| subnet_doc(realm, c))
            .collect(),
    }
}

fn domain_doc(domain: &Domain) -> DomainDoc {
    DomainDoc {
        primary_ns: domain.soa().primary_ns.clone(),
        email: domain.soa().email.clone(),
        refresh_secs: domain.soa().refresh.as_secs(),
        retry_secs: domain.soa().retry.as_secs(),
        expiry_secs: domain.soa().expiry.as_secs(),
        nxdomain_ttl_secs: domain.soa().nxdomain_ttl.as_secs(),
        serial: domain.serial(),
        last_hash: domain.last_hash().map(ToString::to_string),
        ns: domain.ns().to_vec(),
        rr: domain.rr().to_vec(),
    }
}

fn from_doc(doc: RealmDoc) -> Result<Realm> {
    let mut realm = Realm::new(doc.name);
    realm.set_description(doc.description);

    for subnet in doc.subnets {
        restore_subnet(&mut realm, subnet, None)?;
    }

    for host in doc.hosts {
        realm.add_host(host.name, host.addrs, host.attrs)?;
    }

    for (name, dom) in doc.domains {
        let settings = DomainSettings {
            primary_ns: Some(dom.primary_ns),
            email: Some(dom.email),
            refresh: Some(Duration::from_secs(dom.refresh_secs)),
            retry: Some(Duration::from_secs(dom.retry_secs)),
            expiry: Some(Duration::from_secs(dom.expiry_secs)),
            nxdomain_ttl: Some(Duration::from_secs(dom.nxdomain_ttl_secs)),
        };
        realm.add_domain(&name, settings)?;
        if let Some(domain) = realm.domain_mut(&name) {
            domain.restore(dom.serial, dom.last_hash);
            for ns in dom.ns {
                domain.add_ns(ns);
            }
            for rr in dom.rr {
                domain.add_record(rr);
            }
        }
    }

    realm.validate()?;
    debug!(realm = realm.name(), "realm loaded from document");
    Ok(realm)
}

/// Replays one nested subnet into the realm and checks that the tree puts
/// it exactly where the document nested it; a divergence means the
/// document's structure contradicts CIDR containment.
fn restore_subnet(realm: &mut Realm, doc: SubnetDoc, parent: Option<CidrPrefix>) -> Result<()> {
    let net = doc.net;
    let node = realm.add_prefix(net, doc.name, doc.attrs)?;
    let actual_parent = realm
        .prefixes()
        .parent(node)
        .map(|p| *realm.prefixes().cidr(p));
    if actual_parent != parent {
        return Err(StoreError::Realm(RealmError::Corrupt {
            message: format!(
                "document nests {net} under {}, but its container is {}",
                fmt_parent(parent),
                fmt_parent(actual_parent)
            ),
        }));
    }
    for child in doc.subnets {
        restore_subnet(realm, child, Some(net))?;
    }
    Ok(())
}

fn fmt_parent(parent: Option<CidrPrefix>) -> String {
    parent.map_or_else(|| "the root level".to_string(), |p| p.to_string())
}
