//! # Netgrove Zone Export
//!
//! Renders BIND9-compatible zone files from a realm:
//!
//! - **Forward zones** (domain names): A/AAAA records from host attributes,
//!   CNAME aliases, and per-subnet autogenerated A records
//! - **Reverse zones** (CIDR-named domains): PTR records under
//!   `in-addr.arpa` / `ip6.arpa`
//!
//! Export is read-only over the realm except for one side effect: the
//! domain's serial. The rendered text is hashed (SHA-1, base64) and
//! compared against the hash of the previous export; only when the content
//! actually changed does the serial advance, so secondaries are not poked
//! for no-op exports.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

mod forward;
mod reverse;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::debug;

use netgrove_cidr::CidrPrefix;
use netgrove_realm::{Domain, Host, NodeId, Realm, RealmError};

use std::net::IpAddr;

/// Errors produced by zone export.
#[derive(Debug, Error)]
pub enum ExportError {
    /// No domain with this name exists in the realm.
    #[error("domain {name} not found in realm")]
    DomainNotFound {
        /// The absent domain name.
        name: String,
    },

    /// Reverse zones only work on whole-octet boundaries; an `in-addr.arpa`
    /// label cannot split an octet.
    #[error("reverse zone CIDR must be octet-aligned, cannot generate zone for {prefix}")]
    ReverseNotOctetAligned {
        /// The misaligned reverse zone prefix.
        prefix: CidrPrefix,
    },

    /// An underlying realm failure, e.g. serial overflow.
    #[error(transparent)]
    Realm(#[from] RealmError),
}

/// Result type for export operations.
pub type Result<T> = std::result::Result<T, ExportError>;

/// Renders the zone for `name`, advancing the serial if the content
/// changed since the last export (or unconditionally with `force`).
///
/// Returns the rendered zone text. Repeated calls without intervening
/// realm mutations return byte-identical text and leave the serial alone.
pub fn export_zone(realm: &mut Realm, name: &str, force: bool) -> Result<String> {
    let domain = get_domain(realm, name)?.clone();
    let rendered = render(realm, &domain)?;
    let hash = zone_hash(&rendered);

    if !force && domain.last_hash() == Some(hash.as_str()) {
        debug!(domain = name, "zone unchanged, serial kept");
        return Ok(rendered);
    }

    get_domain_mut(realm, name)?.inc_serial()?;
    let domain = get_domain(realm, name)?.clone();
    let rendered = render(realm, &domain)?;
    let hash = zone_hash(&rendered);
    get_domain_mut(realm, name)?.set_last_hash(hash);
    debug!(domain = name, serial = %domain.serial(), "zone exported");
    Ok(rendered)
}

fn render(realm: &Realm, domain: &Domain) -> Result<String> {
    match domain.reverse_prefix() {
        Some(prefix) => reverse::render(realm, domain, &prefix),
        None => Ok(forward::render(realm, domain)),
    }
}

fn get_domain<'a>(realm: &'a Realm, name: &str) -> Result<&'a Domain> {
    realm.domain(name).ok_or_else(|| ExportError::DomainNotFound {
        name: name.to_string(),
    })
}

fn get_domain_mut<'a>(realm: &'a mut Realm, name: &str) -> Result<&'a mut Domain> {
    realm
        .domain_mut(name)
        .ok_or_else(|| ExportError::DomainNotFound {
            name: name.to_string(),
        })
}

/// SHA-1 of the zone text, base64-encoded. Only ever compared for
/// equality against the previous export.
fn zone_hash(zone: &str) -> String {
    let digest = Sha1::digest(zone.as_bytes());
    BASE64.encode(digest)
}

/// The DNS domain an address of a host belongs to: the host's own `domain`
/// attribute, or the nearest `domain` attribute on the chain of prefixes
/// containing the address.
fn ip_domain<'a>(realm: &'a Realm, host: &'a Host, addr: IpAddr) -> Option<&'a str> {
    if let Some(domain) = host.attr("domain") {
        return Some(domain);
    }
    subnet_domain(realm, host.parent_of(addr))
}

/// The nearest `domain` attribute at or above a prefix node.
fn subnet_domain(realm: &Realm, node: Option<NodeId>) -> Option<&str> {
    let tree = realm.prefixes();
    let mut cur = node;
    while let Some(id) = cur {
        if let Some(domain) = tree.attr(id, "domain") {
            return Some(domain);
        }
        cur = tree.parent(id);
    }
    None
}

/// `A` or `AAAA`, depending on the address family.
fn rrtype(addr: IpAddr) -> &'static str {
    match addr {
        IpAddr::V4(_) => "A",
        IpAddr::V6(_) => "AAAA",
    }
}
