//! # Netgrove Realm Model
//!
//! A realm is one self-contained IPAM universe: a forest of allocated CIDR
//! prefixes, a registry of hosts keyed by their addresses, and a registry of
//! DNS domains with SOA metadata and date-based serials.
//!
//! The [`Realm`] type is the mutation boundary. Its three members cross-link
//! heavily (prefix nodes carry bags of the hosts they contain, hosts carry
//! back-references to their deepest containing prefix), so every public
//! mutator goes through the realm, which reconciles the links before
//! returning. Mutators are all-or-nothing: validation happens before any
//! structure is touched, and a returned error means the realm is unchanged.
//!
//! A realm is not internally synchronized. Callers that share one across
//! threads wrap it in a mutual-exclusion primitive; the `netgrove` facade
//! crate provides a ready-made wrapper.
//!
//! ## Example
//!
//! ```rust
//! use netgrove_realm::{Attrs, Realm};
//!
//! let mut realm = Realm::new("home");
//! realm
//!     .add_prefix("192.168.144.0/22".parse().unwrap(), "lab", Attrs::new())
//!     .unwrap();
//! let host = realm
//!     .add_host("vega", vec!["192.168.144.1".parse().unwrap()], Attrs::new())
//!     .unwrap();
//!
//! let addr = "192.168.144.1".parse().unwrap();
//! assert_eq!(realm.find_host_by_ip(addr), Some(host));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]

mod domains;
mod hosts;
mod tree;

pub use domains::{Domain, DomainRegistry, DomainSettings, Soa, ZoneSerial};
pub use hosts::{Host, HostId, HostRegistry};
pub use tree::{Ancestors, NodeId, PrefixTree};

use std::collections::BTreeMap;
use std::net::IpAddr;

use chrono::NaiveDate;
use thiserror::Error;
use tracing::debug;

use netgrove_cidr::{canonical_ip, CidrPrefix};

/// Free-form string attributes attached to prefixes and hosts.
///
/// Attribute bags drive zone export: `fqdn`, `hostname`, `cname` and
/// `domain` on hosts, `domain` and `dns-autogen-pattern` on prefixes.
pub type Attrs = BTreeMap<String, String>;

/// Errors produced by realm mutators and lookups.
#[derive(Debug, Error)]
pub enum RealmError {
    /// Unparseable CIDR prefix or address.
    #[error(transparent)]
    Malformed(#[from] netgrove_cidr::ParseError),

    /// A host-length prefix cannot be allocated; add a host instead.
    #[error("cannot allocate {prefix}: it is a host address")]
    HostAddressDisallowed {
        /// The rejected prefix.
        prefix: CidrPrefix,
    },

    /// The exact prefix is already allocated in this realm.
    #[error("{prefix} already allocated as {name:?}")]
    AlreadyAllocated {
        /// The conflicting prefix.
        prefix: CidrPrefix,
        /// Name of the existing allocation.
        name: String,
    },

    /// No allocation with the exact prefix exists.
    #[error("prefix {prefix} not found in realm")]
    PrefixNotFound {
        /// The prefix that was looked up.
        prefix: CidrPrefix,
    },

    /// A host must own at least one address.
    #[error("host {name:?} has no addresses")]
    NoAddresses {
        /// Name of the rejected host.
        name: String,
    },

    /// The address already belongs to another host in this realm.
    #[error("address {address} already belongs to {owner:?}")]
    AddressInUse {
        /// The conflicting address.
        address: IpAddr,
        /// Name of the host that owns it.
        owner: String,
    },

    /// The host handle does not name a live host.
    #[error("host not found in realm")]
    HostNotFound,

    /// The host does not own the given address.
    #[error("host {name:?} does not have the address {address}")]
    AddressNotFound {
        /// The host name.
        name: String,
        /// The absent address.
        address: IpAddr,
    },

    /// A domain with the same name already exists.
    #[error("domain {name} already exists in realm")]
    DomainExists {
        /// The conflicting domain name.
        name: String,
    },

    /// No domain with the given name exists.
    #[error("domain {name} not found in realm")]
    DomainNotFound {
        /// The absent domain name.
        name: String,
    },

    /// Reverse (CIDR-named) domains must spell out their primary NS and
    /// contact email; there is no sensible default inside `.arpa`.
    #[error("reverse domain {name} requires an explicit primary NS and email")]
    ArpaRequiresNsAndEmail {
        /// The reverse domain name.
        name: String,
    },

    /// The 100th same-day serial increment.
    #[error("zone serial overflow: counter exhausted for {date}")]
    SerialOverflow {
        /// The day whose counter ran out.
        date: NaiveDate,
    },

    /// Unparseable zone serial text.
    #[error("invalid zone serial {text:?}")]
    InvalidSerial {
        /// The offending input.
        text: String,
    },

    /// An internal cross-reference is broken. Raised by
    /// [`Realm::validate`], typically against freshly loaded data.
    #[error("realm is corrupt: {message}")]
    Corrupt {
        /// Description of the broken invariant.
        message: String,
    },
}

/// Result type for realm operations.
pub type Result<T> = std::result::Result<T, RealmError>;

/// What happens to hosts stranded by a cascading prefix deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadePolicy {
    /// Stranded hosts stay in the realm with no containing prefix; they
    /// remain reachable through the address index.
    OrphanHosts,
    /// Stranded hosts are deleted along with the subtree.
    DeleteHosts,
}

/// A named IPAM namespace: one prefix forest, one host registry, one domain
/// registry.
#[derive(Debug, Clone, Default)]
pub struct Realm {
    name: String,
    description: String,
    tree: PrefixTree,
    hosts: HostRegistry,
    domains: DomainRegistry,
}

impl Realm {
    /// Creates an empty realm.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Returns the realm name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the free-form realm description.
    #[inline]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Sets the realm description.
    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = description.into();
    }

    /// Read access to the prefix forest.
    #[inline]
    pub fn prefixes(&self) -> &PrefixTree {
        &self.tree
    }

    /// Read access to the host registry and address index.
    #[inline]
    pub fn hosts(&self) -> &HostRegistry {
        &self.hosts
    }

    /// Read access to the domain registry.
    #[inline]
    pub fn domains(&self) -> &DomainRegistry {
        &self.domains
    }

    // ------------------------------------------------------------------
    // Prefix mutators
    // ------------------------------------------------------------------

    /// Allocates a prefix.
    ///
    /// The new node is placed under its smallest strict container (or at
    /// the root level); existing allocations inside it are re-parented
    /// beneath it, and host addresses it covers move into its host bag.
    pub fn add_prefix(&mut self, prefix: CidrPrefix, name: impl Into<String>, attrs: Attrs) -> Result<NodeId> {
        let orphans = self.hosts.orphan_addrs();
        let outcome = self.tree.add(prefix, name.into(), attrs, &orphans)?;
        for (addr, host) in &outcome.adopted {
            self.hosts.set_parent(*host, *addr, Some(outcome.node));
        }
        Ok(outcome.node)
    }

    /// Deletes an allocation.
    ///
    /// With `reparent_children`, children and indexed hosts move up to the
    /// deleted node's parent (or become roots / orphans). Without it the
    /// whole subtree is destroyed and `cascade` decides whether the hosts
    /// indexed inside it are orphaned or deleted too.
    pub fn delete_prefix(
        &mut self,
        prefix: &CidrPrefix,
        reparent_children: bool,
        cascade: CascadePolicy,
    ) -> Result<()> {
        let outcome = self.tree.delete(prefix, reparent_children)?;
        for (addr, host, parent) in &outcome.reparented {
            self.hosts.set_parent(*host, *addr, *parent);
        }
        if !outcome.displaced.is_empty() {
            // Stranded back-references first, so host deletion below never
            // touches a freed tree slot.
            for (addr, host) in &outcome.displaced {
                self.hosts.set_parent(*host, *addr, None);
            }
            if cascade == CascadePolicy::DeleteHosts {
                let mut stranded: Vec<HostId> =
                    outcome.displaced.iter().map(|(_, host)| *host).collect();
                stranded.sort_unstable();
                stranded.dedup();
                debug!(
                    prefix = %prefix,
                    hosts = stranded.len(),
                    "cascade delete takes hosts with it"
                );
                for host in stranded {
                    self.delete_host(host)?;
                }
            }
        }
        Ok(())
    }

    /// Renames an allocation.
    pub fn set_prefix_name(&mut self, prefix: &CidrPrefix, name: impl Into<String>) -> Result<()> {
        let id = self.require_prefix(prefix)?;
        self.tree.set_name(id, name.into());
        Ok(())
    }

    /// Sets one attribute on an allocation.
    pub fn set_prefix_attr(
        &mut self,
        prefix: &CidrPrefix,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<()> {
        let id = self.require_prefix(prefix)?;
        self.tree.attrs_mut(id).insert(key.into(), value.into());
        Ok(())
    }

    /// Removes one attribute from an allocation.
    pub fn remove_prefix_attr(&mut self, prefix: &CidrPrefix, key: &str) -> Result<()> {
        let id = self.require_prefix(prefix)?;
        self.tree.attrs_mut(id).remove(key);
        Ok(())
    }

    fn require_prefix(&self, prefix: &CidrPrefix) -> Result<NodeId> {
        self.tree
            .find_exact(prefix)
            .ok_or(RealmError::PrefixNotFound { prefix: *prefix })
    }

    // ------------------------------------------------------------------
    // Host mutators
    // ------------------------------------------------------------------

    /// Adds a host owning the given addresses.
    ///
    /// Every address must be unused in this realm; each is indexed and
    /// back-referenced to its deepest containing prefix, or to none.
    pub fn add_host(
        &mut self,
        name: impl Into<String>,
        addrs: Vec<IpAddr>,
        attrs: Attrs,
    ) -> Result<HostId> {
        let addrs: Vec<IpAddr> = addrs.into_iter().map(canonical_ip).collect();
        let id = self.hosts.add(name.into(), addrs.clone(), attrs)?;
        for addr in addrs {
            self.attach_address(id, addr);
        }
        Ok(id)
    }

    /// Deletes a host, releasing all of its addresses.
    pub fn delete_host(&mut self, host: HostId) -> Result<()> {
        let removed = self.hosts.remove(host)?;
        for (addr, parent) in removed.parent_entries() {
            if let Some(node) = parent {
                self.tree.unindex_host(node, addr);
            }
        }
        Ok(())
    }

    /// Gives an existing host one more address.
    pub fn add_host_address(&mut self, host: HostId, addr: IpAddr) -> Result<()> {
        let addr = canonical_ip(addr);
        self.hosts.add_address(host, addr)?;
        self.attach_address(host, addr);
        Ok(())
    }

    /// Takes an address away from a host. The last address cannot be
    /// removed; delete the host instead.
    pub fn remove_host_address(&mut self, host: HostId, addr: IpAddr) -> Result<()> {
        let addr = canonical_ip(addr);
        let parent = self.hosts.remove_address(host, addr)?;
        if let Some(node) = parent {
            self.tree.unindex_host(node, addr);
        }
        Ok(())
    }

    /// Sets one attribute on a host.
    pub fn set_host_attr(
        &mut self,
        host: HostId,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<()> {
        self.hosts.attrs_mut(host)?.insert(key.into(), value.into());
        Ok(())
    }

    /// Removes one attribute from a host.
    pub fn remove_host_attr(&mut self, host: HostId, key: &str) -> Result<()> {
        self.hosts.attrs_mut(host)?.remove(key);
        Ok(())
    }

    /// Looks up the host owning an address.
    pub fn find_host_by_ip(&self, addr: IpAddr) -> Option<HostId> {
        self.hosts.find_by_ip(canonical_ip(addr))
    }

    /// Looks up a host by name. Names are labels, not keys; if several
    /// hosts share one, the first by insertion order wins.
    pub fn find_host_by_name(&self, name: &str) -> Option<HostId> {
        self.hosts
            .iter()
            .find(|(_, host)| host.name() == name)
            .map(|(id, _)| id)
    }

    /// Wires one (host, address) pair into the tree: finds the deepest
    /// containing prefix, indexes the host there, stores the back-reference.
    fn attach_address(&mut self, host: HostId, addr: IpAddr) {
        let node = self.tree.find_containing_ip(addr);
        if let Some(node) = node {
            self.tree.index_host(node, addr, host);
        }
        self.hosts.set_parent(host, addr, node);
    }

    // ------------------------------------------------------------------
    // Domain mutators
    // ------------------------------------------------------------------

    /// Creates a domain, filling unset SOA fields with defaults.
    pub fn add_domain(&mut self, name: impl Into<String>, settings: DomainSettings) -> Result<()> {
        self.domains.add(name.into(), settings)?;
        Ok(())
    }

    /// Deletes a domain.
    pub fn delete_domain(&mut self, name: &str) -> Result<()> {
        self.domains.remove(name)?;
        Ok(())
    }

    /// Looks up a domain.
    pub fn domain(&self, name: &str) -> Option<&Domain> {
        self.domains.get(name)
    }

    /// Mutable access to a domain, for serial advancement and record
    /// editing.
    pub fn domain_mut(&mut self, name: &str) -> Option<&mut Domain> {
        self.domains.get_mut(name)
    }

    // ------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------

    /// Checks every structural invariant of the realm.
    ///
    /// Used against freshly loaded data; a violation means the input was
    /// corrupt or hand-edited, and the realm must not be used.
    pub fn validate(&self) -> Result<()> {
        self.tree.validate()?;

        let corrupt = |message: String| RealmError::Corrupt { message };

        // Address index entries point at live hosts that own the address.
        for (addr, host) in self.hosts.index_entries() {
            let Some(entry) = self.hosts.get(host) else {
                return Err(corrupt(format!("index entry {addr} points at a dead host")));
            };
            if !entry.addrs().contains(&addr) {
                return Err(corrupt(format!(
                    "index entry {addr} points at host {:?} which does not own it",
                    entry.name()
                )));
            }
        }

        // Every host address is indexed, back-referenced to the deepest
        // containing prefix, and present in exactly that prefix's host bag.
        for (id, host) in self.hosts.iter() {
            for addr in host.addrs() {
                if self.hosts.find_by_ip(*addr) != Some(id) {
                    return Err(corrupt(format!(
                        "address {addr} of host {:?} is not indexed to it",
                        host.name()
                    )));
                }
                let expected = self.tree.find_containing_ip(*addr);
                let actual = host.parent_of(*addr);
                if expected != actual {
                    return Err(corrupt(format!(
                        "host {:?} address {addr} back-references the wrong prefix",
                        host.name()
                    )));
                }
                if let Some(node) = actual {
                    if self.tree.host_at(node, *addr) != Some(id) {
                        return Err(corrupt(format!(
                            "host {:?} address {addr} is missing from its prefix's host bag",
                            host.name()
                        )));
                    }
                }
            }
        }

        // Host bags only hold live, matching entries.
        for node in self.tree.iter() {
            for (addr, host) in self.tree.hosts_at(node) {
                let live = self
                    .hosts
                    .get(host)
                    .is_some_and(|h| h.parent_of(addr) == Some(node));
                if !live {
                    return Err(corrupt(format!(
                        "prefix {} indexes {addr} which no live host backs",
                        self.tree.cidr(node)
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cidr(s: &str) -> CidrPrefix {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn sample_realm() -> Realm {
        let mut realm = Realm::new("test");
        realm
            .add_prefix(cidr("192.168.144.0/22"), "lab", Attrs::new())
            .unwrap();
        realm
            .add_prefix(cidr("192.168.144.0/28"), "rack", Attrs::new())
            .unwrap();
        realm
    }

    #[test]
    fn test_host_backref_follows_reparenting() {
        let mut realm = sample_realm();
        let host = realm
            .add_host("router", vec![ip("192.168.144.1")], Attrs::new())
            .unwrap();

        let parent_of = |realm: &Realm, host: HostId| {
            realm
                .hosts()
                .get(host)
                .unwrap()
                .parent_of(ip("192.168.144.1"))
                .map(|node| realm.prefixes().cidr(node).to_string())
        };

        assert_eq!(
            parent_of(&realm, host).as_deref(),
            Some("192.168.144.0/28")
        );

        realm
            .delete_prefix(&cidr("192.168.144.0/28"), true, CascadePolicy::OrphanHosts)
            .unwrap();
        assert_eq!(
            parent_of(&realm, host).as_deref(),
            Some("192.168.144.0/22")
        );

        realm
            .add_prefix(cidr("192.168.144.0/28"), "rack", Attrs::new())
            .unwrap();
        assert_eq!(
            parent_of(&realm, host).as_deref(),
            Some("192.168.144.0/28")
        );

        realm.validate().unwrap();
    }

    #[test]
    fn test_orphan_host_adopted_by_new_root() {
        let mut realm = Realm::new("test");
        let host = realm
            .add_host("lonely", vec![ip("10.1.2.3")], Attrs::new())
            .unwrap();
        assert_eq!(realm.hosts().get(host).unwrap().parent_of(ip("10.1.2.3")), None);

        realm
            .add_prefix(cidr("10.0.0.0/8"), "ten", Attrs::new())
            .unwrap();
        let node = realm.hosts().get(host).unwrap().parent_of(ip("10.1.2.3"));
        assert_eq!(
            node.map(|n| realm.prefixes().cidr(n).to_string()).as_deref(),
            Some("10.0.0.0/8")
        );
        realm.validate().unwrap();
    }

    #[test]
    fn test_cascade_delete_hosts() {
        let mut realm = sample_realm();
        let inside = realm
            .add_host("inside", vec![ip("192.168.144.2")], Attrs::new())
            .unwrap();
        let outside = realm
            .add_host("outside", vec![ip("10.0.0.1")], Attrs::new())
            .unwrap();

        realm
            .delete_prefix(&cidr("192.168.144.0/22"), false, CascadePolicy::DeleteHosts)
            .unwrap();

        assert_eq!(realm.find_host_by_ip(ip("192.168.144.2")), None);
        assert!(realm.hosts().get(inside).is_none());
        assert_eq!(realm.find_host_by_ip(ip("10.0.0.1")), Some(outside));
        assert!(realm.prefixes().is_empty());
        realm.validate().unwrap();
    }

    #[test]
    fn test_cascade_orphan_hosts() {
        let mut realm = sample_realm();
        let host = realm
            .add_host("inside", vec![ip("192.168.144.2")], Attrs::new())
            .unwrap();

        realm
            .delete_prefix(&cidr("192.168.144.0/22"), false, CascadePolicy::OrphanHosts)
            .unwrap();

        assert_eq!(realm.find_host_by_ip(ip("192.168.144.2")), Some(host));
        assert_eq!(realm.hosts().get(host).unwrap().parent_of(ip("192.168.144.2")), None);
        realm.validate().unwrap();
    }

    #[test]
    fn test_address_conflict_leaves_realm_unchanged() {
        let mut realm = sample_realm();
        realm
            .add_host("first", vec![ip("192.168.144.1")], Attrs::new())
            .unwrap();

        let err = realm
            .add_host(
                "second",
                vec![ip("192.168.144.9"), ip("192.168.144.1")],
                Attrs::new(),
            )
            .unwrap_err();
        assert!(matches!(err, RealmError::AddressInUse { .. }));

        // The non-conflicting address of the rejected host must not leak in.
        assert_eq!(realm.find_host_by_ip(ip("192.168.144.9")), None);
        assert!(realm.find_host_by_name("second").is_none());
        realm.validate().unwrap();
    }

    #[test]
    fn test_remove_address_releases_it() {
        let mut realm = sample_realm();
        let host = realm
            .add_host(
                "router",
                vec![ip("192.168.144.1"), ip("192.168.145.1")],
                Attrs::new(),
            )
            .unwrap();

        realm.remove_host_address(host, ip("192.168.144.1")).unwrap();
        assert_eq!(realm.find_host_by_ip(ip("192.168.144.1")), None);
        assert_eq!(realm.find_host_by_ip(ip("192.168.145.1")), Some(host));

        // Released address can be claimed again.
        realm
            .add_host("claimant", vec![ip("192.168.144.1")], Attrs::new())
            .unwrap();
        realm.validate().unwrap();
    }
}
