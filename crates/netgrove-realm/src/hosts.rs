//! Hosts and the realm-wide address index.

use std::collections::BTreeMap;
use std::net::IpAddr;

use tracing::debug;

use crate::tree::NodeId;
use crate::{Attrs, RealmError, Result};

/// Identifier of a host in a [`HostRegistry`] arena.
///
/// Stable for the lifetime of the host; slots are recycled after deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostId(u32);

/// A named machine owning one or more addresses.
///
/// Per address the host keeps a back-reference to the deepest allocated
/// prefix containing it, or `None` when no allocation covers it (the host
/// is then an orphan for that address, still reachable through the address
/// index). The realm keeps these back-references in sync with the prefix
/// forest.
#[derive(Debug, Clone)]
pub struct Host {
    name: String,
    /// Insertion order.
    addrs: Vec<IpAddr>,
    attrs: Attrs,
    /// Canonical address string to containing prefix.
    parents: BTreeMap<String, Option<NodeId>>,
}

impl Host {
    /// The host name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The host's addresses, in the order they were added.
    #[inline]
    pub fn addrs(&self) -> &[IpAddr] {
        &self.addrs
    }

    /// The host's addresses sorted by canonical string form, the order
    /// zone export emits records in.
    pub fn sorted_addrs(&self) -> Vec<IpAddr> {
        let mut addrs = self.addrs.clone();
        addrs.sort_by_key(ToString::to_string);
        addrs
    }

    /// The attribute bag.
    #[inline]
    pub fn attrs(&self) -> &Attrs {
        &self.attrs
    }

    /// One attribute, if set.
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    /// The deepest allocated prefix containing one of this host's
    /// addresses, or `None` if nothing contains it (or the host does not
    /// own the address).
    pub fn parent_of(&self, addr: IpAddr) -> Option<NodeId> {
        self.parents.get(&addr.to_string()).copied().flatten()
    }

    /// Every (address, containing prefix) pair of this host.
    pub fn parent_entries(&self) -> impl Iterator<Item = (IpAddr, Option<NodeId>)> + '_ {
        self.addrs.iter().map(|&a| (a, self.parent_of(a)))
    }
}

/// The hosts of one realm, plus the unique address-to-host index.
#[derive(Debug, Clone, Default)]
pub struct HostRegistry {
    hosts: Vec<Option<Host>>,
    free: Vec<u32>,
    /// Insertion order, drives host iteration (and thus zone export).
    order: Vec<HostId>,
    /// The address index: canonical address string to owning host.
    index: BTreeMap<String, HostId>,
}

impl HostRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of hosts.
    #[inline]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns true if no hosts are registered.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Looks up a host by id. `None` for stale handles.
    pub fn get(&self, id: HostId) -> Option<&Host> {
        self.hosts.get(id.0 as usize).and_then(Option::as_ref)
    }

    /// The host owning an address, if any.
    pub fn find_by_ip(&self, addr: IpAddr) -> Option<HostId> {
        self.index.get(&addr.to_string()).copied()
    }

    /// Iterates hosts in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (HostId, &Host)> + '_ {
        self.order.iter().filter_map(|&id| Some((id, self.get(id)?)))
    }

    /// Every (address, host) entry of the address index.
    pub fn index_entries(&self) -> impl Iterator<Item = (IpAddr, HostId)> + '_ {
        self.index.iter().filter_map(|(addr, &host)| {
            let ip: IpAddr = addr.parse().ok()?;
            Some((ip, host))
        })
    }

    /// Every (address, host) pair currently contained by no allocated
    /// prefix. The realm feeds these to prefix insertion so a new top-level
    /// allocation can adopt them.
    pub(crate) fn orphan_addrs(&self) -> Vec<(IpAddr, HostId)> {
        let mut orphans = Vec::new();
        for (id, host) in self.iter() {
            for (addr, parent) in host.parent_entries() {
                if parent.is_none() {
                    orphans.push((addr, id));
                }
            }
        }
        orphans
    }

    /// Registers a host. All addresses must be unclaimed; on any conflict
    /// nothing is changed.
    pub(crate) fn add(&mut self, name: String, addrs: Vec<IpAddr>, attrs: Attrs) -> Result<HostId> {
        if addrs.is_empty() {
            return Err(RealmError::NoAddresses { name });
        }
        for (i, addr) in addrs.iter().enumerate() {
            if let Some(owner) = self.find_by_ip(*addr) {
                return Err(RealmError::AddressInUse {
                    address: *addr,
                    owner: self.get(owner).map_or_else(String::new, |h| h.name.clone()),
                });
            }
            if addrs[..i].contains(addr) {
                return Err(RealmError::AddressInUse {
                    address: *addr,
                    owner: name.clone(),
                });
            }
        }

        let host = Host {
            name,
            parents: addrs.iter().map(|a| (a.to_string(), None)).collect(),
            addrs,
            attrs,
        };
        let id = self.alloc(host);
        self.order.push(id);
        let host = &self.hosts[id.0 as usize];
        if let Some(host) = host {
            for addr in &host.addrs {
                self.index.insert(addr.to_string(), id);
            }
            debug!(name = %host.name, addrs = host.addrs.len(), "added host");
        }
        Ok(id)
    }

    /// Unregisters a host, releasing its addresses. Returns the removed
    /// host so the realm can detach it from prefix host bags.
    pub(crate) fn remove(&mut self, id: HostId) -> Result<Host> {
        let slot = self
            .hosts
            .get_mut(id.0 as usize)
            .and_then(Option::take)
            .ok_or(RealmError::HostNotFound)?;
        self.free.push(id.0);
        self.order.retain(|&h| h != id);
        for addr in &slot.addrs {
            self.index.remove(&addr.to_string());
        }
        debug!(name = %slot.name, "removed host");
        Ok(slot)
    }

    /// Adds one address to a host. The realm wires the prefix linkage
    /// afterwards.
    pub(crate) fn add_address(&mut self, id: HostId, addr: IpAddr) -> Result<()> {
        if let Some(owner) = self.find_by_ip(addr) {
            return Err(RealmError::AddressInUse {
                address: addr,
                owner: self.get(owner).map_or_else(String::new, |h| h.name.clone()),
            });
        }
        let host = self.get_mut(id)?;
        host.addrs.push(addr);
        host.parents.insert(addr.to_string(), None);
        self.index.insert(addr.to_string(), id);
        Ok(())
    }

    /// Removes one address from a host, returning the prefix it was
    /// back-referenced to so the realm can clean that bag. A host always
    /// keeps at least one address; removing the last one is refused.
    pub(crate) fn remove_address(&mut self, id: HostId, addr: IpAddr) -> Result<Option<NodeId>> {
        let host = self.get_mut(id)?;
        let key = addr.to_string();
        if !host.addrs.contains(&addr) {
            return Err(RealmError::AddressNotFound {
                name: host.name.clone(),
                address: addr,
            });
        }
        if host.addrs.len() == 1 {
            return Err(RealmError::NoAddresses {
                name: host.name.clone(),
            });
        }
        host.addrs.retain(|&a| a != addr);
        let parent = host.parents.remove(&key).flatten();
        self.index.remove(&key);
        Ok(parent)
    }

    /// Updates the per-address back-reference of a host.
    pub(crate) fn set_parent(&mut self, id: HostId, addr: IpAddr, parent: Option<NodeId>) {
        if let Ok(host) = self.get_mut(id) {
            host.parents.insert(addr.to_string(), parent);
        }
    }

    /// Mutable attribute access, used by the realm's attribute setters.
    pub(crate) fn attrs_mut(&mut self, id: HostId) -> Result<&mut Attrs> {
        Ok(&mut self.get_mut(id)?.attrs)
    }

    fn get_mut(&mut self, id: HostId) -> Result<&mut Host> {
        self.hosts
            .get_mut(id.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(RealmError::HostNotFound)
    }

    fn alloc(&mut self, host: Host) -> HostId {
        if let Some(slot) = self.free.pop() {
            self.hosts[slot as usize] = Some(host);
            HostId(slot)
        } else {
            self.hosts.push(Some(host));
            HostId((self.hosts.len() - 1) as u32)
        }
    }
}
