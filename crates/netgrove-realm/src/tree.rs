//! The hierarchical CIDR allocation forest.
//!
//! Nodes live in an arena (`Vec` plus free list) and refer to each other by
//! index, so parent back-pointers never form ownership cycles. Each node's
//! parent is its smallest strict container among the allocations of the
//! realm, an invariant maintained across arbitrary insertion and deletion
//! order: inserting a container re-parents everything it swallows,
//! deleting a node either lifts its children to its parent or tears the
//! subtree down.
//!
//! Sibling lists are kept in ascending [`CidrPrefix`] order, which makes
//! the forest shape a pure function of the allocated set, independent of
//! the order mutations arrived in.

use std::collections::BTreeMap;
use std::net::IpAddr;

use tracing::debug;

use netgrove_cidr::CidrPrefix;

use crate::hosts::HostId;
use crate::{Attrs, RealmError, Result};

/// Identifier of a node in the forest arena.
///
/// Stable for the lifetime of the node. Slots are recycled after deletion,
/// so holding an id across a delete is a caller bug; the realm never does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u32);

#[derive(Debug, Clone)]
struct Node {
    cidr: CidrPrefix,
    name: String,
    attrs: Attrs,
    parent: Option<NodeId>,
    /// Ascending CidrPrefix order.
    children: Vec<NodeId>,
    /// Hosts whose address falls here and in no child, keyed by the
    /// canonical address string.
    hosts: BTreeMap<String, BagEntry>,
}

#[derive(Debug, Clone, Copy)]
struct BagEntry {
    ip: IpAddr,
    host: HostId,
}

/// Result of a successful insertion.
#[derive(Debug)]
pub(crate) struct AddOutcome {
    /// The new node.
    pub node: NodeId,
    /// Addresses whose deepest container became the new node, either moved
    /// down from the parent's bag or adopted from the orphan set.
    pub adopted: Vec<(IpAddr, HostId)>,
}

/// Result of a successful deletion.
#[derive(Debug)]
pub(crate) struct DeleteOutcome {
    /// Bag entries lifted to the deleted node's parent (`None` means they
    /// became orphans at the realm level).
    pub reparented: Vec<(IpAddr, HostId, Option<NodeId>)>,
    /// Bag entries stranded by a cascade, from the whole subtree.
    pub displaced: Vec<(IpAddr, HostId)>,
}

/// The prefix forest of one realm.
#[derive(Debug, Clone, Default)]
pub struct PrefixTree {
    nodes: Vec<Option<Node>>,
    free: Vec<u32>,
    /// Ascending CidrPrefix order.
    roots: Vec<NodeId>,
    live: usize,
}

impl PrefixTree {
    /// Creates an empty forest.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of allocations in the forest.
    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    /// Returns true if nothing is allocated.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// The top-level allocations, in ascending prefix order.
    #[inline]
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    /// The prefix of a node.
    pub fn cidr(&self, id: NodeId) -> &CidrPrefix {
        &self.node(id).cidr
    }

    /// The free-form name of a node.
    pub fn name(&self, id: NodeId) -> &str {
        &self.node(id).name
    }

    /// The attribute bag of a node.
    pub fn attrs(&self, id: NodeId) -> &Attrs {
        &self.node(id).attrs
    }

    /// One attribute of a node.
    pub fn attr(&self, id: NodeId, key: &str) -> Option<&str> {
        self.node(id).attrs.get(key).map(String::as_str)
    }

    /// The parent of a node, `None` for roots.
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    /// The children of a node, in ascending prefix order.
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.node(id).children
    }

    /// The (address, host) pairs indexed at a node.
    pub fn hosts_at(&self, id: NodeId) -> impl Iterator<Item = (IpAddr, HostId)> + '_ {
        self.node(id).hosts.values().map(|e| (e.ip, e.host))
    }

    /// The host indexed at a node for one address.
    pub fn host_at(&self, id: NodeId, addr: IpAddr) -> Option<HostId> {
        self.node(id).hosts.get(&addr.to_string()).map(|e| e.host)
    }

    pub(crate) fn set_name(&mut self, id: NodeId, name: String) {
        self.node_mut(id).name = name;
    }

    pub(crate) fn attrs_mut(&mut self, id: NodeId) -> &mut Attrs {
        &mut self.node_mut(id).attrs
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Finds the smallest allocation containing `target` (non-strictly:
    /// an exact match is its own container).
    pub fn find_containing(&self, target: &CidrPrefix) -> Option<NodeId> {
        let mut found = None;
        let mut list: &[NodeId] = &self.roots;
        'descend: loop {
            for &id in list {
                let node = self.node(id);
                if node.cidr.contains_net(target) {
                    found = Some(id);
                    list = &node.children;
                    continue 'descend;
                }
            }
            return found;
        }
    }

    /// Finds the deepest allocation containing an address.
    pub fn find_containing_ip(&self, addr: IpAddr) -> Option<NodeId> {
        self.find_containing(&CidrPrefix::from_ip(addr))
    }

    /// Finds the allocation with exactly this prefix.
    pub fn find_exact(&self, target: &CidrPrefix) -> Option<NodeId> {
        self.find_containing(target)
            .filter(|&id| self.node(id).cidr == *target)
    }

    /// Longest-prefix match: the deepest allocation containing the
    /// argument, or `None` if nothing does.
    pub fn longest_prefix_match(&self, target: &CidrPrefix) -> Option<NodeId> {
        self.find_containing(target)
    }

    /// The strict containers of `target`, deepest first, up to the root.
    ///
    /// The iterator is cheap and restartable: it borrows the tree and can
    /// be cloned at any position.
    pub fn ancestors(&self, target: &CidrPrefix) -> Ancestors<'_> {
        let deepest = self.find_containing(target).map(|id| {
            if self.node(id).cidr == *target {
                self.node(id).parent
            } else {
                Some(id)
            }
        });
        Ancestors {
            tree: self,
            cur: deepest.flatten(),
        }
    }

    /// All nodes in depth-first pre-order (parents before children,
    /// siblings ascending).
    pub fn iter(&self) -> Dfs<'_> {
        let mut stack: Vec<NodeId> = self.roots.clone();
        stack.reverse();
        Dfs { tree: self, stack }
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    /// Inserts an allocation.
    ///
    /// `orphans` is the realm's set of host addresses currently contained
    /// by no allocation; entries covered by the new prefix are adopted into
    /// its bag. Existing bag entries of the parent that the new prefix
    /// covers move down likewise, and so do contained sibling subtrees.
    pub(crate) fn add(
        &mut self,
        cidr: CidrPrefix,
        name: String,
        attrs: Attrs,
        orphans: &[(IpAddr, HostId)],
    ) -> Result<AddOutcome> {
        if cidr.is_host() {
            return Err(RealmError::HostAddressDisallowed { prefix: cidr });
        }
        let parent = self.find_containing(&cidr);
        if let Some(p) = parent {
            if self.node(p).cidr == cidr {
                return Err(RealmError::AlreadyAllocated {
                    prefix: cidr,
                    name: self.node(p).name.clone(),
                });
            }
        }

        let id = self.alloc(Node {
            cidr,
            name,
            attrs,
            parent,
            children: Vec::new(),
            hosts: BTreeMap::new(),
        });

        let mut adopted = Vec::new();
        match parent {
            Some(p) => {
                // Swallow the siblings the new prefix contains. They were
                // sorted under the parent, so they stay sorted under us.
                let contained: Vec<NodeId> = self
                    .node(p)
                    .children
                    .iter()
                    .copied()
                    .filter(|&c| cidr.contains_net(&self.node(c).cidr))
                    .collect();
                self.node_mut(p).children.retain(|c| !contained.contains(c));
                for &c in &contained {
                    self.node_mut(c).parent = Some(id);
                }
                self.node_mut(id).children = contained;

                // Pull down the parent's bag entries we now cover.
                let moved: Vec<String> = self
                    .node(p)
                    .hosts
                    .iter()
                    .filter(|(_, e)| cidr.contains_ip(e.ip))
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in moved {
                    if let Some(entry) = self.node_mut(p).hosts.remove(&key) {
                        adopted.push((entry.ip, entry.host));
                        self.node_mut(id).hosts.insert(key, entry);
                    }
                }

                self.link_sorted(Some(p), id);
            }
            None => {
                let contained: Vec<NodeId> = self
                    .roots
                    .iter()
                    .copied()
                    .filter(|&r| cidr.contains_net(&self.node(r).cidr))
                    .collect();
                self.roots.retain(|r| !contained.contains(r));
                for &r in &contained {
                    self.node_mut(r).parent = Some(id);
                }
                self.node_mut(id).children = contained;

                for &(ip, host) in orphans {
                    if cidr.contains_ip(ip) {
                        adopted.push((ip, host));
                        self.node_mut(id)
                            .hosts
                            .insert(ip.to_string(), BagEntry { ip, host });
                    }
                }

                self.link_sorted(None, id);
            }
        }

        debug!(prefix = %cidr, adopted = adopted.len(), "allocated prefix");
        Ok(AddOutcome { node: id, adopted })
    }

    /// Deletes the allocation with exactly this prefix.
    ///
    /// With `reparent`, children and bag entries are lifted to the deleted
    /// node's parent. Without it the whole subtree is destroyed and every
    /// bag entry in it is reported as displaced.
    pub(crate) fn delete(&mut self, target: &CidrPrefix, reparent: bool) -> Result<DeleteOutcome> {
        let id = self
            .find_exact(target)
            .ok_or(RealmError::PrefixNotFound { prefix: *target })?;
        let parent = self.node(id).parent;
        self.unlink(parent, id);
        let node = self.take(id);

        let mut outcome = DeleteOutcome {
            reparented: Vec::new(),
            displaced: Vec::new(),
        };

        if reparent {
            for &child in &node.children {
                self.node_mut(child).parent = parent;
                self.link_sorted(parent, child);
            }
            for (key, entry) in node.hosts {
                if let Some(p) = parent {
                    self.node_mut(p).hosts.insert(key, entry);
                }
                outcome.reparented.push((entry.ip, entry.host, parent));
            }
            debug!(prefix = %target, "deleted prefix, children reparented");
        } else {
            let mut removed = 0usize;
            let mut stack = vec![node];
            while let Some(node) = stack.pop() {
                removed += 1;
                for entry in node.hosts.values() {
                    outcome.displaced.push((entry.ip, entry.host));
                }
                for &child in &node.children {
                    let child = self.take(child);
                    stack.push(child);
                }
            }
            debug!(
                prefix = %target,
                removed,
                displaced = outcome.displaced.len(),
                "deleted prefix subtree"
            );
        }

        Ok(outcome)
    }

    /// Records a (address, host) pair in a node's bag. The realm calls this
    /// after computing the deepest container of a new host address.
    pub(crate) fn index_host(&mut self, id: NodeId, addr: IpAddr, host: HostId) {
        self.node_mut(id)
            .hosts
            .insert(addr.to_string(), BagEntry { ip: addr, host });
    }

    /// Drops an address from a node's bag.
    pub(crate) fn unindex_host(&mut self, id: NodeId, addr: IpAddr) {
        self.node_mut(id).hosts.remove(&addr.to_string());
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn node(&self, id: NodeId) -> &Node {
        self.nodes[id.0 as usize]
            .as_ref()
            .expect("stale NodeId: arena slot is free")
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes[id.0 as usize]
            .as_mut()
            .expect("stale NodeId: arena slot is free")
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        self.live += 1;
        if let Some(slot) = self.free.pop() {
            self.nodes[slot as usize] = Some(node);
            NodeId(slot)
        } else {
            self.nodes.push(Some(node));
            NodeId((self.nodes.len() - 1) as u32)
        }
    }

    fn take(&mut self, id: NodeId) -> Node {
        self.live -= 1;
        self.free.push(id.0);
        self.nodes[id.0 as usize]
            .take()
            .expect("stale NodeId: arena slot is free")
    }

    /// Inserts `id` into the sibling list of `parent` (the roots when
    /// `None`), keeping the list sorted.
    fn link_sorted(&mut self, parent: Option<NodeId>, id: NodeId) {
        let cidr = self.node(id).cidr;
        let list = match parent {
            Some(p) => &self.node(p).children,
            None => &self.roots,
        };
        let pos = list.partition_point(|&sibling| self.node(sibling).cidr < cidr);
        match parent {
            Some(p) => self.node_mut(p).children.insert(pos, id),
            None => self.roots.insert(pos, id),
        }
    }

    fn unlink(&mut self, parent: Option<NodeId>, id: NodeId) {
        match parent {
            Some(p) => self.node_mut(p).children.retain(|&c| c != id),
            None => self.roots.retain(|&r| r != id),
        }
    }

    // ------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------

    /// Checks the geometric invariants of the forest: strict containment
    /// along every edge, sorted non-overlapping siblings, consistent parent
    /// pointers, and bag entries inside their node but outside its
    /// children.
    pub fn validate(&self) -> Result<()> {
        let corrupt = |message: String| RealmError::Corrupt { message };

        self.validate_siblings(&self.roots)?;
        for &root in &self.roots {
            if let Some(parent) = self.node(root).parent {
                return Err(corrupt(format!(
                    "root {} has a parent pointer to {}",
                    self.node(root).cidr,
                    self.node(parent).cidr
                )));
            }
        }

        for id in self.iter() {
            let node = self.node(id);
            self.validate_siblings(&node.children)?;
            for &child in &node.children {
                let c = self.node(child);
                if c.parent != Some(id) {
                    return Err(corrupt(format!(
                        "child {} of {} has a mismatched parent pointer",
                        c.cidr, node.cidr
                    )));
                }
                if !node.cidr.contains_net_strict(&c.cidr) {
                    return Err(corrupt(format!(
                        "child {} is not strictly contained in {}",
                        c.cidr, node.cidr
                    )));
                }
            }
            for (key, entry) in &node.hosts {
                if *key != entry.ip.to_string() {
                    return Err(corrupt(format!(
                        "host bag key {key:?} does not match address {}",
                        entry.ip
                    )));
                }
                if !node.cidr.contains_ip(entry.ip) {
                    return Err(corrupt(format!(
                        "host address {} indexed at {} which does not contain it",
                        entry.ip, node.cidr
                    )));
                }
                for &child in &node.children {
                    if self.node(child).cidr.contains_ip(entry.ip) {
                        return Err(corrupt(format!(
                            "host address {} indexed at {} but contained by child {}",
                            entry.ip,
                            node.cidr,
                            self.node(child).cidr
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn validate_siblings(&self, list: &[NodeId]) -> Result<()> {
        for pair in list.windows(2) {
            if self.node(pair[0]).cidr >= self.node(pair[1]).cidr {
                return Err(RealmError::Corrupt {
                    message: format!(
                        "sibling list out of order at {}",
                        self.node(pair[1]).cidr
                    ),
                });
            }
        }
        for (i, &a) in list.iter().enumerate() {
            for &b in &list[i + 1..] {
                let (na, nb) = (&self.node(a).cidr, &self.node(b).cidr);
                if na.contains_net(nb) || nb.contains_net(na) {
                    return Err(RealmError::Corrupt {
                        message: format!("siblings {na} and {nb} overlap"),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Iterator over strict containers, see [`PrefixTree::ancestors`].
#[derive(Debug, Clone)]
pub struct Ancestors<'a> {
    tree: &'a PrefixTree,
    cur: Option<NodeId>,
}

impl Iterator for Ancestors<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.cur?;
        self.cur = self.tree.node(id).parent;
        Some(id)
    }
}

/// Depth-first pre-order iterator, see [`PrefixTree::iter`].
#[derive(Debug, Clone)]
pub struct Dfs<'a> {
    tree: &'a PrefixTree,
    stack: Vec<NodeId>,
}

impl Iterator for Dfs<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.stack.pop()?;
        self.stack
            .extend(self.tree.node(id).children.iter().rev().copied());
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cidr(s: &str) -> CidrPrefix {
        s.parse().unwrap()
    }

    fn tree_with(prefixes: &[&str]) -> PrefixTree {
        let mut tree = PrefixTree::new();
        for p in prefixes {
            tree.add(cidr(p), (*p).to_string(), Attrs::new(), &[])
                .unwrap();
        }
        tree
    }

    fn shape(tree: &PrefixTree) -> Vec<(String, Option<String>)> {
        tree.iter()
            .map(|id| {
                (
                    tree.cidr(id).to_string(),
                    tree.parent(id).map(|p| tree.cidr(p).to_string()),
                )
            })
            .collect()
    }

    #[test]
    fn test_insert_under_smallest_container() {
        let tree = tree_with(&["10.0.0.0/8", "10.1.0.0/16", "10.1.2.0/24"]);
        assert_eq!(
            shape(&tree),
            [
                ("10.0.0.0/8".into(), None),
                ("10.1.0.0/16".into(), Some("10.0.0.0/8".into())),
                ("10.1.2.0/24".into(), Some("10.1.0.0/16".into())),
            ]
        );
        tree.validate().unwrap();
    }

    #[test]
    fn test_inserting_container_swallows_roots() {
        let tree = tree_with(&["10.1.0.0/16", "10.2.0.0/16", "192.168.0.0/16", "10.0.0.0/8"]);
        assert_eq!(
            shape(&tree),
            [
                ("10.0.0.0/8".into(), None),
                ("10.1.0.0/16".into(), Some("10.0.0.0/8".into())),
                ("10.2.0.0/16".into(), Some("10.0.0.0/8".into())),
                ("192.168.0.0/16".into(), None),
            ]
        );
        tree.validate().unwrap();
    }

    #[test]
    fn test_inserting_between_parent_and_children() {
        let mut tree = tree_with(&["10.0.0.0/8", "10.1.2.0/24", "10.1.3.0/24", "10.200.0.0/24"]);
        tree.add(cidr("10.1.0.0/16"), "mid".into(), Attrs::new(), &[])
            .unwrap();
        assert_eq!(
            shape(&tree),
            [
                ("10.0.0.0/8".into(), None),
                ("10.1.0.0/16".into(), Some("10.0.0.0/8".into())),
                ("10.1.2.0/24".into(), Some("10.1.0.0/16".into())),
                ("10.1.3.0/24".into(), Some("10.1.0.0/16".into())),
                ("10.200.0.0/24".into(), Some("10.0.0.0/8".into())),
            ]
        );
        tree.validate().unwrap();
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut tree = tree_with(&["10.0.0.0/8"]);
        let err = tree
            .add(cidr("10.0.0.0/8"), "again".into(), Attrs::new(), &[])
            .unwrap_err();
        assert!(matches!(err, RealmError::AlreadyAllocated { .. }));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_host_prefix_rejected() {
        let mut tree = PrefixTree::new();
        let err = tree
            .add(cidr("10.0.0.1/32"), "host".into(), Attrs::new(), &[])
            .unwrap_err();
        assert!(matches!(err, RealmError::HostAddressDisallowed { .. }));
        assert!(tree.is_empty());
    }

    #[test]
    fn test_delete_reparents_children() {
        let mut tree = tree_with(&["10.0.0.0/8", "10.1.0.0/16", "10.1.2.0/24"]);
        tree.delete(&cidr("10.1.0.0/16"), true).unwrap();
        assert_eq!(
            shape(&tree),
            [
                ("10.0.0.0/8".into(), None),
                ("10.1.2.0/24".into(), Some("10.0.0.0/8".into())),
            ]
        );
        tree.validate().unwrap();
    }

    #[test]
    fn test_delete_cascade_removes_subtree() {
        let mut tree = tree_with(&["10.0.0.0/8", "10.1.0.0/16", "10.1.2.0/24", "192.168.0.0/16"]);
        tree.delete(&cidr("10.0.0.0/8"), false).unwrap();
        assert_eq!(shape(&tree), [("192.168.0.0/16".into(), None)]);
        tree.validate().unwrap();
    }

    #[test]
    fn test_delete_missing() {
        let mut tree = tree_with(&["10.0.0.0/8"]);
        let err = tree.delete(&cidr("10.99.0.0/16"), true).unwrap_err();
        assert!(matches!(err, RealmError::PrefixNotFound { .. }));
    }

    #[test]
    fn test_longest_prefix_match() {
        let tree = tree_with(&[
            "0.0.0.0/0",
            "192.168.0.0/16",
            "192.168.1.0/24",
            "192.168.2.0/24",
            "192.168.2.128/25",
        ]);
        let lpm = |s: &str| {
            tree.longest_prefix_match(&cidr(s))
                .map(|id| tree.cidr(id).to_string())
        };
        assert_eq!(lpm("192.168.1.1/32").as_deref(), Some("192.168.1.0/24"));
        assert_eq!(lpm("192.168.1.0/26").as_deref(), Some("192.168.1.0/24"));
        assert_eq!(lpm("10.0.0.0/8").as_deref(), Some("0.0.0.0/0"));
        assert_eq!(lpm("192.168.10.1/32").as_deref(), Some("192.168.0.0/16"));
    }

    #[test]
    fn test_find_exact_and_containing() {
        let tree = tree_with(&["192.168.0.0/16", "192.168.1.0/24"]);
        assert!(tree.find_exact(&cidr("192.168.1.0/24")).is_some());
        assert!(tree.find_exact(&cidr("192.168.1.0/25")).is_none());
        // find_containing is non-strict, an exact node contains itself.
        let id = tree.find_containing(&cidr("192.168.1.0/24")).unwrap();
        assert_eq!(tree.cidr(id).to_string(), "192.168.1.0/24");
    }

    #[test]
    fn test_ancestors_deepest_first() {
        let tree = tree_with(&[
            "0.0.0.0/0",
            "192.168.0.0/16",
            "192.168.2.0/24",
            "192.168.2.128/25",
        ]);
        let chain: Vec<String> = tree
            .ancestors(&cidr("192.168.2.128/25"))
            .map(|id| tree.cidr(id).to_string())
            .collect();
        assert_eq!(chain, ["192.168.2.0/24", "192.168.0.0/16", "0.0.0.0/0"]);

        // Restartable: a clone taken midway continues independently.
        let mut iter = tree.ancestors(&cidr("192.168.2.128/25"));
        iter.next();
        let rest: Vec<String> = iter
            .clone()
            .map(|id| tree.cidr(id).to_string())
            .collect();
        assert_eq!(rest, ["192.168.0.0/16", "0.0.0.0/0"]);
    }

    #[test]
    fn test_children_sorted_regardless_of_insertion_order() {
        let tree = tree_with(&[
            "10.0.0.0/8",
            "10.3.0.0/16",
            "10.1.0.0/16",
            "10.2.0.0/16",
        ]);
        let root = tree.roots()[0];
        let children: Vec<String> = tree
            .children(root)
            .iter()
            .map(|&c| tree.cidr(c).to_string())
            .collect();
        assert_eq!(children, ["10.1.0.0/16", "10.2.0.0/16", "10.3.0.0/16"]);
    }

    #[test]
    fn test_slot_reuse_after_delete() {
        let mut tree = tree_with(&["10.0.0.0/8", "10.1.0.0/16"]);
        tree.delete(&cidr("10.1.0.0/16"), true).unwrap();
        tree.add(cidr("10.2.0.0/16"), "re".into(), Attrs::new(), &[])
            .unwrap();
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.nodes.len(), 2);
        tree.validate().unwrap();
    }
}
