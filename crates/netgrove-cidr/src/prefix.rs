//! The CIDR prefix value type.

use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Family, ParseError, Result};

/// An IPv4 or IPv6 CIDR block.
///
/// A prefix is an address family, a numeric address, and a prefix length in
/// `0..=bits`. The stored address is always canonical: bits below the prefix
/// length are zero. Parsing accepts non-canonical input (`192.168.1.77/24`)
/// and masks it down.
///
/// # Ordering
///
/// Prefixes are totally ordered: IPv4 before IPv6, then ascending prefix
/// length, then ascending canonical address. Allocation trees rely on this
/// order for their sibling lists, so a container always sorts before the
/// prefixes it contains.
///
/// # Serialization
///
/// Serializes as the canonical string form (`"10.0.0.0/8"`), matching the
/// textual encoding used by the persistence layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CidrPrefix {
    family: Family,
    /// Address bits; IPv4 occupies the low 32 bits.
    addr: u128,
    len: u8,
}

impl CidrPrefix {
    /// Creates a prefix from an address and length, masking host bits.
    ///
    /// Fails with [`ParseError::LengthOutOfRange`] if `len` exceeds the
    /// family width.
    pub fn new(addr: IpAddr, len: u8) -> Result<Self> {
        let family = match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        };
        if len > family.bits() {
            return Err(ParseError::LengthOutOfRange {
                len: u32::from(len),
                family,
                max: family.bits(),
            });
        }
        let mut pfx = Self {
            family,
            addr: ip_bits(addr),
            len,
        };
        pfx.addr &= pfx.network_mask();
        Ok(pfx)
    }

    /// Creates the host-length prefix covering a single address.
    pub fn from_ip(addr: IpAddr) -> Self {
        let addr = canonical_ip(addr);
        let family = match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        };
        Self {
            family,
            addr: ip_bits(addr),
            len: family.bits(),
        }
    }

    /// Returns the address family.
    #[inline]
    pub const fn family(&self) -> Family {
        self.family
    }

    /// Returns the prefix length.
    #[inline]
    pub const fn len(&self) -> u8 {
        self.len
    }

    /// Returns true for the zero-length prefix of either family.
    #[inline]
    pub const fn is_default_route(&self) -> bool {
        self.len == 0
    }

    /// Returns true if the prefix length equals the family width, i.e. the
    /// block holds exactly one address.
    #[inline]
    pub const fn is_host(&self) -> bool {
        self.len == self.family.bits()
    }

    /// Non-strict containment: every address of `other` falls in `self`.
    /// A prefix contains itself.
    pub fn contains_net(&self, other: &Self) -> bool {
        self.family == other.family
            && self.len <= other.len
            && (other.addr & self.network_mask()) == self.addr
    }

    /// Strict containment: [`contains_net`](Self::contains_net) with a
    /// strictly shorter prefix length.
    pub fn contains_net_strict(&self, other: &Self) -> bool {
        self.len < other.len && self.contains_net(other)
    }

    /// Returns true if the address falls inside this block.
    ///
    /// Cross-family comparisons are always false; v4-mapped IPv6 addresses
    /// are first folded back to IPv4.
    pub fn contains_ip(&self, addr: IpAddr) -> bool {
        let addr = canonical_ip(addr);
        let same_family = matches!(
            (self.family, addr),
            (Family::V4, IpAddr::V4(_)) | (Family::V6, IpAddr::V6(_))
        );
        same_family && (ip_bits(addr) & self.network_mask()) == self.addr
    }

    /// Returns the first (network) address of the block.
    pub fn first_addr(&self) -> IpAddr {
        self.to_ip(self.addr)
    }

    /// Returns the last address of the block, with all host bits set.
    pub fn last_addr(&self) -> IpAddr {
        self.to_ip(self.addr | self.host_mask())
    }

    /// Projects the prefix onto the two 64-bit halves of its 128-bit
    /// representation, for storage in integer index columns.
    ///
    /// IPv4 is first mapped into `::ffff:a.b.c.d` so that both families
    /// share one coordinate space. With `max_bound` the host bits are set to
    /// one, yielding the upper corner of the block; otherwise the canonical
    /// (lower) corner is returned. "Prefix strictly inside another" then
    /// becomes a pair of range comparisons on `(hi, lo)`.
    pub fn as_u64_pair(&self, max_bound: bool) -> (u64, u64) {
        let mut bits = self.addr;
        if max_bound {
            bits |= self.host_mask();
        }
        if self.family.is_v4() {
            bits |= 0xffff_u128 << 32;
        }
        ((bits >> 64) as u64, bits as u64)
    }

    /// Iterates the addresses of the block in ascending order, bounds
    /// included. Intended for small blocks (autogen patterns cap the host
    /// bits at 8).
    pub fn iter_addrs(&self) -> AddrIter {
        AddrIter {
            prefix: *self,
            next: Some(self.addr),
            last: self.addr | self.host_mask(),
        }
    }

    fn to_ip(&self, bits: u128) -> IpAddr {
        match self.family {
            Family::V4 => IpAddr::V4(Ipv4Addr::from(bits as u32)),
            Family::V6 => IpAddr::V6(Ipv6Addr::from(bits)),
        }
    }

    /// Mask covering the host bits of this prefix.
    fn host_mask(&self) -> u128 {
        match self.family.bits() - self.len {
            0 => 0,
            128 => u128::MAX,
            width => (1u128 << width) - 1,
        }
    }

    /// Mask covering the network bits of this prefix.
    fn network_mask(&self) -> u128 {
        let full = match self.family {
            Family::V4 => u128::from(u32::MAX),
            Family::V6 => u128::MAX,
        };
        full ^ self.host_mask()
    }
}

/// Folds v4-mapped IPv6 addresses (`::ffff:a.b.c.d`) back to IPv4 so a
/// given address has exactly one canonical form.
pub fn canonical_ip(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => addr,
        },
        IpAddr::V4(_) => addr,
    }
}

fn ip_bits(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

impl PartialOrd for CidrPrefix {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CidrPrefix {
    fn cmp(&self, other: &Self) -> Ordering {
        self.family
            .cmp(&other.family)
            .then_with(|| self.len.cmp(&other.len))
            .then_with(|| self.addr.cmp(&other.addr))
    }
}

impl fmt::Display for CidrPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.first_addr(), self.len)
    }
}

impl FromStr for CidrPrefix {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = || ParseError::MalformedPrefix {
            text: s.to_string(),
        };
        let (addr_part, len_part) = s.split_once('/').ok_or_else(malformed)?;
        let addr = IpAddr::from_str(addr_part).map_err(|_| malformed())?;
        let len: u32 = len_part.parse().map_err(|_| malformed())?;
        let family = match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        };
        if len > u32::from(family.bits()) {
            return Err(ParseError::LengthOutOfRange {
                len,
                family,
                max: family.bits(),
            });
        }
        Self::new(addr, len as u8)
    }
}

impl Serialize for CidrPrefix {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CidrPrefix {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct PrefixVisitor;

        impl Visitor<'_> for PrefixVisitor {
            type Value = CidrPrefix;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a CIDR prefix string such as \"10.0.0.0/8\"")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<CidrPrefix, E> {
                v.parse().map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_str(PrefixVisitor)
    }
}

/// Iterator over the addresses of a block, see
/// [`CidrPrefix::iter_addrs`].
#[derive(Debug, Clone)]
pub struct AddrIter {
    prefix: CidrPrefix,
    next: Option<u128>,
    last: u128,
}

impl Iterator for AddrIter {
    type Item = IpAddr;

    fn next(&mut self) -> Option<IpAddr> {
        let cur = self.next?;
        self.next = if cur < self.last { Some(cur + 1) } else { None };
        Some(self.prefix.to_ip(cur))
    }
}
