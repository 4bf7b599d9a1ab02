//! # Netgrove CIDR Arithmetic
//!
//! This crate provides the [`CidrPrefix`] value type underpinning the
//! netgrove IPAM engine:
//!
//! - **Parsing**: textual CIDR notation (`192.168.0.0/24`, `2001:db8::/32`)
//!   with canonicalization of stray host bits
//! - **Containment**: strict and non-strict prefix containment, address
//!   membership
//! - **Ordering**: a total order (family, then length, then address) used to
//!   keep sibling lists sorted in allocation trees
//! - **Bounds**: first/last address of a block, and a 128-bit integer
//!   projection split into two 64-bit halves for index-friendly range
//!   queries
//!
//! ## Example
//!
//! ```rust
//! use netgrove_cidr::CidrPrefix;
//! use std::str::FromStr;
//!
//! let net = CidrPrefix::from_str("192.168.208.0/22").unwrap();
//! let sub = CidrPrefix::from_str("192.168.209.0/24").unwrap();
//!
//! assert!(net.contains_net(&sub));
//! assert_eq!(net.last_addr().to_string(), "192.168.211.255");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::len_without_is_empty)]

mod prefix;

pub use prefix::{canonical_ip, AddrIter, CidrPrefix};

use std::fmt;

use thiserror::Error;

/// Errors produced when parsing CIDR prefixes or addresses.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The text is not a well-formed CIDR prefix.
    #[error("malformed CIDR prefix {text:?}")]
    MalformedPrefix {
        /// The offending input.
        text: String,
    },

    /// The text is not a well-formed IP address.
    #[error("malformed IP address {text:?}")]
    MalformedAddress {
        /// The offending input.
        text: String,
    },

    /// The prefix length does not fit the address family.
    #[error("prefix length {len} out of range for {family} (max {max})")]
    LengthOutOfRange {
        /// The requested prefix length.
        len: u32,
        /// The address family of the prefix.
        family: Family,
        /// The width of that family in bits.
        max: u8,
    },
}

/// Result type for CIDR parsing operations.
pub type Result<T> = std::result::Result<T, ParseError>;

/// The address family of a prefix.
///
/// IPv4 sorts before IPv6; this drives the cross-family part of the
/// [`CidrPrefix`] total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Family {
    /// IPv4, 32 bits.
    V4,
    /// IPv6, 128 bits.
    V6,
}

impl Family {
    /// Returns the address width of this family in bits.
    #[inline]
    pub const fn bits(self) -> u8 {
        match self {
            Self::V4 => 32,
            Self::V6 => 128,
        }
    }

    /// Returns true for IPv4.
    #[inline]
    pub const fn is_v4(self) -> bool {
        matches!(self, Self::V4)
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 => write!(f, "IPv4"),
            Self::V6 => write!(f, "IPv6"),
        }
    }
}
