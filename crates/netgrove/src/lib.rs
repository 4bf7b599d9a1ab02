//! # Netgrove
//!
//! An IP address management engine. Realms hold hierarchically allocated
//! CIDR prefixes, hosts keyed by their addresses, and DNS domain metadata;
//! BIND9 zone files for forward and reverse zones are derived from them on
//! demand.
//!
//! This crate is the facade: it re-exports the member crates and adds the
//! small amount of glue an embedding application wants, namely a
//! shared-realm wrapper and tracing setup.
//!
//! ## Example
//!
//! ```rust
//! use netgrove::{export_zone, Attrs, DomainSettings, Realm};
//!
//! let mut realm = Realm::new("home");
//! realm
//!     .add_prefix("192.168.144.0/24".parse().unwrap(), "lab", Attrs::new())
//!     .unwrap();
//!
//! let mut attrs = Attrs::new();
//! attrs.insert("fqdn".into(), "vega.example.com".into());
//! realm
//!     .add_host("vega", vec!["192.168.144.1".parse().unwrap()], attrs)
//!     .unwrap();
//!
//! realm
//!     .add_domain("example.com", DomainSettings::default())
//!     .unwrap();
//! let zone = export_zone(&mut realm, "example.com", false).unwrap();
//! assert!(zone.contains("vega IN A 192.168.144.1"));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

mod trace;

pub use trace::{init_tracing, LogConfig, LogFormat};

pub use netgrove_cidr::{canonical_ip, CidrPrefix, Family, ParseError};
pub use netgrove_export::{export_zone, ExportError};
pub use netgrove_realm::{
    Attrs, CascadePolicy, Domain, DomainRegistry, DomainSettings, Host, HostId, HostRegistry,
    NodeId, PrefixTree, Realm, RealmError, Soa, ZoneSerial,
};

/// Persistence adapters: JSON documents and SQLite.
pub use netgrove_store as store;

use std::sync::Arc;

use parking_lot::Mutex;

/// A realm behind the mutual exclusion the concurrency model asks callers
/// to provide. The realm itself is single-threaded by design; this is the
/// one lock wrapping it.
pub type SharedRealm = Arc<Mutex<Realm>>;

/// Wraps a realm for sharing across threads.
pub fn shared(realm: Realm) -> SharedRealm {
    Arc::new(Mutex::new(realm))
}
