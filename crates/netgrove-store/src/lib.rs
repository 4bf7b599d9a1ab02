//! # Netgrove Persistence
//!
//! Two interchangeable persistence profiles for realms:
//!
//! - **Document** ([`document`]): one self-contained JSON document per
//!   realm. Prefixes nest, hosts sit at the realm level, and the address
//!   index and host-to-prefix back-references are recomputed on load.
//! - **Relational** ([`SqlStore`]): a SQLite schema with one table per
//!   entity, foreign keys enforced, and denormalized 64-bit prefix bounds
//!   maintained by triggers so containment and longest-prefix-match can be
//!   answered as integer range queries.
//!
//! Both profiles validate the full set of realm invariants after loading
//! and refuse data that violates them. `load(dump(realm))` reproduces the
//! realm exactly, back-references included.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod document;
mod sql;

pub use sql::SqlStore;

use thiserror::Error;

use netgrove_realm::RealmError;

/// Errors produced by the persistence adapters.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Document encoding or decoding failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// SQLite failure.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The named realm is not in the store.
    #[error("realm {name} not found in store")]
    RealmNotFound {
        /// The absent realm name.
        name: String,
    },

    /// The stored data violates a realm invariant; it is refused rather
    /// than repaired.
    #[error(transparent)]
    Realm(#[from] RealmError),
}

/// Result type for persistence operations.
pub type Result<T> = std::result::Result<T, StoreError>;
