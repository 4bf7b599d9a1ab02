//! The relational profile: realms in SQLite.
//!
//! One table per entity, foreign keys enforced. Prefix rows carry four
//! denormalized 64-bit bound columns derived from the prefix text by a
//! trigger, so containment and longest-prefix-match become integer range
//! predicates. The `is_subnet_of`, `prefix_len` and `prefix_bound`
//! scalar functions are registered on the connection at open time, never
//! process-wide.
//!
//! SQLite integers are signed; the bounds are unsigned 64-bit halves
//! stored as their two's-complement reinterpretation. The predicates below
//! recover unsigned ordering with the XOR construction
//! `(a >= b) != ((a < 0) != (b < 0))`: when both operands have the same
//! sign the signed comparison already agrees with the unsigned one, and
//! when the signs differ it is exactly wrong.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use rusqlite::functions::FunctionFlags;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::debug;

use netgrove_cidr::CidrPrefix;
use netgrove_realm::{Attrs, NodeId, Realm, RealmError, ZoneSerial};

use crate::{Result, StoreError};

/// All create statements, grouped per table with its triggers.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS realms (
  realm_id INTEGER PRIMARY KEY,
  name TEXT UNIQUE NOT NULL,
  description TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS prefixes (
  prefix_id INTEGER PRIMARY KEY,
  realm_id INTEGER NOT NULL REFERENCES realms ON DELETE CASCADE ON UPDATE CASCADE,
  parent_id INTEGER REFERENCES prefixes (prefix_id) ON DELETE RESTRICT ON UPDATE CASCADE,
  prefix TEXT NOT NULL,
  description TEXT NOT NULL DEFAULT '',
  attrs TEXT NOT NULL DEFAULT '{}',

  family INTEGER,
  prefixlen INTEGER,
  hi_low INTEGER,
  lo_low INTEGER,
  hi_high INTEGER,
  lo_high INTEGER,

  UNIQUE (realm_id, prefix)
);

CREATE TRIGGER IF NOT EXISTS prefixes_insert_denormalized
  AFTER INSERT ON prefixes
  FOR EACH ROW
  BEGIN
    UPDATE prefixes
      SET family = CASE WHEN instr(NEW.prefix, ':') > 0 THEN 6 ELSE 4 END,
          prefixlen = prefix_len(NEW.prefix),
          hi_low = prefix_bound(NEW.prefix, 1, 0),
          lo_low = prefix_bound(NEW.prefix, 0, 0),
          hi_high = prefix_bound(NEW.prefix, 1, 1),
          lo_high = prefix_bound(NEW.prefix, 0, 1)
      WHERE rowid = NEW.rowid;
  END;

CREATE TRIGGER IF NOT EXISTS prefixes_update_denormalized
  AFTER UPDATE OF prefix ON prefixes
  FOR EACH ROW
  BEGIN
    UPDATE prefixes
      SET family = CASE WHEN instr(NEW.prefix, ':') > 0 THEN 6 ELSE 4 END,
          prefixlen = prefix_len(NEW.prefix),
          hi_low = prefix_bound(NEW.prefix, 1, 0),
          lo_low = prefix_bound(NEW.prefix, 0, 0),
          hi_high = prefix_bound(NEW.prefix, 1, 1),
          lo_high = prefix_bound(NEW.prefix, 0, 1)
      WHERE rowid = NEW.rowid;
  END;

CREATE TABLE IF NOT EXISTS hosts (
  host_id INTEGER PRIMARY KEY,
  realm_id INTEGER NOT NULL REFERENCES realms ON DELETE CASCADE ON UPDATE CASCADE,
  hostname TEXT NOT NULL,
  description TEXT NOT NULL DEFAULT '',
  attrs TEXT NOT NULL DEFAULT '{}',
  UNIQUE (realm_id, hostname)
);

CREATE TABLE IF NOT EXISTS host_addrs (
  addr_id INTEGER PRIMARY KEY,
  realm_id INTEGER NOT NULL REFERENCES realms ON DELETE CASCADE ON UPDATE CASCADE,
  host_id INTEGER NOT NULL REFERENCES hosts ON DELETE CASCADE ON UPDATE CASCADE,
  address TEXT NOT NULL,
  description TEXT NOT NULL DEFAULT '',
  UNIQUE (realm_id, address)
);

CREATE TABLE IF NOT EXISTS domains (
  domain_id INTEGER PRIMARY KEY,
  realm_id INTEGER NOT NULL REFERENCES realms ON DELETE CASCADE ON UPDATE CASCADE,
  name TEXT NOT NULL,
  primary_ns TEXT NOT NULL,
  email TEXT NOT NULL,
  slave_refresh INTEGER NOT NULL,
  slave_retry INTEGER NOT NULL,
  slave_expiry INTEGER NOT NULL,
  nxdomain_ttl INTEGER NOT NULL,
  serial TEXT NOT NULL DEFAULT '0',
  last_hash TEXT,
  ns TEXT NOT NULL DEFAULT '[]',
  UNIQUE (realm_id, name)
);

CREATE TABLE IF NOT EXISTS domain_records (
  record_id INTEGER PRIMARY KEY,
  domain_id INTEGER NOT NULL REFERENCES domains ON DELETE CASCADE ON UPDATE CASCADE,
  record TEXT NOT NULL,
  UNIQUE (domain_id, record)
);
";

/// Unsigned `column <= bound` over signed storage.
macro_rules! ule {
    ($a:expr, $b:expr) => {
        concat!(
            "((", $a, " <= ", $b, ") != ((", $a, " < 0) != (", $b, " < 0)))"
        )
    };
}

/// Unsigned `column >= bound` over signed storage.
macro_rules! uge {
    ($a:expr, $b:expr) => {
        concat!(
            "((", $a, " >= ", $b, ") != ((", $a, " < 0) != (", $b, " < 0)))"
        )
    };
}

/// A SQLite-backed realm store.
///
/// The connection is fully configured by the constructor: foreign keys on,
/// IPAM scalar functions registered, schema created. Every public mutator
/// runs in its own transaction and rolls back on failure.
pub struct SqlStore {
    conn: Connection,
}

impl SqlStore {
    /// Opens (and if needed creates) a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    /// Opens a fresh in-memory store.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", true)?;
        register_functions(&conn)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Writes a realm into the store, replacing any previous contents
    /// under the same name. One transaction, all or nothing.
    pub fn save_realm(&mut self, realm: &Realm) -> Result<()> {
        let tx = self.conn.transaction()?;
        delete_realm_rows(&tx, realm.name())?;

        tx.execute(
            "INSERT INTO realms (name, description) VALUES (?1, ?2)",
            params![realm.name(), realm.description()],
        )?;
        let realm_id = tx.last_insert_rowid();

        // Depth-first pre-order guarantees a parent's row exists before
        // its children reference it.
        let tree = realm.prefixes();
        let mut rows: HashMap<NodeId, i64> = HashMap::new();
        for node in tree.iter() {
            let parent_row = tree.parent(node).map(|p| rows[&p]);
            tx.execute(
                "INSERT INTO prefixes (realm_id, parent_id, prefix, description, attrs)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    realm_id,
                    parent_row,
                    tree.cidr(node).to_string(),
                    tree.name(node),
                    serde_json::to_string(tree.attrs(node))?,
                ],
            )?;
            rows.insert(node, tx.last_insert_rowid());
        }

        for (_, host) in realm.hosts().iter() {
            tx.execute(
                "INSERT INTO hosts (realm_id, hostname, attrs) VALUES (?1, ?2, ?3)",
                params![realm_id, host.name(), serde_json::to_string(host.attrs())?],
            )?;
            let host_row = tx.last_insert_rowid();
            for addr in host.addrs() {
                tx.execute(
                    "INSERT INTO host_addrs (realm_id, host_id, address) VALUES (?1, ?2, ?3)",
                    params![realm_id, host_row, addr.to_string()],
                )?;
            }
        }

        for domain in realm.domains().iter() {
            tx.execute(
                "INSERT INTO domains (realm_id, name, primary_ns, email, slave_refresh,
                                      slave_retry, slave_expiry, nxdomain_ttl, serial,
                                      last_hash, ns)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    realm_id,
                    domain.name(),
                    domain.soa().primary_ns,
                    domain.soa().email,
                    domain.soa().refresh.as_secs(),
                    domain.soa().retry.as_secs(),
                    domain.soa().expiry.as_secs(),
                    domain.soa().nxdomain_ttl.as_secs(),
                    domain.serial().encode(),
                    domain.last_hash(),
                    serde_json::to_string(domain.ns())?,
                ],
            )?;
            let domain_row = tx.last_insert_rowid();
            for record in domain.rr() {
                tx.execute(
                    "INSERT INTO domain_records (domain_id, record) VALUES (?1, ?2)",
                    params![domain_row, record],
                )?;
            }
        }

        tx.commit()?;
        debug!(realm = realm.name(), "realm saved to SQLite");
        Ok(())
    }

    /// Reads a realm back out of the store, rebuilding all indexes and
    /// validating every invariant.
    pub fn load_realm(&self, name: &str) -> Result<Realm> {
        let row: Option<(i64, String)> = self
            .conn
            .query_row(
                "SELECT realm_id, description FROM realms WHERE name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((realm_id, description)) = row else {
            return Err(StoreError::RealmNotFound {
                name: name.to_string(),
            });
        };

        let mut realm = Realm::new(name);
        realm.set_description(description);

        // Shorter prefixes first, so every row's container is already in
        // the tree when the row replays.
        let mut stmt = self.conn.prepare(
            "SELECT prefix_id, parent_id, prefix, description, attrs
             FROM prefixes WHERE realm_id = ?1 ORDER BY prefixlen ASC, prefix ASC",
        )?;
        let prefix_rows = stmt.query_map(params![realm_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<i64>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut nodes: HashMap<i64, NodeId> = HashMap::new();
        let mut parents: HashMap<i64, Option<i64>> = HashMap::new();
        for row in prefix_rows {
            let (row_id, parent_row, prefix, description, attrs) = row?;
            let prefix: CidrPrefix = prefix.parse().map_err(RealmError::from)?;
            let attrs: Attrs = serde_json::from_str(&attrs)?;
            let node = realm.add_prefix(prefix, description, attrs)?;
            nodes.insert(row_id, node);
            parents.insert(row_id, parent_row);
        }
        // The stored parent_id must agree with the containment the tree
        // recomputed; a mismatch means the table was edited inconsistently.
        for (row_id, parent_row) in &parents {
            let node = nodes[row_id];
            let actual = realm.prefixes().parent(node);
            let expected = match parent_row {
                Some(p) => nodes.get(p).copied(),
                None => None,
            };
            if actual != expected {
                return Err(StoreError::Realm(RealmError::Corrupt {
                    message: format!(
                        "prefix {} has parent_id inconsistent with its container",
                        realm.prefixes().cidr(node)
                    ),
                }));
            }
        }

        let mut stmt = self.conn.prepare(
            "SELECT host_id, hostname, attrs FROM hosts WHERE realm_id = ?1 ORDER BY host_id",
        )?;
        let host_rows = stmt.query_map(params![realm_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut addr_stmt = self.conn.prepare(
            "SELECT address FROM host_addrs WHERE host_id = ?1 ORDER BY addr_id",
        )?;
        for row in host_rows {
            let (host_row, hostname, attrs) = row?;
            let attrs: Attrs = serde_json::from_str(&attrs)?;
            let addr_texts = addr_stmt
                .query_map(params![host_row], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            let mut addrs = Vec::with_capacity(addr_texts.len());
            for text in addr_texts {
                let addr = text.parse().map_err(|_| {
                    StoreError::Realm(RealmError::Corrupt {
                        message: format!("malformed address {text:?} for host {hostname:?}"),
                    })
                })?;
                addrs.push(addr);
            }
            realm.add_host(hostname, addrs, attrs)?;
        }

        let mut stmt = self.conn.prepare(
            "SELECT domain_id, name, primary_ns, email, slave_refresh, slave_retry,
                    slave_expiry, nxdomain_ttl, serial, last_hash, ns
             FROM domains WHERE realm_id = ?1 ORDER BY name",
        )?;
        let domain_rows = stmt.query_map(params![realm_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, u64>(4)?,
                row.get::<_, u64>(5)?,
                row.get::<_, u64>(6)?,
                row.get::<_, u64>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, Option<String>>(9)?,
                row.get::<_, String>(10)?,
            ))
        })?;
        let mut record_stmt = self.conn.prepare(
            "SELECT record FROM domain_records WHERE domain_id = ?1 ORDER BY record_id",
        )?;
        for row in domain_rows {
            let (domain_row, name, primary_ns, email, refresh, retry, expiry, nxttl, serial, last_hash, ns) =
                row?;
            let settings = netgrove_realm::DomainSettings {
                primary_ns: Some(primary_ns),
                email: Some(email),
                refresh: Some(Duration::from_secs(refresh)),
                retry: Some(Duration::from_secs(retry)),
                expiry: Some(Duration::from_secs(expiry)),
                nxdomain_ttl: Some(Duration::from_secs(nxttl)),
            };
            realm.add_domain(&name, settings)?;
            let serial: ZoneSerial = serial.parse()?;
            let ns: Vec<String> = serde_json::from_str(&ns)?;
            let records = record_stmt
                .query_map(params![domain_row], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            if let Some(domain) = realm.domain_mut(&name) {
                domain.restore(serial, last_hash);
                for entry in ns {
                    domain.add_ns(entry);
                }
                for record in records {
                    domain.add_record(record);
                }
            }
        }

        realm.validate()?;
        debug!(realm = name, "realm loaded from SQLite");
        Ok(realm)
    }

    /// Names of all realms in the store.
    pub fn list_realms(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM realms ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    /// Drops a realm and everything it owns.
    pub fn delete_realm(&mut self, name: &str) -> Result<()> {
        let tx = self.conn.transaction()?;
        let deleted = delete_realm_rows(&tx, name)?;
        tx.commit()?;
        if deleted {
            Ok(())
        } else {
            Err(StoreError::RealmNotFound {
                name: name.to_string(),
            })
        }
    }

    /// Longest-prefix match straight off the table, answered from the
    /// denormalized bound columns: the candidate's [low, high] corners must
    /// bracket the target's low corner, half by half, within the target's
    /// address family.
    ///
    /// The family predicate is load-bearing: the `::ffff:a.b.c.d` mapping
    /// leaves every v4 prefix with zero top-64 bounds, so without it a v6
    /// prefix whose network address also has zero top bits (`::/0`,
    /// anything inside `::/64`) would bound-box-contain every v4 target.
    pub fn longest_prefix_match(
        &self,
        realm: &str,
        target: &CidrPrefix,
    ) -> Result<Option<CidrPrefix>> {
        let target_text = target.to_string();
        let target_family: i64 = if target.family().is_v4() { 4 } else { 6 };

        // An exact hit is indexed and cheap; try it first.
        let exact: Option<String> = self
            .conn
            .query_row(
                "SELECT prefix FROM prefixes INNER JOIN realms USING (realm_id)
                 WHERE realms.name = ?1 AND prefix = ?2",
                params![realm, target_text],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(prefix) = exact {
            return Ok(Some(prefix.parse().map_err(RealmError::from)?));
        }

        let query = concat!(
            "SELECT prefix FROM prefixes INNER JOIN realms USING (realm_id) \
             WHERE realms.name = ?1 \
               AND family = ?3 \
               AND prefixlen < prefix_len(?2) \
               AND ",
            ule!("hi_low", "prefix_bound(?2, 1, 0)"),
            " AND ",
            uge!("hi_high", "prefix_bound(?2, 1, 0)"),
            " AND ",
            ule!("lo_low", "prefix_bound(?2, 0, 0)"),
            " AND ",
            uge!("lo_high", "prefix_bound(?2, 0, 0)"),
            " ORDER BY prefixlen DESC LIMIT 1",
        );
        let found: Option<String> = self
            .conn
            .query_row(query, params![realm, target_text, target_family], |row| {
                row.get(0)
            })
            .optional()?;
        match found {
            Some(prefix) => Ok(Some(prefix.parse().map_err(RealmError::from)?)),
            None => Ok(None),
        }
    }

    /// All stored prefixes contained in `target` (non-strictly), via the
    /// `is_subnet_of` scalar function.
    pub fn subnets_of(&self, realm: &str, target: &CidrPrefix) -> Result<Vec<CidrPrefix>> {
        let mut stmt = self.conn.prepare(
            "SELECT prefix FROM prefixes INNER JOIN realms USING (realm_id)
             WHERE realms.name = ?1 AND is_subnet_of(?2, prefix)
             ORDER BY prefixlen ASC, prefix ASC",
        )?;
        let rows = stmt
            .query_map(params![realm, target.to_string()], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        let mut prefixes = Vec::with_capacity(rows.len());
        for text in rows {
            prefixes.push(text.parse().map_err(RealmError::from)?);
        }
        Ok(prefixes)
    }
}

/// Deletes a realm row and its prefixes, children before parents so the
/// `parent_id` RESTRICT never fires. Returns whether the realm existed.
fn delete_realm_rows(tx: &Transaction<'_>, name: &str) -> Result<bool> {
    let realm_id: Option<i64> = tx
        .query_row(
            "SELECT realm_id FROM realms WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    let Some(realm_id) = realm_id else {
        return Ok(false);
    };

    let ids: Vec<i64> = tx
        .prepare("SELECT prefix_id FROM prefixes WHERE realm_id = ?1 ORDER BY prefixlen DESC")?
        .query_map(params![realm_id], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    for id in ids {
        tx.execute("DELETE FROM prefixes WHERE prefix_id = ?1", params![id])?;
    }
    tx.execute("DELETE FROM realms WHERE realm_id = ?1", params![realm_id])?;
    Ok(true)
}

/// Registers the IPAM scalar functions on one connection.
fn register_functions(conn: &Connection) -> rusqlite::Result<()> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;

    conn.create_scalar_function("is_subnet_of", 2, flags, |ctx| {
        let parent = parse_prefix(ctx.get::<String>(0)?)?;
        let child = parse_prefix(ctx.get::<String>(1)?)?;
        Ok(parent.contains_net(&child))
    })?;

    conn.create_scalar_function("prefix_len", 1, flags, |ctx| {
        let prefix = parse_prefix(ctx.get::<String>(0)?)?;
        Ok(i64::from(prefix.len()))
    })?;

    conn.create_scalar_function("prefix_bound", 3, flags, |ctx| {
        let prefix = parse_prefix(ctx.get::<String>(0)?)?;
        let hi = ctx.get::<i64>(1)? != 0;
        let max = ctx.get::<i64>(2)? != 0;
        let (hi_half, lo_half) = prefix.as_u64_pair(max);
        Ok(if hi { hi_half as i64 } else { lo_half as i64 })
    })
}

fn parse_prefix(text: String) -> rusqlite::Result<CidrPrefix> {
    text.parse()
        .map_err(|e: netgrove_cidr::ParseError| rusqlite::Error::UserFunctionError(Box::new(e)))
}
