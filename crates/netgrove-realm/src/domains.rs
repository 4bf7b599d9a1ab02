//! DNS domains, SOA metadata, and the date-based zone serial.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use netgrove_cidr::CidrPrefix;

use crate::{RealmError, Result};

/// A zone serial in the conventional `YYYYMMDDnn` form: a UTC date plus a
/// same-day counter from 0 to 99.
///
/// Incrementing on a new day resets the counter; the hundredth increment on
/// one day fails with [`RealmError::SerialOverflow`] rather than wrapping,
/// since a wrapped serial would move backwards for secondaries.
///
/// The zero serial (no export has ever happened) is the year-1 date with a
/// zero counter; its persistent encoding is the string `"0"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ZoneSerial {
    date: NaiveDate,
    counter: u8,
}

impl ZoneSerial {
    /// The largest same-day counter value.
    pub const MAX_COUNTER: u8 = 99;

    /// Returns true if this is the zero serial.
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    /// Advances the serial for an export happening today (UTC).
    pub fn inc(&mut self) -> Result<()> {
        self.inc_on(Utc::now().date_naive())
    }

    /// Advances the serial for an export happening on `today`.
    ///
    /// Same day: counter goes up, failing at the cap. New day: the date
    /// moves forward and the counter resets.
    pub fn inc_on(&mut self, today: NaiveDate) -> Result<()> {
        if self.date == today {
            if self.counter == Self::MAX_COUNTER {
                return Err(RealmError::SerialOverflow { date: today });
            }
            self.counter += 1;
        } else {
            self.date = today;
            self.counter = 0;
        }
        Ok(())
    }

    /// Returns true if this serial describes an older zone than `other`.
    pub fn before(&self, other: &Self) -> bool {
        self < other
    }

    /// The persistent encoding: `"0"` for the zero serial, the ten-digit
    /// form otherwise.
    pub fn encode(&self) -> String {
        if self.is_zero() {
            "0".to_string()
        } else {
            self.to_string()
        }
    }
}

impl Default for ZoneSerial {
    fn default() -> Self {
        Self {
            // The year-1 epoch marks "never exported".
            date: NaiveDate::from_ymd_opt(1, 1, 1).unwrap_or_default(),
            counter: 0,
        }
    }
}

impl fmt::Display for ZoneSerial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:02}", self.date.format("%Y%m%d"), self.counter)
    }
}

impl FromStr for ZoneSerial {
    type Err = RealmError;

    fn from_str(s: &str) -> Result<Self> {
        if s == "0" {
            return Ok(Self::default());
        }
        let invalid = || RealmError::InvalidSerial {
            text: s.to_string(),
        };
        if s.len() != 10 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let date = NaiveDate::parse_from_str(&s[..8], "%Y%m%d").map_err(|_| invalid())?;
        let counter: u8 = s[8..].parse().map_err(|_| invalid())?;
        Ok(Self { date, counter })
    }
}

impl Serialize for ZoneSerial {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for ZoneSerial {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct SerialVisitor;

        impl Visitor<'_> for SerialVisitor {
            type Value = ZoneSerial;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a zone serial string (\"YYYYMMDDnn\" or \"0\")")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<ZoneSerial, E> {
                v.parse().map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_str(SerialVisitor)
    }
}

/// The SOA parameters of a domain. Durations are emitted as integer
/// seconds in zone files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Soa {
    /// The primary nameserver.
    pub primary_ns: String,
    /// The zone contact, as an email address.
    pub email: String,
    /// How often secondaries poll for changes.
    pub refresh: Duration,
    /// How soon secondaries retry a failed poll.
    pub retry: Duration,
    /// When secondaries stop serving a stale zone.
    pub expiry: Duration,
    /// Negative-answer TTL.
    pub nxdomain_ttl: Duration,
}

/// Optional fields for [`DomainRegistry::add`]; anything unset gets the
/// conventional default.
#[derive(Debug, Clone, Default)]
pub struct DomainSettings {
    /// Primary nameserver; defaults to `ns1.<name>`.
    pub primary_ns: Option<String>,
    /// Contact email; defaults to `hostmaster.<name>`.
    pub email: Option<String>,
    /// Slave refresh; defaults to one hour.
    pub refresh: Option<Duration>,
    /// Slave retry; defaults to fifteen minutes.
    pub retry: Option<Duration>,
    /// Slave expiry; defaults to three weeks.
    pub expiry: Option<Duration>,
    /// NXDOMAIN TTL; defaults to ten minutes.
    pub nxdomain_ttl: Option<Duration>,
}

/// A forward or reverse DNS domain.
///
/// The name is either a DNS name (`example.com`, a forward zone) or a CIDR
/// prefix in text form (`192.168.144.0/24`, a reverse zone). Besides the
/// SOA parameters the domain carries its current serial, the content hash
/// of the last export (the exporter's change detector), an NS list, and
/// free-form extra record lines emitted verbatim into the forward zone.
#[derive(Debug, Clone)]
pub struct Domain {
    name: String,
    soa: Soa,
    serial: ZoneSerial,
    last_hash: Option<String>,
    ns: Vec<String>,
    rr: Vec<String>,
}

impl Domain {
    /// The domain name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The SOA parameters.
    #[inline]
    pub fn soa(&self) -> &Soa {
        &self.soa
    }

    /// The current serial.
    #[inline]
    pub fn serial(&self) -> ZoneSerial {
        self.serial
    }

    /// The content hash of the last export, if any.
    #[inline]
    pub fn last_hash(&self) -> Option<&str> {
        self.last_hash.as_deref()
    }

    /// The NS names announced at the zone apex.
    #[inline]
    pub fn ns(&self) -> &[String] {
        &self.ns
    }

    /// The verbatim extra record lines.
    #[inline]
    pub fn rr(&self) -> &[String] {
        &self.rr
    }

    /// Parses the domain name as a CIDR prefix; `Some` marks this as a
    /// reverse zone.
    pub fn reverse_prefix(&self) -> Option<CidrPrefix> {
        self.name.parse().ok()
    }

    /// Renders the SOA line with the current serial.
    pub fn soa_line(&self) -> String {
        let email = self.soa.email.replace('@', ".");
        format!(
            "@ IN SOA {}. {}. ( {} {} {} {} {} )",
            self.soa.primary_ns,
            email,
            self.serial,
            self.soa.refresh.as_secs(),
            self.soa.retry.as_secs(),
            self.soa.expiry.as_secs(),
            self.soa.nxdomain_ttl.as_secs(),
        )
    }

    /// Advances the serial for an export happening now.
    pub fn inc_serial(&mut self) -> Result<()> {
        self.serial.inc()
    }

    /// Records the content hash of the latest export.
    pub fn set_last_hash(&mut self, hash: impl Into<String>) {
        self.last_hash = Some(hash.into());
    }

    /// Adds an apex NS name.
    pub fn add_ns(&mut self, ns: impl Into<String>) {
        self.ns.push(ns.into());
    }

    /// Adds a verbatim record line.
    pub fn add_record(&mut self, record: impl Into<String>) {
        self.rr.push(record.into());
    }

    /// Removes a verbatim record line. Returns false if absent.
    pub fn remove_record(&mut self, record: &str) -> bool {
        let before = self.rr.len();
        self.rr.retain(|r| r != record);
        self.rr.len() < before
    }

    /// Restores persisted state; used by the store adapters when
    /// reconstructing a realm.
    pub fn restore(&mut self, serial: ZoneSerial, last_hash: Option<String>) {
        self.serial = serial;
        self.last_hash = last_hash;
    }
}

/// The domains of one realm, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct DomainRegistry {
    domains: BTreeMap<String, Domain>,
}

impl DomainRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of domains.
    #[inline]
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    /// Returns true if no domains exist.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Looks up a domain by name.
    pub fn get(&self, name: &str) -> Option<&Domain> {
        self.domains.get(name)
    }

    /// Mutable domain lookup.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Domain> {
        self.domains.get_mut(name)
    }

    /// Iterates domains in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Domain> + '_ {
        self.domains.values()
    }

    /// Creates a domain, filling unset SOA fields with defaults.
    ///
    /// A CIDR-shaped name marks a reverse zone, which must spell out its
    /// primary NS and email: `ns1.192.168.0.0/16` is not a nameserver.
    pub fn add(&mut self, name: String, settings: DomainSettings) -> Result<&mut Domain> {
        if self.domains.contains_key(&name) {
            return Err(RealmError::DomainExists { name });
        }

        let is_reverse = name.parse::<CidrPrefix>().is_ok();
        if is_reverse && (settings.primary_ns.is_none() || settings.email.is_none()) {
            return Err(RealmError::ArpaRequiresNsAndEmail { name });
        }

        let soa = Soa {
            primary_ns: settings
                .primary_ns
                .unwrap_or_else(|| format!("ns1.{name}")),
            email: settings
                .email
                .unwrap_or_else(|| format!("hostmaster.{name}")),
            refresh: settings.refresh.unwrap_or(Duration::from_secs(3600)),
            retry: settings.retry.unwrap_or(Duration::from_secs(15 * 60)),
            expiry: settings
                .expiry
                .unwrap_or(Duration::from_secs(21 * 24 * 3600)),
            nxdomain_ttl: settings.nxdomain_ttl.unwrap_or(Duration::from_secs(600)),
        };

        debug!(domain = %name, reverse = is_reverse, "added domain");
        let domain = Domain {
            name: name.clone(),
            soa,
            serial: ZoneSerial::default(),
            last_hash: None,
            ns: Vec::new(),
            rr: Vec::new(),
        };
        Ok(self.domains.entry(name).or_insert(domain))
    }

    /// Deletes a domain.
    pub fn remove(&mut self, name: &str) -> Result<Domain> {
        self.domains
            .remove(name)
            .ok_or_else(|| RealmError::DomainNotFound {
                name: name.to_string(),
            })
    }
}
