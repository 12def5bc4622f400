//! Object identifiers
//!
//! An OID is a dotted path: `<namespace>.<instance>[.<field>...]`, e.g.
//! `0.4.12.2` is the card number field of card `0.4.12`.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Hierarchical object identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Oid(String);

impl Oid {
    /// Wraps a dotted string without validation (use `parse` for untrusted input)
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Appends a field suffix. The suffix may or may not carry its leading dot.
    pub fn append(&self, suffix: &str) -> Oid {
        let suffix = suffix.trim_start_matches('.');
        if suffix.is_empty() {
            self.clone()
        } else if self.0.is_empty() {
            Oid(suffix.to_string())
        } else {
            Oid(format!("{}.{}", self.0, suffix))
        }
    }

    /// Appends a single numeric segment
    pub fn child(&self, n: u32) -> Oid {
        self.append(&n.to_string())
    }

    /// True when `self` equals `prefix` or lies below it (segment aware:
    /// `0.3.10` is not below `0.3.1`)
    pub fn has_prefix(&self, prefix: &Oid) -> bool {
        match self.0.strip_prefix(prefix.as_str()) {
            Some("") => true,
            Some(rest) => rest.starts_with('.'),
            None => false,
        }
    }

    /// Suffix of `self` below `prefix`, including the leading dot
    pub fn suffix_of(&self, prefix: &Oid) -> Option<&str> {
        if self.has_prefix(prefix) {
            Some(&self.0[prefix.0.len()..])
        } else {
            None
        }
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.').filter(|s| !s.is_empty())
    }

    fn numeric_segments(&self) -> Vec<u64> {
        self.segments()
            .map(|s| s.parse::<u64>().unwrap_or(u64::MAX))
            .collect()
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Oid {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let valid = !s.is_empty()
            && s.split('.')
                .all(|segment| !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()));

        if valid {
            Ok(Oid(s.to_string()))
        } else {
            Err(crate::Error::Validation(format!("invalid OID '{}'", s)))
        }
    }
}

impl From<&str> for Oid {
    fn from(s: &str) -> Self {
        Oid::new(s)
    }
}

// Numeric per-segment ordering so that 0.3.2 sorts before 0.3.10
impl Ord for Oid {
    fn cmp(&self, other: &Self) -> Ordering {
        self.numeric_segments()
            .cmp(&other.numeric_segments())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for Oid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Per-type OID namespaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    Interfaces,
    Controllers,
    Doors,
    Cards,
    Groups,
    Events,
    Logs,
    Users,
}

impl Namespace {
    pub const ALL: [Namespace; 8] = [
        Namespace::Interfaces,
        Namespace::Controllers,
        Namespace::Doors,
        Namespace::Cards,
        Namespace::Groups,
        Namespace::Events,
        Namespace::Logs,
        Namespace::Users,
    ];

    pub fn prefix(&self) -> &'static str {
        match self {
            Namespace::Interfaces => "0.1",
            Namespace::Controllers => "0.2",
            Namespace::Doors => "0.3",
            Namespace::Cards => "0.4",
            Namespace::Groups => "0.5",
            Namespace::Events => "0.6",
            Namespace::Logs => "0.7",
            Namespace::Users => "0.8",
        }
    }

    pub fn oid(&self) -> Oid {
        Oid::new(self.prefix())
    }

    /// OID of instance `n` in this namespace
    pub fn instance(&self, n: u32) -> Oid {
        self.oid().child(n)
    }

    /// Namespace an OID belongs to
    pub fn of(oid: &Oid) -> Option<Namespace> {
        Self::ALL
            .into_iter()
            .find(|ns| oid.has_prefix(&ns.oid()) && oid != &ns.oid())
    }

    /// Splits a field OID into (instance OID, instance number, field suffix).
    /// The suffix keeps its leading dot and is empty for the instance itself.
    pub fn split<'a>(&self, oid: &'a Oid) -> Option<(Oid, u32, &'a str)> {
        let rest = oid.suffix_of(&self.oid())?.strip_prefix('.')?;
        let (instance, suffix) = match rest.find('.') {
            Some(ix) => (&rest[..ix], &rest[ix..]),
            None => (rest, ""),
        };
        let n = instance.parse::<u32>().ok()?;
        Some((self.instance(n), n, suffix))
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Namespace::Interfaces => "interfaces",
            Namespace::Controllers => "controllers",
            Namespace::Doors => "doors",
            Namespace::Cards => "cards",
            Namespace::Groups => "groups",
            Namespace::Events => "events",
            Namespace::Logs => "logs",
            Namespace::Users => "users",
        };
        f.write_str(name)
    }
}
