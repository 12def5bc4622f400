//! Catalog tables
//!
//! A `Snapshot` is the full catalog content: one identity table per
//! namespace plus the flat `(OID + field suffix) -> value` map. Writers
//! mutate a private copy and swap it in; readers keep an `Arc` to a
//! consistent snapshot.

use super::fields;
use super::oid::{Namespace, Oid};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Attribute value stored against a field OID
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Text(String),
    Uint(u32),
    Bool(bool),
    Oid(Oid),
    Date(NaiveDate),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(s) => f.write_str(s),
            Value::Uint(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Oid(oid) => write!(f, "{}", oid),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Uint(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<Oid> for Value {
    fn from(oid: Oid) -> Self {
        Value::Oid(oid)
    }
}

impl From<NaiveDate> for Value {
    fn from(d: NaiveDate) -> Self {
        Value::Date(d)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Entry {
    deleted: bool,
}

/// Identity table and field values of one namespace
#[derive(Debug, Clone, Default)]
struct Table {
    entries: BTreeMap<u32, Entry>,
    last: u32,
    /// Compaction bound: `Some(n)` reuses the lowest free slot in 1..=n,
    /// `None` always grows
    limit: Option<u32>,
    values: HashMap<Oid, Value>,
}

/// Catalog content
///
/// Tables are shared between snapshots and copied on first write, so a
/// shadow only pays for the namespaces it touches.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    tables: HashMap<Namespace, Arc<Table>>,
}

impl Snapshot {
    /// Empty catalog. `limit` applies to every namespace except the
    /// append-only ones (events, logs), which always grow.
    pub fn new(limit: Option<u32>) -> Self {
        let mut snapshot = Self::default();
        for ns in Namespace::ALL {
            let limit = match ns {
                Namespace::Events | Namespace::Logs => None,
                _ => limit,
            };
            snapshot.tables.insert(
                ns,
                Arc::new(Table {
                    limit,
                    ..Default::default()
                }),
            );
        }
        snapshot
    }

    fn table(&self, ns: Namespace) -> Option<&Table> {
        self.tables.get(&ns).map(Arc::as_ref)
    }

    fn table_mut(&mut self, ns: Namespace) -> &mut Table {
        Arc::make_mut(self.tables.entry(ns).or_default())
    }

    fn check_namespace(ns: Namespace, oid: &Oid) {
        if !oid.has_prefix(&ns.oid()) || oid == &ns.oid() {
            panic!("catalog: OID {} is outside the {} namespace ({})", oid, ns, ns.prefix());
        }
    }

    /// Allocates the next instance OID in a namespace. Never returns an OID
    /// held by an entry, live or soft-deleted.
    pub fn allocate(&mut self, ns: Namespace) -> Oid {
        let table = self.table_mut(ns);
        let next = table.last + 1;
        let item = match table.limit {
            Some(limit) => (1..=limit)
                .find(|n| !table.entries.contains_key(n))
                .unwrap_or(next),
            None => next,
        };

        table.entries.insert(item, Entry::default());
        table.last = table.last.max(item);

        ns.instance(item)
    }

    /// Puts an instance at a specific OID (used when loading persisted state).
    ///
    /// Panics if the OID is outside `ns` or already present.
    pub fn put_instance(&mut self, ns: Namespace, oid: &Oid, deleted: bool) {
        Self::check_namespace(ns, oid);
        let n = match ns.split(oid) {
            Some((_, n, "")) => n,
            _ => panic!("catalog: {} is not an instance OID of {}", oid, ns),
        };

        let table = self.table_mut(ns);
        if table.entries.contains_key(&n) {
            panic!("catalog: duplicate instance OID {}", oid);
        }
        table.entries.insert(n, Entry { deleted });
        table.last = table.last.max(n);
    }

    /// Sets a field value. Panics if the OID is outside `ns`.
    pub fn put_v(&mut self, ns: Namespace, oid: Oid, value: impl Into<Value>) {
        Self::check_namespace(ns, &oid);
        self.table_mut(ns).values.insert(oid, value.into());
    }

    /// Clears a field value. Panics if the OID is outside `ns`.
    pub fn clear_v(&mut self, ns: Namespace, oid: &Oid) {
        Self::check_namespace(ns, oid);
        if self.table(ns).is_some_and(|t| t.values.contains_key(oid)) {
            self.table_mut(ns).values.remove(oid);
        }
    }

    pub fn get_v(&self, oid: &Oid) -> Option<&Value> {
        let ns = Namespace::of(oid)?;
        self.table(ns)?.values.get(oid)
    }

    /// Marks an instance soft-deleted; the OID stays reserved until removed
    pub fn mark_deleted(&mut self, ns: Namespace, oid: &Oid) {
        Self::check_namespace(ns, oid);
        if let Some((_, n, "")) = ns.split(oid) {
            if let Some(entry) = self.table_mut(ns).entries.get_mut(&n) {
                entry.deleted = true;
            }
        }
    }

    /// Permanently removes an instance and every field below it
    pub fn remove(&mut self, ns: Namespace, oid: &Oid) {
        Self::check_namespace(ns, oid);
        let table = self.table_mut(ns);
        if let Some((_, n, "")) = ns.split(oid) {
            table.entries.remove(&n);
        }
        table.values.retain(|k, _| !k.has_prefix(oid));
    }

    pub fn is_live(&self, ns: Namespace, oid: &Oid) -> bool {
        match ns.split(oid) {
            Some((_, n, "")) => self
                .table(ns)
                .and_then(|t| t.entries.get(&n))
                .is_some_and(|e| !e.deleted),
            _ => false,
        }
    }

    /// All live instance OIDs of a namespace, in OID order
    pub fn list_live(&self, ns: Namespace) -> Vec<Oid> {
        self.table(ns)
            .map(|t| {
                t.entries
                    .iter()
                    .filter(|(_, e)| !e.deleted)
                    .map(|(n, _)| ns.instance(*n))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Reverse lookup: the first live instance whose `suffix` field equals `value`
    pub fn find(&self, ns: Namespace, suffix: &str, value: &Value) -> Option<Oid> {
        let table = self.table(ns)?;
        self.list_live(ns)
            .into_iter()
            .find(|oid| table.values.get(&oid.append(suffix)) == Some(value))
    }

    /// True when both snapshots share the same table for `ns`
    #[cfg(test)]
    pub(crate) fn shares_table(&self, other: &Snapshot, ns: Namespace) -> bool {
        match (self.tables.get(&ns), other.tables.get(&ns)) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    // ========================================
    // Typed views
    // ========================================

    /// Device id of a controller (0 or absent means unassigned)
    pub fn controller_device_id(&self, controller: &Oid) -> Option<u32> {
        match self.get_v(&controller.append(fields::controller::DEVICE_ID)) {
            Some(Value::Uint(id)) if *id != 0 => Some(*id),
            _ => None,
        }
    }

    /// Live controller OID for a device id
    pub fn find_controller(&self, device_id: u32) -> Option<Oid> {
        if device_id == 0 {
            return None;
        }
        self.find(
            Namespace::Controllers,
            fields::controller::DEVICE_ID,
            &Value::Uint(device_id),
        )
    }

    /// Door assigned to a controller slot
    pub fn controller_door(&self, controller: &Oid, slot: u8) -> Option<Oid> {
        match self.get_v(&controller.append(&fields::controller::door(slot))) {
            Some(Value::Oid(door)) => Some(door.clone()),
            _ => None,
        }
    }

    /// Owning `(device id, door slot)` of a door: the first live controller,
    /// in OID order, with a non-zero device id and the door in one of its slots
    pub fn door_slot(&self, door: &Oid) -> Option<(u32, u8)> {
        for controller in self.list_live(Namespace::Controllers) {
            let Some(device_id) = self.controller_device_id(&controller) else {
                continue;
            };
            for slot in 1..=4u8 {
                if self.controller_door(&controller, slot).as_ref() == Some(door) {
                    return Some((device_id, slot));
                }
            }
        }
        None
    }

    pub fn text(&self, oid: &Oid) -> Option<&str> {
        match self.get_v(oid) {
            Some(Value::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }
}
