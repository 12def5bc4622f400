//! Events - append-only log of what devices reported
//!
//! An event is keyed by `(device id, index)`. An index the device could not
//! return is recorded as a `missing` placeholder; a later successful fetch
//! fills the placeholder in place and keeps its OID. Recorded events are
//! otherwise immutable.
//!
//! A placeholder is asked for again on later cycles until the device has
//! failed to return it `REFETCH_ATTEMPTS` times.

use crate::auth::EntityKind;
use crate::catalog::{fields, Namespace, Oid, Snapshot};
use crate::device_gateway::{DeviceEvent, Direction};
use crate::error::Result;
use crate::system::Store;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Fetch attempts after which a placeholder is given up on
pub const REFETCH_ATTEMPTS: u32 = 3;

/// Display names resolved when the event is recorded
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedNames {
    #[serde(default)]
    pub controller: String,
    #[serde(default)]
    pub door: String,
    #[serde(default)]
    pub card: String,
}

/// Recorded event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub oid: Oid,
    pub device_id: u32,
    pub index: u32,
    /// Placeholder for an index the device could not return
    #[serde(default)]
    pub missing: bool,
    /// Failed fetches of a placeholder
    #[serde(default, skip_serializing_if = "is_zero")]
    pub attempts: u32,
    #[serde(default)]
    pub kind: u8,
    #[serde(default)]
    pub door: u8,
    #[serde(default)]
    pub direction: Option<Direction>,
    #[serde(default)]
    pub card: u32,
    #[serde(default)]
    pub timestamp: Option<NaiveDateTime>,
    #[serde(default)]
    pub granted: bool,
    #[serde(default)]
    pub reason: u8,
    #[serde(default)]
    pub names: ResolvedNames,
    pub recorded: DateTime<Utc>,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl Event {
    fn fill(&mut self, event: &DeviceEvent, names: ResolvedNames) {
        self.missing = false;
        self.attempts = 0;
        self.kind = event.kind;
        self.door = event.door;
        self.direction = Some(event.direction);
        self.card = event.card;
        self.timestamp = Some(event.timestamp);
        self.granted = event.granted;
        self.reason = event.reason;
        self.names = names;
        self.recorded = Utc::now();
    }
}

/// Event store
#[derive(Debug, Clone, Default)]
pub struct Events {
    events: BTreeMap<Oid, Event>,
    /// device id -> index -> event OID
    index: HashMap<u32, BTreeMap<u32, Oid>>,
}

#[derive(Serialize, Deserialize)]
struct Blob {
    events: Vec<Event>,
}

impl Events {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn get(&self, oid: &Oid) -> Option<&Event> {
        self.events.get(oid)
    }

    pub fn find(&self, device_id: u32, index: u32) -> Option<&Event> {
        self.index
            .get(&device_id)
            .and_then(|m| m.get(&index))
            .and_then(|oid| self.events.get(oid))
    }

    /// Every index known for a device, missing placeholders included
    pub fn known(&self, device_id: u32) -> BTreeSet<u32> {
        self.index
            .get(&device_id)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Placeholders of a device still worth asking for again
    pub fn refetch(&self, device_id: u32) -> BTreeSet<u32> {
        self.index
            .get(&device_id)
            .map(|m| {
                m.iter()
                    .filter(|(_, oid)| {
                        self.events
                            .get(*oid)
                            .is_some_and(|e| e.missing && e.attempts < REFETCH_ATTEMPTS)
                    })
                    .map(|(index, _)| *index)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Device ids with at least one recorded event
    pub fn devices(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.index.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Most recent first (by device index within a device, by OID across devices)
    pub fn list(&self, device_id: Option<u32>, limit: usize) -> Vec<&Event> {
        match device_id {
            Some(id) => self
                .index
                .get(&id)
                .map(|m| {
                    m.values()
                        .rev()
                        .filter_map(|oid| self.events.get(oid))
                        .take(limit)
                        .collect()
                })
                .unwrap_or_default(),
            None => self.events.values().rev().take(limit).collect(),
        }
    }

    /// Records a fetched event. Returns the event OID and whether anything changed.
    pub fn record(
        &mut self,
        catalog: &mut Snapshot,
        device_id: u32,
        event: &DeviceEvent,
        names: ResolvedNames,
    ) -> (Oid, bool) {
        if let Some(oid) = self.index.get(&device_id).and_then(|m| m.get(&event.index)).cloned() {
            if let Some(existing) = self.events.get_mut(&oid) {
                if !existing.missing {
                    return (oid, false);
                }
                existing.fill(event, names);
                return (oid, true);
            }
        }

        let oid = self.insert(catalog, device_id, event.index);
        if let Some(entry) = self.events.get_mut(&oid) {
            entry.fill(event, names);
        }
        (oid, true)
    }

    /// Records a placeholder for an index the device did not return.
    /// Returns the OID of a new placeholder; an existing placeholder only
    /// counts the failed attempt and a recorded event is left alone.
    pub fn record_missing(&mut self, catalog: &mut Snapshot, device_id: u32, index: u32) -> Option<Oid> {
        if let Some(oid) = self.index.get(&device_id).and_then(|m| m.get(&index)) {
            if let Some(existing) = self.events.get_mut(oid) {
                if existing.missing {
                    existing.attempts = existing.attempts.saturating_add(1);
                }
            }
            return None;
        }
        Some(self.insert(catalog, device_id, index))
    }

    fn insert(&mut self, catalog: &mut Snapshot, device_id: u32, index: u32) -> Oid {
        let oid = catalog.allocate(Namespace::Events);
        let event = Event {
            oid: oid.clone(),
            device_id,
            index,
            missing: true,
            attempts: 1,
            kind: 0,
            door: 0,
            direction: None,
            card: 0,
            timestamp: None,
            granted: false,
            reason: 0,
            names: ResolvedNames::default(),
            recorded: Utc::now(),
        };
        Self::mirror(catalog, &event);
        self.index.entry(device_id).or_default().insert(index, oid.clone());
        self.events.insert(oid.clone(), event);
        oid
    }

    fn mirror(catalog: &mut Snapshot, event: &Event) {
        let ns = Namespace::Events;
        catalog.put_v(ns, event.oid.append(fields::event::DEVICE_ID), event.device_id);
        catalog.put_v(ns, event.oid.append(fields::event::INDEX), event.index);
    }
}

impl Store for Events {
    const NAMESPACE: Namespace = Namespace::Events;
    const KIND: EntityKind = EntityKind::Event;

    fn validate(&self) -> Result<()> {
        Ok(())
    }

    // events are never soft-deleted
    fn sweep(&mut self, _catalog: &mut Snapshot, _cutoff: DateTime<Utc>) -> Vec<Oid> {
        Vec::new()
    }

    fn load(&mut self, catalog: &mut Snapshot, blob: &[u8]) -> Result<()> {
        let blob: Blob = serde_json::from_slice(blob)?;

        self.events.clear();
        self.index.clear();
        for event in blob.events {
            catalog.put_instance(Self::NAMESPACE, &event.oid, false);
            Self::mirror(catalog, &event);
            self.index
                .entry(event.device_id)
                .or_default()
                .insert(event.index, event.oid.clone());
            self.events.insert(event.oid.clone(), event);
        }

        Ok(())
    }

    fn save(&self) -> Result<Vec<u8>> {
        let blob = Blob {
            events: self.events.values().cloned().collect(),
        };
        Ok(serde_json::to_vec_pretty(&blob)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn swipe(index: u32) -> DeviceEvent {
        DeviceEvent {
            index,
            kind: 1,
            door: 1,
            direction: Direction::In,
            card: 6514231,
            timestamp: chrono::NaiveDate::from_ymd_opt(2021, 6, 1)
                .and_then(|d| d.and_hms_opt(12, 0, 0))
                .unwrap(),
            granted: true,
            reason: 1,
        }
    }

    #[test]
    fn test_missing_placeholder_filled_in_place() {
        let mut catalog = Snapshot::new(None);
        let mut events = Events::new();

        let placeholder = events.record_missing(&mut catalog, 405419896, 37).unwrap();
        assert!(events.find(405419896, 37).unwrap().missing);
        assert!(events.known(405419896).contains(&37));

        let names = ResolvedNames {
            controller: "Alpha".into(),
            door: "Great Hall".into(),
            card: "Alice".into(),
        };
        let (oid, changed) = events.record(&mut catalog, 405419896, &swipe(37), names);
        assert!(changed);
        assert_eq!(oid, placeholder);

        let event = events.get(&oid).unwrap();
        assert!(!event.missing);
        assert_eq!(event.card, 6514231);
        assert_eq!(event.names.door, "Great Hall");
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_recorded_events_are_immutable() {
        let mut catalog = Snapshot::new(None);
        let mut events = Events::new();

        let (oid, _) = events.record(&mut catalog, 1, &swipe(5), ResolvedNames::default());
        let mut replay = swipe(5);
        replay.card = 99;
        let (again, changed) = events.record(&mut catalog, 1, &replay, ResolvedNames::default());

        assert_eq!(oid, again);
        assert!(!changed);
        assert_eq!(events.get(&oid).unwrap().card, 6514231);
        assert!(events.record_missing(&mut catalog, 1, 5).is_none());
    }

    #[test]
    fn test_placeholder_refetch_is_bounded() {
        let mut catalog = Snapshot::new(None);
        let mut events = Events::new();

        events.record_missing(&mut catalog, 7, 40);
        events.record(&mut catalog, 7, &swipe(41), ResolvedNames::default());
        assert_eq!(events.refetch(7), BTreeSet::from([40]));

        for _ in 1..REFETCH_ATTEMPTS {
            assert!(events.record_missing(&mut catalog, 7, 40).is_none());
        }
        assert_eq!(events.find(7, 40).unwrap().attempts, REFETCH_ATTEMPTS);
        assert!(events.refetch(7).is_empty());
        assert!(events.refetch(8).is_empty());
    }

    #[test]
    fn test_list_newest_first() {
        let mut catalog = Snapshot::new(None);
        let mut events = Events::new();
        for index in [3, 1, 2] {
            events.record(&mut catalog, 7, &swipe(index), ResolvedNames::default());
        }

        let indices: Vec<u32> = events.list(Some(7), 2).iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![3, 2]);
        assert!(events.list(Some(8), 10).is_empty());
    }
}
