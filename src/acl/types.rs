//! ACL data types

use crate::device_gateway::CardRecord;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One card's permission on one controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permission {
    pub from: NaiveDate,
    pub to: NaiveDate,
    /// Grant per door slot 1..4 (index 0 = slot 1)
    pub doors: [u8; 4],
}

impl Permission {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Self {
        Self {
            from,
            to,
            doors: [0; 4],
        }
    }

    /// Sets or clears the grant for a 1-based slot
    pub fn set(&mut self, slot: u8, granted: bool) {
        if let 1..=4 = slot {
            self.doors[usize::from(slot - 1)] = u8::from(granted);
        }
    }

    pub fn granted(&self, slot: u8) -> bool {
        matches!(slot, 1..=4) && self.doors[usize::from(slot - 1)] != 0
    }

    pub fn record(&self, number: u32) -> CardRecord {
        CardRecord {
            number,
            from: self.from,
            to: self.to,
            doors: self.doors,
        }
    }
}

impl From<&CardRecord> for Permission {
    fn from(record: &CardRecord) -> Self {
        Self {
            from: record.from,
            to: record.to,
            doors: record.doors,
        }
    }
}

/// Card number -> permission, for one controller
pub type DeviceAcl = BTreeMap<u32, Permission>;

/// Controller device id -> card table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl(BTreeMap<u32, DeviceAcl>);

impl Acl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an empty table for a controller if it has none
    pub fn add_device(&mut self, device_id: u32) {
        self.0.entry(device_id).or_default();
    }

    pub fn device(&self, device_id: u32) -> Option<&DeviceAcl> {
        self.0.get(&device_id)
    }

    pub fn device_mut(&mut self, device_id: u32) -> Option<&mut DeviceAcl> {
        self.0.get_mut(&device_id)
    }

    pub fn devices(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u32, &DeviceAcl)> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&u32, &mut DeviceAcl)> {
        self.0.iter_mut()
    }

    pub fn get(&self, device_id: u32, card: u32) -> Option<&Permission> {
        self.0.get(&device_id).and_then(|acl| acl.get(&card))
    }

    pub fn get_mut(&mut self, device_id: u32, card: u32) -> Option<&mut Permission> {
        self.0.get_mut(&device_id).and_then(|acl| acl.get_mut(&card))
    }

    /// Every card number granted on at least one controller
    pub fn cards(&self) -> BTreeSet<u32> {
        self.0.values().flat_map(|table| table.keys().copied()).collect()
    }

    /// Builds an ACL from card records read off devices
    pub fn from_records(records: impl IntoIterator<Item = (u32, Vec<CardRecord>)>) -> Self {
        let mut acl = Self::new();
        for (device_id, cards) in records {
            let table = acl.0.entry(device_id).or_default();
            for card in &cards {
                table.insert(card.number, Permission::from(card));
            }
        }
        acl
    }
}
