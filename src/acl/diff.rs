//! ACL diff
//!
//! Partitions, per controller, the union of computed and device cards into
//! unchanged / updated / added / deleted.

use super::{Acl, DeviceAcl, Permission};
use crate::device_gateway::CardRecord;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Diff for one controller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceDiff {
    pub unchanged: Vec<u32>,
    /// Present on both, validity window or doors differ (computed value)
    pub updated: Vec<CardRecord>,
    /// Computed but absent on the device
    pub added: Vec<CardRecord>,
    /// On the device but not (or no longer validly) computed
    pub deleted: Vec<u32>,
}

impl DeviceDiff {
    pub fn is_in_sync(&self) -> bool {
        self.updated.is_empty() && self.added.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.unchanged.len() + self.updated.len() + self.added.len() + self.deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Totals across all compared controllers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiffTotals {
    pub unchanged: usize,
    pub updated: usize,
    pub added: usize,
    pub deleted: usize,
}

impl DiffTotals {
    pub fn out_of_sync(&self) -> usize {
        self.updated + self.added + self.deleted
    }
}

/// System-wide comparison
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompareReport {
    pub devices: BTreeMap<u32, DeviceDiff>,
    /// Controllers that could not be read, with the reason
    pub unreachable: BTreeMap<u32, String>,
    pub totals: DiffTotals,
}

impl CompareReport {
    /// Non-zero updated + added + deleted anywhere
    pub fn is_out_of_sync(&self) -> bool {
        self.totals.out_of_sync() > 0
    }

    pub fn out_of_sync_devices(&self) -> impl Iterator<Item = (u32, &DeviceDiff)> {
        self.devices
            .iter()
            .filter(|(_, diff)| !diff.is_in_sync())
            .map(|(id, diff)| (*id, diff))
    }
}

/// Compares one controller's computed table with what the device holds
pub fn diff_device(computed: Option<&DeviceAcl>, resident: &[CardRecord]) -> DeviceDiff {
    let empty = DeviceAcl::new();
    let computed = computed.unwrap_or(&empty);
    let resident: BTreeMap<u32, Permission> = resident
        .iter()
        .map(|record| (record.number, Permission::from(record)))
        .collect();

    let numbers: BTreeSet<u32> = computed.keys().chain(resident.keys()).copied().collect();
    let mut diff = DeviceDiff::default();

    for number in numbers {
        match (computed.get(&number), resident.get(&number)) {
            (Some(want), Some(have)) if want == have => diff.unchanged.push(number),
            (Some(want), Some(_)) => diff.updated.push(want.record(number)),
            (Some(want), None) => diff.added.push(want.record(number)),
            (None, Some(_)) => diff.deleted.push(number),
            (None, None) => {}
        }
    }

    diff
}

/// Builds the system-wide report from the device tables that could be read
pub fn compare(
    computed: &Acl,
    resident: BTreeMap<u32, Vec<CardRecord>>,
    unreachable: BTreeMap<u32, String>,
) -> CompareReport {
    let mut report = CompareReport {
        unreachable,
        ..Default::default()
    };

    for (device_id, records) in resident {
        let diff = diff_device(computed.device(device_id), &records);
        report.totals.unchanged += diff.unchanged.len();
        report.totals.updated += diff.updated.len();
        report.totals.added += diff.added.len();
        report.totals.deleted += diff.deleted.len();
        report.devices.insert(device_id, diff);
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn date(m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, m, d).unwrap()
    }

    fn record(number: u32, doors: [u8; 4]) -> CardRecord {
        CardRecord {
            number,
            from: date(1, 2),
            to: date(12, 30),
            doors,
        }
    }

    fn table(records: &[CardRecord]) -> DeviceAcl {
        records.iter().map(|r| (r.number, Permission::from(r))).collect()
    }

    #[test]
    fn test_partition() {
        let computed = table(&[record(1, [1, 0, 0, 0]), record(2, [1, 1, 0, 0]), record(3, [0, 0, 1, 0])]);
        let resident = vec![record(1, [1, 0, 0, 0]), record(2, [1, 0, 0, 0]), record(4, [1, 1, 1, 1])];

        let diff = diff_device(Some(&computed), &resident);
        assert_eq!(diff.unchanged, vec![1]);
        assert_eq!(diff.updated, vec![record(2, [1, 1, 0, 0])]);
        assert_eq!(diff.added, vec![record(3, [0, 0, 1, 0])]);
        assert_eq!(diff.deleted, vec![4]);

        // every card of the union lands in exactly one bucket
        assert_eq!(diff.len(), 4);
        assert!(!diff.is_in_sync());
    }

    #[test]
    fn test_validity_window_change_is_update() {
        let computed = table(&[record(1, [1, 0, 0, 0])]);
        let mut resident = record(1, [1, 0, 0, 0]);
        resident.to = date(6, 30);

        let diff = diff_device(Some(&computed), &[resident]);
        assert_eq!(diff.updated.len(), 1);
    }

    #[test]
    fn test_end_to_end_card_added() {
        let mut acl = Acl::new();
        acl.add_device(405419896);
        if let Some(table) = acl.device_mut(405419896) {
            table.insert(6514231, Permission::from(&record(6514231, [1, 0, 0, 0])));
        }

        let report = compare(&acl, BTreeMap::from([(405419896, vec![])]), BTreeMap::new());
        assert!(report.is_out_of_sync());
        assert_eq!(report.totals.added, 1);
        assert_eq!(report.devices[&405419896].added, vec![record(6514231, [1, 0, 0, 0])]);
    }

    #[test]
    fn test_unreachable_devices_are_not_empty() {
        let mut acl = Acl::new();
        acl.add_device(1);
        if let Some(table) = acl.device_mut(1) {
            table.insert(7, Permission::from(&record(7, [1, 0, 0, 0])));
        }

        let report = compare(&acl, BTreeMap::new(), BTreeMap::from([(1, "timeout".to_string())]));
        assert!(!report.is_out_of_sync());
        assert!(report.devices.is_empty());
        assert_eq!(report.unreachable[&1], "timeout");
    }

    #[test]
    fn test_device_without_controller_deletes_everything() {
        let report = compare(
            &Acl::new(),
            BTreeMap::from([(9, vec![record(1, [1, 0, 0, 0])])]),
            BTreeMap::new(),
        );
        assert_eq!(report.devices[&9].deleted, vec![1]);
    }
}
