//! ACL compare and synchronize against live devices
//!
//! Reads are best effort: a device that cannot be read is reported as
//! unreachable and skipped, never treated as holding an empty table.
//! Pushes are idempotent; anything that fails is retried next cycle.

use super::diff::{self, CompareReport, DeviceDiff};
use super::Acl;
use crate::cards::SyncStatus;
use crate::device_gateway::{CardRecord, DeviceError, DeviceGateway};
use crate::reconciler::fanout::fan_out;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Reads the card tables of `devices`
pub async fn read_resident(
    gateway: Arc<dyn DeviceGateway>,
    devices: Vec<u32>,
    concurrency: usize,
) -> (BTreeMap<u32, Vec<CardRecord>>, BTreeMap<u32, String>) {
    let results = fan_out(devices, concurrency, move |device_id| {
        let gateway = gateway.clone();
        async move { (device_id, gateway.get_card_records(device_id).await) }
    })
    .await;

    let mut resident = BTreeMap::new();
    let mut unreachable = BTreeMap::new();
    for (device_id, result) in results {
        match result {
            Ok(cards) => {
                resident.insert(device_id, cards);
            }
            Err(e) => {
                tracing::warn!(device_id, error = %e, "Could not read device cards");
                unreachable.insert(device_id, e.to_string());
            }
        }
    }

    (resident, unreachable)
}

/// Compares the computed ACL with every controller it names
pub async fn compare(gateway: Arc<dyn DeviceGateway>, acl: &Acl, concurrency: usize) -> CompareReport {
    let devices: Vec<u32> = acl.devices().collect();
    let (resident, unreachable) = read_resident(gateway, devices, concurrency).await;
    let report = diff::compare(acl, resident, unreachable);

    tracing::info!(
        unchanged = report.totals.unchanged,
        updated = report.totals.updated,
        added = report.totals.added,
        deleted = report.totals.deleted,
        unreachable = report.unreachable.len(),
        "ACL compared"
    );

    report
}

/// Push outcome for one controller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DevicePush {
    pub put: usize,
    pub deleted: usize,
    /// Card number and error of every failed call
    pub failed: Vec<(u32, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub pushes: BTreeMap<u32, DevicePush>,
    /// Re-read after the push
    pub verify: CompareReport,
    /// Per computed card: ok when every pushed device now agrees
    pub card_status: BTreeMap<u32, SyncStatus>,
}

/// Pushes corrections for every out-of-sync controller in `report`, then
/// re-reads those controllers to verify
pub async fn synchronize(
    gateway: Arc<dyn DeviceGateway>,
    acl: &Acl,
    report: &CompareReport,
    concurrency: usize,
) -> SyncReport {
    let work: Vec<(u32, DeviceDiff)> = report
        .out_of_sync_devices()
        .map(|(id, diff)| (id, diff.clone()))
        .collect();

    if work.is_empty() {
        return SyncReport::default();
    }

    let devices: Vec<u32> = work.iter().map(|(id, _)| *id).collect();

    let push_gateway = gateway.clone();
    let pushes = fan_out(work, concurrency, move |(device_id, diff)| {
        let gateway = push_gateway.clone();
        async move { (device_id, push_device(gateway.as_ref(), device_id, &diff).await) }
    })
    .await;

    let (resident, unreachable) = read_resident(gateway, devices, concurrency).await;
    let verify = diff::compare(acl, resident, unreachable);
    let card_status = card_status(acl, &verify);

    let report = SyncReport {
        pushes: pushes.into_iter().collect(),
        verify,
        card_status,
    };

    let failed: usize = report.pushes.values().map(|p| p.failed.len()).sum();
    tracing::info!(
        devices = report.pushes.len(),
        failed,
        remaining = report.verify.totals.out_of_sync(),
        "ACL synchronized"
    );

    report
}

async fn push_device(gateway: &dyn DeviceGateway, device_id: u32, diff: &DeviceDiff) -> DevicePush {
    let mut push = DevicePush::default();

    for card in diff.updated.iter().chain(&diff.added) {
        match gateway.put_card(device_id, *card).await {
            Ok(()) => {
                push.put += 1;
                tracing::debug!(device_id, card = card.number, "Card pushed");
            }
            Err(e) => push_failed(&mut push, device_id, card.number, e),
        }
    }

    for &number in &diff.deleted {
        match gateway.delete_card(device_id, number).await {
            Ok(()) => {
                push.deleted += 1;
                tracing::debug!(device_id, card = number, "Card deleted");
            }
            Err(e) => push_failed(&mut push, device_id, number, e),
        }
    }

    push
}

fn push_failed(push: &mut DevicePush, device_id: u32, card: u32, e: DeviceError) {
    tracing::warn!(device_id, card, error = %e, "Card push failed");
    push.failed.push((card, e.to_string()));
}

/// Sync status of every computed card on the verified controllers. A card
/// is `error` if any of them still disagrees or could not be read.
fn card_status(acl: &Acl, verify: &CompareReport) -> BTreeMap<u32, SyncStatus> {
    let mut status = BTreeMap::new();

    for (device_id, diff) in &verify.devices {
        let Some(table) = acl.device(*device_id) else {
            continue;
        };
        for &number in table.keys() {
            let disagrees = diff.updated.iter().chain(&diff.added).any(|c| c.number == number);
            merge(&mut status, number, disagrees);
        }
    }

    for device_id in verify.unreachable.keys() {
        if let Some(table) = acl.device(*device_id) {
            for &number in table.keys() {
                merge(&mut status, number, true);
            }
        }
    }

    status
}

fn merge(status: &mut BTreeMap<u32, SyncStatus>, card: u32, error: bool) {
    let entry = status.entry(card).or_insert(SyncStatus::Ok);
    if error {
        *entry = SyncStatus::Error;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::Permission;
    use crate::device_gateway::{GatewayCall, MemoryGateway, SimDevice};
    use chrono::NaiveDate;

    fn record(number: u32, doors: [u8; 4]) -> CardRecord {
        CardRecord {
            number,
            from: NaiveDate::from_ymd_opt(2021, 1, 2).unwrap(),
            to: NaiveDate::from_ymd_opt(2021, 12, 30).unwrap(),
            doors,
        }
    }

    fn acl(device_id: u32, records: &[CardRecord]) -> Acl {
        let mut acl = Acl::new();
        acl.add_device(device_id);
        if let Some(table) = acl.device_mut(device_id) {
            for r in records {
                table.insert(r.number, Permission::from(r));
            }
        }
        acl
    }

    #[tokio::test]
    async fn test_synchronize_pushes_added_and_deletes_stale() {
        let mut device = SimDevice::new(405419896);
        device.cards.insert(99, record(99, [1, 1, 1, 1]));
        let gateway = Arc::new(MemoryGateway::with_devices([device]));
        let acl = acl(405419896, &[record(6514231, [1, 0, 0, 0])]);

        let report = compare(gateway.clone(), &acl, 4).await;
        assert!(report.is_out_of_sync());

        let sync = synchronize(gateway.clone(), &acl, &report, 4).await;
        assert_eq!(
            gateway.writes(),
            vec![
                GatewayCall::PutCard(405419896, record(6514231, [1, 0, 0, 0])),
                GatewayCall::DeleteCard(405419896, 99),
            ]
        );
        assert!(!sync.verify.is_out_of_sync());
        assert_eq!(sync.card_status.get(&6514231), Some(&SyncStatus::Ok));

        // second pass finds nothing to do
        gateway.clear_calls();
        let report = compare(gateway.clone(), &acl, 4).await;
        let sync = synchronize(gateway.clone(), &acl, &report, 4).await;
        assert!(gateway.writes().is_empty());
        assert!(sync.pushes.is_empty());
    }

    #[tokio::test]
    async fn test_offline_device_reported_unreachable() {
        let gateway = Arc::new(MemoryGateway::with_devices([SimDevice::new(1)]));
        gateway.set_online(1, false);

        let report = compare(gateway.clone(), &acl(1, &[record(5, [1, 0, 0, 0])]), 4).await;
        assert!(report.unreachable.contains_key(&1));
        assert!(!report.is_out_of_sync());
    }

    #[tokio::test]
    async fn test_device_dropping_offline_mid_sync_marks_error() {
        let gateway = Arc::new(MemoryGateway::with_devices([SimDevice::new(1)]));
        let acl = acl(1, &[record(5, [1, 0, 0, 0])]);
        let report = compare(gateway.clone(), &acl, 4).await;

        gateway.set_online(1, false);
        let sync = synchronize(gateway.clone(), &acl, &report, 4).await;

        assert_eq!(sync.pushes[&1].failed.len(), 1);
        assert_eq!(sync.card_status.get(&5), Some(&SyncStatus::Error));
    }
}
