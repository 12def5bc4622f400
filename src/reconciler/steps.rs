//! Reconciliation steps
//!
//! Each step fans out per controller, joins, and only then writes what it
//! learned back into the system. A device failure is logged and skipped;
//! it never aborts the step for the other devices.

use super::fanout::fan_out;
use super::types::{CycleReport, ReconcilerConfig};
use crate::acl::{self, Acl, CompareReport, SyncReport};
use crate::controllers::{Connection, DoorState};
use crate::device_gateway::{DeviceGateway, DeviceResult, EventIndices, Fleet};
use crate::doors::DoorMode;
use crate::event_gaps;
use crate::rules::Rules;
use crate::system::{DeviceEvents, System, View};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Everything a step needs
pub(super) struct Context {
    pub system: Arc<System>,
    pub fleet: Arc<Fleet>,
    pub rules: Arc<dyn Rules>,
    pub config: ReconcilerConfig,
}

impl Context {
    fn gateway(&self) -> Arc<dyn DeviceGateway> {
        self.fleet.clone()
    }
}

// ========================================
// Discovery
// ========================================

/// Routes every reachable device to its link and notes the ones no
/// controller entity claims yet
pub(super) async fn discover(ctx: &Context, report: &mut CycleReport) {
    let mut devices: Vec<u32> = ctx.fleet.discover().await.into_iter().map(|(_, id)| id).collect();
    devices.sort_unstable();
    devices.dedup();

    let view = ctx.system.view().await;
    for &device_id in &devices {
        if view.state.controllers.find_by_device(device_id).is_none() {
            ctx.system.status.record_seen(device_id, None).await;
            report.unconfigured.push(device_id);
        }
    }

    report.discovered = devices.len();
    if !report.unconfigured.is_empty() {
        tracing::info!(devices = ?report.unconfigured, "Unconfigured controllers on the network");
    }
}

// ========================================
// Status refresh
// ========================================

pub(super) async fn refresh(ctx: &Context, view: &View, report: &mut CycleReport) {
    let targets: Vec<(u32, Vec<u8>)> = view
        .state
        .controllers
        .configured()
        .map(|c| (c.device_id, c.assigned().map(|(slot, _)| slot).collect()))
        .collect();

    let gateway = ctx.gateway();
    let results = fan_out(targets, ctx.config.concurrency, move |(device_id, slots)| {
        let gateway = gateway.clone();
        async move {
            let status = gateway.get_status(device_id).await;
            let mut doors = Vec::new();
            if status.is_ok() {
                for slot in slots {
                    doors.push((slot, read_door(gateway.as_ref(), device_id, slot).await));
                }
            }
            (device_id, status, doors)
        }
    })
    .await;

    for (device_id, status, doors) in results {
        match status {
            Ok(status) => {
                ctx.system.status.record_ok(&status).await;
                for (slot, state) in doors {
                    ctx.system.status.record_door(device_id, slot, state).await;
                }
                report.refreshed += 1;
            }
            Err(e) => {
                // transitions are logged by the tracker
                tracing::debug!(device_id, error = %e, "Controller refresh failed");
                ctx.system.status.record_error(device_id, &e.to_string()).await;
                report.refresh_failed += 1;
            }
        }
    }
}

async fn read_door(gateway: &dyn DeviceGateway, device_id: u32, slot: u8) -> DoorState {
    let delay = gateway
        .get_door_delay(device_id, slot)
        .await
        .inspect_err(|e| tracing::debug!(device_id, slot, error = %e, "Door delay read failed"))
        .ok();
    let mode = gateway
        .get_door_control(device_id, slot)
        .await
        .inspect_err(|e| tracing::debug!(device_id, slot, error = %e, "Door control read failed"))
        .ok();

    DoorState { delay, mode }
}

// ========================================
// Event catch-up
// ========================================

struct EventFetch {
    indices: EventIndices,
    events: DeviceEvents,
}

/// Known indices and placeholders worth asking for again, per device
struct EventTarget {
    device_id: u32,
    known: BTreeSet<u32>,
    retry: BTreeSet<u32>,
}

pub(super) async fn fetch_events(ctx: &Context, view: &View, report: &mut CycleReport) {
    let targets: Vec<EventTarget> = view
        .state
        .controllers
        .configured()
        .map(|c| EventTarget {
            device_id: c.device_id,
            known: view.state.events.known(c.device_id),
            retry: view.state.events.refetch(c.device_id),
        })
        .collect();

    let gateway = ctx.gateway();
    let depth = ctx.config.gap_depth;
    let batch = ctx.config.event_batch;
    let results = fan_out(targets, ctx.config.concurrency, move |target| {
        let gateway = gateway.clone();
        async move {
            let device_id = target.device_id;
            (device_id, fetch_device_events(gateway.as_ref(), &target, depth, batch).await)
        }
    })
    .await;

    let mut batches = Vec::new();
    for (device_id, fetched) in results {
        match fetched {
            Ok(fetch) => {
                ctx.system.status.record_events(device_id, fetch.indices).await;
                batches.push(fetch.events);
            }
            Err(e) => tracing::debug!(device_id, error = %e, "Event indices unavailable"),
        }
    }

    // one commit for every device
    match ctx.system.record_events(&batches).await {
        Ok(outcomes) => {
            for (device_id, outcome) in outcomes {
                report.events_recorded += outcome.recorded;
                report.events_missing += outcome.missing;
                if outcome.recorded + outcome.missing > 0 {
                    tracing::debug!(
                        device_id,
                        recorded = outcome.recorded,
                        missing = outcome.missing,
                        "Events recorded"
                    );
                }
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "Could not record events");
            report.errors.push(format!("events: {}", e));
        }
    }
}

async fn fetch_device_events(
    gateway: &dyn DeviceGateway,
    target: &EventTarget,
    depth: i32,
    batch: usize,
) -> DeviceResult<EventFetch> {
    let device_id = target.device_id;
    let indices = gateway.get_event_indices(device_id).await?;
    let plan = event_gaps::plan_fetch(&target.known, &target.retry, &indices, depth, batch);

    let mut fetch = EventFetch {
        indices,
        events: DeviceEvents {
            device_id,
            events: Vec::with_capacity(plan.len()),
            missing: Vec::new(),
        },
    };

    for index in plan {
        match gateway.get_event(device_id, index).await {
            Ok(Some(event)) => fetch.events.events.push(event),
            Ok(None) => fetch.events.missing.push(index),
            Err(e) => {
                // keep what arrived, the rest is planned again next cycle
                tracing::debug!(device_id, index, error = %e, "Event fetch interrupted");
                break;
            }
        }
    }

    Ok(fetch)
}

// ========================================
// Sweep
// ========================================

pub(super) async fn sweep(ctx: &Context, report: &mut CycleReport) {
    let cutoff = Utc::now() - ctx.config.retention;
    match ctx.system.sweep(cutoff).await {
        Ok(swept) => {
            if !swept.is_empty() {
                tracing::info!(count = swept.len(), cutoff = %cutoff, "Expired entities swept");
            }
            report.swept = swept.len();
        }
        Err(e) => {
            tracing::error!(error = %e, "Sweep failed");
            report.errors.push(format!("sweep: {}", e));
        }
    }
}

// ========================================
// ACL
// ========================================

/// Builds the ACL and compares it with the devices
pub(super) async fn compare(ctx: &Context, view: &View, report: &mut CycleReport) -> (Acl, CompareReport) {
    let built = acl::build(&view.state, &view.catalog, ctx.rules.as_ref());
    report.rule_failures = built.failures.len();

    let dropped = ctx.system.retain_sync_status(&built.acl.cards()).await;
    if dropped > 0 {
        tracing::debug!(dropped, "Sync status cleared for revoked cards");
    }

    let compared = acl::sync::compare(ctx.gateway(), &built.acl, ctx.config.concurrency).await;
    for (device_id, diff) in &compared.devices {
        ctx.system.status.record_acl(*device_id, diff.is_in_sync()).await;
    }
    report.acl_out_of_sync = compared.totals.out_of_sync();

    (built.acl, compared)
}

/// Pushes the ACL to out-of-sync devices and records per-card outcome
pub(super) async fn push_acl(
    ctx: &Context,
    acl: &Acl,
    compared: &CompareReport,
    report: &mut CycleReport,
) -> SyncReport {
    if !compared.is_out_of_sync() {
        return SyncReport::default();
    }

    let synced = acl::sync::synchronize(ctx.gateway(), acl, compared, ctx.config.concurrency).await;
    report.cards_pushed += synced.pushes.values().map(|p| p.put + p.deleted).sum::<usize>();

    for (card, status) in &synced.card_status {
        ctx.system.set_sync_status(*card, *status).await;
    }
    for (device_id, diff) in &synced.verify.devices {
        ctx.system.status.record_acl(*device_id, diff.is_in_sync()).await;
    }

    synced
}

// ========================================
// Clock and door resync
// ========================================

/// Sets the clock of every online controller that drifted beyond the
/// tolerated skew. Returns the number of clocks set.
pub(super) async fn set_clocks(ctx: &Context, view: &View) -> usize {
    let now = Utc::now();
    let tolerance = ctx.config.clock_skew.num_seconds();

    let mut targets = Vec::new();
    for controller in view.state.controllers.configured() {
        let Some(record) = ctx.system.status.get(controller.device_id).await else {
            continue;
        };
        if record.connection != Connection::Online {
            continue;
        }
        let Some(device_now) = record.device_now(now) else {
            continue;
        };

        let tz = controller.tz();
        let skew = (device_now - now.with_timezone(&tz).naive_local()).num_seconds();
        if skew.abs() > tolerance {
            targets.push((controller.device_id, tz, skew));
        }
    }

    let gateway = ctx.gateway();
    let results = fan_out(targets, ctx.config.concurrency, move |(device_id, tz, skew)| {
        let gateway = gateway.clone();
        async move {
            let time = Utc::now().with_timezone(&tz).naive_local();
            tracing::info!(device_id, skew_secs = skew, tz = %tz, "Setting controller clock");
            (device_id, time, gateway.set_time(device_id, time).await)
        }
    })
    .await;

    let mut set = 0;
    for (device_id, time, result) in results {
        match result {
            Ok(()) => {
                ctx.system.status.record_time(device_id, time).await;
                set += 1;
            }
            Err(e) => tracing::warn!(device_id, error = %e, "Could not set controller clock"),
        }
    }
    set
}

struct DoorFix {
    device_id: u32,
    slot: u8,
    current: DoorState,
    delay: Option<u8>,
    mode: Option<DoorMode>,
}

/// Pushes configured door delay/mode where the device reports a different
/// value. Returns the number of settings written.
pub(super) async fn set_doors(ctx: &Context, view: &View) -> usize {
    let mut targets = Vec::new();

    for controller in view.state.controllers.configured() {
        let Some(record) = ctx.system.status.get(controller.device_id).await else {
            continue;
        };
        if record.connection != Connection::Online {
            continue;
        }

        for (slot, door) in controller.assigned() {
            let Some(door) = view.state.doors.live(door) else {
                continue;
            };
            let current = record.doors[usize::from(slot - 1)];
            let delay = door.delay.filter(|want| current.delay.is_some_and(|have| have != *want));
            let mode = door.mode.filter(|want| current.mode.is_some_and(|have| have != *want));

            if delay.is_some() || mode.is_some() {
                targets.push(DoorFix {
                    device_id: controller.device_id,
                    slot,
                    current,
                    delay,
                    mode,
                });
            }
        }
    }

    let gateway = ctx.gateway();
    let results = fan_out(targets, ctx.config.concurrency, move |fix| {
        let gateway = gateway.clone();
        async move { apply_door_fix(gateway.as_ref(), fix).await }
    })
    .await;

    let mut written = 0;
    for (device_id, slot, state, count) in results {
        ctx.system.status.record_door(device_id, slot, state).await;
        written += count;
    }
    written
}

async fn apply_door_fix(gateway: &dyn DeviceGateway, fix: DoorFix) -> (u32, u8, DoorState, usize) {
    let DoorFix {
        device_id,
        slot,
        mut current,
        delay,
        mode,
    } = fix;
    let mut written = 0;

    if let Some(delay) = delay {
        tracing::info!(device_id, slot, from = ?current.delay, to = delay, "Setting door delay");
        match gateway.set_door_delay(device_id, slot, delay).await {
            Ok(()) => {
                current.delay = Some(delay);
                written += 1;
            }
            Err(e) => tracing::warn!(device_id, slot, error = %e, "Could not set door delay"),
        }
    }

    if let Some(mode) = mode {
        tracing::info!(device_id, slot, from = ?current.mode, to = %mode, "Setting door control");
        match gateway.set_door_control(device_id, slot, mode).await {
            Ok(()) => {
                current.mode = Some(mode);
                written += 1;
            }
            Err(e) => tracing::warn!(device_id, slot, error = %e, "Could not set door control"),
        }
    }

    (device_id, slot, current, written)
}
