//! System - the context object holding the catalog and every entity store
//!
//! ## Writes
//!
//! Writers are serialized by a gate. A write clones the live state into a
//! shadow, mutates and validates the shadow, appends the audit records it
//! produced and then swaps shadow state and catalog in under the state
//! write lock. A rejected shadow is dropped and the live state is untouched.
//!
//! ## Reads
//!
//! `view()` hands out the current `Arc`s of state and catalog, taken
//! together under the read lock so both always describe the same commit.

pub mod persistence;
mod state;
pub mod store;

pub use state::SystemState;
pub use store::{Editable, Entity, Store};

use crate::auth::{AuditRecord, Authorizer, EntityKind, Operation};
use crate::cards::SyncStatus;
use crate::catalog::{Catalog, Namespace, Oid, Snapshot};
use crate::controllers::StatusTracker;
use crate::device_gateway::DeviceEvent;
use crate::error::{Error, Result};
use crate::events::ResolvedNames;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Consistent read-only view of one commit
#[derive(Debug, Clone)]
pub struct View {
    pub state: Arc<SystemState>,
    pub catalog: Arc<Snapshot>,
}

/// Mutable shadow of the live state
#[derive(Debug)]
pub struct Shadow {
    pub state: SystemState,
    pub catalog: Snapshot,
    audit: Vec<AuditRecord>,
}

impl Shadow {
    pub fn add(&mut self, auth: &dyn Authorizer, kind: EntityKind) -> Result<Oid> {
        let catalog = &mut self.catalog;
        let state = &mut self.state;

        let (oid, audit) = match kind {
            EntityKind::Interface => Arc::make_mut(&mut state.interfaces).add(catalog, auth)?,
            EntityKind::Controller => Arc::make_mut(&mut state.controllers).add(catalog, auth)?,
            EntityKind::Door => Arc::make_mut(&mut state.doors).add(catalog, auth)?,
            EntityKind::Card => Arc::make_mut(&mut state.cards).add(catalog, auth)?,
            EntityKind::Group => Arc::make_mut(&mut state.groups).add(catalog, auth)?,
            EntityKind::Event | EntityKind::Log => {
                return Err(Error::Validation(format!("{} entries cannot be added", kind)))
            }
        };

        self.audit.extend(audit);
        Ok(oid)
    }

    /// Sets one field addressed by its OID
    pub fn update(&mut self, auth: &dyn Authorizer, oid: &Oid, value: &str) -> Result<()> {
        let catalog = &mut self.catalog;
        let state = &mut self.state;

        let audit = match Namespace::of(oid) {
            Some(Namespace::Interfaces) => Arc::make_mut(&mut state.interfaces).update(catalog, auth, oid, value)?,
            Some(Namespace::Controllers) => Arc::make_mut(&mut state.controllers).update(catalog, auth, oid, value)?,
            Some(Namespace::Doors) => Arc::make_mut(&mut state.doors).update(catalog, auth, oid, value)?,
            Some(Namespace::Cards) => Arc::make_mut(&mut state.cards).update(catalog, auth, oid, value)?,
            Some(Namespace::Groups) => Arc::make_mut(&mut state.groups).update(catalog, auth, oid, value)?,
            _ => return Err(Error::Validation(format!("{} is not an editable field", oid))),
        };

        self.audit.extend(audit);
        Ok(())
    }

    pub fn delete(&mut self, auth: &dyn Authorizer, oid: &Oid) -> Result<()> {
        let catalog = &mut self.catalog;
        let state = &mut self.state;

        let audit = match Namespace::of(oid) {
            Some(Namespace::Interfaces) => Arc::make_mut(&mut state.interfaces).delete(catalog, auth, oid)?,
            Some(Namespace::Controllers) => Arc::make_mut(&mut state.controllers).delete(catalog, auth, oid)?,
            Some(Namespace::Doors) => Arc::make_mut(&mut state.doors).delete(catalog, auth, oid)?,
            Some(Namespace::Cards) => Arc::make_mut(&mut state.cards).delete(catalog, auth, oid)?,
            Some(Namespace::Groups) => Arc::make_mut(&mut state.groups).delete(catalog, auth, oid)?,
            _ => return Err(Error::Validation(format!("{} cannot be deleted", oid))),
        };

        self.audit.extend(audit);
        Ok(())
    }

    /// Display names for an event, resolved against this shadow
    fn resolve_names(&self, device_id: u32, event: &DeviceEvent) -> ResolvedNames {
        let controller = self
            .catalog
            .find_controller(device_id)
            .and_then(|oid| self.state.controllers.get(&oid));
        let door = controller
            .and_then(|c| c.door(event.door))
            .and_then(|oid| self.state.doors.get(oid));
        let card = self.state.cards.find_by_number(event.card);

        ResolvedNames {
            controller: controller.map(|c| c.name.clone()).unwrap_or_default(),
            door: door.map(|d| d.name.clone()).unwrap_or_default(),
            card: card.map(|c| c.name.clone()).unwrap_or_default(),
        }
    }
}

/// Events fetched from one device in one cycle
#[derive(Debug, Clone, Default)]
pub struct DeviceEvents {
    pub device_id: u32,
    pub events: Vec<DeviceEvent>,
    /// Indices the device could not return
    pub missing: Vec<u32>,
}

/// Outcome of recording one device's events
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordedEvents {
    pub recorded: usize,
    pub missing: usize,
}

/// Dependency-injected system context
#[derive(Debug)]
pub struct System {
    catalog: Catalog,
    state: RwLock<Arc<SystemState>>,
    write_gate: Mutex<()>,
    dirty: AtomicBool,
    /// Runtime device status, not persisted
    pub status: StatusTracker,
    /// Outcome of the last ACL push per card number, not persisted
    sync_status: RwLock<HashMap<u32, SyncStatus>>,
}

impl System {
    /// Empty system with an optional catalog compaction bound
    pub fn new(limit: Option<u32>) -> Self {
        Self::from_parts(SystemState::default(), Snapshot::new(limit))
    }

    pub fn from_parts(state: SystemState, catalog: Snapshot) -> Self {
        Self {
            catalog: Catalog::from_snapshot(catalog),
            state: RwLock::new(Arc::new(state)),
            write_gate: Mutex::new(()),
            dirty: AtomicBool::new(false),
            status: StatusTracker::new(),
            sync_status: RwLock::new(HashMap::new()),
        }
    }

    /// Loads persisted stores from `dir`
    pub async fn load(dir: &Path, limit: Option<u32>) -> Result<Self> {
        let (state, catalog) = persistence::load(dir, limit).await?;
        tracing::info!(
            dir = %dir.display(),
            controllers = state.controllers.list().count(),
            cards = state.cards.list().count(),
            "System state loaded"
        );
        Ok(Self::from_parts(state, catalog))
    }

    pub async fn save(&self, dir: &Path) -> Result<()> {
        let view = self.view().await;
        persistence::save(dir, &view.state).await
    }

    pub async fn view(&self) -> View {
        let state = self.state.read().await;
        View {
            state: state.clone(),
            catalog: self.catalog.snapshot(),
        }
    }

    /// Runs `f` against a shadow copy and commits it if `f` and validation succeed
    pub async fn transact<T>(&self, f: impl FnOnce(&mut Shadow) -> Result<T>) -> Result<T> {
        let _gate = self.write_gate.lock().await;

        let current = self.state.read().await.clone();
        let mut shadow = Shadow {
            state: SystemState::clone(&current),
            catalog: Snapshot::clone(&self.catalog.snapshot()),
            audit: Vec::new(),
        };

        let value = f(&mut shadow)?;
        shadow.state.validate()?;

        let Shadow {
            mut state,
            mut catalog,
            audit,
        } = shadow;
        if !audit.is_empty() {
            Arc::make_mut(&mut state.logs).append(&mut catalog, audit);
        }

        let mut live = self.state.write().await;
        self.catalog.replace(catalog);
        *live = Arc::new(state);
        drop(live);

        self.mark_dirty();
        Ok(value)
    }

    pub async fn add(&self, auth: &dyn Authorizer, kind: EntityKind) -> Result<Oid> {
        let oid = self.transact(|shadow| shadow.add(auth, kind)).await?;
        tracing::info!(uid = auth.uid(), kind = %kind, oid = %oid, "Entity added");
        Ok(oid)
    }

    pub async fn update(&self, auth: &dyn Authorizer, oid: &Oid, value: &str) -> Result<()> {
        self.transact(|shadow| shadow.update(auth, oid, value)).await?;
        tracing::debug!(uid = auth.uid(), oid = %oid, "Field updated");
        Ok(())
    }

    /// Applies several field updates all-or-nothing
    pub async fn update_many(&self, auth: &dyn Authorizer, updates: &[(Oid, String)]) -> Result<()> {
        self.transact(|shadow| {
            for (oid, value) in updates {
                shadow.update(auth, oid, value)?;
            }
            Ok(())
        })
        .await
    }

    pub async fn delete(&self, auth: &dyn Authorizer, oid: &Oid) -> Result<()> {
        self.transact(|shadow| shadow.delete(auth, oid)).await?;
        tracing::info!(uid = auth.uid(), oid = %oid, "Entity deleted");
        Ok(())
    }

    /// Permanently removes entities soft-deleted before `cutoff`
    pub async fn sweep(&self, cutoff: DateTime<Utc>) -> Result<Vec<Oid>> {
        let view = self.view().await;
        if !has_expired(&view.state, cutoff) {
            return Ok(Vec::new());
        }

        self.transact(|shadow| Ok(shadow.state.sweep(&mut shadow.catalog, cutoff)))
            .await
    }

    /// Records what every device returned this cycle in one commit: fetched
    /// events, and placeholders for indices a device could not return.
    /// Outcomes are reported per device, in input order.
    pub async fn record_events(&self, batches: &[DeviceEvents]) -> Result<Vec<(u32, RecordedEvents)>> {
        if batches.iter().all(|b| b.events.is_empty() && b.missing.is_empty()) {
            return Ok(Vec::new());
        }

        self.transact(|shadow| {
            let mut outcomes = Vec::with_capacity(batches.len());
            for batch in batches {
                let names: Vec<ResolvedNames> = batch
                    .events
                    .iter()
                    .map(|event| shadow.resolve_names(batch.device_id, event))
                    .collect();

                let mut outcome = RecordedEvents::default();
                let events = Arc::make_mut(&mut shadow.state.events);
                for (event, names) in batch.events.iter().zip(names) {
                    if events.record(&mut shadow.catalog, batch.device_id, event, names).1 {
                        outcome.recorded += 1;
                    }
                }
                for index in &batch.missing {
                    if events.record_missing(&mut shadow.catalog, batch.device_id, *index).is_some() {
                        outcome.missing += 1;
                    }
                }
                outcomes.push((batch.device_id, outcome));
            }
            Ok(outcomes)
        })
        .await
    }

    /// Checks a read capability
    pub fn authorize_view(&self, auth: &dyn Authorizer, kind: EntityKind) -> Result<()> {
        auth.authorize(Operation::View, kind, None)
    }

    pub async fn set_sync_status(&self, card: u32, status: SyncStatus) {
        self.sync_status.write().await.insert(card, status);
    }

    pub async fn sync_status(&self, card: u32) -> Option<SyncStatus> {
        self.sync_status.read().await.get(&card).copied()
    }

    /// Drops push outcomes for cards no longer in `cards`. Returns the number dropped.
    pub async fn retain_sync_status(&self, cards: &BTreeSet<u32>) -> usize {
        let mut statuses = self.sync_status.write().await;
        let before = statuses.len();
        statuses.retain(|card, _| cards.contains(card));
        before - statuses.len()
    }

    pub async fn sync_statuses(&self) -> HashMap<u32, SyncStatus> {
        self.sync_status.read().await.clone()
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Clears and returns the dirty flag
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }
}

fn has_expired(state: &SystemState, cutoff: DateTime<Utc>) -> bool {
    fn expired<'a, E: Entity + 'a>(mut it: impl Iterator<Item = &'a E>, cutoff: DateTime<Utc>) -> bool {
        it.any(|e| e.deleted().is_some_and(|at| at < cutoff))
    }

    expired(state.interfaces.all(), cutoff)
        || expired(state.controllers.all(), cutoff)
        || expired(state.doors.all(), cutoff)
        || expired(state.cards.all(), cutoff)
        || expired(state.groups.all(), cutoff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AllowAll, Policy};
    use crate::catalog::fields;
    use crate::device_gateway::Direction;

    #[tokio::test]
    async fn test_rejected_shadow_leaves_live_state_unchanged() {
        let system = System::new(None);
        let auth = AllowAll::system();

        let a = system.add(&auth, EntityKind::Card).await.unwrap();
        let b = system.add(&auth, EntityKind::Card).await.unwrap();
        system
            .update(&auth, &a.append(fields::card::NUMBER), "6514231")
            .await
            .unwrap();

        let before = system.view().await;
        let before_blob = before.state.cards.save().unwrap();
        let before_logs = before.state.logs.len();

        let err = system
            .update(&auth, &b.append(fields::card::NUMBER), "6514231")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let after = system.view().await;
        assert_eq!(after.state.cards.save().unwrap(), before_blob);
        assert_eq!(after.state.logs.len(), before_logs);
        assert!(Arc::ptr_eq(&before.catalog, &after.catalog));
    }

    #[tokio::test]
    async fn test_update_many_is_all_or_nothing() {
        let system = System::new(None);
        let auth = AllowAll::system();
        let card = system.add(&auth, EntityKind::Card).await.unwrap();

        let updates = vec![
            (card.append(fields::card::NAME), "Alice".to_string()),
            (card.append(fields::card::FROM), "not-a-date".to_string()),
        ];
        assert!(system.update_many(&auth, &updates).await.is_err());
        assert_eq!(system.view().await.state.cards.get(&card).unwrap().name, "");
    }

    #[tokio::test]
    async fn test_audit_records_committed_with_change() {
        let system = System::new(None);
        let auth = AllowAll::new("admin");
        let door = system.add(&auth, EntityKind::Door).await.unwrap();
        system
            .update(&auth, &door.append(fields::door::NAME), "Great Hall")
            .await
            .unwrap();

        let view = system.view().await;
        let logs = view.state.logs.list(10);
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].record.uid, "admin");
        assert_eq!(logs[0].record.field, "name");
        assert_eq!(logs[0].record.after, "Great Hall");
    }

    #[tokio::test]
    async fn test_unauthorized_write_rejected() {
        let system = System::new(None);
        let guest = Policy::read_only("guest");
        let err = system.add(&guest, EntityKind::Card).await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
        assert!(system.view().await.catalog.list_live(Namespace::Cards).is_empty());
    }

    #[tokio::test]
    async fn test_events_and_logs_not_editable() {
        let system = System::new(None);
        let auth = AllowAll::system();
        assert!(system.add(&auth, EntityKind::Event).await.is_err());
        assert!(system
            .update(&auth, &Oid::new("0.6.1.1"), "1")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_sweep_after_retention() {
        let system = System::new(Some(32));
        let auth = AllowAll::system();
        let group = system.add(&auth, EntityKind::Group).await.unwrap();
        system.delete(&auth, &group).await.unwrap();

        assert!(system.sweep(Utc::now() - chrono::Duration::hours(24)).await.unwrap().is_empty());
        let swept = system.sweep(Utc::now() + chrono::Duration::seconds(1)).await.unwrap();
        assert_eq!(swept, vec![group.clone()]);

        // the freed slot is reused
        assert_eq!(system.add(&auth, EntityKind::Group).await.unwrap(), group);
    }

    /// Controller 405419896 with door D11 in slot 1, group G05 granting D11,
    /// card 6514231 in G05
    async fn seed_grant(system: &System) -> (Oid, Oid, Oid, Oid) {
        let auth = AllowAll::system();
        let controller = system.add(&auth, EntityKind::Controller).await.unwrap();
        let door = system.add(&auth, EntityKind::Door).await.unwrap();
        let group = system.add(&auth, EntityKind::Group).await.unwrap();
        let card = system.add(&auth, EntityKind::Card).await.unwrap();
        system
            .update_many(
                &auth,
                &[
                    (controller.append(fields::controller::DEVICE_ID), "405419896".into()),
                    (controller.append(&fields::controller::door(1)), door.to_string()),
                    (door.append(fields::door::NAME), "D11".into()),
                    (group.append(fields::group::NAME), "G05".into()),
                    (group.append(fields::group::DOORS).append(door.as_str()), "true".into()),
                    (card.append(fields::card::NUMBER), "6514231".into()),
                    (card.append(fields::card::FROM), "2021-01-02".into()),
                    (card.append(fields::card::TO), "2021-12-30".into()),
                    (card.append(fields::card::GROUPS).append(group.as_str()), "true".into()),
                ],
            )
            .await
            .unwrap();
        (controller, door, group, card)
    }

    async fn grants(system: &System) -> [u8; 4] {
        let view = system.view().await;
        let built = crate::acl::build(&view.state, &view.catalog, &crate::rules::NoRules);
        built.acl.get(405419896, 6514231).map(|p| p.doors).unwrap_or_default()
    }

    #[tokio::test]
    async fn test_reused_door_oid_inherits_no_references() {
        let system = System::new(Some(32));
        let auth = AllowAll::system();
        let (controller, door, group, _) = seed_grant(&system).await;
        assert_eq!(grants(&system).await, [1, 0, 0, 0]);

        system.delete(&auth, &door).await.unwrap();
        assert_eq!(grants(&system).await, [0, 0, 0, 0]);
        system.sweep(Utc::now() + chrono::Duration::seconds(1)).await.unwrap();

        let reused = system.add(&auth, EntityKind::Door).await.unwrap();
        assert_eq!(reused, door);
        assert_eq!(grants(&system).await, [0, 0, 0, 0]);

        let view = system.view().await;
        assert_eq!(view.state.controllers.get(&controller).unwrap().door(1), None);
        assert!(view.state.groups.get(&group).unwrap().doors.is_empty());
        assert_eq!(view.catalog.controller_door(&controller, 1), None);
        assert_eq!(view.catalog.door_slot(&reused), None);
    }

    #[tokio::test]
    async fn test_reused_group_oid_inherits_no_members() {
        let system = System::new(Some(32));
        let auth = AllowAll::system();
        let (_, door, group, card) = seed_grant(&system).await;

        system.delete(&auth, &group).await.unwrap();
        system.sweep(Utc::now() + chrono::Duration::seconds(1)).await.unwrap();

        let reused = system.add(&auth, EntityKind::Group).await.unwrap();
        assert_eq!(reused, group);
        system
            .update(&auth, &reused.append(fields::group::DOORS).append(door.as_str()), "true")
            .await
            .unwrap();

        let view = system.view().await;
        assert!(view.state.cards.get(&card).unwrap().groups.is_empty());
        assert!(view
            .catalog
            .get_v(&card.append(fields::card::GROUPS).append(group.as_str()))
            .is_none());
        assert_eq!(grants(&system).await, [0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_record_events_resolves_names() {
        let system = System::new(None);
        let auth = AllowAll::system();
        let controller = system.add(&auth, EntityKind::Controller).await.unwrap();
        let door = system.add(&auth, EntityKind::Door).await.unwrap();
        let card = system.add(&auth, EntityKind::Card).await.unwrap();
        system
            .update_many(
                &auth,
                &[
                    (controller.append(fields::controller::NAME), "Alpha".into()),
                    (controller.append(fields::controller::DEVICE_ID), "405419896".into()),
                    (controller.append(&fields::controller::door(1)), door.to_string()),
                    (door.append(fields::door::NAME), "Great Hall".into()),
                    (card.append(fields::card::NAME), "Alice".into()),
                    (card.append(fields::card::NUMBER), "6514231".into()),
                ],
            )
            .await
            .unwrap();

        let event = DeviceEvent {
            index: 12,
            kind: 1,
            door: 1,
            direction: Direction::In,
            card: 6514231,
            timestamp: Utc::now().naive_utc(),
            granted: true,
            reason: 1,
        };
        let batch = DeviceEvents {
            device_id: 405419896,
            events: vec![event],
            missing: vec![11],
        };
        let outcomes = system.record_events(&[batch, DeviceEvents::default()]).await.unwrap();
        assert_eq!(outcomes[0], (405419896, RecordedEvents { recorded: 1, missing: 1 }));
        assert_eq!(outcomes[1], (0, RecordedEvents::default()));

        let view = system.view().await;
        let recorded = view.state.events.find(405419896, 12).unwrap();
        assert_eq!(recorded.names.controller, "Alpha");
        assert_eq!(recorded.names.door, "Great Hall");
        assert_eq!(recorded.names.card, "Alice");
        assert!(view.state.events.find(405419896, 11).unwrap().missing);
    }

    #[tokio::test]
    async fn test_event_commit_leaves_other_tables_shared() {
        let system = System::new(None);
        let auth = AllowAll::system();
        system.add(&auth, EntityKind::Card).await.unwrap();
        let before = system.view().await;

        let batches = [
            DeviceEvents {
                device_id: 405419896,
                missing: vec![4],
                ..Default::default()
            },
            DeviceEvents {
                device_id: 423187757,
                missing: vec![9],
                ..Default::default()
            },
        ];
        system.record_events(&batches).await.unwrap();

        let after = system.view().await;
        assert_eq!(after.state.events.len(), 2);
        assert!(Arc::ptr_eq(&after.state.cards, &before.state.cards));
        assert!(Arc::ptr_eq(&after.state.logs, &before.state.logs));
        assert!(after.catalog.shares_table(&before.catalog, Namespace::Cards));
        assert!(!after.catalog.shares_table(&before.catalog, Namespace::Events));
    }

    #[tokio::test]
    async fn test_dirty_flag() {
        let system = System::new(None);
        assert!(!system.take_dirty());
        system.add(&AllowAll::system(), EntityKind::Door).await.unwrap();
        assert!(system.take_dirty());
        assert!(!system.take_dirty());
    }
}
