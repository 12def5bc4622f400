//! Controllers - access controller devices and their door slots
//!
//! Invariants:
//! - at most one live controller per non-zero device id
//! - a door occupies at most one slot across all live controllers

pub mod status;
mod types;

pub use status::{door_liveness, Connection, DeviceRecord, DoorState, Liveness, StatusEvent, StatusTracker};
pub use types::*;

use crate::auth::{AuditRecord, Authorizer, EntityKind, Operation};
use crate::catalog::{fields, Namespace, Oid, Snapshot, Value};
use crate::error::{Error, Result};
use crate::system::store::{live_mut, parse_u32, soft_delete, split_field, sweep_entities};
use crate::system::{Editable, Entity, Store};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Controller store
#[derive(Debug, Clone, Default)]
pub struct Controllers {
    controllers: BTreeMap<Oid, Controller>,
}

#[derive(Serialize, Deserialize)]
struct Blob {
    controllers: Vec<Controller>,
}

impl Controllers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self) -> impl Iterator<Item = &Controller> {
        self.controllers.values().filter(|c| c.is_live())
    }

    /// Live controllers with an assigned device id
    pub fn configured(&self) -> impl Iterator<Item = &Controller> {
        self.list().filter(|c| c.device_id != 0)
    }

    /// Live and soft-deleted entities
    pub fn all(&self) -> impl Iterator<Item = &Controller> {
        self.controllers.values()
    }

    pub fn get(&self, oid: &Oid) -> Option<&Controller> {
        self.controllers.get(oid)
    }

    pub fn find_by_device(&self, device_id: u32) -> Option<&Controller> {
        if device_id == 0 {
            return None;
        }
        self.list().find(|c| c.device_id == device_id)
    }

    /// Controller and slot a door is assigned to
    pub fn find_door(&self, door: &Oid) -> Option<(&Controller, u8)> {
        self.configured()
            .find_map(|c| c.assigned().find(|(_, d)| *d == door).map(|(slot, _)| (c, slot)))
    }

    /// Empties every slot, on live or soft-deleted controllers, holding one
    /// of `doors`
    pub fn release_doors(&mut self, catalog: &mut Snapshot, doors: &[Oid]) -> usize {
        let mut released = 0;
        for controller in self.controllers.values_mut() {
            for (door, slot) in controller.doors.iter_mut().zip(1..=DOOR_SLOTS) {
                if door.as_ref().is_some_and(|d| doors.contains(d)) {
                    *door = None;
                    catalog.clear_v(Self::NAMESPACE, &controller.oid.append(&fields::controller::door(slot)));
                    released += 1;
                }
            }
        }
        released
    }

    fn mirror(catalog: &mut Snapshot, controller: &Controller) {
        let ns = Namespace::Controllers;
        let oid = &controller.oid;
        catalog.put_v(ns, oid.append(fields::controller::NAME), controller.name.clone());
        catalog.put_v(ns, oid.append(fields::controller::DEVICE_ID), controller.device_id);
        catalog.put_v(ns, oid.append(fields::CREATED), controller.created.to_rfc3339());
        match controller.endpoint {
            Some(addr) => catalog.put_v(ns, oid.append(fields::controller::ENDPOINT), addr.to_string()),
            None => catalog.clear_v(ns, &oid.append(fields::controller::ENDPOINT)),
        }
        match &controller.timezone {
            Some(tz) => catalog.put_v(ns, oid.append(fields::controller::TIMEZONE), tz.clone()),
            None => catalog.clear_v(ns, &oid.append(fields::controller::TIMEZONE)),
        }
        for slot in 1..=DOOR_SLOTS {
            let field = oid.append(&fields::controller::door(slot));
            match controller.door(slot) {
                Some(door) => catalog.put_v(ns, field, Value::Oid(door.clone())),
                None => catalog.clear_v(ns, &field),
            }
        }
    }
}

impl Store for Controllers {
    const NAMESPACE: Namespace = Namespace::Controllers;
    const KIND: EntityKind = EntityKind::Controller;

    fn validate(&self) -> Result<()> {
        let mut devices: HashMap<u32, &Oid> = HashMap::new();
        let mut doors: HashMap<&Oid, (&Oid, u8)> = HashMap::new();

        for controller in self.list() {
            if controller.device_id != 0 {
                if let Some(other) = devices.insert(controller.device_id, &controller.oid) {
                    return Err(Error::Validation(format!(
                        "device id {} is assigned to both {} and {}",
                        controller.device_id, other, controller.oid
                    )));
                }
            }

            for (slot, door) in controller.assigned() {
                if let Some((other, other_slot)) = doors.insert(door, (&controller.oid, slot)) {
                    return Err(Error::Validation(format!(
                        "door {} is assigned to {} slot {} and {} slot {}",
                        door, other, other_slot, controller.oid, slot
                    )));
                }
            }
        }

        Ok(())
    }

    fn sweep(&mut self, catalog: &mut Snapshot, cutoff: DateTime<Utc>) -> Vec<Oid> {
        sweep_entities(&mut self.controllers, Self::NAMESPACE, catalog, cutoff)
    }

    fn load(&mut self, catalog: &mut Snapshot, blob: &[u8]) -> Result<()> {
        let blob: Blob = serde_json::from_slice(blob)?;

        self.controllers.clear();
        for controller in blob.controllers {
            catalog.put_instance(Self::NAMESPACE, &controller.oid, controller.deleted.is_some());
            Self::mirror(catalog, &controller);
            self.controllers.insert(controller.oid.clone(), controller);
        }

        Ok(())
    }

    fn save(&self) -> Result<Vec<u8>> {
        let blob = Blob {
            controllers: self.controllers.values().cloned().collect(),
        };
        Ok(serde_json::to_vec_pretty(&blob)?)
    }
}

impl Editable for Controllers {
    fn add(&mut self, catalog: &mut Snapshot, auth: &dyn Authorizer) -> Result<(Oid, Vec<AuditRecord>)> {
        auth.authorize(Operation::Add, Self::KIND, None)?;

        let oid = catalog.allocate(Self::NAMESPACE);
        let controller = Controller::new(oid.clone());
        Self::mirror(catalog, &controller);
        self.controllers.insert(oid.clone(), controller);

        let record = AuditRecord::new(auth, Self::KIND, &oid, "", "created", "", oid.as_str());
        Ok((oid, vec![record]))
    }

    fn update(
        &mut self,
        catalog: &mut Snapshot,
        auth: &dyn Authorizer,
        oid: &Oid,
        value: &str,
    ) -> Result<Vec<AuditRecord>> {
        let (instance, suffix) = split_field(Self::NAMESPACE, oid)?;
        let field = ControllerField::parse(suffix)?;
        auth.authorize(Operation::Update, Self::KIND, Some(field.name()))?;

        let controller = live_mut(&mut self.controllers, Self::KIND, &instance)?;
        let value = value.trim();

        let (before, after) = match field {
            ControllerField::Name => {
                let before = std::mem::replace(&mut controller.name, value.to_string());
                (before, value.to_string())
            }
            ControllerField::DeviceId => {
                let device_id = parse_u32("device id", value)?;
                let before = std::mem::replace(&mut controller.device_id, device_id);
                (before.to_string(), device_id.to_string())
            }
            ControllerField::Endpoint => {
                let endpoint = parse_endpoint(value)?;
                let before = std::mem::replace(&mut controller.endpoint, endpoint);
                (
                    before.map(|a| a.to_string()).unwrap_or_default(),
                    endpoint.map(|a| a.to_string()).unwrap_or_default(),
                )
            }
            ControllerField::Timezone => {
                let tz = if value.is_empty() {
                    None
                } else {
                    value
                        .parse::<chrono_tz::Tz>()
                        .map_err(|_| Error::Validation(format!("unknown timezone '{}'", value)))?;
                    Some(value.to_string())
                };
                let before = std::mem::replace(&mut controller.timezone, tz.clone());
                (before.unwrap_or_default(), tz.unwrap_or_default())
            }
            ControllerField::Door(slot) => {
                let door = if value.is_empty() {
                    None
                } else {
                    let door = value.parse::<Oid>()?;
                    if !catalog.is_live(Namespace::Doors, &door) {
                        return Err(Error::Validation(format!("unknown door {}", door)));
                    }
                    Some(door)
                };
                let before = std::mem::replace(&mut controller.doors[usize::from(slot - 1)], door.clone());
                (
                    before.map(|d| d.to_string()).unwrap_or_default(),
                    door.map(|d| d.to_string()).unwrap_or_default(),
                )
            }
        };

        Self::mirror(catalog, controller);

        if before == after {
            return Ok(vec![]);
        }

        let field_name = match field {
            ControllerField::Door(slot) => format!("door {}", slot),
            other => other.name().to_string(),
        };

        Ok(vec![AuditRecord::new(
            auth,
            Self::KIND,
            &instance,
            &controller.name,
            &field_name,
            before,
            after,
        )])
    }

    fn delete(&mut self, catalog: &mut Snapshot, auth: &dyn Authorizer, oid: &Oid) -> Result<Vec<AuditRecord>> {
        soft_delete(&mut self.controllers, Self::NAMESPACE, Self::KIND, catalog, auth, oid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AllowAll;

    fn setup() -> (Snapshot, Controllers, Oid) {
        let auth = AllowAll::system();
        let mut catalog = Snapshot::new(None);
        let mut controllers = Controllers::new();
        let (oid, _) = controllers.add(&mut catalog, &auth).unwrap();
        (catalog, controllers, oid)
    }

    #[test]
    fn test_door_slot_resolves_through_catalog() {
        let auth = AllowAll::system();
        let (mut catalog, mut controllers, oid) = setup();
        let door = catalog.allocate(Namespace::Doors);

        controllers
            .update(&mut catalog, &auth, &oid.append(fields::controller::DEVICE_ID), "405419896")
            .unwrap();
        controllers
            .update(&mut catalog, &auth, &oid.append(&fields::controller::door(1)), door.as_str())
            .unwrap();

        assert_eq!(catalog.door_slot(&door), Some((405419896, 1)));
        assert_eq!(catalog.find_controller(405419896), Some(oid.clone()));
        assert_eq!(controllers.find_door(&door).map(|(c, s)| (c.oid.clone(), s)), Some((oid, 1)));
    }

    #[test]
    fn test_duplicate_device_id_rejected() {
        let auth = AllowAll::system();
        let (mut catalog, mut controllers, a) = setup();
        let (b, _) = controllers.add(&mut catalog, &auth).unwrap();

        for oid in [&a, &b] {
            controllers
                .update(&mut catalog, &auth, &oid.append(fields::controller::DEVICE_ID), "303986753")
                .unwrap();
        }
        assert!(controllers.validate().is_err());

        controllers
            .update(&mut catalog, &auth, &b.append(fields::controller::DEVICE_ID), "0")
            .unwrap();
        assert!(controllers.validate().is_ok());
    }

    #[test]
    fn test_door_in_two_slots_rejected() {
        let auth = AllowAll::system();
        let (mut catalog, mut controllers, oid) = setup();
        let door = catalog.allocate(Namespace::Doors);

        controllers
            .update(&mut catalog, &auth, &oid.append(&fields::controller::door(1)), door.as_str())
            .unwrap();
        controllers
            .update(&mut catalog, &auth, &oid.append(&fields::controller::door(3)), door.as_str())
            .unwrap();
        assert!(matches!(controllers.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_invalid_timezone_rejected() {
        let auth = AllowAll::system();
        let (mut catalog, mut controllers, oid) = setup();
        let field = oid.append(fields::controller::TIMEZONE);

        assert!(controllers.update(&mut catalog, &auth, &field, "Mars/Olympus").is_err());
        controllers.update(&mut catalog, &auth, &field, "Europe/Berlin").unwrap();
        assert_eq!(controllers.get(&oid).unwrap().tz(), chrono_tz::Europe::Berlin);
    }
}
