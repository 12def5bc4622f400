//! Doors - names and the delay/mode each controller slot should enforce

mod types;

pub use types::*;

use crate::auth::{AuditRecord, Authorizer, EntityKind, Operation};
use crate::catalog::{fields, Namespace, Oid, Snapshot};
use crate::error::{Error, Result};
use crate::system::store::{live_mut, soft_delete, split_field, sweep_entities};
use crate::system::{Editable, Entity, Store};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Door store
#[derive(Debug, Clone, Default)]
pub struct Doors {
    doors: BTreeMap<Oid, Door>,
}

#[derive(Serialize, Deserialize)]
struct Blob {
    doors: Vec<Door>,
}

impl Doors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self) -> impl Iterator<Item = &Door> {
        self.doors.values().filter(|d| d.is_live())
    }

    /// Live and soft-deleted entities
    pub fn all(&self) -> impl Iterator<Item = &Door> {
        self.doors.values()
    }

    pub fn get(&self, oid: &Oid) -> Option<&Door> {
        self.doors.get(oid)
    }

    /// Live door by OID
    pub fn live(&self, oid: &Oid) -> Option<&Door> {
        self.doors.get(oid).filter(|d| d.is_live())
    }

    /// Live door by (normalised) name
    pub fn find_by_name(&self, name: &str) -> Option<&Door> {
        let key = crate::groups::normalise_name(name);
        self.list().find(|d| crate::groups::normalise_name(&d.name) == key)
    }

    fn mirror(catalog: &mut Snapshot, door: &Door) {
        let ns = Namespace::Doors;
        catalog.put_v(ns, door.oid.append(fields::door::NAME), door.name.clone());
        catalog.put_v(ns, door.oid.append(fields::CREATED), door.created.to_rfc3339());
        match door.delay {
            Some(delay) => catalog.put_v(ns, door.oid.append(fields::door::DELAY), u32::from(delay)),
            None => catalog.clear_v(ns, &door.oid.append(fields::door::DELAY)),
        }
        match door.mode {
            Some(mode) => catalog.put_v(ns, door.oid.append(fields::door::MODE), u32::from(mode.code())),
            None => catalog.clear_v(ns, &door.oid.append(fields::door::MODE)),
        }
    }
}

impl Store for Doors {
    const NAMESPACE: Namespace = Namespace::Doors;
    const KIND: EntityKind = EntityKind::Door;

    fn validate(&self) -> Result<()> {
        Ok(())
    }

    fn sweep(&mut self, catalog: &mut Snapshot, cutoff: DateTime<Utc>) -> Vec<Oid> {
        sweep_entities(&mut self.doors, Self::NAMESPACE, catalog, cutoff)
    }

    fn load(&mut self, catalog: &mut Snapshot, blob: &[u8]) -> Result<()> {
        let blob: Blob = serde_json::from_slice(blob)?;

        self.doors.clear();
        for door in blob.doors {
            catalog.put_instance(Self::NAMESPACE, &door.oid, door.deleted.is_some());
            Self::mirror(catalog, &door);
            self.doors.insert(door.oid.clone(), door);
        }

        Ok(())
    }

    fn save(&self) -> Result<Vec<u8>> {
        let blob = Blob {
            doors: self.doors.values().cloned().collect(),
        };
        Ok(serde_json::to_vec_pretty(&blob)?)
    }
}

impl Editable for Doors {
    fn add(&mut self, catalog: &mut Snapshot, auth: &dyn Authorizer) -> Result<(Oid, Vec<AuditRecord>)> {
        auth.authorize(Operation::Add, Self::KIND, None)?;

        let oid = catalog.allocate(Self::NAMESPACE);
        let door = Door::new(oid.clone());
        Self::mirror(catalog, &door);
        self.doors.insert(oid.clone(), door);

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
        let field = DoorField::parse(suffix)?;
        auth.authorize(Operation::Update, Self::KIND, Some(field.name()))?;

        let door = live_mut(&mut self.doors, Self::KIND, &instance)?;
        let value = value.trim();

        let (before, after) = match field {
            DoorField::Name => {
                let before = std::mem::replace(&mut door.name, value.to_string());
                (before, value.to_string())
            }
            DoorField::Delay => {
                let delay = if value.is_empty() {
                    None
                } else {
                    Some(value.parse::<u8>().map_err(|_| {
                        Error::Validation(format!("invalid door delay '{}' (0..255 seconds)", value))
                    })?)
                };
                let before = std::mem::replace(&mut door.delay, delay);
                (opt_string(before), opt_string(delay))
            }
            DoorField::Mode => {
                let mode = if value.is_empty() {
                    None
                } else {
                    Some(value.parse::<DoorMode>()?)
                };
                let before = std::mem::replace(&mut door.mode, mode);
                (opt_string(before), opt_string(mode))
            }
        };

        Self::mirror(catalog, door);

        if before == after {
            return Ok(vec![]);
        }

        Ok(vec![AuditRecord::new(
            auth,
            Self::KIND,
            &instance,
            &door.name,
            field.name(),
            before,
            after,
        )])
    }

    fn delete(&mut self, catalog: &mut Snapshot, auth: &dyn Authorizer, oid: &Oid) -> Result<Vec<AuditRecord>> {
        soft_delete(&mut self.doors, Self::NAMESPACE, Self::KIND, catalog, auth, oid)
    }
}

fn opt_string<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}
