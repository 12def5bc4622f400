//! Groups - named door sets that cards are members of
//!
//! Invariant: a group name is unique among live groups, ignoring case and
//! whitespace.

use crate::auth::{AuditRecord, Authorizer, EntityKind, Operation};
use crate::catalog::{fields, Namespace, Oid, Snapshot};
use crate::error::{Error, Result};
use crate::system::store::{live_mut, parse_bool, soft_delete, split_field, sweep_entities};
use crate::system::{Editable, Entity, Store};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Card group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub oid: Oid,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub doors: BTreeSet<Oid>,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<DateTime<Utc>>,
}

impl Group {
    pub fn new(oid: Oid) -> Self {
        Self {
            oid,
            name: String::new(),
            doors: BTreeSet::new(),
            created: Utc::now(),
            deleted: None,
        }
    }
}

impl Entity for Group {
    fn oid(&self) -> &Oid {
        &self.oid
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn created(&self) -> DateTime<Utc> {
        self.created
    }

    fn deleted(&self) -> Option<DateTime<Utc>> {
        self.deleted
    }

    fn set_deleted(&mut self, at: Option<DateTime<Utc>>) {
        self.deleted = at;
    }
}

/// Name key used for uniqueness: lowercase, all whitespace removed
pub fn normalise_name(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

enum GroupField {
    Name,
    Door(Oid),
}

impl GroupField {
    fn parse(suffix: &str) -> Result<Self> {
        if suffix == fields::group::NAME {
            return Ok(GroupField::Name);
        }
        suffix
            .strip_prefix(fields::group::DOORS)
            .and_then(|rest| rest.strip_prefix('.'))
            .and_then(|door| door.parse::<Oid>().ok())
            .map(GroupField::Door)
            .ok_or_else(|| Error::Validation(format!("unknown group field '{}'", suffix)))
    }

    fn name(&self) -> &'static str {
        match self {
            GroupField::Name => "name",
            GroupField::Door(_) => "door",
        }
    }
}

/// Group store
#[derive(Debug, Clone, Default)]
pub struct Groups {
    groups: BTreeMap<Oid, Group>,
}

#[derive(Serialize, Deserialize)]
struct Blob {
    groups: Vec<Group>,
}

impl Groups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self) -> impl Iterator<Item = &Group> {
        self.groups.values().filter(|g| g.is_live())
    }

    /// Live and soft-deleted entities
    pub fn all(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    pub fn get(&self, oid: &Oid) -> Option<&Group> {
        self.groups.get(oid)
    }

    /// Live group by OID
    pub fn live(&self, oid: &Oid) -> Option<&Group> {
        self.groups.get(oid).filter(|g| g.is_live())
    }

    /// Drops `doors` from every group, live or soft-deleted
    pub fn release_doors(&mut self, catalog: &mut Snapshot, doors: &[Oid]) -> usize {
        let mut released = 0;
        for group in self.groups.values_mut() {
            for door in doors {
                if group.doors.remove(door) {
                    catalog.clear_v(Self::NAMESPACE, &group.oid.append(fields::group::DOORS).append(door.as_str()));
                    released += 1;
                }
            }
        }
        released
    }

    fn mirror(catalog: &mut Snapshot, group: &Group) {
        let ns = Namespace::Groups;
        catalog.put_v(ns, group.oid.append(fields::group::NAME), group.name.clone());
        catalog.put_v(ns, group.oid.append(fields::CREATED), group.created.to_rfc3339());
        for door in &group.doors {
            catalog.put_v(ns, group.oid.append(fields::group::DOORS).append(door.as_str()), true);
        }
    }
}

impl Store for Groups {
    const NAMESPACE: Namespace = Namespace::Groups;
    const KIND: EntityKind = EntityKind::Group;

    fn validate(&self) -> Result<()> {
        let mut names: HashMap<String, &Oid> = HashMap::new();

        for group in self.list() {
            let key = normalise_name(&group.name);
            if key.is_empty() {
                continue;
            }
            if let Some(other) = names.insert(key, &group.oid) {
                return Err(Error::Validation(format!(
                    "group name '{}' is already used by {}",
                    group.name, other
                )));
            }
        }

        Ok(())
    }

    fn sweep(&mut self, catalog: &mut Snapshot, cutoff: DateTime<Utc>) -> Vec<Oid> {
        sweep_entities(&mut self.groups, Self::NAMESPACE, catalog, cutoff)
    }

    fn load(&mut self, catalog: &mut Snapshot, blob: &[u8]) -> Result<()> {
        let blob: Blob = serde_json::from_slice(blob)?;

        self.groups.clear();
        for group in blob.groups {
            catalog.put_instance(Self::NAMESPACE, &group.oid, group.deleted.is_some());
            Self::mirror(catalog, &group);
            self.groups.insert(group.oid.clone(), group);
        }

        Ok(())
    }

    fn save(&self) -> Result<Vec<u8>> {
        let blob = Blob {
            groups: self.groups.values().cloned().collect(),
        };
        Ok(serde_json::to_vec_pretty(&blob)?)
    }
}

impl Editable for Groups {
    fn add(&mut self, catalog: &mut Snapshot, auth: &dyn Authorizer) -> Result<(Oid, Vec<AuditRecord>)> {
        auth.authorize(Operation::Add, Self::KIND, None)?;

        let oid = catalog.allocate(Self::NAMESPACE);
        let group = Group::new(oid.clone());
        Self::mirror(catalog, &group);
        self.groups.insert(oid.clone(), group);

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
        let field = GroupField::parse(suffix)?;
        auth.authorize(Operation::Update, Self::KIND, Some(field.name()))?;

        let group = live_mut(&mut self.groups, Self::KIND, &instance)?;

        let (field_name, before, after) = match field {
            GroupField::Name => {
                let after = value.trim().to_string();
                let before = std::mem::replace(&mut group.name, after.clone());
                catalog.put_v(Self::NAMESPACE, oid.clone(), after.clone());
                ("name".to_string(), before, after)
            }
            GroupField::Door(door) => {
                if !catalog.is_live(Namespace::Doors, &door) {
                    return Err(Error::Validation(format!("unknown door {}", door)));
                }
                let member = parse_bool("door membership", value)?;
                let before = group.doors.contains(&door);
                if member {
                    group.doors.insert(door.clone());
                    catalog.put_v(Self::NAMESPACE, oid.clone(), true);
                } else {
                    group.doors.remove(&door);
                    catalog.clear_v(Self::NAMESPACE, oid);
                }
                (format!("door {}", door), before.to_string(), member.to_string())
            }
        };

        if before == after {
            return Ok(vec![]);
        }

        Ok(vec![AuditRecord::new(
            auth,
            Self::KIND,
            &instance,
            &group.name,
            &field_name,
            before,
            after,
        )])
    }

    fn delete(&mut self, catalog: &mut Snapshot, auth: &dyn Authorizer, oid: &Oid) -> Result<Vec<AuditRecord>> {
        soft_delete(&mut self.groups, Self::NAMESPACE, Self::KIND, catalog, auth, oid)
    }
}
