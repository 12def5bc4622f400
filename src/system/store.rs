//! Entity store contracts
//!
//! Each store owns its entities exclusively and mirrors indexed fields into
//! the catalog snapshot it is handed. Stores are plain values: the system
//! clones them, mutates the clone and swaps it in after validation.

use crate::auth::{AuditRecord, Authorizer, EntityKind};
use crate::catalog::{Namespace, Oid, Snapshot};
use crate::error::{Error, Result};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeMap;

/// Entities with a soft-delete lifecycle
pub trait Entity: Clone {
    fn oid(&self) -> &Oid;
    fn name(&self) -> &str;
    fn created(&self) -> DateTime<Utc>;
    fn deleted(&self) -> Option<DateTime<Utc>>;
    fn set_deleted(&mut self, at: Option<DateTime<Utc>>);

    fn is_live(&self) -> bool {
        self.deleted().is_none()
    }
}

/// Persistence and housekeeping shared by every store
pub trait Store: Clone + Default + Send + Sync + 'static {
    const NAMESPACE: Namespace;
    const KIND: EntityKind;

    /// Checks store-wide invariants
    fn validate(&self) -> Result<()>;

    /// Permanently removes soft-deleted entities deleted before `cutoff`
    fn sweep(&mut self, catalog: &mut Snapshot, cutoff: DateTime<Utc>) -> Vec<Oid>;

    /// Replaces the store content with a persisted blob and registers every
    /// entity (live or soft-deleted) in the catalog
    fn load(&mut self, catalog: &mut Snapshot, blob: &[u8]) -> Result<()>;

    /// Serializes live and not-yet-swept entities
    fn save(&self) -> Result<Vec<u8>>;
}

/// Stores editable through the object API
pub trait Editable: Store {
    /// Creates a blank entity
    fn add(&mut self, catalog: &mut Snapshot, auth: &dyn Authorizer) -> Result<(Oid, Vec<AuditRecord>)>;

    /// Sets one field addressed by its field OID from a textual value
    fn update(
        &mut self,
        catalog: &mut Snapshot,
        auth: &dyn Authorizer,
        oid: &Oid,
        value: &str,
    ) -> Result<Vec<AuditRecord>>;

    /// Soft-deletes an entity
    fn delete(&mut self, catalog: &mut Snapshot, auth: &dyn Authorizer, oid: &Oid) -> Result<Vec<AuditRecord>>;
}

/// Generic sweep over an OID-keyed entity map
pub(crate) fn sweep_entities<T: Entity>(
    entities: &mut BTreeMap<Oid, T>,
    ns: Namespace,
    catalog: &mut Snapshot,
    cutoff: DateTime<Utc>,
) -> Vec<Oid> {
    let expired: Vec<Oid> = entities
        .values()
        .filter(|e| e.deleted().is_some_and(|at| at < cutoff))
        .map(|e| e.oid().clone())
        .collect();

    for oid in &expired {
        entities.remove(oid);
        catalog.remove(ns, oid);
    }

    expired
}

/// Generic soft delete: stamps the entity and hides it from the catalog
pub(crate) fn soft_delete<T: Entity>(
    entities: &mut BTreeMap<Oid, T>,
    ns: Namespace,
    kind: EntityKind,
    catalog: &mut Snapshot,
    auth: &dyn Authorizer,
    oid: &Oid,
) -> Result<Vec<AuditRecord>> {
    auth.authorize(crate::auth::Operation::Delete, kind, None)?;

    let entity = live_mut(entities, kind, oid)?;
    let now = Utc::now();
    entity.set_deleted(Some(now));
    catalog.mark_deleted(ns, oid);
    catalog.put_v(ns, oid.append(crate::catalog::fields::DELETED), now.to_rfc3339());

    Ok(vec![AuditRecord::new(
        auth,
        kind,
        oid,
        entity.name(),
        "deleted",
        "",
        now.to_rfc3339(),
    )])
}

/// Looks up a live entity for mutation
pub(crate) fn live_mut<'a, T: Entity>(
    entities: &'a mut BTreeMap<Oid, T>,
    kind: EntityKind,
    oid: &Oid,
) -> Result<&'a mut T> {
    entities
        .get_mut(oid)
        .filter(|e| e.is_live())
        .ok_or_else(|| Error::NotFound(format!("{} {} not found", kind, oid)))
}

/// Resolves a field OID to (instance OID, field suffix) within a namespace
pub(crate) fn split_field<'a>(ns: Namespace, oid: &'a Oid) -> Result<(Oid, &'a str)> {
    match ns.split(oid) {
        Some((instance, _, suffix)) if !suffix.is_empty() => Ok((instance, suffix)),
        _ => Err(Error::Validation(format!("{} is not a {} field", oid, ns))),
    }
}

// ========================================
// Value parsing
// ========================================

pub(crate) fn parse_u32(field: &str, value: &str) -> Result<u32> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(0);
    }
    value
        .parse::<u32>()
        .map_err(|_| Error::Validation(format!("invalid {} '{}'", field, value)))
}

pub(crate) fn parse_date(field: &str, value: &str) -> Result<Option<NaiveDate>> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map(Some)
        .map_err(|_| Error::Validation(format!("invalid {} '{}'", field, value)))
}

pub(crate) fn parse_bool(field: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        other => Err(Error::Validation(format!("invalid {} '{}'", field, other))),
    }
}

pub(crate) fn display_date(date: Option<NaiveDate>) -> String {
    date.map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_helpers() {
        assert_eq!(parse_u32("number", " 6514231 ").unwrap(), 6514231);
        assert_eq!(parse_u32("number", "").unwrap(), 0);
        assert!(parse_u32("number", "-1").is_err());

        assert_eq!(
            parse_date("from", "2021-01-02").unwrap(),
            NaiveDate::from_ymd_opt(2021, 1, 2)
        );
        assert_eq!(parse_date("from", "").unwrap(), None);
        assert!(parse_date("from", "2021-13-01").is_err());

        assert!(parse_bool("member", "true").unwrap());
        assert!(!parse_bool("member", "off").unwrap());
        assert!(parse_bool("member", "maybe").is_err());
    }
}
