//! Authorization and audit
//!
//! Every add/update/delete is checked against a fixed capability set
//! (`Operation` x `EntityKind`) and every committed field write leaves an
//! `AuditRecord` behind.

use crate::catalog::Oid;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    View,
    Add,
    Update,
    Delete,
}

/// Entity kind a capability applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Interface,
    Controller,
    Door,
    Card,
    Group,
    Event,
    Log,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Interface => "interface",
            EntityKind::Controller => "controller",
            EntityKind::Door => "door",
            EntityKind::Card => "card",
            EntityKind::Group => "group",
            EntityKind::Event => "event",
            EntityKind::Log => "log",
        };
        f.write_str(name)
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().trim_end_matches('s') {
            "interface" => Ok(EntityKind::Interface),
            "controller" => Ok(EntityKind::Controller),
            "door" => Ok(EntityKind::Door),
            "card" => Ok(EntityKind::Card),
            "group" => Ok(EntityKind::Group),
            "event" => Ok(EntityKind::Event),
            "log" => Ok(EntityKind::Log),
            other => Err(Error::Validation(format!("unknown entity kind '{}'", other))),
        }
    }
}

/// Decides whether a caller may perform an operation
pub trait Authorizer: Send + Sync {
    /// Identity recorded in audit records
    fn uid(&self) -> &str;

    /// `field` is the field name for updates, `None` for whole-entity operations
    fn authorize(&self, op: Operation, kind: EntityKind, field: Option<&str>) -> Result<()>;
}

/// Grants everything (system tasks, tests)
#[derive(Debug, Clone)]
pub struct AllowAll {
    uid: String,
}

impl AllowAll {
    pub fn new(uid: impl Into<String>) -> Self {
        Self { uid: uid.into() }
    }

    pub fn system() -> Self {
        Self::new("system")
    }
}

impl Authorizer for AllowAll {
    fn uid(&self) -> &str {
        &self.uid
    }

    fn authorize(&self, _op: Operation, _kind: EntityKind, _field: Option<&str>) -> Result<()> {
        Ok(())
    }
}

/// Explicit grant table
#[derive(Debug, Clone)]
pub struct Policy {
    uid: String,
    grants: HashSet<(Operation, EntityKind)>,
    /// Fields that may never be updated, e.g. `(Controller, "device_id")`
    locked_fields: HashSet<(EntityKind, String)>,
}

impl Policy {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            grants: HashSet::new(),
            locked_fields: HashSet::new(),
        }
    }

    /// Can view everything, change nothing
    pub fn read_only(uid: impl Into<String>) -> Self {
        let mut policy = Self::new(uid);
        for kind in [
            EntityKind::Interface,
            EntityKind::Controller,
            EntityKind::Door,
            EntityKind::Card,
            EntityKind::Group,
            EntityKind::Event,
            EntityKind::Log,
        ] {
            policy = policy.grant(Operation::View, kind);
        }
        policy
    }

    pub fn grant(mut self, op: Operation, kind: EntityKind) -> Self {
        self.grants.insert((op, kind));
        self
    }

    pub fn lock_field(mut self, kind: EntityKind, field: &str) -> Self {
        self.locked_fields.insert((kind, field.to_string()));
        self
    }
}

impl Authorizer for Policy {
    fn uid(&self) -> &str {
        &self.uid
    }

    fn authorize(&self, op: Operation, kind: EntityKind, field: Option<&str>) -> Result<()> {
        if !self.grants.contains(&(op, kind)) {
            return Err(Error::Unauthorized(format!(
                "{} may not {:?} {}",
                self.uid, op, kind
            )));
        }

        if let Some(field) = field {
            if self.locked_fields.contains(&(kind, field.to_string())) {
                return Err(Error::Unauthorized(format!(
                    "{} may not update {} {}",
                    self.uid, kind, field
                )));
            }
        }

        Ok(())
    }
}

/// One audited change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub uid: String,
    pub kind: EntityKind,
    pub oid: Oid,
    /// Display name of the entity at the time of the change
    pub name: String,
    pub field: String,
    pub before: String,
    pub after: String,
}

impl AuditRecord {
    pub fn new(
        auth: &dyn Authorizer,
        kind: EntityKind,
        oid: &Oid,
        name: &str,
        field: &str,
        before: impl ToString,
        after: impl ToString,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            uid: auth.uid().to_string(),
            kind,
            oid: oid.clone(),
            name: name.to_string(),
            field: field.to_string(),
            before: before.to_string(),
            after: after.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_only_policy() {
        let policy = Policy::read_only("guest");
        assert!(policy.authorize(Operation::View, EntityKind::Card, None).is_ok());
        assert!(matches!(
            policy.authorize(Operation::Update, EntityKind::Card, Some("name")),
            Err(Error::Unauthorized(_))
        ));
    }

    #[test]
    fn test_locked_field() {
        let policy = Policy::new("operator")
            .grant(Operation::Update, EntityKind::Controller)
            .lock_field(EntityKind::Controller, "device_id");

        assert!(policy
            .authorize(Operation::Update, EntityKind::Controller, Some("name"))
            .is_ok());
        assert!(policy
            .authorize(Operation::Update, EntityKind::Controller, Some("device_id"))
            .is_err());
    }

    #[test]
    fn test_entity_kind_from_plural() {
        assert_eq!("cards".parse::<EntityKind>().unwrap(), EntityKind::Card);
        assert_eq!("Controller".parse::<EntityKind>().unwrap(), EntityKind::Controller);
        assert!("users".parse::<EntityKind>().is_err());
    }
}
