//! Interfaces - LAN links the device gateways talk through

use crate::auth::{AuditRecord, Authorizer, EntityKind, Operation};
use crate::catalog::{fields, Namespace, Oid, Snapshot};
use crate::error::{Error, Result};
use crate::system::store::{live_mut, soft_delete, split_field, sweep_entities};
use crate::system::{Editable, Entity, Store};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;

/// Network link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub oid: Oid,
    #[serde(default)]
    pub name: String,
    /// Local address requests are sent from
    #[serde(default)]
    pub bind: Option<SocketAddr>,
    /// Broadcast address used for discovery
    #[serde(default)]
    pub broadcast: Option<SocketAddr>,
    /// Address device events are received on
    #[serde(default)]
    pub listen: Option<SocketAddr>,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<DateTime<Utc>>,
}

impl Interface {
    pub fn new(oid: Oid) -> Self {
        Self {
            oid,
            name: String::new(),
            bind: None,
            broadcast: None,
            listen: None,
            created: Utc::now(),
            deleted: None,
        }
    }
}

impl Entity for Interface {
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

/// Interface store
#[derive(Debug, Clone, Default)]
pub struct Interfaces {
    interfaces: BTreeMap<Oid, Interface>,
}

#[derive(Serialize, Deserialize)]
struct Blob {
    interfaces: Vec<Interface>,
}

impl Interfaces {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self) -> impl Iterator<Item = &Interface> {
        self.interfaces.values().filter(|i| i.is_live())
    }

    /// Live and soft-deleted entities
    pub fn all(&self) -> impl Iterator<Item = &Interface> {
        self.interfaces.values()
    }

    pub fn get(&self, oid: &Oid) -> Option<&Interface> {
        self.interfaces.get(oid)
    }

    fn mirror(catalog: &mut Snapshot, interface: &Interface) {
        let ns = Namespace::Interfaces;
        let oid = &interface.oid;
        catalog.put_v(ns, oid.append(fields::interface::NAME), interface.name.clone());
        catalog.put_v(ns, oid.append(fields::CREATED), interface.created.to_rfc3339());
        for (suffix, addr) in [
            (fields::interface::BIND, interface.bind),
            (fields::interface::BROADCAST, interface.broadcast),
            (fields::interface::LISTEN, interface.listen),
        ] {
            match addr {
                Some(addr) => catalog.put_v(ns, oid.append(suffix), addr.to_string()),
                None => catalog.clear_v(ns, &oid.append(suffix)),
            }
        }
    }
}

impl Store for Interfaces {
    const NAMESPACE: Namespace = Namespace::Interfaces;
    const KIND: EntityKind = EntityKind::Interface;

    fn validate(&self) -> Result<()> {
        Ok(())
    }

    fn sweep(&mut self, catalog: &mut Snapshot, cutoff: DateTime<Utc>) -> Vec<Oid> {
        sweep_entities(&mut self.interfaces, Self::NAMESPACE, catalog, cutoff)
    }

    fn load(&mut self, catalog: &mut Snapshot, blob: &[u8]) -> Result<()> {
        let blob: Blob = serde_json::from_slice(blob)?;

        self.interfaces.clear();
        for interface in blob.interfaces {
            catalog.put_instance(Self::NAMESPACE, &interface.oid, interface.deleted.is_some());
            Self::mirror(catalog, &interface);
            self.interfaces.insert(interface.oid.clone(), interface);
        }

        Ok(())
    }

    fn save(&self) -> Result<Vec<u8>> {
        let blob = Blob {
            interfaces: self.interfaces.values().cloned().collect(),
        };
        Ok(serde_json::to_vec_pretty(&blob)?)
    }
}

impl Editable for Interfaces {
    fn add(&mut self, catalog: &mut Snapshot, auth: &dyn Authorizer) -> Result<(Oid, Vec<AuditRecord>)> {
        auth.authorize(Operation::Add, Self::KIND, None)?;

        let oid = catalog.allocate(Self::NAMESPACE);
        let interface = Interface::new(oid.clone());
        Self::mirror(catalog, &interface);
        self.interfaces.insert(oid.clone(), interface);

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
        let field = match suffix {
            fields::interface::NAME => "name",
            fields::interface::BIND => "bind",
            fields::interface::BROADCAST => "broadcast",
            fields::interface::LISTEN => "listen",
            other => return Err(Error::Validation(format!("unknown interface field '{}'", other))),
        };
        auth.authorize(Operation::Update, Self::KIND, Some(field))?;

        let interface = live_mut(&mut self.interfaces, Self::KIND, &instance)?;
        let value = value.trim();

        let (before, after) = if field == "name" {
            let before = std::mem::replace(&mut interface.name, value.to_string());
            (before, value.to_string())
        } else {
            let addr = if value.is_empty() {
                None
            } else {
                Some(value.parse::<SocketAddr>().map_err(|_| {
                    Error::Validation(format!("invalid {} address '{}'", field, value))
                })?)
            };
            let slot = match field {
                "bind" => &mut interface.bind,
                "broadcast" => &mut interface.broadcast,
                _ => &mut interface.listen,
            };
            let before = std::mem::replace(slot, addr);
            (
                before.map(|a| a.to_string()).unwrap_or_default(),
                addr.map(|a| a.to_string()).unwrap_or_default(),
            )
        };

        Self::mirror(catalog, interface);

        if before == after {
            return Ok(vec![]);
        }

        Ok(vec![AuditRecord::new(
            auth,
            Self::KIND,
            &instance,
            &interface.name,
            field,
            before,
            after,
        )])
    }

    fn delete(&mut self, catalog: &mut Snapshot, auth: &dyn Authorizer, oid: &Oid) -> Result<Vec<AuditRecord>> {
        soft_delete(&mut self.interfaces, Self::NAMESPACE, Self::KIND, catalog, auth, oid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AllowAll;

    #[test]
    fn test_update_addresses() {
        let auth = AllowAll::system();
        let mut catalog = Snapshot::new(None);
        let mut interfaces = Interfaces::new();
        let (oid, _) = interfaces.add(&mut catalog, &auth).unwrap();

        interfaces
            .update(&mut catalog, &auth, &oid.append(fields::interface::BROADCAST), "192.168.1.255:60000")
            .unwrap();
        assert_eq!(
            interfaces.get(&oid).unwrap().broadcast,
            Some("192.168.1.255:60000".parse().unwrap())
        );
        assert_eq!(
            catalog.text(&oid.append(fields::interface::BROADCAST)),
            Some("192.168.1.255:60000")
        );

        assert!(interfaces
            .update(&mut catalog, &auth, &oid.append(fields::interface::BIND), "not-an-address")
            .is_err());
    }
}
