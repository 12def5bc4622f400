//! Logs - persisted audit trail of committed changes

use crate::auth::{AuditRecord, EntityKind};
use crate::catalog::{Namespace, Oid, Snapshot};
use crate::error::Result;
use crate::system::Store;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// One audit entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub oid: Oid,
    /// Shared by every entry of one commit
    pub transaction: Uuid,
    pub record: AuditRecord,
}

/// Append-only audit log
#[derive(Debug, Clone, Default)]
pub struct Logs {
    entries: BTreeMap<Oid, LogEntry>,
}

#[derive(Serialize, Deserialize)]
struct Blob {
    logs: Vec<LogEntry>,
}

impl Logs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn append(&mut self, catalog: &mut Snapshot, records: Vec<AuditRecord>) -> Vec<Oid> {
        let transaction = Uuid::new_v4();
        records
            .into_iter()
            .map(|record| {
                let oid = catalog.allocate(Namespace::Logs);
                let entry = LogEntry {
                    oid: oid.clone(),
                    transaction,
                    record,
                };
                self.entries.insert(oid.clone(), entry);
                oid
            })
            .collect()
    }

    /// Newest first
    pub fn list(&self, limit: usize) -> Vec<&LogEntry> {
        self.entries.values().rev().take(limit).collect()
    }
}

impl Store for Logs {
    const NAMESPACE: Namespace = Namespace::Logs;
    const KIND: EntityKind = EntityKind::Log;

    fn validate(&self) -> Result<()> {
        Ok(())
    }

    fn sweep(&mut self, _catalog: &mut Snapshot, _cutoff: DateTime<Utc>) -> Vec<Oid> {
        Vec::new()
    }

    fn load(&mut self, catalog: &mut Snapshot, blob: &[u8]) -> Result<()> {
        let blob: Blob = serde_json::from_slice(blob)?;

        self.entries.clear();
        for entry in blob.logs {
            catalog.put_instance(Self::NAMESPACE, &entry.oid, false);
            self.entries.insert(entry.oid.clone(), entry);
        }

        Ok(())
    }

    fn save(&self) -> Result<Vec<u8>> {
        let blob = Blob {
            logs: self.entries.values().cloned().collect(),
        };
        Ok(serde_json::to_vec_pretty(&blob)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AllowAll;

    #[test]
    fn test_append_and_list_newest_first() {
        let auth = AllowAll::new("admin");
        let mut catalog = Snapshot::new(None);
        let mut logs = Logs::new();

        let card = Oid::new("0.4.1");
        let records = (1..=3)
            .map(|n| AuditRecord::new(&auth, EntityKind::Card, &card, "Alice", "number", n - 1, n))
            .collect();
        let oids = logs.append(&mut catalog, records);
        assert_eq!(oids.len(), 3);

        let listed: Vec<&str> = logs.list(2).iter().map(|e| e.record.after.as_str()).collect();
        assert_eq!(listed, vec!["3", "2"]);

        // one commit, one transaction id
        let first = logs.list(10)[0].transaction;
        assert!(logs.list(10).iter().all(|e| e.transaction == first));

        logs.append(
            &mut catalog,
            vec![AuditRecord::new(&auth, EntityKind::Card, &card, "Alice", "name", "Alice", "Bob")],
        );
        let latest = logs.list(1)[0];
        assert_ne!(latest.transaction, first);
    }

    #[test]
    fn test_save_load() {
        let auth = AllowAll::new("admin");
        let mut catalog = Snapshot::new(None);
        let mut logs = Logs::new();
        logs.append(
            &mut catalog,
            vec![AuditRecord::new(&auth, EntityKind::Door, &Oid::new("0.3.1"), "", "name", "", "Lobby")],
        );

        let blob = logs.save().unwrap();
        let mut restored = Logs::new();
        restored.load(&mut Snapshot::new(None), &blob).unwrap();
        assert_eq!(restored.list(10), logs.list(10));
    }
}
