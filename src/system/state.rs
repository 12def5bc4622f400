//! Aggregate of every entity store
//!
//! Each store sits behind its own `Arc`: a shadow copy deep-clones only the
//! stores a transaction writes to.

use crate::cards::Cards;
use crate::catalog::{Oid, Snapshot};
use crate::controllers::Controllers;
use crate::doors::Doors;
use crate::error::Result;
use crate::events::Events;
use crate::groups::Groups;
use crate::interfaces::Interfaces;
use crate::logs::Logs;
use crate::system::Store;
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct SystemState {
    pub interfaces: Arc<Interfaces>,
    pub controllers: Arc<Controllers>,
    pub doors: Arc<Doors>,
    pub cards: Arc<Cards>,
    pub groups: Arc<Groups>,
    pub events: Arc<Events>,
    pub logs: Arc<Logs>,
}

impl SystemState {
    /// Store-wide invariants of every store
    pub fn validate(&self) -> Result<()> {
        self.interfaces.validate()?;
        self.controllers.validate()?;
        self.doors.validate()?;
        self.cards.validate()?;
        self.groups.validate()?;
        self.events.validate()?;
        self.logs.validate()?;
        Ok(())
    }

    /// Permanently removes soft-deleted entities older than `cutoff`.
    ///
    /// A swept OID can be handed out again by the catalog, so every slot and
    /// membership still naming a swept door or group is cleared with it.
    pub fn sweep(&mut self, catalog: &mut Snapshot, cutoff: DateTime<Utc>) -> Vec<Oid> {
        let mut swept = Vec::new();
        swept.extend(Arc::make_mut(&mut self.interfaces).sweep(catalog, cutoff));
        swept.extend(Arc::make_mut(&mut self.controllers).sweep(catalog, cutoff));

        let doors = Arc::make_mut(&mut self.doors).sweep(catalog, cutoff);
        if !doors.is_empty() {
            Arc::make_mut(&mut self.controllers).release_doors(catalog, &doors);
            Arc::make_mut(&mut self.groups).release_doors(catalog, &doors);
        }
        swept.extend(doors);

        swept.extend(Arc::make_mut(&mut self.cards).sweep(catalog, cutoff));

        let groups = Arc::make_mut(&mut self.groups).sweep(catalog, cutoff);
        if !groups.is_empty() {
            Arc::make_mut(&mut self.cards).release_groups(catalog, &groups);
        }
        swept.extend(groups);

        swept
    }
}
