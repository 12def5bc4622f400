//! JSON persistence
//!
//! One file per store in the data directory. Files are written to a
//! temporary sibling and renamed so a crash never leaves a half-written
//! store behind.

use super::{System, SystemState};
use crate::catalog::Snapshot;
use crate::error::Result;
use crate::system::Store;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub const INTERFACES_FILE: &str = "interfaces.json";
pub const CONTROLLERS_FILE: &str = "controllers.json";
pub const DOORS_FILE: &str = "doors.json";
pub const CARDS_FILE: &str = "cards.json";
pub const GROUPS_FILE: &str = "groups.json";
pub const EVENTS_FILE: &str = "events.json";
pub const LOGS_FILE: &str = "logs.json";

/// Writes every store
pub async fn save(dir: &Path, state: &SystemState) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;

    write_atomic(&dir.join(INTERFACES_FILE), &state.interfaces.save()?).await?;
    write_atomic(&dir.join(CONTROLLERS_FILE), &state.controllers.save()?).await?;
    write_atomic(&dir.join(DOORS_FILE), &state.doors.save()?).await?;
    write_atomic(&dir.join(CARDS_FILE), &state.cards.save()?).await?;
    write_atomic(&dir.join(GROUPS_FILE), &state.groups.save()?).await?;
    write_atomic(&dir.join(EVENTS_FILE), &state.events.save()?).await?;
    write_atomic(&dir.join(LOGS_FILE), &state.logs.save()?).await?;

    Ok(())
}

/// Reads every store present in `dir`. Missing files leave the store empty.
pub async fn load(dir: &Path, limit: Option<u32>) -> Result<(SystemState, Snapshot)> {
    let mut catalog = Snapshot::new(limit);
    let mut state = SystemState::default();

    load_store(&dir.join(INTERFACES_FILE), &mut state.interfaces, &mut catalog).await?;
    load_store(&dir.join(CONTROLLERS_FILE), &mut state.controllers, &mut catalog).await?;
    load_store(&dir.join(DOORS_FILE), &mut state.doors, &mut catalog).await?;
    load_store(&dir.join(CARDS_FILE), &mut state.cards, &mut catalog).await?;
    load_store(&dir.join(GROUPS_FILE), &mut state.groups, &mut catalog).await?;
    load_store(&dir.join(EVENTS_FILE), &mut state.events, &mut catalog).await?;
    load_store(&dir.join(LOGS_FILE), &mut state.logs, &mut catalog).await?;

    state.validate()?;
    Ok((state, catalog))
}

async fn load_store<S: Store>(path: &Path, store: &mut Arc<S>, catalog: &mut Snapshot) -> Result<()> {
    let blob = match tokio::fs::read(path).await {
        Ok(blob) => blob,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "No persisted store, starting empty");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    Arc::make_mut(store).load(catalog, &blob)?;
    tracing::debug!(path = %path.display(), kind = %S::KIND, "Store loaded");
    Ok(())
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Background task that flushes the system whenever a commit marked it dirty
pub fn spawn_saver(system: Arc<System>, dir: PathBuf, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;

            if !system.take_dirty() {
                continue;
            }

            if let Err(e) = system.save(&dir).await {
                // retry on the next tick
                system.mark_dirty();
                tracing::error!(dir = %dir.display(), error = %e, "Failed to save system state");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AllowAll;
    use crate::cards::Card;
    use crate::catalog::{fields, Namespace};
    use crate::system::Editable;

    fn temp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("doorkeeper-{}-{}", name, uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let dir = temp_dir("persist");
        let auth = AllowAll::system();
        let mut catalog = Snapshot::new(None);
        let mut state = SystemState::default();

        let cards = Arc::make_mut(&mut state.cards);
        let (a, _) = cards.add(&mut catalog, &auth).unwrap();
        let (b, _) = cards.add(&mut catalog, &auth).unwrap();
        cards
            .update(&mut catalog, &auth, &a.append(fields::card::NUMBER), "6514231")
            .unwrap();
        cards.delete(&mut catalog, &auth, &b).unwrap();

        save(&dir, &state).await.unwrap();
        let (restored, restored_catalog) = load(&dir, None).await.unwrap();

        let live: Vec<&Card> = restored.cards.list().collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].number, 6514231);
        assert!(restored.cards.get(&b).is_some_and(|c| c.deleted.is_some()));
        assert_eq!(restored_catalog.list_live(Namespace::Cards), vec![a]);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn test_load_empty_dir() {
        let dir = temp_dir("empty");
        let (state, catalog) = load(&dir, Some(32)).await.unwrap();
        assert_eq!(state.cards.list().count(), 0);
        assert!(catalog.list_live(Namespace::Doors).is_empty());
    }
}
