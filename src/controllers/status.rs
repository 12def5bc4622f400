//! Controller status tracker
//!
//! Runtime cache of what each device last reported. Nothing here is
//! persisted. Only connection transitions are logged so a device that stays
//! offline does not flood the log.

use crate::device_gateway::{DeviceStatus, EventIndices};
use crate::doors::{Door, DoorMode};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::RwLock;

/// Age under which a device is considered healthy
pub const OK_WINDOW_SECS: i64 = 60;
/// Age under which a device is considered uncertain, error beyond
pub const UNCERTAIN_WINDOW_SECS: i64 = 300;

/// Liveness classification of a controller or door
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Unknown,
    Ok,
    Uncertain,
    Error,
    Unconfigured,
}

/// Connection state used for transition detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connection {
    #[default]
    Unknown,
    Online,
    Offline,
}

/// Connection transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    Lost,
    Recovered,
}

/// Door configuration as last read from a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DoorState {
    pub delay: Option<u8>,
    pub mode: Option<DoorMode>,
}

/// Last known state of one device
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub connection: Connection,
    /// Last successful refresh
    pub touched: Option<DateTime<Utc>>,
    pub endpoint: Option<SocketAddr>,
    /// Device clock and the local time it was read at
    pub device_time: Option<NaiveDateTime>,
    pub read_at: Option<DateTime<Utc>>,
    pub cards: Option<u32>,
    pub event_index: Option<u32>,
    pub events: Option<EventIndices>,
    pub antipassback: Option<u8>,
    pub doors: [DoorState; 4],
    /// Outcome of the last ACL comparison (true = in sync)
    pub acl_in_sync: Option<bool>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

impl DeviceRecord {
    /// Age-based classification of a configured device
    pub fn classify(&self, now: DateTime<Utc>) -> Liveness {
        let Some(touched) = self.touched else {
            return if self.last_error.is_some() {
                Liveness::Error
            } else {
                Liveness::Unknown
            };
        };

        let age = now - touched;
        let by_age = if age < Duration::seconds(OK_WINDOW_SECS) {
            Liveness::Ok
        } else if age < Duration::seconds(UNCERTAIN_WINDOW_SECS) {
            Liveness::Uncertain
        } else {
            Liveness::Error
        };

        // a failure after the last success downgrades a healthy device
        match (by_age, self.last_error_at) {
            (Liveness::Ok, Some(at)) if at > touched => Liveness::Uncertain,
            (liveness, _) => liveness,
        }
    }

    /// Device clock now, extrapolated from the last read
    pub fn device_now(&self, now: DateTime<Utc>) -> Option<NaiveDateTime> {
        match (self.device_time, self.read_at) {
            (Some(time), Some(at)) => Some(time + (now - at)),
            _ => None,
        }
    }
}

/// Liveness of a door given its controller's liveness and device state
pub fn door_liveness(controller: Liveness, state: Option<&DoorState>, door: &Door) -> Liveness {
    match controller {
        Liveness::Unknown | Liveness::Unconfigured => Liveness::Unknown,
        Liveness::Error => Liveness::Error,
        Liveness::Uncertain => Liveness::Uncertain,
        Liveness::Ok => {
            let Some(state) = state else {
                return Liveness::Unknown;
            };
            let delay_differs = door.delay.is_some() && state.delay.is_some() && door.delay != state.delay;
            let mode_differs = door.mode.is_some() && state.mode.is_some() && door.mode != state.mode;
            if delay_differs || mode_differs {
                Liveness::Uncertain
            } else {
                Liveness::Ok
            }
        }
    }
}

/// Tracks device status and detects lost/recovered transitions
#[derive(Debug, Default)]
pub struct StatusTracker {
    devices: RwLock<HashMap<u32, DeviceRecord>>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful status refresh
    pub async fn record_ok(&self, status: &DeviceStatus) -> Option<StatusEvent> {
        let now = Utc::now();
        let mut devices = self.devices.write().await;
        let record = devices.entry(status.device_id).or_default();

        record.touched = Some(now);
        record.endpoint = status.endpoint.or(record.endpoint);
        record.device_time = Some(status.time);
        record.read_at = Some(now);
        record.cards = Some(status.cards);
        record.event_index = Some(status.event_index);
        record.antipassback = Some(status.antipassback);

        Self::transition(status.device_id, record, Connection::Online)
    }

    /// Records a failed refresh
    pub async fn record_error(&self, device_id: u32, error: &str) -> Option<StatusEvent> {
        let mut devices = self.devices.write().await;
        let record = devices.entry(device_id).or_default();

        record.last_error = Some(error.to_string());
        record.last_error_at = Some(Utc::now());

        Self::transition(device_id, record, Connection::Offline)
    }

    fn transition(device_id: u32, record: &mut DeviceRecord, next: Connection) -> Option<StatusEvent> {
        let prev = std::mem::replace(&mut record.connection, next);

        match (prev, next) {
            (Connection::Online, Connection::Offline) => {
                tracing::warn!(device_id, error = ?record.last_error, "Controller connection lost");
                Some(StatusEvent::Lost)
            }
            (Connection::Offline, Connection::Online) => {
                tracing::info!(device_id, "Controller connection recovered");
                Some(StatusEvent::Recovered)
            }
            (Connection::Unknown, Connection::Offline) => {
                tracing::warn!(device_id, error = ?record.last_error, "Controller initial refresh failed");
                Some(StatusEvent::Lost)
            }
            _ => None,
        }
    }

    /// Notes a device seen during discovery without refreshing it
    pub async fn record_seen(&self, device_id: u32, endpoint: Option<SocketAddr>) {
        let mut devices = self.devices.write().await;
        let record = devices.entry(device_id).or_default();
        if endpoint.is_some() {
            record.endpoint = endpoint;
        }
    }

    pub async fn record_door(&self, device_id: u32, slot: u8, state: DoorState) {
        if !(1..=4).contains(&slot) {
            return;
        }
        let mut devices = self.devices.write().await;
        devices.entry(device_id).or_default().doors[usize::from(slot - 1)] = state;
    }

    pub async fn record_events(&self, device_id: u32, indices: EventIndices) {
        let mut devices = self.devices.write().await;
        devices.entry(device_id).or_default().events = Some(indices);
    }

    pub async fn record_acl(&self, device_id: u32, in_sync: bool) {
        let mut devices = self.devices.write().await;
        devices.entry(device_id).or_default().acl_in_sync = Some(in_sync);
    }

    /// Device clock was just set
    pub async fn record_time(&self, device_id: u32, time: NaiveDateTime) {
        let mut devices = self.devices.write().await;
        let record = devices.entry(device_id).or_default();
        record.device_time = Some(time);
        record.read_at = Some(Utc::now());
    }

    pub async fn get(&self, device_id: u32) -> Option<DeviceRecord> {
        self.devices.read().await.get(&device_id).cloned()
    }

    /// Every tracked device id
    pub async fn device_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.devices.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn all(&self) -> HashMap<u32, DeviceRecord> {
        self.devices.read().await.clone()
    }

    /// Classification of a device. `configured` tells whether a live
    /// controller entity carries this device id.
    pub async fn liveness(&self, device_id: u32, configured: bool) -> Liveness {
        let devices = self.devices.read().await;
        match devices.get(&device_id) {
            None => Liveness::Unknown,
            Some(_) if !configured => Liveness::Unconfigured,
            Some(record) => record.classify(Utc::now()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Oid;

    fn status(device_id: u32) -> DeviceStatus {
        DeviceStatus {
            device_id,
            endpoint: None,
            time: Utc::now().naive_utc(),
            cards: 3,
            event_index: 17,
            antipassback: 0,
        }
    }

    #[tokio::test]
    async fn test_transitions_logged_once() {
        let tracker = StatusTracker::new();

        assert_eq!(tracker.record_ok(&status(1)).await, None);
        assert_eq!(tracker.record_error(1, "timeout").await, Some(StatusEvent::Lost));
        assert_eq!(tracker.record_error(1, "timeout").await, None);
        assert_eq!(tracker.record_ok(&status(1)).await, Some(StatusEvent::Recovered));
        assert_eq!(tracker.record_ok(&status(1)).await, None);
    }

    #[tokio::test]
    async fn test_initial_failure_is_lost() {
        let tracker = StatusTracker::new();
        assert_eq!(tracker.record_error(2, "unreachable").await, Some(StatusEvent::Lost));
        assert_eq!(tracker.liveness(2, true).await, Liveness::Error);
    }

    #[tokio::test]
    async fn test_liveness_unknown_and_unconfigured() {
        let tracker = StatusTracker::new();
        assert_eq!(tracker.liveness(3, true).await, Liveness::Unknown);

        tracker.record_seen(3, None).await;
        assert_eq!(tracker.liveness(3, false).await, Liveness::Unconfigured);

        tracker.record_ok(&status(3)).await;
        assert_eq!(tracker.liveness(3, true).await, Liveness::Ok);
    }

    #[test]
    fn test_classify_by_age() {
        let now = Utc::now();
        let mut record = DeviceRecord {
            touched: Some(now - Duration::seconds(30)),
            ..Default::default()
        };
        assert_eq!(record.classify(now), Liveness::Ok);

        record.touched = Some(now - Duration::seconds(120));
        assert_eq!(record.classify(now), Liveness::Uncertain);

        record.touched = Some(now - Duration::seconds(600));
        assert_eq!(record.classify(now), Liveness::Error);

        record.touched = Some(now - Duration::seconds(5));
        record.last_error_at = Some(now);
        record.last_error = Some("timeout".into());
        assert_eq!(record.classify(now), Liveness::Uncertain);
    }

    #[test]
    fn test_door_liveness() {
        let mut door = Door::new(Oid::new("0.3.1"));
        door.delay = Some(5);
        door.mode = Some(DoorMode::Controlled);

        let matching = DoorState {
            delay: Some(5),
            mode: Some(DoorMode::Controlled),
        };
        let drifted = DoorState {
            delay: Some(3),
            mode: Some(DoorMode::Controlled),
        };

        assert_eq!(door_liveness(Liveness::Ok, Some(&matching), &door), Liveness::Ok);
        assert_eq!(door_liveness(Liveness::Ok, Some(&drifted), &door), Liveness::Uncertain);
        assert_eq!(door_liveness(Liveness::Error, Some(&matching), &door), Liveness::Error);
        assert_eq!(door_liveness(Liveness::Unknown, None, &door), Liveness::Unknown);
    }
}
