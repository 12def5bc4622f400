//! In-process device fleet
//!
//! Simulates controllers well enough to drive the reconciler end to end:
//! card tables, door settings, an event ring and a drifting clock. Every
//! call is recorded so tests can assert on exactly what was pushed.

use super::{CardRecord, DeviceError, DeviceEvent, DeviceGateway, DeviceResult, DeviceStatus, EventIndices};
use crate::doors::DoorMode;
use async_trait::async_trait;
use chrono::{Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

/// Door settings held by a simulated device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimDoor {
    pub delay: u8,
    pub mode: DoorMode,
}

impl Default for SimDoor {
    fn default() -> Self {
        Self {
            delay: 5,
            mode: DoorMode::Controlled,
        }
    }
}

/// Simulated controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimDevice {
    pub device_id: u32,
    #[serde(default)]
    pub endpoint: Option<SocketAddr>,
    #[serde(default = "default_online")]
    pub online: bool,
    /// Device clock minus UTC, in seconds
    #[serde(default)]
    pub clock_offset_secs: i64,
    #[serde(default)]
    pub cards: BTreeMap<u32, CardRecord>,
    #[serde(default)]
    pub doors: [SimDoor; 4],
    #[serde(default)]
    pub events: BTreeMap<u32, DeviceEvent>,
    #[serde(default)]
    pub antipassback: u8,
}

fn default_online() -> bool {
    true
}

impl SimDevice {
    pub fn new(device_id: u32) -> Self {
        Self {
            device_id,
            endpoint: None,
            online: true,
            clock_offset_secs: 0,
            cards: BTreeMap::new(),
            doors: Default::default(),
            events: BTreeMap::new(),
            antipassback: 0,
        }
    }

    fn now(&self) -> NaiveDateTime {
        Utc::now().naive_utc() + Duration::seconds(self.clock_offset_secs)
    }

    fn indices(&self) -> EventIndices {
        let first = self.events.keys().next().copied().unwrap_or(0);
        let last = self.events.keys().next_back().copied().unwrap_or(0);
        EventIndices {
            first,
            last,
            current: last,
        }
    }
}

/// Recorded gateway call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    GetDevices,
    GetStatus(u32),
    GetCardRecords(u32),
    PutCard(u32, CardRecord),
    DeleteCard(u32, u32),
    GetDoorDelay(u32, u8),
    SetDoorDelay(u32, u8, u8),
    GetDoorControl(u32, u8),
    SetDoorControl(u32, u8, DoorMode),
    GetEventIndices(u32),
    GetEvent(u32, u32),
    SetTime(u32, NaiveDateTime),
}

impl GatewayCall {
    /// True for calls that change device state
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            GatewayCall::PutCard(..)
                | GatewayCall::DeleteCard(..)
                | GatewayCall::SetDoorDelay(..)
                | GatewayCall::SetDoorControl(..)
                | GatewayCall::SetTime(..)
        )
    }
}

#[derive(Debug, Deserialize)]
struct FleetFile {
    devices: Vec<SimDevice>,
}

/// Gateway backed by simulated devices
#[derive(Debug, Default)]
pub struct MemoryGateway {
    devices: Mutex<BTreeMap<u32, SimDevice>>,
    calls: Mutex<Vec<GatewayCall>>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: impl IntoIterator<Item = SimDevice>) -> Self {
        let gateway = Self::new();
        for device in devices {
            gateway.insert(device);
        }
        gateway
    }

    /// Loads a fleet description (`{"devices": [...]}`)
    pub async fn load(path: impl AsRef<Path>) -> crate::error::Result<Self> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path).await?;
        let file: FleetFile = serde_json::from_str(&json)?;
        tracing::info!(path = %path.display(), devices = file.devices.len(), "Device fleet loaded");
        Ok(Self::with_devices(file.devices))
    }

    pub fn insert(&self, device: SimDevice) {
        self.lock_devices().insert(device.device_id, device);
    }

    /// Snapshot of one simulated device
    pub fn device(&self, device_id: u32) -> Option<SimDevice> {
        self.lock_devices().get(&device_id).cloned()
    }

    /// Mutates one simulated device in place
    pub fn modify(&self, device_id: u32, f: impl FnOnce(&mut SimDevice)) {
        if let Some(device) = self.lock_devices().get_mut(&device_id) {
            f(device);
        }
    }

    pub fn set_online(&self, device_id: u32, online: bool) {
        self.modify(device_id, |d| d.online = online);
    }

    /// Every call so far, oldest first
    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// State-changing calls so far
    pub fn writes(&self) -> Vec<GatewayCall> {
        self.calls().into_iter().filter(GatewayCall::is_write).collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    fn lock_devices(&self) -> std::sync::MutexGuard<'_, BTreeMap<u32, SimDevice>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: GatewayCall) {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(call);
    }

    /// Runs `f` against an online device
    fn with_device<T>(&self, device_id: u32, f: impl FnOnce(&mut SimDevice) -> DeviceResult<T>) -> DeviceResult<T> {
        let mut devices = self.lock_devices();
        match devices.get_mut(&device_id) {
            Some(device) if device.online => f(device),
            Some(_) => Err(DeviceError::Timeout),
            None => Err(DeviceError::Unreachable(format!("no such device {}", device_id))),
        }
    }

    fn door_index(door: u8) -> DeviceResult<usize> {
        match door {
            1..=4 => Ok(usize::from(door - 1)),
            _ => Err(DeviceError::Rejected(format!("invalid door {}", door))),
        }
    }
}

#[async_trait]
impl DeviceGateway for MemoryGateway {
    async fn get_devices(&self) -> DeviceResult<Vec<u32>> {
        self.record(GatewayCall::GetDevices);
        Ok(self
            .lock_devices()
            .values()
            .filter(|d| d.online)
            .map(|d| d.device_id)
            .collect())
    }

    async fn get_status(&self, device_id: u32) -> DeviceResult<DeviceStatus> {
        self.record(GatewayCall::GetStatus(device_id));
        self.with_device(device_id, |d| {
            Ok(DeviceStatus {
                device_id,
                endpoint: d.endpoint,
                time: d.now(),
                cards: d.cards.len() as u32,
                event_index: d.indices().last,
                antipassback: d.antipassback,
            })
        })
    }

    async fn get_card_records(&self, device_id: u32) -> DeviceResult<Vec<CardRecord>> {
        self.record(GatewayCall::GetCardRecords(device_id));
        self.with_device(device_id, |d| Ok(d.cards.values().copied().collect()))
    }

    async fn put_card(&self, device_id: u32, card: CardRecord) -> DeviceResult<()> {
        self.record(GatewayCall::PutCard(device_id, card));
        self.with_device(device_id, |d| {
            d.cards.insert(card.number, card);
            Ok(())
        })
    }

    async fn delete_card(&self, device_id: u32, card_number: u32) -> DeviceResult<()> {
        self.record(GatewayCall::DeleteCard(device_id, card_number));
        self.with_device(device_id, |d| {
            d.cards.remove(&card_number);
            Ok(())
        })
    }

    async fn get_door_delay(&self, device_id: u32, door: u8) -> DeviceResult<u8> {
        self.record(GatewayCall::GetDoorDelay(device_id, door));
        let ix = Self::door_index(door)?;
        self.with_device(device_id, |d| Ok(d.doors[ix].delay))
    }

    async fn set_door_delay(&self, device_id: u32, door: u8, delay: u8) -> DeviceResult<()> {
        self.record(GatewayCall::SetDoorDelay(device_id, door, delay));
        let ix = Self::door_index(door)?;
        self.with_device(device_id, |d| {
            d.doors[ix].delay = delay;
            Ok(())
        })
    }

    async fn get_door_control(&self, device_id: u32, door: u8) -> DeviceResult<DoorMode> {
        self.record(GatewayCall::GetDoorControl(device_id, door));
        let ix = Self::door_index(door)?;
        self.with_device(device_id, |d| Ok(d.doors[ix].mode))
    }

    async fn set_door_control(&self, device_id: u32, door: u8, mode: DoorMode) -> DeviceResult<()> {
        self.record(GatewayCall::SetDoorControl(device_id, door, mode));
        let ix = Self::door_index(door)?;
        self.with_device(device_id, |d| {
            d.doors[ix].mode = mode;
            Ok(())
        })
    }

    async fn get_event_indices(&self, device_id: u32) -> DeviceResult<EventIndices> {
        self.record(GatewayCall::GetEventIndices(device_id));
        self.with_device(device_id, |d| Ok(d.indices()))
    }

    async fn get_event(&self, device_id: u32, index: u32) -> DeviceResult<Option<DeviceEvent>> {
        self.record(GatewayCall::GetEvent(device_id, index));
        self.with_device(device_id, |d| Ok(d.events.get(&index).cloned()))
    }

    async fn set_time(&self, device_id: u32, time: NaiveDateTime) -> DeviceResult<()> {
        self.record(GatewayCall::SetTime(device_id, time));
        self.with_device(device_id, |d| {
            d.clock_offset_secs = (time - Utc::now().naive_utc()).num_seconds();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn card(number: u32) -> CardRecord {
        CardRecord {
            number,
            from: NaiveDate::from_ymd_opt(2021, 1, 2).unwrap(),
            to: NaiveDate::from_ymd_opt(2021, 12, 30).unwrap(),
            doors: [1, 0, 0, 0],
        }
    }

    #[tokio::test]
    async fn test_put_and_read_cards() {
        let gateway = MemoryGateway::with_devices([SimDevice::new(405419896)]);
        gateway.put_card(405419896, card(6514231)).await.unwrap();

        let cards = gateway.get_card_records(405419896).await.unwrap();
        assert_eq!(cards, vec![card(6514231)]);
        assert_eq!(gateway.writes(), vec![GatewayCall::PutCard(405419896, card(6514231))]);
    }

    #[tokio::test]
    async fn test_offline_device_times_out() {
        let gateway = MemoryGateway::with_devices([SimDevice::new(1)]);
        gateway.set_online(1, false);

        assert_eq!(gateway.get_status(1).await.unwrap_err(), DeviceError::Timeout);
        assert!(gateway.get_devices().await.unwrap().is_empty());
        assert!(matches!(gateway.get_status(2).await, Err(DeviceError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_set_time_adjusts_clock() {
        let mut device = SimDevice::new(1);
        device.clock_offset_secs = 3600;
        let gateway = MemoryGateway::with_devices([device]);

        gateway.set_time(1, Utc::now().naive_utc()).await.unwrap();
        let status = gateway.get_status(1).await.unwrap();
        let drift = (status.time - Utc::now().naive_utc()).num_seconds().abs();
        assert!(drift <= 1);
    }

    #[tokio::test]
    async fn test_event_indices() {
        let gateway = MemoryGateway::with_devices([SimDevice::new(1)]);
        assert_eq!(gateway.get_event_indices(1).await.unwrap(), EventIndices::default());
        assert_eq!(gateway.get_event(1, 3).await.unwrap(), None);
    }
}
