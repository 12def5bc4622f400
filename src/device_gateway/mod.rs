//! Device Gateway - I/O with physical access controllers
//!
//! `DeviceGateway` is the capability one network link provides. The wire
//! protocol lives behind it. `Fleet` routes device ids to links and
//! serializes state-changing calls per device. `MemoryGateway` is an
//! in-process fleet used by tests and demo deployments.

mod fleet;
mod locks;
mod memory;
mod types;

pub use fleet::Fleet;
pub use locks::{DeviceLease, DeviceLocks, DEFAULT_WAIT_TIMEOUT_MS};
pub use memory::{GatewayCall, MemoryGateway, SimDevice, SimDoor};
pub use types::*;

use crate::doors::DoorMode;
use async_trait::async_trait;
use chrono::NaiveDateTime;

/// Capability provided by one network link
#[async_trait]
pub trait DeviceGateway: Send + Sync {
    /// Device ids reachable on this link
    async fn get_devices(&self) -> DeviceResult<Vec<u32>>;

    async fn get_status(&self, device_id: u32) -> DeviceResult<DeviceStatus>;

    /// Every card record held by a device
    async fn get_card_records(&self, device_id: u32) -> DeviceResult<Vec<CardRecord>>;

    /// Adds or replaces a card record
    async fn put_card(&self, device_id: u32, card: CardRecord) -> DeviceResult<()>;

    async fn delete_card(&self, device_id: u32, card_number: u32) -> DeviceResult<()>;

    async fn get_door_delay(&self, device_id: u32, door: u8) -> DeviceResult<u8>;

    async fn set_door_delay(&self, device_id: u32, door: u8, delay: u8) -> DeviceResult<()>;

    async fn get_door_control(&self, device_id: u32, door: u8) -> DeviceResult<DoorMode>;

    async fn set_door_control(&self, device_id: u32, door: u8, mode: DoorMode) -> DeviceResult<()>;

    async fn get_event_indices(&self, device_id: u32) -> DeviceResult<EventIndices>;

    /// `Ok(None)` when the device no longer holds that index
    async fn get_event(&self, device_id: u32, index: u32) -> DeviceResult<Option<DeviceEvent>>;

    /// Sets the device clock (device local time)
    async fn set_time(&self, device_id: u32, time: NaiveDateTime) -> DeviceResult<()>;
}
