//! Fleet - routes device ids to the link they were discovered on

use super::{CardRecord, DeviceError, DeviceEvent, DeviceGateway, DeviceLocks, DeviceResult, DeviceStatus, EventIndices};
use crate::catalog::Oid;
use crate::doors::DoorMode;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Link registry plus per-device exclusion
pub struct Fleet {
    /// Interface OID -> gateway
    links: RwLock<BTreeMap<Oid, Arc<dyn DeviceGateway>>>,
    /// Device id -> interface OID
    routes: RwLock<HashMap<u32, Oid>>,
    locks: DeviceLocks,
}

impl std::fmt::Debug for Fleet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fleet").finish_non_exhaustive()
    }
}

impl Fleet {
    pub fn new(lock_timeout_ms: u64) -> Self {
        Self {
            links: RwLock::new(BTreeMap::new()),
            routes: RwLock::new(HashMap::new()),
            locks: DeviceLocks::with_timeout(lock_timeout_ms),
        }
    }

    pub async fn add_link(&self, interface: Oid, gateway: Arc<dyn DeviceGateway>) {
        tracing::info!(interface = %interface, "Link registered");
        self.links.write().await.insert(interface, gateway);
    }

    pub async fn link_count(&self) -> usize {
        self.links.read().await.len()
    }

    /// Link a device was last seen on
    pub async fn route_of(&self, device_id: u32) -> Option<Oid> {
        self.routes.read().await.get(&device_id).cloned()
    }

    /// Asks every link for its devices and routes each device to the link
    /// that reported it. A failing link is logged and skipped.
    pub async fn discover(&self) -> Vec<(Oid, u32)> {
        let links: Vec<(Oid, Arc<dyn DeviceGateway>)> = self
            .links
            .read()
            .await
            .iter()
            .map(|(oid, gw)| (oid.clone(), gw.clone()))
            .collect();

        let mut found = Vec::new();
        for (interface, gateway) in links {
            match gateway.get_devices().await {
                Ok(devices) => {
                    let mut routes = self.routes.write().await;
                    for device_id in devices {
                        routes.insert(device_id, interface.clone());
                        found.push((interface.clone(), device_id));
                    }
                }
                Err(e) => {
                    tracing::warn!(interface = %interface, error = %e, "Discovery failed on link");
                }
            }
        }

        found
    }

    /// Gateway for a device. Falls back to the only link when the device has
    /// not been discovered yet.
    async fn route(&self, device_id: u32) -> DeviceResult<Arc<dyn DeviceGateway>> {
        let links = self.links.read().await;

        if let Some(interface) = self.routes.read().await.get(&device_id) {
            if let Some(gateway) = links.get(interface) {
                return Ok(gateway.clone());
            }
        }

        match links.len() {
            1 => links.values().next().cloned().ok_or_else(no_route),
            _ => Err(no_route()),
        }
    }
}

fn no_route() -> DeviceError {
    DeviceError::Unreachable("no route".into())
}

#[async_trait]
impl DeviceGateway for Fleet {
    async fn get_devices(&self) -> DeviceResult<Vec<u32>> {
        let mut devices: Vec<u32> = self.discover().await.into_iter().map(|(_, id)| id).collect();
        devices.sort_unstable();
        devices.dedup();
        Ok(devices)
    }

    async fn get_status(&self, device_id: u32) -> DeviceResult<DeviceStatus> {
        self.route(device_id).await?.get_status(device_id).await
    }

    async fn get_card_records(&self, device_id: u32) -> DeviceResult<Vec<CardRecord>> {
        self.route(device_id).await?.get_card_records(device_id).await
    }

    async fn put_card(&self, device_id: u32, card: CardRecord) -> DeviceResult<()> {
        let gateway = self.route(device_id).await?;
        let _lease = self.locks.acquire(device_id).await?;
        gateway.put_card(device_id, card).await
    }

    async fn delete_card(&self, device_id: u32, card_number: u32) -> DeviceResult<()> {
        let gateway = self.route(device_id).await?;
        let _lease = self.locks.acquire(device_id).await?;
        gateway.delete_card(device_id, card_number).await
    }

    async fn get_door_delay(&self, device_id: u32, door: u8) -> DeviceResult<u8> {
        self.route(device_id).await?.get_door_delay(device_id, door).await
    }

    async fn set_door_delay(&self, device_id: u32, door: u8, delay: u8) -> DeviceResult<()> {
        let gateway = self.route(device_id).await?;
        let _lease = self.locks.acquire(device_id).await?;
        gateway.set_door_delay(device_id, door, delay).await
    }

    async fn get_door_control(&self, device_id: u32, door: u8) -> DeviceResult<DoorMode> {
        self.route(device_id).await?.get_door_control(device_id, door).await
    }

    async fn set_door_control(&self, device_id: u32, door: u8, mode: DoorMode) -> DeviceResult<()> {
        let gateway = self.route(device_id).await?;
        let _lease = self.locks.acquire(device_id).await?;
        gateway.set_door_control(device_id, door, mode).await
    }

    async fn get_event_indices(&self, device_id: u32) -> DeviceResult<EventIndices> {
        self.route(device_id).await?.get_event_indices(device_id).await
    }

    async fn get_event(&self, device_id: u32, index: u32) -> DeviceResult<Option<DeviceEvent>> {
        self.route(device_id).await?.get_event(device_id, index).await
    }

    async fn set_time(&self, device_id: u32, time: NaiveDateTime) -> DeviceResult<()> {
        let gateway = self.route(device_id).await?;
        let _lease = self.locks.acquire(device_id).await?;
        gateway.set_time(device_id, time).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_gateway::{GatewayCall, MemoryGateway, SimDevice};

    #[tokio::test]
    async fn test_discovery_routes_devices() {
        let fleet = Fleet::new(1000);
        let a = Arc::new(MemoryGateway::with_devices([SimDevice::new(1), SimDevice::new(2)]));
        let b = Arc::new(MemoryGateway::with_devices([SimDevice::new(3)]));
        fleet.add_link(Oid::new("0.1.1"), a.clone()).await;
        fleet.add_link(Oid::new("0.1.2"), b.clone()).await;

        assert_eq!(fleet.get_devices().await.unwrap(), vec![1, 2, 3]);
        assert_eq!(fleet.route_of(3).await, Some(Oid::new("0.1.2")));

        fleet.get_status(3).await.unwrap();
        assert!(b.calls().contains(&GatewayCall::GetStatus(3)));
        assert!(!a.calls().contains(&GatewayCall::GetStatus(3)));
    }

    #[tokio::test]
    async fn test_unrouted_device_with_several_links() {
        let fleet = Fleet::new(1000);
        fleet.add_link(Oid::new("0.1.1"), Arc::new(MemoryGateway::new())).await;
        fleet.add_link(Oid::new("0.1.2"), Arc::new(MemoryGateway::new())).await;

        let err = fleet.get_status(9).await.unwrap_err();
        assert_eq!(err, DeviceError::Unreachable("no route".into()));
    }

    #[tokio::test]
    async fn test_single_link_fallback() {
        let fleet = Fleet::new(1000);
        let gateway = Arc::new(MemoryGateway::with_devices([SimDevice::new(7)]));
        fleet.add_link(Oid::new("0.1.1"), gateway).await;
        assert_eq!(fleet.get_status(7).await.unwrap().device_id, 7);
    }

    #[tokio::test]
    async fn test_writes_to_one_device_are_serialized() {
        let fleet = Arc::new(Fleet::new(5000));
        let gateway = Arc::new(MemoryGateway::with_devices([SimDevice::new(1)]));
        fleet.add_link(Oid::new("0.1.1"), gateway.clone()).await;

        let held = fleet.locks.acquire(1).await.unwrap();
        let pending = {
            let fleet = fleet.clone();
            tokio::spawn(async move { fleet.set_door_delay(1, 1, 9).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(gateway.writes().is_empty());

        drop(held);
        pending.await.unwrap().unwrap();
        assert_eq!(gateway.writes(), vec![GatewayCall::SetDoorDelay(1, 1, 9)]);
    }
}
