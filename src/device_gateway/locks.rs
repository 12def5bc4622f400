//! Per-device exclusion
//!
//! State-changing operations against one device never interleave;
//! operations against different devices run in parallel. Waiting for a busy
//! device is bounded by a timeout.

use super::DeviceError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::time::timeout;

/// Default wait for a busy device (5 s)
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 5000;

/// Device id -> exclusion token
#[derive(Debug)]
pub struct DeviceLocks {
    locks: RwLock<HashMap<u32, Arc<Mutex<()>>>>,
    wait_timeout: Duration,
}

impl DeviceLocks {
    pub fn with_timeout(timeout_ms: u64) -> Self {
        Self {
            locks: RwLock::new(HashMap::new()),
            wait_timeout: Duration::from_millis(timeout_ms),
        }
    }

    /// Waits for exclusive access to a device. The lease releases on drop.
    pub async fn acquire(&self, device_id: u32) -> Result<DeviceLease, DeviceError> {
        let lock = self.get_or_create(device_id).await;

        match timeout(self.wait_timeout, lock.lock_owned()).await {
            Ok(guard) => Ok(DeviceLease {
                device_id,
                _guard: guard,
            }),
            Err(_) => {
                tracing::warn!(
                    device_id,
                    timeout_ms = self.wait_timeout.as_millis() as u64,
                    "Device busy, giving up"
                );
                Err(DeviceError::Timeout)
            }
        }
    }

    async fn get_or_create(&self, device_id: u32) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.read().await.get(&device_id) {
            return lock.clone();
        }

        self.locks
            .write()
            .await
            .entry(device_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Exclusive access to one device, released on drop
#[derive(Debug)]
pub struct DeviceLease {
    device_id: u32,
    _guard: OwnedMutexGuard<()>,
}

impl DeviceLease {
    pub fn device_id(&self) -> u32 {
        self.device_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_release() {
        let locks = DeviceLocks::with_timeout(DEFAULT_WAIT_TIMEOUT_MS);
        let lease = locks.acquire(405419896).await.unwrap();
        assert_eq!(lease.device_id(), 405419896);
        drop(lease);
        let _again = locks.acquire(405419896).await.unwrap();
    }

    #[tokio::test]
    async fn test_busy_device_does_not_block_others() {
        let locks = DeviceLocks::with_timeout(50);
        let _held = locks.acquire(1).await.unwrap();
        assert!(locks.acquire(2).await.is_ok());
        assert_eq!(locks.acquire(1).await.unwrap_err(), DeviceError::Timeout);
    }

    #[tokio::test]
    async fn test_timeout() {
        let locks = DeviceLocks::with_timeout(50);
        let _held = locks.acquire(1).await.unwrap();
        assert_eq!(locks.acquire(1).await.unwrap_err(), DeviceError::Timeout);
    }
}
