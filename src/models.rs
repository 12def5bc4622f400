//! Shared API models
//!
//! Response wrappers and request bodies used by the web API.

use crate::cards::{Card, SyncStatus};
use crate::controllers::{Controller, DeviceRecord, Liveness};
use crate::doors::Door;
use crate::catalog::Oid;
use serde::{Deserialize, Serialize};

/// Standard API response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_sec: u64,
    pub controllers: usize,
    pub links: usize,
}

/// Controller with its runtime status
#[derive(Debug, Clone, Serialize)]
pub struct ControllerView {
    #[serde(flatten)]
    pub controller: Controller,
    pub liveness: Liveness,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<DeviceRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerList {
    pub controllers: Vec<ControllerView>,
    /// Reachable device ids no controller claims
    pub unconfigured: Vec<u32>,
}

/// Door with the liveness derived from its controller
#[derive(Debug, Clone, Serialize)]
pub struct DoorView {
    #[serde(flatten)]
    pub door: Door,
    pub liveness: Liveness,
    /// Owning controller device id and slot
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot: Option<u8>,
}

/// Card with the outcome of the last ACL push
#[derive(Debug, Clone, Serialize)]
pub struct CardView {
    #[serde(flatten)]
    pub card: Card,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_status: Option<SyncStatus>,
}

/// `PUT /api/objects` body
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateRequest {
    pub oid: Oid,
    pub value: String,
}

/// `POST /api/objects/:kind` response
#[derive(Debug, Clone, Serialize)]
pub struct CreatedResponse {
    pub oid: Oid,
}

/// `limit` / `device` query parameters
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
    pub device: Option<u32>,
}

impl ListQuery {
    pub const DEFAULT_LIMIT: usize = 100;

    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT)
    }
}
