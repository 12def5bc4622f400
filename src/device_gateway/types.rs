//! Device Gateway types

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Device communication failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("timeout")]
    Timeout,

    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("malformed reply: {0}")]
    Malformed(String),

    /// Device answered but refused the request
    #[error("rejected: {0}")]
    Rejected(String),
}

pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Live status reported by a controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub device_id: u32,
    pub endpoint: Option<SocketAddr>,
    /// Device clock (device local time)
    pub time: NaiveDateTime,
    /// Number of card records stored on the device
    pub cards: u32,
    /// Index of the most recent event
    pub event_index: u32,
    /// Anti-passback mode (0 = disabled)
    #[serde(default)]
    pub antipassback: u8,
}

/// Card record as stored on a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CardRecord {
    pub number: u32,
    pub from: NaiveDate,
    pub to: NaiveDate,
    /// Grant per door slot 1..4 (index 0 = slot 1)
    pub doors: [u8; 4],
}

/// Event index range kept by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EventIndices {
    /// Oldest index still retrievable
    pub first: u32,
    /// Most recent index
    pub last: u32,
    /// Device's "current" read pointer
    pub current: u32,
}

/// Swipe/door direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    In,
    Out,
}

/// Event as returned by a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEvent {
    pub index: u32,
    /// Device event type code (swipe, door, alarm, ...)
    pub kind: u8,
    /// Door slot 1..4, 0 when not door related
    pub door: u8,
    pub direction: Direction,
    pub card: u32,
    pub timestamp: NaiveDateTime,
    pub granted: bool,
    pub reason: u8,
}
