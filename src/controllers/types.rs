//! Controller data types

use crate::catalog::{fields, Oid};
use crate::error::{Error, Result};
use crate::system::Entity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

/// Default UDP port of an access controller
pub const DEFAULT_PORT: u16 = 60000;

/// Number of door slots on a controller
pub const DOOR_SLOTS: u8 = 4;

/// Networked access controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Controller {
    pub oid: Oid,
    #[serde(default)]
    pub name: String,
    /// Device serial number, 0 when not yet assigned
    #[serde(default)]
    pub device_id: u32,
    /// Fixed endpoint; `None` means broadcast discovery on the link
    #[serde(default)]
    pub endpoint: Option<SocketAddr>,
    /// IANA timezone of the device clock, UTC when unset
    #[serde(default)]
    pub timezone: Option<String>,
    /// Door assigned to slots 1..4
    #[serde(default)]
    pub doors: [Option<Oid>; 4],
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<DateTime<Utc>>,
}

impl Controller {
    pub fn new(oid: Oid) -> Self {
        Self {
            oid,
            name: String::new(),
            device_id: 0,
            endpoint: None,
            timezone: None,
            doors: Default::default(),
            created: Utc::now(),
            deleted: None,
        }
    }

    /// Door in a 1-based slot
    pub fn door(&self, slot: u8) -> Option<&Oid> {
        match slot {
            1..=DOOR_SLOTS => self.doors[usize::from(slot - 1)].as_ref(),
            _ => None,
        }
    }

    /// `(slot, door)` pairs of assigned slots
    pub fn assigned(&self) -> impl Iterator<Item = (u8, &Oid)> {
        self.doors
            .iter()
            .zip(1..=DOOR_SLOTS)
            .filter_map(|(door, slot)| door.as_ref().map(|d| (slot, d)))
    }

    /// Parsed timezone, UTC when unset or unknown
    pub fn tz(&self) -> chrono_tz::Tz {
        self.timezone
            .as_deref()
            .and_then(|tz| tz.parse::<chrono_tz::Tz>().ok())
            .unwrap_or(chrono_tz::UTC)
    }
}

impl Entity for Controller {
    fn oid(&self) -> &Oid {
        &self.oid
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn created(&self) -> DateTime<Utc> {
        self.created
    }

    fn deleted(&self) -> Option<DateTime<Utc>> {
        self.deleted
    }

    fn set_deleted(&mut self, at: Option<DateTime<Utc>>) {
        self.deleted = at;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerField {
    Name,
    DeviceId,
    Endpoint,
    Timezone,
    Door(u8),
}

impl ControllerField {
    pub fn parse(suffix: &str) -> Result<Self> {
        match suffix {
            fields::controller::NAME => Ok(ControllerField::Name),
            fields::controller::DEVICE_ID => Ok(ControllerField::DeviceId),
            fields::controller::ENDPOINT => Ok(ControllerField::Endpoint),
            fields::controller::TIMEZONE => Ok(ControllerField::Timezone),
            other => other
                .strip_prefix(fields::controller::DOORS)
                .and_then(|rest| rest.strip_prefix('.'))
                .and_then(|slot| slot.parse::<u8>().ok())
                .filter(|slot| (1..=DOOR_SLOTS).contains(slot))
                .map(ControllerField::Door)
                .ok_or_else(|| Error::Validation(format!("unknown controller field '{}'", other))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ControllerField::Name => "name",
            ControllerField::DeviceId => "device_id",
            ControllerField::Endpoint => "endpoint",
            ControllerField::Timezone => "timezone",
            ControllerField::Door(_) => "door",
        }
    }
}

/// Parses `host:port` or a bare IP address (default port)
pub fn parse_endpoint(value: &str) -> Result<Option<SocketAddr>> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(Some(addr));
    }
    value
        .parse::<IpAddr>()
        .map(|ip| Some(SocketAddr::new(ip, DEFAULT_PORT)))
        .map_err(|_| Error::Validation(format!("invalid endpoint '{}'", value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(
            parse_endpoint("192.168.1.100").unwrap(),
            Some("192.168.1.100:60000".parse().unwrap())
        );
        assert_eq!(
            parse_endpoint("192.168.1.100:54321").unwrap(),
            Some("192.168.1.100:54321".parse().unwrap())
        );
        assert_eq!(parse_endpoint("").unwrap(), None);
        assert!(parse_endpoint("controller.local").is_err());
    }

    #[test]
    fn test_field_parse() {
        assert_eq!(ControllerField::parse(".2").unwrap(), ControllerField::DeviceId);
        assert_eq!(ControllerField::parse(".5.4").unwrap(), ControllerField::Door(4));
        assert!(ControllerField::parse(".5.5").is_err());
        assert!(ControllerField::parse(".9").is_err());
    }

    #[test]
    fn test_tz_falls_back_to_utc() {
        let mut controller = Controller::new(Oid::new("0.2.1"));
        assert_eq!(controller.tz(), chrono_tz::UTC);
        controller.timezone = Some("Africa/Johannesburg".into());
        assert_eq!(controller.tz(), chrono_tz::Africa::Johannesburg);
    }
}
