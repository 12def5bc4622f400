//! Door data types

use crate::catalog::{fields, Oid};
use crate::error::{Error, Result};
use crate::system::Entity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Door control mode as stored on the controller (1..3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoorMode {
    NormallyOpen,
    NormallyClosed,
    Controlled,
}

impl DoorMode {
    pub fn code(&self) -> u8 {
        match self {
            DoorMode::NormallyOpen => 1,
            DoorMode::NormallyClosed => 2,
            DoorMode::Controlled => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(DoorMode::NormallyOpen),
            2 => Some(DoorMode::NormallyClosed),
            3 => Some(DoorMode::Controlled),
            _ => None,
        }
    }
}

impl fmt::Display for DoorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DoorMode::NormallyOpen => "normally open",
            DoorMode::NormallyClosed => "normally closed",
            DoorMode::Controlled => "controlled",
        };
        f.write_str(s)
    }
}

impl FromStr for DoorMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let key: String = s
            .trim()
            .to_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();

        match key.as_str() {
            "1" | "normallyopen" | "no" => Ok(DoorMode::NormallyOpen),
            "2" | "normallyclosed" | "nc" => Ok(DoorMode::NormallyClosed),
            "3" | "controlled" => Ok(DoorMode::Controlled),
            _ => Err(Error::Validation(format!("invalid door mode '{}'", s.trim()))),
        }
    }
}

/// Physical door
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Door {
    pub oid: Oid,
    #[serde(default)]
    pub name: String,
    /// Unlock delay in seconds
    #[serde(default)]
    pub delay: Option<u8>,
    #[serde(default)]
    pub mode: Option<DoorMode>,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<DateTime<Utc>>,
}

impl Door {
    pub fn new(oid: Oid) -> Self {
        Self {
            oid,
            name: String::new(),
            delay: None,
            mode: None,
            created: Utc::now(),
            deleted: None,
        }
    }
}

impl Entity for Door {
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
pub enum DoorField {
    Name,
    Delay,
    Mode,
}

impl DoorField {
    pub fn parse(suffix: &str) -> Result<Self> {
        match suffix {
            fields::door::NAME => Ok(DoorField::Name),
            fields::door::DELAY => Ok(DoorField::Delay),
            fields::door::MODE => Ok(DoorField::Mode),
            other => Err(Error::Validation(format!("unknown door field '{}'", other))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DoorField::Name => "name",
            DoorField::Delay => "delay",
            DoorField::Mode => "mode",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_door_mode_parse() {
        assert_eq!("controlled".parse::<DoorMode>().unwrap(), DoorMode::Controlled);
        assert_eq!("Normally Open".parse::<DoorMode>().unwrap(), DoorMode::NormallyOpen);
        assert_eq!("normally-closed".parse::<DoorMode>().unwrap(), DoorMode::NormallyClosed);
        assert_eq!("3".parse::<DoorMode>().unwrap(), DoorMode::Controlled);
        assert!("ajar".parse::<DoorMode>().is_err());
    }

    #[test]
    fn test_door_mode_codes() {
        for mode in [DoorMode::NormallyOpen, DoorMode::NormallyClosed, DoorMode::Controlled] {
            assert_eq!(DoorMode::from_code(mode.code()), Some(mode));
        }
        assert_eq!(DoorMode::from_code(0), None);
    }
}
