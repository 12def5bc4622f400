//! Card data types

use crate::catalog::{fields, Oid};
use crate::error::{Error, Result};
use crate::system::Entity;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Access card
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub oid: Oid,
    /// Card holder
    #[serde(default)]
    pub name: String,
    /// Card number, 0 when not yet assigned
    #[serde(default)]
    pub number: u32,
    #[serde(default)]
    pub from: Option<NaiveDate>,
    #[serde(default)]
    pub to: Option<NaiveDate>,
    #[serde(default)]
    pub groups: BTreeSet<Oid>,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<DateTime<Utc>>,
}

impl Card {
    pub fn new(oid: Oid) -> Self {
        Self {
            oid,
            name: String::new(),
            number: 0,
            from: None,
            to: None,
            groups: BTreeSet::new(),
            created: Utc::now(),
            deleted: None,
        }
    }

    /// Live, numbered and with a complete validity window
    pub fn is_valid(&self) -> bool {
        self.deleted.is_none() && self.number != 0 && self.from.is_some() && self.to.is_some()
    }
}

impl Entity for Card {
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

/// Addressable card fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardField {
    Name,
    Number,
    From,
    To,
    Group(Oid),
}

impl CardField {
    pub fn parse(suffix: &str) -> Result<Self> {
        match suffix {
            fields::card::NAME => Ok(CardField::Name),
            fields::card::NUMBER => Ok(CardField::Number),
            fields::card::FROM => Ok(CardField::From),
            fields::card::TO => Ok(CardField::To),
            other => other
                .strip_prefix(fields::card::GROUPS)
                .and_then(|rest| rest.strip_prefix('.'))
                .and_then(|group| group.parse::<Oid>().ok())
                .map(CardField::Group)
                .ok_or_else(|| Error::Validation(format!("unknown card field '{}'", other))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CardField::Name => "name",
            CardField::Number => "number",
            CardField::From => "from",
            CardField::To => "to",
            CardField::Group(_) => "group",
        }
    }
}

/// Per-card outcome of the last ACL push
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Ok,
    Error,
}
