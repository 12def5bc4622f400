//! Rules - pluggable per-card allow/forbid overrides
//!
//! The rule language itself lives outside this crate. `Rules` is the seam;
//! `NoRules` and `StaticRules` are the two implementations shipped here.

use crate::cards::Card;
use crate::catalog::Oid;
use crate::doors::Door;
use crate::error::{Error, Result};
use crate::groups::normalise_name;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Doors a rule evaluation added or removed for one card
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleOutcome {
    pub allowed: Vec<Oid>,
    pub forbidden: Vec<Oid>,
}

/// Rules capability
pub trait Rules: Send + Sync {
    /// Evaluates overrides for one card against the live doors. An error
    /// only affects this card.
    fn eval(&self, card: &Card, doors: &[Door]) -> Result<RuleOutcome>;
}

/// No overrides
#[derive(Debug, Clone, Default)]
pub struct NoRules;

impl Rules for NoRules {
    fn eval(&self, _card: &Card, _doors: &[Door]) -> Result<RuleOutcome> {
        Ok(RuleOutcome::default())
    }
}

/// One static rule. `card: None` applies to every card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticRule {
    #[serde(default)]
    pub card: Option<u32>,
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub forbid: Vec<String>,
}

/// Rules loaded from a JSON document, doors referenced by name
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticRules {
    pub rules: Vec<StaticRule>,
}

impl StaticRules {
    pub fn new(rules: Vec<StaticRule>) -> Self {
        Self { rules }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path).await?;
        let rules = Self::from_json(&json)?;
        tracing::info!(path = %path.display(), rules = rules.rules.len(), "Static rules loaded");
        Ok(rules)
    }

    fn resolve(card: &Card, doors: &[Door], name: &str) -> Result<Oid> {
        let key = normalise_name(name);
        doors
            .iter()
            .find(|d| normalise_name(&d.name) == key)
            .map(|d| d.oid.clone())
            .ok_or_else(|| Error::Rules {
                card: card.number.to_string(),
                message: format!("unknown door '{}'", name),
            })
    }
}

impl Rules for StaticRules {
    fn eval(&self, card: &Card, doors: &[Door]) -> Result<RuleOutcome> {
        let mut outcome = RuleOutcome::default();

        for rule in &self.rules {
            if rule.card.is_some_and(|number| number != card.number) {
                continue;
            }
            for name in &rule.allow {
                outcome.allowed.push(Self::resolve(card, doors, name)?);
            }
            for name in &rule.forbid {
                outcome.forbidden.push(Self::resolve(card, doors, name)?);
            }
        }

        Ok(outcome)
    }
}
