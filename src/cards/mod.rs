//! Cards - card holders, numbers, validity and group membership
//!
//! Invariant: a card number is unique among live cards.

mod types;

pub use types::*;

use crate::auth::{AuditRecord, Authorizer, EntityKind, Operation};
use crate::catalog::{fields, Namespace, Oid, Snapshot};
use crate::error::{Error, Result};
use crate::system::store::{
    display_date, live_mut, parse_bool, parse_date, parse_u32, soft_delete, split_field,
    sweep_entities,
};
use crate::system::{Editable, Entity, Store};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Card store
#[derive(Debug, Clone, Default)]
pub struct Cards {
    cards: BTreeMap<Oid, Card>,
}

#[derive(Serialize, Deserialize)]
struct Blob {
    cards: Vec<Card>,
}

impl Cards {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live cards in OID order
    pub fn list(&self) -> impl Iterator<Item = &Card> {
        self.cards.values().filter(|c| c.is_live())
    }

    /// Live cards that take part in the computed ACL
    pub fn valid(&self) -> impl Iterator<Item = &Card> {
        self.cards.values().filter(|c| c.is_valid())
    }

    /// Live and soft-deleted entities
    pub fn all(&self) -> impl Iterator<Item = &Card> {
        self.cards.values()
    }

    pub fn get(&self, oid: &Oid) -> Option<&Card> {
        self.cards.get(oid)
    }

    pub fn find_by_number(&self, number: u32) -> Option<&Card> {
        if number == 0 {
            return None;
        }
        self.list().find(|c| c.number == number)
    }

    /// Drops `groups` from every card, live or soft-deleted
    pub fn release_groups(&mut self, catalog: &mut Snapshot, groups: &[Oid]) -> usize {
        let mut released = 0;
        for card in self.cards.values_mut() {
            for group in groups {
                if card.groups.remove(group) {
                    catalog.clear_v(Self::NAMESPACE, &Self::group_field(&card.oid, group));
                    released += 1;
                }
            }
        }
        released
    }

    fn mirror(catalog: &mut Snapshot, card: &Card) {
        let ns = Namespace::Cards;
        catalog.put_v(ns, card.oid.append(fields::card::NAME), card.name.clone());
        catalog.put_v(ns, card.oid.append(fields::card::NUMBER), card.number);
        catalog.put_v(ns, card.oid.append(fields::CREATED), card.created.to_rfc3339());
        match card.from {
            Some(from) => catalog.put_v(ns, card.oid.append(fields::card::FROM), from),
            None => catalog.clear_v(ns, &card.oid.append(fields::card::FROM)),
        }
        match card.to {
            Some(to) => catalog.put_v(ns, card.oid.append(fields::card::TO), to),
            None => catalog.clear_v(ns, &card.oid.append(fields::card::TO)),
        }
        for group in &card.groups {
            catalog.put_v(ns, Self::group_field(&card.oid, group), true);
        }
    }

    fn group_field(card: &Oid, group: &Oid) -> Oid {
        card.append(fields::card::GROUPS).append(group.as_str())
    }
}

impl Store for Cards {
    const NAMESPACE: Namespace = Namespace::Cards;
    const KIND: EntityKind = EntityKind::Card;

    fn validate(&self) -> Result<()> {
        let mut numbers: HashMap<u32, &Oid> = HashMap::new();

        for card in self.list() {
            if card.number != 0 {
                if let Some(other) = numbers.insert(card.number, &card.oid) {
                    return Err(Error::Validation(format!(
                        "card number {} is assigned to both {} and {}",
                        card.number, other, card.oid
                    )));
                }
            }

            if let (Some(from), Some(to)) = (card.from, card.to) {
                if from > to {
                    return Err(Error::Validation(format!(
                        "card {}: valid from {} is after valid to {}",
                        card.oid, from, to
                    )));
                }
            }
        }

        Ok(())
    }

    fn sweep(&mut self, catalog: &mut Snapshot, cutoff: DateTime<Utc>) -> Vec<Oid> {
        sweep_entities(&mut self.cards, Self::NAMESPACE, catalog, cutoff)
    }

    fn load(&mut self, catalog: &mut Snapshot, blob: &[u8]) -> Result<()> {
        let blob: Blob = serde_json::from_slice(blob)?;

        self.cards.clear();
        for card in blob.cards {
            catalog.put_instance(Self::NAMESPACE, &card.oid, card.deleted.is_some());
            Self::mirror(catalog, &card);
            self.cards.insert(card.oid.clone(), card);
        }

        Ok(())
    }

    fn save(&self) -> Result<Vec<u8>> {
        let blob = Blob {
            cards: self.cards.values().cloned().collect(),
        };
        Ok(serde_json::to_vec_pretty(&blob)?)
    }
}

impl Editable for Cards {
    fn add(&mut self, catalog: &mut Snapshot, auth: &dyn Authorizer) -> Result<(Oid, Vec<AuditRecord>)> {
        auth.authorize(Operation::Add, Self::KIND, None)?;

        let oid = catalog.allocate(Self::NAMESPACE);
        let card = Card::new(oid.clone());
        Self::mirror(catalog, &card);
        self.cards.insert(oid.clone(), card);

        let record = AuditRecord::new(auth, Self::KIND, &oid, "", "created", "", oid.as_str());
        Ok((oid, vec![record]))
    }

    fn update(
        &mut self,
        catalog: &mut Snapshot,
        auth: &dyn Authorizer,
        oid: &Oid,
        value: &str,
    ) -> Result<Vec<AuditRecord>> {
        let (instance, suffix) = split_field(Self::NAMESPACE, oid)?;
        let field = CardField::parse(suffix)?;
        auth.authorize(Operation::Update, Self::KIND, Some(field.name()))?;

        let card = live_mut(&mut self.cards, Self::KIND, &instance)?;
        let ns = Self::NAMESPACE;

        let (before, after) = match &field {
            CardField::Name => {
                let after = value.trim().to_string();
                let before = std::mem::replace(&mut card.name, after.clone());
                catalog.put_v(ns, oid.clone(), after.clone());
                (before, after)
            }
            CardField::Number => {
                let number = parse_u32("card number", value)?;
                let before = std::mem::replace(&mut card.number, number);
                catalog.put_v(ns, oid.clone(), number);
                (before.to_string(), number.to_string())
            }
            CardField::From | CardField::To => {
                let date = parse_date(field.name(), value)?;
                let slot = if field == CardField::From {
                    &mut card.from
                } else {
                    &mut card.to
                };
                let before = std::mem::replace(slot, date);
                match date {
                    Some(d) => catalog.put_v(ns, oid.clone(), d),
                    None => catalog.clear_v(ns, oid),
                }
                (display_date(before), display_date(date))
            }
            CardField::Group(group) => {
                if !catalog.is_live(Namespace::Groups, group) {
                    return Err(Error::Validation(format!("unknown group {}", group)));
                }
                let member = parse_bool("group membership", value)?;
                let before = card.groups.contains(group);
                if member {
                    card.groups.insert(group.clone());
                    catalog.put_v(ns, oid.clone(), true);
                } else {
                    card.groups.remove(group);
                    catalog.clear_v(ns, oid);
                }
                (before.to_string(), member.to_string())
            }
        };

        if before == after {
            return Ok(vec![]);
        }

        let field_name = match &field {
            CardField::Group(group) => format!("group {}", group),
            other => other.name().to_string(),
        };

        Ok(vec![AuditRecord::new(
            auth,
            Self::KIND,
            &instance,
            &card.name,
            &field_name,
            before,
            after,
        )])
    }

    fn delete(&mut self, catalog: &mut Snapshot, auth: &dyn Authorizer, oid: &Oid) -> Result<Vec<AuditRecord>> {
        soft_delete(&mut self.cards, Self::NAMESPACE, Self::KIND, catalog, auth, oid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AllowAll;
    use crate::catalog::Value;

    fn field(oid: &Oid, suffix: &str) -> Oid {
        oid.append(suffix)
    }

    #[test]
    fn test_add_and_update_mirrors_catalog() {
        let auth = AllowAll::system();
        let mut catalog = Snapshot::new(None);
        let mut cards = Cards::new();

        let (oid, _) = cards.add(&mut catalog, &auth).unwrap();
        cards
            .update(&mut catalog, &auth, &field(&oid, fields::card::NUMBER), "6514231")
            .unwrap();
        cards
            .update(&mut catalog, &auth, &field(&oid, fields::card::NAME), " Alice ")
            .unwrap();

        let card = cards.get(&oid).unwrap();
        assert_eq!(card.number, 6514231);
        assert_eq!(card.name, "Alice");
        assert_eq!(
            catalog.get_v(&field(&oid, fields::card::NUMBER)),
            Some(&Value::Uint(6514231))
        );
    }

    #[test]
    fn test_duplicate_number_fails_validation() {
        let auth = AllowAll::system();
        let mut catalog = Snapshot::new(None);
        let mut cards = Cards::new();

        let (a, _) = cards.add(&mut catalog, &auth).unwrap();
        let (b, _) = cards.add(&mut catalog, &auth).unwrap();
        cards.update(&mut catalog, &auth, &field(&a, fields::card::NUMBER), "100").unwrap();
        cards.update(&mut catalog, &auth, &field(&b, fields::card::NUMBER), "100").unwrap();
        assert!(matches!(cards.validate(), Err(Error::Validation(_))));

        // a deleted card no longer holds its number
        cards.delete(&mut catalog, &auth, &a).unwrap();
        assert!(cards.validate().is_ok());
    }

    #[test]
    fn test_group_membership_requires_live_group() {
        let auth = AllowAll::system();
        let mut catalog = Snapshot::new(None);
        let mut cards = Cards::new();
        let (card, _) = cards.add(&mut catalog, &auth).unwrap();

        let group = Oid::new("0.5.1");
        let membership = card.append(fields::card::GROUPS).append(group.as_str());
        assert!(cards.update(&mut catalog, &auth, &membership, "true").is_err());

        catalog.put_instance(Namespace::Groups, &group, false);
        let audit = cards.update(&mut catalog, &auth, &membership, "true").unwrap();
        assert_eq!(audit.len(), 1);
        assert!(cards.get(&card).unwrap().groups.contains(&group));

        // unchanged value produces no audit record
        let audit = cards.update(&mut catalog, &auth, &membership, "true").unwrap();
        assert!(audit.is_empty());
    }

    #[test]
    fn test_inverted_validity_window_rejected() {
        let auth = AllowAll::system();
        let mut catalog = Snapshot::new(None);
        let mut cards = Cards::new();
        let (oid, _) = cards.add(&mut catalog, &auth).unwrap();
        cards.update(&mut catalog, &auth, &field(&oid, fields::card::FROM), "2021-12-30").unwrap();
        cards.update(&mut catalog, &auth, &field(&oid, fields::card::TO), "2021-01-02").unwrap();
        assert!(cards.validate().is_err());
    }

    #[test]
    fn test_save_load_keeps_soft_deleted() {
        let auth = AllowAll::system();
        let mut catalog = Snapshot::new(None);
        let mut cards = Cards::new();
        let (a, _) = cards.add(&mut catalog, &auth).unwrap();
        let (b, _) = cards.add(&mut catalog, &auth).unwrap();
        cards.update(&mut catalog, &auth, &field(&a, fields::card::NUMBER), "6514231").unwrap();
        cards.delete(&mut catalog, &auth, &b).unwrap();

        let blob = cards.save().unwrap();
        let mut restored_catalog = Snapshot::new(Some(8));
        let mut restored = Cards::new();
        restored.load(&mut restored_catalog, &blob).unwrap();

        assert_eq!(restored.get(&a), cards.get(&a));
        assert_eq!(restored.get(&b), cards.get(&b));
        // the soft-deleted slot stays taken
        assert_eq!(restored_catalog.allocate(Namespace::Cards), Namespace::Cards.instance(3));
        assert!(!restored_catalog.is_live(Namespace::Cards, &b));
        assert_eq!(restored.list().count(), 1);
    }

    #[test]
    fn test_sweep_removes_expired() {
        let auth = AllowAll::system();
        let mut catalog = Snapshot::new(Some(32));
        let mut cards = Cards::new();
        let (a, _) = cards.add(&mut catalog, &auth).unwrap();
        cards.delete(&mut catalog, &auth, &a).unwrap();

        let swept = cards.sweep(&mut catalog, Utc::now() - chrono::Duration::hours(1));
        assert!(swept.is_empty());

        let swept = cards.sweep(&mut catalog, Utc::now() + chrono::Duration::seconds(1));
        assert_eq!(swept, vec![a.clone()]);
        assert!(cards.get(&a).is_none());
        assert_eq!(catalog.allocate(Namespace::Cards), a);
    }
}
