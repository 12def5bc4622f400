//! Permission builder
//!
//! Computes the ACL every controller should hold from cards, groups, doors
//! and the rules capability. Pure given its inputs, so two runs over the
//! same state produce identical tables.

use super::{Acl, Permission};
use crate::cards::Card;
use crate::catalog::{Oid, Snapshot};
use crate::doors::Door;
use crate::rules::Rules;
use crate::system::SystemState;

/// Rule evaluation that failed for one card
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleFailure {
    pub card: u32,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct BuildResult {
    pub acl: Acl,
    /// Cards whose rules failed; their entries carry no grants
    pub failures: Vec<RuleFailure>,
}

/// Builds the computed ACL
pub fn build(state: &SystemState, catalog: &Snapshot, rules: &dyn Rules) -> BuildResult {
    let mut acl = Acl::new();
    let mut failures = Vec::new();

    for controller in state.controllers.configured() {
        acl.add_device(controller.device_id);
    }

    let cards: Vec<&Card> = state.cards.valid().collect();
    let doors: Vec<Door> = state.doors.list().cloned().collect();

    // seed every valid card on every controller
    for card in &cards {
        let (Some(from), Some(to)) = (card.from, card.to) else {
            continue;
        };
        for (_, table) in acl.iter_mut() {
            table.insert(card.number, Permission::new(from, to));
        }
    }

    // base pass: group membership
    for card in &cards {
        for group in card.groups.iter().filter_map(|g| state.groups.live(g)) {
            for door in group.doors.iter().filter(|d| state.doors.live(d).is_some()) {
                grant(&mut acl, catalog, card.number, door, true);
            }
        }
    }

    // override pass: allowed adds, forbidden always clears
    for card in &cards {
        match rules.eval(card, &doors) {
            Ok(outcome) => {
                for door in &outcome.allowed {
                    grant(&mut acl, catalog, card.number, door, true);
                }
                for door in &outcome.forbidden {
                    grant(&mut acl, catalog, card.number, door, false);
                }
            }
            Err(e) => {
                tracing::warn!(card = card.number, error = %e, "Rule evaluation failed, revoking all doors");
                for (_, table) in acl.iter_mut() {
                    if let Some(permission) = table.get_mut(&card.number) {
                        permission.doors = [0; 4];
                    }
                }
                failures.push(RuleFailure {
                    card: card.number,
                    message: e.to_string(),
                });
            }
        }
    }

    BuildResult { acl, failures }
}

fn grant(acl: &mut Acl, catalog: &Snapshot, card: u32, door: &Oid, granted: bool) {
    let Some((device_id, slot)) = catalog.door_slot(door) else {
        return;
    };
    if let Some(permission) = acl.get_mut(device_id, card) {
        permission.set(slot, granted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AllowAll;
    use crate::cards::Card;
    use crate::catalog::fields;
    use crate::error::{Error, Result};
    use crate::rules::{NoRules, RuleOutcome};
    use crate::system::{Shadow, System};
    use chrono::NaiveDate;

    struct ForbidDoor(Oid);

    impl Rules for ForbidDoor {
        fn eval(&self, _card: &Card, _doors: &[Door]) -> Result<RuleOutcome> {
            Ok(RuleOutcome {
                allowed: vec![],
                forbidden: vec![self.0.clone()],
            })
        }
    }

    struct FailFor(u32);

    impl Rules for FailFor {
        fn eval(&self, card: &Card, doors: &[Door]) -> Result<RuleOutcome> {
            if card.number == self.0 {
                return Err(Error::Rules {
                    card: card.number.to_string(),
                    message: "boom".into(),
                });
            }
            Ok(RuleOutcome {
                allowed: doors.iter().map(|d| d.oid.clone()).collect(),
                forbidden: vec![],
            })
        }
    }

    fn set(shadow: &mut Shadow, oid: &Oid, suffix: &str, value: &str) {
        shadow.update(&AllowAll::system(), &oid.append(suffix), value).unwrap();
    }

    /// Card C01 in group G05 granting door D11 on controller 405419896 slot 1
    async fn scenario() -> (System, Oid) {
        let system = System::new(None);
        let door = system
            .transact(|shadow| {
                let auth = AllowAll::system();
                let controller = shadow.add(&auth, crate::auth::EntityKind::Controller)?;
                let door = shadow.add(&auth, crate::auth::EntityKind::Door)?;
                let group = shadow.add(&auth, crate::auth::EntityKind::Group)?;
                let card = shadow.add(&auth, crate::auth::EntityKind::Card)?;

                set(shadow, &controller, fields::controller::DEVICE_ID, "405419896");
                set(shadow, &controller, &fields::controller::door(1), door.as_str());
                set(shadow, &door, fields::door::NAME, "D11");
                set(shadow, &group, fields::group::NAME, "G05");
                set(shadow, &group, &format!("{}.{}", fields::group::DOORS, door), "true");
                set(shadow, &card, fields::card::NAME, "C01");
                set(shadow, &card, fields::card::NUMBER, "6514231");
                set(shadow, &card, fields::card::FROM, "2021-01-02");
                set(shadow, &card, fields::card::TO, "2021-12-30");
                set(shadow, &card, &format!("{}.{}", fields::card::GROUPS, group), "true");
                Ok(door)
            })
            .await
            .unwrap();
        (system, door)
    }

    #[tokio::test]
    async fn test_group_grant() {
        let (system, _) = scenario().await;
        let view = system.view().await;
        let result = build(&view.state, &view.catalog, &NoRules);

        let permission = result.acl.get(405419896, 6514231).unwrap();
        assert_eq!(permission.from, NaiveDate::from_ymd_opt(2021, 1, 2).unwrap());
        assert_eq!(permission.to, NaiveDate::from_ymd_opt(2021, 12, 30).unwrap());
        assert_eq!(permission.doors, [1, 0, 0, 0]);
        assert!(result.failures.is_empty());
    }

    #[tokio::test]
    async fn test_build_is_idempotent() {
        let (system, _) = scenario().await;
        let view = system.view().await;
        let a = build(&view.state, &view.catalog, &NoRules);
        let b = build(&view.state, &view.catalog, &NoRules);
        assert_eq!(a.acl, b.acl);
    }

    #[tokio::test]
    async fn test_forbid_wins_over_group_grant() {
        let (system, door) = scenario().await;
        let view = system.view().await;
        let result = build(&view.state, &view.catalog, &ForbidDoor(door));
        assert_eq!(result.acl.get(405419896, 6514231).unwrap().doors, [0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_rule_failure_fails_closed_for_that_card_only() {
        let (system, _) = scenario().await;
        let other = system
            .transact(|shadow| {
                let card = shadow.add(&AllowAll::system(), crate::auth::EntityKind::Card)?;
                set(shadow, &card, fields::card::NUMBER, "100");
                set(shadow, &card, fields::card::FROM, "2021-01-01");
                set(shadow, &card, fields::card::TO, "2021-12-31");
                Ok(card)
            })
            .await
            .unwrap();
        assert!(!other.is_empty());

        let view = system.view().await;
        let result = build(&view.state, &view.catalog, &FailFor(6514231));

        assert_eq!(result.acl.get(405419896, 6514231).unwrap().doors, [0, 0, 0, 0]);
        assert_eq!(result.acl.get(405419896, 100).unwrap().doors, [1, 0, 0, 0]);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].card, 6514231);
    }

    #[tokio::test]
    async fn test_invalid_cards_and_unconfigured_controllers_skipped() {
        let system = System::new(None);
        let auth = AllowAll::system();
        system.add(&auth, crate::auth::EntityKind::Controller).await.unwrap();
        let card = system.add(&auth, crate::auth::EntityKind::Card).await.unwrap();
        system
            .update(&auth, &card.append(fields::card::NUMBER), "42")
            .await
            .unwrap();

        let view = system.view().await;
        let result = build(&view.state, &view.catalog, &NoRules);
        assert_eq!(result.acl, Acl::new());
    }
}
