//! Badge condition evaluation
//!
//! A badge's conditions are checked in declared order and the first failing
//! one decides the result. Evaluation only reads the store, so it is safe to
//! run next to the indexer.

use crate::records::{
    now_secs, ContractTemplate, DeploymentStatus, MintCondition, UserAccount, UserBadge,
};
use crate::store::{Mutation, ProgressStore, WriteSet};
use alloy_primitives::Address;
use anyhow::{Context, Result};
use std::fmt;
use tracing::info;

/// Source of season ranks for `RANK_ACHIEVED`.
pub trait RankProvider {
    /// 1-based rank of `user`, or `None` if unranked.
    fn season_rank(&self, user: Address) -> Result<Option<u32>>;
}

/// Ranks users by total XP. Users with equal XP share a rank.
pub struct XpLeaderboard<'a> {
    store: &'a dyn ProgressStore,
}

impl<'a> XpLeaderboard<'a> {
    pub fn new(store: &'a dyn ProgressStore) -> Self {
        Self { store }
    }
}

impl RankProvider for XpLeaderboard<'_> {
    fn season_rank(&self, user: Address) -> Result<Option<u32>> {
        let users = self.store.list_users().context("Failed to list users")?;
        let Some(me) = users.iter().find(|u| u.address == user) else {
            return Ok(None);
        };
        let ahead = users.iter().filter(|u| u.xp > me.xp).count();
        Ok(Some(u32::try_from(ahead + 1).unwrap_or(u32::MAX)))
    }
}

/// Why a user can't (yet) have a badge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IneligibleReason {
    AlreadyHeld,
    MissionNotCompleted(String),
    XpBelow { xp: u64, threshold: u64 },
    ReputationBelow { reputation: u8, threshold: u64 },
    NoDeployment(Option<ContractTemplate>),
    RankNotAchieved { rank: Option<u32>, required: u32 },
    RequiresAdminApproval,
    UnknownCondition,
}

impl fmt::Display for IneligibleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyHeld => write!(f, "Already has this badge"),
            Self::MissionNotCompleted(mission) => write!(f, "Mission {} not completed", mission),
            Self::XpBelow { xp, threshold } => {
                write!(f, "XP threshold not met ({}/{})", xp, threshold)
            }
            Self::ReputationBelow { reputation, threshold } => {
                write!(f, "Reputation threshold not met ({}/{})", reputation, threshold)
            }
            Self::NoDeployment(None) => write!(f, "No contract deployment found"),
            Self::NoDeployment(Some(template)) => {
                write!(f, "No {} contract deployment found", template)
            }
            Self::RankNotAchieved { rank: Some(rank), required } => {
                write!(f, "Rank {} not achieved (current rank {})", required, rank)
            }
            Self::RankNotAchieved { rank: None, required } => {
                write!(f, "Rank {} not achieved (unranked)", required)
            }
            Self::RequiresAdminApproval => write!(f, "Requires admin approval"),
            Self::UnknownCondition => write!(f, "Unknown condition type"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    Ineligible(IneligibleReason),
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Self::Eligible)
    }
}

/// Result of an award attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Award {
    Awarded(UserBadge),
    Refused(IneligibleReason),
}

pub struct BadgeEvaluator<'a> {
    store: &'a dyn ProgressStore,
    ranks: &'a dyn RankProvider,
}

impl<'a> BadgeEvaluator<'a> {
    pub fn new(store: &'a dyn ProgressStore, ranks: &'a dyn RankProvider) -> Self {
        Self { store, ranks }
    }

    /// Decide whether `user` may hold `badge_id`.
    ///
    /// A held badge is ineligible before any condition is looked at. Unknown
    /// users are evaluated as fresh accounts. A missing template is an error.
    pub fn evaluate(&self, user: Address, badge_id: &str) -> Result<Eligibility> {
        if self.store.get_user_badge(user, badge_id)?.is_some() {
            return Ok(Eligibility::Ineligible(IneligibleReason::AlreadyHeld));
        }

        let template = self
            .store
            .get_badge_template(badge_id)?
            .with_context(|| format!("Badge template {} not found", badge_id))?;
        let account = self
            .store
            .get_user(user)?
            .unwrap_or_else(|| UserAccount::new(user, 0));

        for condition in &template.conditions {
            if let Some(reason) = self.check(condition, &account)? {
                return Ok(Eligibility::Ineligible(reason));
            }
        }
        Ok(Eligibility::Eligible)
    }

    /// `None` if the condition holds.
    fn check(
        &self,
        condition: &MintCondition,
        account: &UserAccount,
    ) -> Result<Option<IneligibleReason>> {
        let reason = match condition {
            MintCondition::MissionComplete { mission_id } => {
                let done = self
                    .store
                    .get_mission_progress(account.address, mission_id)?
                    .is_some_and(|p| p.completed);
                (!done).then(|| IneligibleReason::MissionNotCompleted(mission_id.clone()))
            }
            MintCondition::XpThreshold { threshold } => {
                (account.xp < *threshold).then_some(IneligibleReason::XpBelow {
                    xp: account.xp,
                    threshold: *threshold,
                })
            }
            MintCondition::ReputationThreshold { threshold } => {
                (u64::from(account.reputation) < *threshold).then_some(IneligibleReason::ReputationBelow {
                    reputation: account.reputation,
                    threshold: *threshold,
                })
            }
            MintCondition::ContractDeployed { template } => {
                let found = self
                    .store
                    .user_deployments(account.address)?
                    .iter()
                    .any(|d| {
                        d.status == DeploymentStatus::Success
                            && template.map_or(true, |t| d.template == t)
                    });
                (!found).then_some(IneligibleReason::NoDeployment(*template))
            }
            MintCondition::RankAchieved { rank: required } => {
                let rank = self.ranks.season_rank(account.address)?;
                match rank {
                    Some(rank) if rank <= *required => None,
                    _ => Some(IneligibleReason::RankNotAchieved {
                        rank,
                        required: *required,
                    }),
                }
            }
            MintCondition::AdminApproval => Some(IneligibleReason::RequiresAdminApproval),
            MintCondition::Unknown => Some(IneligibleReason::UnknownCondition),
        };
        Ok(reason)
    }

    /// Evaluate and, when eligible, record the badge as held.
    pub fn award(&self, user: Address, badge_id: &str) -> Result<Award> {
        let reason = match self.evaluate(user, badge_id)? {
            Eligibility::Eligible => format!("Met all conditions for {}", badge_id),
            Eligibility::Ineligible(reason) => return Ok(Award::Refused(reason)),
        };

        let badge = UserBadge {
            user,
            badge_id: badge_id.to_string(),
            earned_reason: reason,
            earned_at: now_secs(),
        };
        let mut set = WriteSet::new();
        set.push(Mutation::PutUserBadge(badge.clone()));
        self.store.commit(set).context("Failed to commit badge award")?;
        info!(?user, badge_id, "Awarded badge");
        Ok(Award::Awarded(badge))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{ALICE, BOB};
    use crate::progression::Progression;
    use crate::records::{BadgeTemplate, DeploymentStatus, XpSource};
    use crate::store::RocksProgressStore;
    use alloy_primitives::b256;
    use tempfile::TempDir;

    fn create_test_store() -> (RocksProgressStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = RocksProgressStore::open(temp_dir.path()).unwrap();
        (store, temp_dir)
    }

    /// Fails the test if a rank is ever requested.
    struct NoRanks;

    impl RankProvider for NoRanks {
        fn season_rank(&self, _user: Address) -> Result<Option<u32>> {
            panic!("rank should not be consulted");
        }
    }

    fn badge(id: &str, conditions: Vec<MintCondition>) -> BadgeTemplate {
        BadgeTemplate {
            id: id.into(),
            name: id.into(),
            description: String::new(),
            conditions,
        }
    }

    #[test]
    fn test_first_failing_condition_decides() {
        let (store, _temp_dir) = create_test_store();
        let engine = Progression::new(&store);
        engine.grant_xp(ALICE, 100, XpSource::Manual, "seed", None).unwrap();
        engine
            .record_deployment(
                ALICE,
                BOB,
                b256!("4444444444444444444444444444444444444444444444444444444444444444"),
                ContractTemplate::Erc20,
                DeploymentStatus::Success,
                None,
            )
            .unwrap();
        store
            .put_badge_template(&badge(
                "builder",
                vec![
                    MintCondition::XpThreshold { threshold: 5000 },
                    MintCondition::ContractDeployed { template: Some(ContractTemplate::Erc20) },
                    MintCondition::RankAchieved { rank: 1 },
                ],
            ))
            .unwrap();

        let evaluator = BadgeEvaluator::new(&store, &NoRanks);
        let result = evaluator.evaluate(ALICE, "builder").unwrap();
        assert_eq!(
            result,
            Eligibility::Ineligible(IneligibleReason::XpBelow { xp: 200, threshold: 5000 })
        );
        if let Eligibility::Ineligible(reason) = result {
            assert_eq!(reason.to_string(), "XP threshold not met (200/5000)");
        }
    }

    #[test]
    fn test_held_badge_short_circuits() {
        let (store, _temp_dir) = create_test_store();
        store.put_badge_template(&badge("welcome", vec![])).unwrap();

        let evaluator = BadgeEvaluator::new(&store, &NoRanks);
        assert!(evaluator.evaluate(ALICE, "welcome").unwrap().is_eligible());
        assert!(matches!(
            evaluator.award(ALICE, "welcome").unwrap(),
            Award::Awarded(_)
        ));

        assert_eq!(
            evaluator.evaluate(ALICE, "welcome").unwrap(),
            Eligibility::Ineligible(IneligibleReason::AlreadyHeld)
        );
        assert_eq!(
            evaluator.award(ALICE, "welcome").unwrap(),
            Award::Refused(IneligibleReason::AlreadyHeld)
        );

        assert!(evaluator.evaluate(BOB, "missing").is_err());
    }

    #[test]
    fn test_condition_kinds() {
        let (store, _temp_dir) = create_test_store();
        let engine = Progression::new(&store);
        let leaderboard = XpLeaderboard::new(&store);
        let evaluator = BadgeEvaluator::new(&store, &leaderboard);

        store
            .put_badge_template(&badge(
                "quester",
                vec![MintCondition::MissionComplete { mission_id: "m-1".into() }],
            ))
            .unwrap();
        assert_eq!(
            evaluator.evaluate(ALICE, "quester").unwrap(),
            Eligibility::Ineligible(IneligibleReason::MissionNotCompleted("m-1".into()))
        );
        engine.complete_mission(ALICE, "m-1", None, 10).unwrap();
        assert!(evaluator.evaluate(ALICE, "quester").unwrap().is_eligible());

        store
            .put_badge_template(&badge(
                "trusted",
                vec![MintCondition::ReputationThreshold { threshold: 50 }],
            ))
            .unwrap();
        assert!(!evaluator.evaluate(ALICE, "trusted").unwrap().is_eligible());
        engine.set_reputation(ALICE, 80).unwrap();
        assert!(evaluator.evaluate(ALICE, "trusted").unwrap().is_eligible());

        // Reputation is clamped to 100, so this one is never met
        store
            .put_badge_template(&badge(
                "legend",
                vec![MintCondition::ReputationThreshold { threshold: 150 }],
            ))
            .unwrap();
        engine.set_reputation(ALICE, 500).unwrap();
        assert_eq!(
            evaluator.evaluate(ALICE, "legend").unwrap(),
            Eligibility::Ineligible(IneligibleReason::ReputationBelow {
                reputation: 100,
                threshold: 150
            })
        );

        store
            .put_badge_template(&badge("deployer", vec![MintCondition::ContractDeployed { template: None }]))
            .unwrap();
        assert_eq!(
            evaluator.evaluate(ALICE, "deployer").unwrap(),
            Eligibility::Ineligible(IneligibleReason::NoDeployment(None))
        );

        store
            .put_badge_template(&badge("approved", vec![MintCondition::AdminApproval]))
            .unwrap();
        assert_eq!(
            evaluator.evaluate(ALICE, "approved").unwrap(),
            Eligibility::Ineligible(IneligibleReason::RequiresAdminApproval)
        );

        store
            .put_badge_template(&badge("mystery", vec![MintCondition::Unknown]))
            .unwrap();
        assert_eq!(
            evaluator.evaluate(ALICE, "mystery").unwrap(),
            Eligibility::Ineligible(IneligibleReason::UnknownCondition)
        );
    }

    #[test]
    fn test_rank_from_xp_leaderboard() {
        let (store, _temp_dir) = create_test_store();
        let engine = Progression::new(&store);
        engine.grant_xp(ALICE, 300, XpSource::Manual, "seed", None).unwrap();
        engine.grant_xp(BOB, 900, XpSource::Manual, "seed", None).unwrap();

        let leaderboard = XpLeaderboard::new(&store);
        assert_eq!(leaderboard.season_rank(BOB).unwrap(), Some(1));
        assert_eq!(leaderboard.season_rank(ALICE).unwrap(), Some(2));
        assert_eq!(leaderboard.season_rank(Address::ZERO).unwrap(), None);

        store
            .put_badge_template(&badge("top", vec![MintCondition::RankAchieved { rank: 1 }]))
            .unwrap();
        let evaluator = BadgeEvaluator::new(&store, &leaderboard);
        assert!(evaluator.evaluate(BOB, "top").unwrap().is_eligible());
        assert_eq!(
            evaluator.evaluate(ALICE, "top").unwrap(),
            Eligibility::Ineligible(IneligibleReason::RankNotAchieved {
                rank: Some(2),
                required: 1
            })
        );
    }
}
