//! Progression engine
//!
//! Applies XP grants, level and reputation changes, deployment records and
//! mission completions to the store. Every operation stages its rows into a
//! [`WriteSet`] and commits them at once, so an account and its XP ledger can
//! never disagree.

use crate::records::{
    now_secs, ContractDeployment, ContractTemplate, DeploymentStatus, MissionProgress,
    UserAccount, XpLedgerEntry, XpSource,
};
use crate::rpc::ChainReader;
use crate::store::{Mutation, ProgressStore, WriteSet};
use alloy_primitives::{Address, B256};
use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

/// XP granted for a contract deployment observed as successful.
pub const DEPLOYMENT_XP_REWARD: u64 = 100;

/// Maximum reputation; values above are clamped.
pub const MAX_REPUTATION: u8 = 100;

/// XP needed to leave level `i + 1`.
const LEVEL_THRESHOLDS: [u64; 10] = [100, 300, 600, 1000, 1500, 2100, 2800, 3600, 4500, 5500];

/// XP per level past the last threshold.
const XP_PER_LEVEL_AFTER_TABLE: u64 = 1000;

const SECONDS_PER_DAY: u64 = 86_400;

/// Level for a cumulative XP total.
///
/// Below 5500 XP the level is the step table; beyond it one level per 1000 XP.
/// Total and monotonically non-decreasing.
pub fn level_from_xp(xp: u64) -> u32 {
    match LEVEL_THRESHOLDS.iter().position(|&threshold| xp < threshold) {
        Some(index) => index as u32 + 1,
        None => {
            let last = LEVEL_THRESHOLDS[LEVEL_THRESHOLDS.len() - 1];
            let extra = (xp - last) / XP_PER_LEVEL_AFTER_TABLE;
            10u32.saturating_add(u32::try_from(extra).unwrap_or(u32::MAX))
        }
    }
}

/// Clamp an on-chain reputation value into `0..=100`.
pub fn clamp_reputation(value: u64) -> u8 {
    value.min(MAX_REPUTATION as u64) as u8
}

/// Bump the daily streak counters for activity on `day` (Unix days).
fn record_activity(user: &mut UserAccount, day: u64) {
    user.current_streak = match user.last_active_day {
        Some(last) if last == day => user.current_streak.max(1),
        Some(last) if last + 1 == day => user.current_streak.saturating_add(1),
        _ => 1,
    };
    user.longest_streak = user.longest_streak.max(user.current_streak);
    user.last_active_day = Some(day);
}

/// Result of recording a deployment observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "deployment", rename_all = "snake_case")]
pub enum DeploymentOutcome {
    /// First observation of this `(contract, tx)`
    Created(ContractDeployment),
    /// A pending or failed record confirmed as successful
    Promoted(ContractDeployment),
    /// A non-successful record whose status or reason changed
    Updated(ContractDeployment),
    /// Nothing changed
    Duplicate(ContractDeployment),
}

impl DeploymentOutcome {
    pub fn deployment(&self) -> &ContractDeployment {
        match self {
            Self::Created(d) | Self::Promoted(d) | Self::Updated(d) | Self::Duplicate(d) => d,
        }
    }
}

/// Result of completing a mission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MissionOutcome {
    Completed {
        progress: MissionProgress,
        user: UserAccount,
    },
    AlreadyCompleted {
        progress: MissionProgress,
    },
}

/// Comparison of an account against its XP ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerCheck {
    pub address: Address,
    pub account_xp: u64,
    pub ledger_xp: u64,
    pub entries: usize,
    pub level: u32,
    pub expected_level: u32,
}

impl LedgerCheck {
    /// XP total matches the ledger sum.
    pub fn xp_consistent(&self) -> bool {
        self.account_xp == self.ledger_xp
    }

    /// Stored level matches the level function.
    pub fn level_consistent(&self) -> bool {
        self.level == self.expected_level
    }
}

/// Business rules over user progression.
pub struct Progression<'a> {
    store: &'a dyn ProgressStore,
    deployment_reward: u64,
}

impl<'a> Progression<'a> {
    pub fn new(store: &'a dyn ProgressStore) -> Self {
        Self {
            store,
            deployment_reward: DEPLOYMENT_XP_REWARD,
        }
    }

    /// Override the XP granted per successful deployment.
    pub fn with_deployment_reward(mut self, reward: u64) -> Self {
        self.deployment_reward = reward;
        self
    }

    pub fn store(&self) -> &'a dyn ProgressStore {
        self.store
    }

    /// Load an account, or start a fresh one if the address was never seen.
    fn load_or_new(&self, address: Address) -> Result<UserAccount> {
        Ok(self
            .store
            .get_user(address)
            .with_context(|| format!("Failed to load user {:?}", address))?
            .unwrap_or_else(|| {
                debug!(?address, "Creating user account");
                UserAccount::new(address, now_secs())
            }))
    }

    /// Append a ledger entry and credit the account in memory.
    fn credit(
        &self,
        set: &mut WriteSet,
        user: &mut UserAccount,
        amount: u64,
        source: XpSource,
        description: String,
        related_tx: Option<B256>,
    ) -> Result<()> {
        let xp = user
            .xp
            .checked_add(amount)
            .with_context(|| format!("XP overflow for {:?}", user.address))?;

        set.push(Mutation::AppendXp(XpLedgerEntry {
            user: user.address,
            sequence: user.xp_entries,
            amount,
            source,
            description,
            related_tx,
            created_at: now_secs(),
        }));
        user.xp_entries += 1;
        user.xp = xp;
        user.level = level_from_xp(xp);
        Ok(())
    }

    pub(crate) fn stage_grant_xp(
        &self,
        set: &mut WriteSet,
        address: Address,
        amount: u64,
        source: XpSource,
        description: &str,
        related_tx: Option<B256>,
    ) -> Result<UserAccount> {
        let mut user = self.load_or_new(address)?;
        self.credit(set, &mut user, amount, source, description.to_string(), related_tx)?;
        set.push(Mutation::PutUser(user.clone()));
        Ok(user)
    }

    /// Credit XP to an address, creating the account if needed.
    ///
    /// The account row and its ledger entry are written in one batch.
    pub fn grant_xp(
        &self,
        address: Address,
        amount: u64,
        source: XpSource,
        description: &str,
        related_tx: Option<B256>,
    ) -> Result<UserAccount> {
        let mut set = WriteSet::new();
        let user = self.stage_grant_xp(&mut set, address, amount, source, description, related_tx)?;
        self.store.commit(set).context("Failed to commit XP grant")?;
        info!(?address, amount, xp = user.xp, level = user.level, "Granted XP");
        Ok(user)
    }

    pub(crate) fn stage_set_reputation(
        &self,
        set: &mut WriteSet,
        address: Address,
        value: u64,
    ) -> Result<UserAccount> {
        let mut user = self.load_or_new(address)?;
        user.reputation = clamp_reputation(value);
        set.push(Mutation::PutUser(user.clone()));
        Ok(user)
    }

    /// Overwrite a user's reputation, clamped to `0..=100`.
    pub fn set_reputation(&self, address: Address, value: u64) -> Result<UserAccount> {
        let mut set = WriteSet::new();
        let user = self.stage_set_reputation(&mut set, address, value)?;
        self.store.commit(set).context("Failed to commit reputation")?;
        Ok(user)
    }

    pub(crate) fn stage_set_level(
        &self,
        set: &mut WriteSet,
        address: Address,
        level: u32,
    ) -> Result<UserAccount> {
        let mut user = self.load_or_new(address)?;
        let derived = level_from_xp(user.xp);
        if level != derived {
            warn!(?address, level, derived, "On-chain level differs from XP-derived level");
        }
        user.level = level;
        set.push(Mutation::PutUser(user.clone()));
        Ok(user)
    }

    /// Overwrite a user's level with an authoritative value.
    pub fn set_level(&self, address: Address, level: u32) -> Result<UserAccount> {
        let mut set = WriteSet::new();
        let user = self.stage_set_level(&mut set, address, level)?;
        self.store.commit(set).context("Failed to commit level")?;
        Ok(user)
    }

    /// Grant the deployment reward once per deployment record.
    fn reward_deployment(
        &self,
        set: &mut WriteSet,
        user: &mut UserAccount,
        deployment: &mut ContractDeployment,
    ) -> Result<()> {
        if deployment.xp_awarded > 0 {
            return Ok(());
        }
        self.credit(
            set,
            user,
            self.deployment_reward,
            XpSource::ContractDeploy,
            format!("Contract deployment: {:?}", deployment.contract_address),
            Some(deployment.deployment_tx),
        )?;
        user.total_deployments += 1;
        deployment.xp_awarded = self.deployment_reward;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn stage_deployment(
        &self,
        set: &mut WriteSet,
        user: Address,
        contract: Address,
        tx: B256,
        template: ContractTemplate,
        status: DeploymentStatus,
        failure_reason: Option<String>,
    ) -> Result<DeploymentOutcome> {
        let existing = self
            .store
            .get_deployment(contract, tx)
            .context("Failed to load deployment")?;

        match existing {
            Some(existing) if existing.status == DeploymentStatus::Success => {
                Ok(DeploymentOutcome::Duplicate(existing))
            }
            Some(mut existing) if status == DeploymentStatus::Success => {
                let mut owner = self.load_or_new(existing.user)?;
                existing.status = DeploymentStatus::Success;
                existing.failure_reason = None;
                self.reward_deployment(set, &mut owner, &mut existing)?;
                set.push(Mutation::PutUser(owner));
                set.push(Mutation::PutDeployment(existing.clone()));
                Ok(DeploymentOutcome::Promoted(existing))
            }
            Some(mut existing) => {
                if existing.status == status && existing.failure_reason == failure_reason {
                    return Ok(DeploymentOutcome::Duplicate(existing));
                }
                existing.status = status;
                existing.failure_reason = failure_reason;
                set.push(Mutation::PutDeployment(existing.clone()));
                Ok(DeploymentOutcome::Updated(existing))
            }
            None => {
                let mut deployment = ContractDeployment {
                    user,
                    contract_address: contract,
                    deployment_tx: tx,
                    template,
                    status,
                    xp_awarded: 0,
                    failure_reason: if status == DeploymentStatus::Success {
                        None
                    } else {
                        failure_reason
                    },
                    recorded_at: now_secs(),
                };
                if status == DeploymentStatus::Success {
                    let mut owner = self.load_or_new(user)?;
                    self.reward_deployment(set, &mut owner, &mut deployment)?;
                    set.push(Mutation::PutUser(owner));
                }
                set.push(Mutation::PutDeployment(deployment.clone()));
                Ok(DeploymentOutcome::Created(deployment))
            }
        }
    }

    /// Record a deployment observation.
    ///
    /// Unique per `(contract, tx)`: once a record is `SUCCESS` further
    /// observations are no-ops, and the reward is granted exactly once.
    pub fn record_deployment(
        &self,
        user: Address,
        contract: Address,
        tx: B256,
        template: ContractTemplate,
        status: DeploymentStatus,
        failure_reason: Option<String>,
    ) -> Result<DeploymentOutcome> {
        let mut set = WriteSet::new();
        let outcome =
            self.stage_deployment(&mut set, user, contract, tx, template, status, failure_reason)?;
        self.store
            .commit(set)
            .context("Failed to commit deployment")?;
        debug!(?contract, ?tx, ?outcome, "Recorded deployment");
        Ok(outcome)
    }

    /// Check a user-submitted deployment against its on-chain receipt.
    ///
    /// A missing or reverted receipt, or a created address that doesn't match
    /// `contract`, records the deployment as `FAILED` without any XP.
    pub async fn verify_deployment<R: ChainReader>(
        &self,
        chain: &R,
        user: Address,
        contract: Address,
        tx: B256,
        template: ContractTemplate,
    ) -> Result<DeploymentOutcome> {
        let receipt = chain
            .transaction_receipt(tx)
            .await
            .with_context(|| format!("Failed to fetch receipt for tx {:?}", tx))?;

        let (status, reason) = match receipt {
            Some(receipt) if receipt.is_success() => {
                if receipt.contract_address == Some(contract) {
                    (DeploymentStatus::Success, None)
                } else {
                    (DeploymentStatus::Failed, Some("Address mismatch".to_string()))
                }
            }
            _ => (DeploymentStatus::Failed, Some("Transaction failed".to_string())),
        };

        if let Some(reason) = &reason {
            info!(?contract, ?tx, reason = reason.as_str(), "Deployment verification failed");
        }
        self.record_deployment(user, contract, tx, template, status, reason)
    }

    /// Mark a mission completed for a user and grant its XP.
    pub fn complete_mission(
        &self,
        address: Address,
        mission_id: &str,
        season_id: Option<String>,
        xp_reward: u64,
    ) -> Result<MissionOutcome> {
        self.complete_mission_at(address, mission_id, season_id, xp_reward, now_secs())
    }

    pub(crate) fn complete_mission_at(
        &self,
        address: Address,
        mission_id: &str,
        season_id: Option<String>,
        xp_reward: u64,
        completed_at: u64,
    ) -> Result<MissionOutcome> {
        if let Some(progress) = self
            .store
            .get_mission_progress(address, mission_id)
            .context("Failed to load mission progress")?
        {
            if progress.completed {
                return Ok(MissionOutcome::AlreadyCompleted { progress });
            }
        }

        let mut set = WriteSet::new();
        let mut user = self.load_or_new(address)?;
        self.credit(
            &mut set,
            &mut user,
            xp_reward,
            XpSource::Mission,
            format!("Mission completed: {}", mission_id),
            None,
        )?;
        user.total_missions += 1;
        record_activity(&mut user, completed_at / SECONDS_PER_DAY);

        let progress = MissionProgress {
            user: address,
            mission_id: mission_id.to_string(),
            season_id,
            completed: true,
            xp_awarded: xp_reward,
            completed_at: Some(completed_at),
        };
        set.push(Mutation::PutMission(progress.clone()));
        set.push(Mutation::PutUser(user.clone()));
        self.store
            .commit(set)
            .context("Failed to commit mission completion")?;

        info!(?address, mission_id, xp = user.xp, "Mission completed");
        Ok(MissionOutcome::Completed { progress, user })
    }

    /// Compare an account with the sum of its XP ledger.
    pub fn check_ledger(&self, address: Address) -> Result<LedgerCheck> {
        let user = self
            .store
            .get_user(address)?
            .with_context(|| format!("User {:?} not found", address))?;
        let entries = self.store.xp_entries(address)?;
        let ledger_xp = entries.iter().map(|e| e.amount).sum();

        Ok(LedgerCheck {
            address,
            account_xp: user.xp,
            ledger_xp,
            entries: entries.len(),
            level: user.level,
            expected_level: level_from_xp(user.xp),
        })
    }
}
