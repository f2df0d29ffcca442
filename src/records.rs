//! Record types for the progression store
//!
//! These structs represent the data stored in the progression store.
//! Most use postcard for binary serialization, which is compact and deterministic;
//! badge templates are stored as JSON (see [`BadgeTemplate`]).

use crate::types::Log;
use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in Unix seconds.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// One observed on-chain log, keyed by `(transaction_hash, log_index)`.
///
/// Written once, before any decoding. Only `processed` and the decoded
/// fields change afterwards; the row is never deleted or duplicated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub chain_id: u64,
    pub transaction_hash: B256,
    pub log_index: u64,
    pub block_number: u64,
    pub contract_address: Address,
    /// Best-effort sender taken from the first indexed topic
    pub sender: Option<Address>,
    pub topics: Vec<B256>,
    pub raw_data: Vec<u8>,
    pub decoded_name: Option<String>,
    /// Decoded arguments as a JSON document
    pub decoded_args: Option<String>,
    pub processed: bool,
    /// Unix seconds
    pub observed_at: u64,
}

impl LedgerEvent {
    /// Build a fresh, unprocessed ledger row from a receipt log.
    pub fn observed(chain_id: u64, log: &Log, observed_at: u64) -> Self {
        Self {
            chain_id,
            transaction_hash: log.transaction_hash,
            log_index: log.log_index,
            block_number: log.block_number,
            contract_address: log.address,
            sender: log.first_indexed_address(),
            topics: log.topics.clone(),
            raw_data: log.data.clone(),
            decoded_name: None,
            decoded_args: None,
            processed: false,
            observed_at,
        }
    }
}

/// A participant's progression state.
///
/// `level` always equals `level_from_xp(xp)` after engine-driven mutations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    pub address: Address,
    pub xp: u64,
    pub level: u32,
    /// Always within `0..=100`
    pub reputation: u8,
    pub total_deployments: u64,
    pub total_missions: u64,
    pub current_streak: u32,
    pub longest_streak: u32,
    /// Day number (Unix days) of the last mission completion
    pub last_active_day: Option<u64>,
    /// Number of XP ledger entries written for this user; next entry sequence
    pub xp_entries: u64,
    pub created_at: u64,
}

impl UserAccount {
    /// A brand new account with no XP.
    pub fn new(address: Address, created_at: u64) -> Self {
        Self {
            address,
            xp: 0,
            level: 1,
            reputation: 0,
            total_deployments: 0,
            total_missions: 0,
            current_streak: 0,
            longest_streak: 0,
            last_active_day: None,
            xp_entries: 0,
            created_at,
        }
    }
}

/// Where an XP grant came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum XpSource {
    /// `XPGranted` event emitted by the XP system contract
    Onchain,
    ContractDeploy,
    Mission,
    Manual,
}

/// Immutable, append-only XP ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XpLedgerEntry {
    pub user: Address,
    /// Position of this entry in the user's ledger
    pub sequence: u64,
    pub amount: u64,
    pub source: XpSource,
    pub description: String,
    pub related_tx: Option<B256>,
    pub created_at: u64,
}

/// Contract templates known to the deployment tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContractTemplate {
    Erc20,
    Erc721,
    Erc1155,
    Multisig,
    Timelock,
    Governor,
    Custom,
}

impl ContractTemplate {
    /// Map the tracker contract's `uint8 template` argument. Unknown values are `Custom`.
    pub fn from_index(index: u64) -> Self {
        match index {
            0 => Self::Erc20,
            1 => Self::Erc721,
            2 => Self::Erc1155,
            3 => Self::Multisig,
            4 => Self::Timelock,
            5 => Self::Governor,
            _ => Self::Custom,
        }
    }
}

impl fmt::Display for ContractTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Erc20 => "ERC20",
            Self::Erc721 => "ERC721",
            Self::Erc1155 => "ERC1155",
            Self::Multisig => "MULTISIG",
            Self::Timelock => "TIMELOCK",
            Self::Governor => "GOVERNOR",
            Self::Custom => "CUSTOM",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for ContractTemplate {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ERC20" => Ok(Self::Erc20),
            "ERC721" => Ok(Self::Erc721),
            "ERC1155" => Ok(Self::Erc1155),
            "MULTISIG" => Ok(Self::Multisig),
            "TIMELOCK" => Ok(Self::Timelock),
            "GOVERNOR" => Ok(Self::Governor),
            "CUSTOM" => Ok(Self::Custom),
            other => anyhow::bail!("Unknown contract template: {}", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Pending,
    Success,
    Failed,
}

/// A contract deployment attributed to a user, unique per `(contract_address, deployment_tx)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractDeployment {
    pub user: Address,
    pub contract_address: Address,
    pub deployment_tx: B256,
    pub template: ContractTemplate,
    pub status: DeploymentStatus,
    /// XP granted for this deployment; zero until rewarded
    pub xp_awarded: u64,
    pub failure_reason: Option<String>,
    pub recorded_at: u64,
}

/// One typed predicate of a badge's mint rule.
///
/// JSON shape: `{"type": "XP_THRESHOLD", "threshold": 500}`. Kinds this build
/// doesn't know deserialize to [`MintCondition::Unknown`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MintCondition {
    MissionComplete {
        #[serde(rename = "missionTemplateId")]
        mission_id: String,
    },
    XpThreshold {
        threshold: u64,
    },
    ReputationThreshold {
        threshold: u64,
    },
    ContractDeployed {
        #[serde(default)]
        template: Option<ContractTemplate>,
    },
    RankAchieved {
        rank: u32,
    },
    AdminApproval,
    #[serde(other)]
    Unknown,
}

/// A badge definition and its AND-combined, ordered mint conditions.
///
/// Stored as JSON: the internally tagged condition enum needs a
/// self-describing format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadgeTemplate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "mintConditions")]
    pub conditions: Vec<MintCondition>,
}

/// A badge held by a user, unique per `(user, badge_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserBadge {
    pub user: Address,
    pub badge_id: String,
    pub earned_reason: String,
    pub earned_at: u64,
}

/// A user's progress on a mission, unique per `(user, mission_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionProgress {
    pub user: Address,
    pub mission_id: String,
    pub season_id: Option<String>,
    pub completed: bool,
    pub xp_awarded: u64,
    pub completed_at: Option<u64>,
}
