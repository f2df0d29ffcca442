//! Event decoding and routing
//!
//! Matches a ledger event's `(contract, topic0)` against the known event
//! shapes, decodes the ABI arguments, and applies the result through the
//! progression engine. Logs from other contracts or with other signatures
//! decode to [`ChainEvent::Unrecognized`]; that is expected traffic, not an error.

use crate::progression::Progression;
use crate::records::{ContractTemplate, DeploymentStatus, LedgerEvent, XpSource};
use crate::store::{Mutation, WriteSet};
use crate::types::address_from_topic;
use alloy_primitives::{keccak256, Address, B256, U256};
use anyhow::{Context, Result};
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, warn};

pub const XP_GRANTED_SIGNATURE: &str = "XPGranted(address,uint256,string)";
pub const LEVEL_UP_SIGNATURE: &str = "LevelUp(address,uint256)";
pub const REPUTATION_CHANGED_SIGNATURE: &str = "ReputationChanged(address,uint256)";
pub const CONTRACT_DEPLOYED_SIGNATURE: &str = "ContractDeployed(address,address,uint8,uint256)";

/// topic0 of an event signature.
pub fn event_topic(signature: &str) -> B256 {
    keccak256(signature.as_bytes())
}

/// Contracts whose events drive progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchedContracts {
    /// Emits XPGranted, LevelUp and ReputationChanged
    pub xp_system: Address,
    /// Emits ContractDeployed
    pub deployment_tracker: Address,
}

/// A decoded event from a watched contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    XpGranted {
        user: Address,
        amount: U256,
        reason: String,
    },
    LevelChanged {
        user: Address,
        level: U256,
    },
    ReputationChanged {
        user: Address,
        reputation: U256,
    },
    ContractDeployed {
        deployer: Address,
        contract: Address,
        template: ContractTemplate,
        timestamp: U256,
    },
    Unrecognized,
}

impl ChainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::XpGranted { .. } => "XPGranted",
            Self::LevelChanged { .. } => "LevelUp",
            Self::ReputationChanged { .. } => "ReputationChanged",
            Self::ContractDeployed { .. } => "ContractDeployed",
            Self::Unrecognized => "Unrecognized",
        }
    }

    /// Decoded arguments as a JSON document, for the ledger row.
    fn args_json(&self) -> Option<String> {
        let value = match self {
            Self::XpGranted { user, amount, reason } => json!({
                "user": user,
                "amount": amount.to_string(),
                "reason": reason,
            }),
            Self::LevelChanged { user, level } => json!({
                "user": user,
                "newLevel": level.to_string(),
            }),
            Self::ReputationChanged { user, reputation } => json!({
                "user": user,
                "newReputation": reputation.to_string(),
            }),
            Self::ContractDeployed { deployer, contract, template, timestamp } => json!({
                "deployer": deployer,
                "contractAddress": contract,
                "template": template.to_string(),
                "timestamp": timestamp.to_string(),
            }),
            Self::Unrecognized => return None,
        };
        Some(value.to_string())
    }
}

/// Why a log was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// `(tx_hash, log_index)` already in the ledger
    Duplicate,
    /// No known `(contract, topic0)` shape
    Unrecognized,
    /// Ledger row was already marked processed
    AlreadyProcessed,
}

/// What happened to one observed log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutcome {
    /// Decoded and applied; carries the event name
    Applied(&'static str),
    Skipped(SkipReason),
    /// Decode or handler failure; the ledger row stays unprocessed
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    XpGranted,
    LevelUp,
    ReputationChanged,
    ContractDeployed,
}

/// Routes ledger events from watched contracts to progression handlers.
pub struct Router {
    routes: HashMap<(Address, B256), Shape>,
}

impl Router {
    pub fn new(contracts: WatchedContracts) -> Self {
        let routes = HashMap::from([
            ((contracts.xp_system, event_topic(XP_GRANTED_SIGNATURE)), Shape::XpGranted),
            ((contracts.xp_system, event_topic(LEVEL_UP_SIGNATURE)), Shape::LevelUp),
            (
                (contracts.xp_system, event_topic(REPUTATION_CHANGED_SIGNATURE)),
                Shape::ReputationChanged,
            ),
            (
                (contracts.deployment_tracker, event_topic(CONTRACT_DEPLOYED_SIGNATURE)),
                Shape::ContractDeployed,
            ),
        ]);
        Self { routes }
    }

    /// Whether a handler exists for this event's `(contract, topic0)` pair.
    pub fn is_routed(&self, event: &LedgerEvent) -> bool {
        event
            .topics
            .first()
            .is_some_and(|topic0| self.routes.contains_key(&(event.contract_address, *topic0)))
    }

    /// Decode a ledger event into a typed event.
    ///
    /// Unknown `(contract, topic0)` pairs yield `Unrecognized`; a known shape
    /// with malformed topics or data is an error.
    pub fn decode(&self, event: &LedgerEvent) -> Result<ChainEvent> {
        let Some(topic0) = event.topics.first() else {
            return Ok(ChainEvent::Unrecognized);
        };
        let Some(shape) = self.routes.get(&(event.contract_address, *topic0)) else {
            return Ok(ChainEvent::Unrecognized);
        };

        let data = &event.raw_data;
        let decoded = match shape {
            Shape::XpGranted => ChainEvent::XpGranted {
                user: indexed_address(&event.topics, 1)?,
                amount: word(data, 0)?,
                reason: abi_string(data, 1)?,
            },
            Shape::LevelUp => ChainEvent::LevelChanged {
                user: indexed_address(&event.topics, 1)?,
                level: word(data, 0)?,
            },
            Shape::ReputationChanged => ChainEvent::ReputationChanged {
                user: indexed_address(&event.topics, 1)?,
                reputation: word(data, 0)?,
            },
            Shape::ContractDeployed => ChainEvent::ContractDeployed {
                deployer: indexed_address(&event.topics, 1)?,
                contract: indexed_address(&event.topics, 2)?,
                template: ContractTemplate::from_index(u256_to_u64(word(data, 0)?)?),
                timestamp: word(data, 1)?,
            },
        };
        Ok(decoded)
    }

    /// Stage the handler for a decoded event.
    fn stage(
        &self,
        engine: &Progression<'_>,
        set: &mut WriteSet,
        decoded: &ChainEvent,
        tx_hash: B256,
    ) -> Result<()> {
        match decoded {
            ChainEvent::XpGranted { user, amount, reason } => {
                let amount = u256_to_u64(*amount).context("XP amount out of range")?;
                engine.stage_grant_xp(set, *user, amount, XpSource::Onchain, reason, Some(tx_hash))?;
            }
            ChainEvent::LevelChanged { user, level } => {
                let level = u32::try_from(u256_to_u64(*level)?).context("Level out of range")?;
                engine.stage_set_level(set, *user, level)?;
            }
            ChainEvent::ReputationChanged { user, reputation } => {
                let value = u256_to_u64(*reputation).unwrap_or(u64::MAX);
                engine.stage_set_reputation(set, *user, value)?;
            }
            ChainEvent::ContractDeployed { deployer, contract, template, .. } => {
                engine.stage_deployment(
                    set,
                    *deployer,
                    *contract,
                    tx_hash,
                    *template,
                    DeploymentStatus::Success,
                    None,
                )?;
            }
            ChainEvent::Unrecognized => {}
        }
        Ok(())
    }

    /// Decode a ledger event and apply it.
    ///
    /// Handler mutations and the "processed" flag are committed in one batch,
    /// so an event is applied at most once. Decode and handler failures are
    /// returned as [`LogOutcome::Failed`]; only a failed commit is an `Err`.
    pub fn apply(&self, engine: &Progression<'_>, event: &LedgerEvent) -> Result<LogOutcome> {
        if event.processed {
            return Ok(LogOutcome::Skipped(SkipReason::AlreadyProcessed));
        }

        let decoded = match self.decode(event) {
            Ok(ChainEvent::Unrecognized) => {
                return Ok(LogOutcome::Skipped(SkipReason::Unrecognized));
            }
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(tx = ?event.transaction_hash, log_index = event.log_index, "Could not decode event: {:#}", e);
                return Ok(LogOutcome::Failed(format!("decode: {:#}", e)));
            }
        };

        let mut set = WriteSet::new();
        if let Err(e) = self.stage(engine, &mut set, &decoded, event.transaction_hash) {
            warn!(tx = ?event.transaction_hash, log_index = event.log_index, event = decoded.name(), "Handler failed: {:#}", e);
            return Ok(LogOutcome::Failed(format!("{}: {:#}", decoded.name(), e)));
        }

        let mut processed = event.clone();
        processed.processed = true;
        processed.decoded_name = Some(decoded.name().to_string());
        processed.decoded_args = decoded.args_json();
        set.push(Mutation::PutEvent(processed));
        set.push(Mutation::ClearPending {
            tx_hash: event.transaction_hash,
            log_index: event.log_index,
        });

        engine
            .store()
            .commit(set)
            .context("Failed to commit event application")?;
        debug!(tx = ?event.transaction_hash, log_index = event.log_index, event = decoded.name(), "Applied event");
        Ok(LogOutcome::Applied(decoded.name()))
    }
}

/// Narrow a U256 to u64, failing if it doesn't fit.
pub fn u256_to_u64(value: U256) -> Result<u64> {
    if value > U256::from(u64::MAX) {
        anyhow::bail!("Value {} does not fit in u64", value);
    }
    Ok(value.as_limbs()[0])
}

fn indexed_address(topics: &[B256], index: usize) -> Result<Address> {
    topics
        .get(index)
        .map(address_from_topic)
        .with_context(|| format!("Missing indexed topic {}", index))
}

/// The `index`-th 32-byte ABI word of `data`.
fn word(data: &[u8], index: usize) -> Result<U256> {
    let start = index.checked_mul(32).context("Word index overflow")?;
    let end = start.checked_add(32).context("Word index overflow")?;
    let bytes = data
        .get(start..end)
        .with_context(|| format!("Event data too short for word {} ({} bytes)", index, data.len()))?;
    Ok(U256::from_be_slice(bytes))
}

/// A dynamic `string` whose offset is stored in head word `head_index`.
fn abi_string(data: &[u8], head_index: usize) -> Result<String> {
    let offset = usize::try_from(u256_to_u64(word(data, head_index)?)?)
        .context("String offset out of range")?;
    if offset % 32 != 0 {
        anyhow::bail!("Unaligned string offset {}", offset);
    }
    let len = usize::try_from(u256_to_u64(word(data, offset / 32)?)?)
        .context("String length out of range")?;
    let start = offset.checked_add(32).context("String offset overflow")?;
    let end = start
        .checked_add(len)
        .context("String length overflow")?;
    let bytes = data
        .get(start..end)
        .with_context(|| format!("String of {} bytes exceeds event data", len))?;
    String::from_utf8(bytes.to_vec()).context("String is not valid UTF-8")
}
