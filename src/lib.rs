//! Guildwatch - on-chain event indexer and progression engine
//!
//! Ingests events from the guild contracts into an idempotent event ledger
//! and turns them into XP, levels, reputation, deployment records and badge
//! eligibility, persisted in RocksDB.

pub mod keys;
pub mod records;
pub mod store;
pub mod cli;

// Indexer modules
pub mod badge;
pub mod config;
pub mod poller;
pub mod progression;
pub mod router;
pub mod rpc;
pub mod types;

#[cfg(test)]
mod fixtures;

// Re-export the main types for convenience
pub use badge::{BadgeEvaluator, Eligibility, RankProvider};
pub use progression::{level_from_xp, Progression};
pub use records::{
    BadgeTemplate, ContractDeployment, LedgerEvent, MintCondition, UserAccount, XpLedgerEntry,
};
pub use store::{ProgressStore, RocksProgressStore};
