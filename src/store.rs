//! ProgressStore trait and RocksDB implementation
//!
//! Provides the durable store behind ingestion and progression: the scan
//! cursor, the event ledger, user accounts, the XP ledger, deployments,
//! badges and mission progress. Uses RocksDB with one column family per entity.
//!
//! Multi-row mutations are collected in a [`WriteSet`] and committed as a
//! single RocksDB write batch, so either every row of a mutation lands or none does.

use crate::keys::{
    decode_event_key, encode_badge_key, encode_deployment_key, encode_event_key,
    encode_meta_key, encode_mission_key, encode_user_badge_key, encode_user_deployment_key,
    encode_user_deployment_prefix, encode_user_key, encode_xp_entry_key, encode_xp_prefix,
    META_SCAN_CURSOR,
};
use crate::records::{
    BadgeTemplate, ContractDeployment, LedgerEvent, MissionProgress, UserAccount, UserBadge,
    XpLedgerEntry,
};
use alloy_primitives::{Address, B256};
use anyhow::{Context, Result};
use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use std::path::Path;

const CF_META: &str = "meta";
const CF_EVENTS: &str = "events";
const CF_PENDING: &str = "pending_events";
const CF_USERS: &str = "users";
const CF_XP_LEDGER: &str = "xp_ledger";
const CF_DEPLOYMENTS: &str = "deployments";
const CF_USER_DEPLOYMENTS: &str = "user_deployments";
const CF_BADGE_TEMPLATES: &str = "badge_templates";
const CF_USER_BADGES: &str = "user_badges";
const CF_MISSIONS: &str = "mission_progress";

/// A single row-level change inside a [`WriteSet`].
#[derive(Debug, Clone)]
pub enum Mutation {
    PutUser(UserAccount),
    AppendXp(XpLedgerEntry),
    PutDeployment(ContractDeployment),
    PutEvent(LedgerEvent),
    /// Drop an event from the reconciliation queue
    ClearPending { tx_hash: B256, log_index: u64 },
    PutUserBadge(UserBadge),
    PutMission(MissionProgress),
}

/// Mutations that must be applied together.
#[derive(Debug, Default, Clone)]
pub struct WriteSet {
    ops: Vec<Mutation>,
}

impl WriteSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, mutation: Mutation) {
        self.ops.push(mutation);
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.ops
    }
}

/// Trait defining the interface for progression storage.
///
/// All methods return Results for proper error handling.
/// Lookups of rows that don't exist return `Ok(None)`.
pub trait ProgressStore {
    /// Get the last fully processed block.
    fn get_cursor(&self) -> Result<Option<u64>>;

    /// Move the scan cursor forward. Moving it backwards is an error.
    fn advance_cursor(&self, block: u64) -> Result<()>;

    /// Get a ledger event by its unique key.
    fn get_event(&self, tx_hash: B256, log_index: u64) -> Result<Option<LedgerEvent>>;

    /// Insert a ledger event if its key is absent.
    ///
    /// Returns `false` (and writes nothing) when the key already exists.
    /// `pending` additionally queues the event for the reconciliation sweep.
    fn insert_event(&self, event: &LedgerEvent, pending: bool) -> Result<bool>;

    /// Keys of events queued for reconciliation, in key order.
    fn pending_events(&self) -> Result<Vec<(B256, u64)>>;

    /// Get a user account by address.
    fn get_user(&self, addr: Address) -> Result<Option<UserAccount>>;

    /// All user accounts.
    fn list_users(&self) -> Result<Vec<UserAccount>>;

    /// A user's XP ledger in append order.
    fn xp_entries(&self, addr: Address) -> Result<Vec<XpLedgerEntry>>;

    /// Get a deployment by its unique key.
    fn get_deployment(&self, contract: Address, tx: B256) -> Result<Option<ContractDeployment>>;

    /// All deployments attributed to a user.
    fn user_deployments(&self, user: Address) -> Result<Vec<ContractDeployment>>;

    /// Store (or replace) a badge template.
    fn put_badge_template(&self, template: &BadgeTemplate) -> Result<()>;

    /// Get a badge template by id.
    fn get_badge_template(&self, badge_id: &str) -> Result<Option<BadgeTemplate>>;

    /// Get a held badge.
    fn get_user_badge(&self, user: Address, badge_id: &str) -> Result<Option<UserBadge>>;

    /// Get a user's progress on a mission.
    fn get_mission_progress(
        &self,
        user: Address,
        mission_id: &str,
    ) -> Result<Option<MissionProgress>>;

    /// Apply every mutation of the set atomically.
    fn commit(&self, set: WriteSet) -> Result<()>;
}

/// RocksDB-backed implementation of ProgressStore.
///
/// Uses column families to organize different types of data:
/// - meta: scan cursor
/// - events / pending_events: event ledger and its reconciliation queue
/// - users / xp_ledger: accounts and their append-only XP history
/// - deployments / user_deployments: deployment records and a per-user index
/// - badge_templates / user_badges: badge definitions and holdings
/// - mission_progress: per-user mission state
pub struct RocksProgressStore {
    db: DB,
}

impl RocksProgressStore {
    /// Open or create a RocksDB database at the given path.
    ///
    /// Creates all required column families if they don't exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let column_families = [
            CF_META,
            CF_EVENTS,
            CF_PENDING,
            CF_USERS,
            CF_XP_LEDGER,
            CF_DEPLOYMENTS,
            CF_USER_DEPLOYMENTS,
            CF_BADGE_TEMPLATES,
            CF_USER_BADGES,
            CF_MISSIONS,
        ]
        .into_iter()
        .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
        .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&opts, path, column_families)
            .context("Failed to open RocksDB database")?;

        Ok(Self { db })
    }

    /// Get a column family handle by name.
    fn get_cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .with_context(|| format!("Column family '{}' not found", name))
    }

    /// Read and deserialize a postcard record.
    fn get_record<T: serde::de::DeserializeOwned>(
        &self,
        cf_name: &str,
        key: &[u8],
        what: &str,
    ) -> Result<Option<T>> {
        let cf = self.get_cf(cf_name)?;
        match self
            .db
            .get_cf(cf, key)
            .with_context(|| format!("Failed to get {}", what))?
        {
            Some(bytes) => {
                let record = postcard::from_bytes(&bytes)
                    .with_context(|| format!("Failed to deserialize {}", what))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Collect every (key, value) pair whose key starts with `prefix`.
    fn scan_prefix(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>> {
        let cf = self.get_cf(cf_name)?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));

        let mut rows = Vec::new();
        for item in iter {
            let (key, value) = item.context("Failed to read iterator")?;
            if !key.starts_with(prefix) {
                break;
            }
            rows.push((key, value));
        }
        Ok(rows)
    }

    fn put_record<T: serde::Serialize>(
        &self,
        batch: &mut WriteBatch,
        cf_name: &str,
        key: &[u8],
        record: &T,
        what: &str,
    ) -> Result<()> {
        let cf = self.get_cf(cf_name)?;
        let value = postcard::to_allocvec(record)
            .with_context(|| format!("Failed to serialize {}", what))?;
        batch.put_cf(cf, key, value);
        Ok(())
    }
}

impl ProgressStore for RocksProgressStore {
    fn get_cursor(&self) -> Result<Option<u64>> {
        let cf = self.get_cf(CF_META)?;
        let key = encode_meta_key(META_SCAN_CURSOR);
        match self.db.get_cf(cf, &key).context("Failed to get scan cursor")? {
            Some(bytes) => {
                let bytes: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    anyhow::anyhow!("Scan cursor must be 8 bytes (u64), got {}", bytes.len())
                })?;
                Ok(Some(u64::from_be_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    fn advance_cursor(&self, block: u64) -> Result<()> {
        if let Some(current) = self.get_cursor()? {
            if block < current {
                anyhow::bail!(
                    "Scan cursor cannot move backwards (current {}, requested {})",
                    current,
                    block
                );
            }
        }
        let cf = self.get_cf(CF_META)?;
        let key = encode_meta_key(META_SCAN_CURSOR);
        self.db
            .put_cf(cf, &key, block.to_be_bytes())
            .context("Failed to set scan cursor")?;
        Ok(())
    }

    fn get_event(&self, tx_hash: B256, log_index: u64) -> Result<Option<LedgerEvent>> {
        self.get_record(CF_EVENTS, &encode_event_key(tx_hash, log_index), "ledger event")
    }

    fn insert_event(&self, event: &LedgerEvent, pending: bool) -> Result<bool> {
        if self
            .get_event(event.transaction_hash, event.log_index)?
            .is_some()
        {
            return Ok(false);
        }

        let key = encode_event_key(event.transaction_hash, event.log_index);
        let mut batch = WriteBatch::default();
        self.put_record(&mut batch, CF_EVENTS, &key, event, "ledger event")?;
        if pending {
            batch.put_cf(self.get_cf(CF_PENDING)?, &key, b"");
        }
        self.db
            .write(batch)
            .context("Failed to insert ledger event")?;
        Ok(true)
    }

    fn pending_events(&self) -> Result<Vec<(B256, u64)>> {
        self.scan_prefix(CF_PENDING, b"E")?
            .into_iter()
            .map(|(key, _)| decode_event_key(&key))
            .collect()
    }

    fn get_user(&self, addr: Address) -> Result<Option<UserAccount>> {
        self.get_record(CF_USERS, &encode_user_key(addr), "user account")
    }

    fn list_users(&self) -> Result<Vec<UserAccount>> {
        self.scan_prefix(CF_USERS, b"U")?
            .into_iter()
            .map(|(_, value)| {
                postcard::from_bytes(&value).context("Failed to deserialize user account")
            })
            .collect()
    }

    fn xp_entries(&self, addr: Address) -> Result<Vec<XpLedgerEntry>> {
        self.scan_prefix(CF_XP_LEDGER, &encode_xp_prefix(addr))?
            .into_iter()
            .map(|(_, value)| {
                postcard::from_bytes(&value).context("Failed to deserialize XP ledger entry")
            })
            .collect()
    }

    fn get_deployment(&self, contract: Address, tx: B256) -> Result<Option<ContractDeployment>> {
        self.get_record(
            CF_DEPLOYMENTS,
            &encode_deployment_key(contract, tx),
            "deployment",
        )
    }

    fn user_deployments(&self, user: Address) -> Result<Vec<ContractDeployment>> {
        let mut deployments = Vec::new();
        for (key, _) in self.scan_prefix(CF_USER_DEPLOYMENTS, &encode_user_deployment_prefix(user))? {
            let (_, contract, tx) = crate::keys::decode_user_deployment_key(&key)
                .context("Failed to decode user deployment key")?;
            let deployment = self.get_deployment(contract, tx)?.with_context(|| {
                format!(
                    "Deployment index points at missing record {:?}/{:?}",
                    contract, tx
                )
            })?;
            deployments.push(deployment);
        }
        Ok(deployments)
    }

    fn put_badge_template(&self, template: &BadgeTemplate) -> Result<()> {
        let cf = self.get_cf(CF_BADGE_TEMPLATES)?;
        let value =
            serde_json::to_vec(template).context("Failed to serialize badge template")?;
        self.db
            .put_cf(cf, encode_badge_key(&template.id), value)
            .context("Failed to put badge template")?;
        Ok(())
    }

    fn get_badge_template(&self, badge_id: &str) -> Result<Option<BadgeTemplate>> {
        let cf = self.get_cf(CF_BADGE_TEMPLATES)?;
        match self
            .db
            .get_cf(cf, encode_badge_key(badge_id))
            .context("Failed to get badge template")?
        {
            Some(bytes) => {
                let template = serde_json::from_slice(&bytes)
                    .context("Failed to deserialize badge template")?;
                Ok(Some(template))
            }
            None => Ok(None),
        }
    }

    fn get_user_badge(&self, user: Address, badge_id: &str) -> Result<Option<UserBadge>> {
        self.get_record(
            CF_USER_BADGES,
            &encode_user_badge_key(user, badge_id),
            "user badge",
        )
    }

    fn get_mission_progress(
        &self,
        user: Address,
        mission_id: &str,
    ) -> Result<Option<MissionProgress>> {
        self.get_record(
            CF_MISSIONS,
            &encode_mission_key(user, mission_id),
            "mission progress",
        )
    }

    fn commit(&self, set: WriteSet) -> Result<()> {
        if set.is_empty() {
            return Ok(());
        }

        let mut batch = WriteBatch::default();
        for mutation in set.ops {
            match mutation {
                Mutation::PutUser(user) => {
                    self.put_record(&mut batch, CF_USERS, &encode_user_key(user.address), &user, "user account")?;
                }
                Mutation::AppendXp(entry) => {
                    let key = encode_xp_entry_key(entry.user, entry.sequence);
                    self.put_record(&mut batch, CF_XP_LEDGER, &key, &entry, "XP ledger entry")?;
                }
                Mutation::PutDeployment(deployment) => {
                    let key =
                        encode_deployment_key(deployment.contract_address, deployment.deployment_tx);
                    self.put_record(&mut batch, CF_DEPLOYMENTS, &key, &deployment, "deployment")?;
                    let index = encode_user_deployment_key(
                        deployment.user,
                        deployment.contract_address,
                        deployment.deployment_tx,
                    );
                    batch.put_cf(self.get_cf(CF_USER_DEPLOYMENTS)?, index, b"");
                }
                Mutation::PutEvent(event) => {
                    let key = encode_event_key(event.transaction_hash, event.log_index);
                    self.put_record(&mut batch, CF_EVENTS, &key, &event, "ledger event")?;
                }
                Mutation::ClearPending { tx_hash, log_index } => {
                    batch.delete_cf(self.get_cf(CF_PENDING)?, encode_event_key(tx_hash, log_index));
                }
                Mutation::PutUserBadge(badge) => {
                    let key = encode_user_badge_key(badge.user, &badge.badge_id);
                    self.put_record(&mut batch, CF_USER_BADGES, &key, &badge, "user badge")?;
                }
                Mutation::PutMission(progress) => {
                    let key = encode_mission_key(progress.user, &progress.mission_id);
                    self.put_record(&mut batch, CF_MISSIONS, &key, &progress, "mission progress")?;
                }
            }
        }

        self.db.write(batch).context("Failed to commit write set")?;
        Ok(())
    }
}
