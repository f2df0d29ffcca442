//! Chain poller
//!
//! Scans blocks from the stored cursor up to the chain head, ledgers every
//! receipt log, routes logs from watched contracts to the progression engine,
//! and advances the cursor after each batch.

use crate::config::PollerConfig;
use crate::progression::Progression;
use crate::records::{now_secs, LedgerEvent};
use crate::router::{LogOutcome, Router, SkipReason, WatchedContracts};
use crate::rpc::ChainReader;
use crate::store::{Mutation, ProgressStore, RocksProgressStore, WriteSet};
use crate::types::Log;
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Cooperative shutdown signal shared between the poller and its owner.
#[derive(Clone, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolve once [`Shutdown::trigger`] has been called.
    pub async fn wait(&self) {
        if self.is_triggered() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Per-cycle counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Another cycle was running; nothing was done
    pub skipped: bool,
    pub head: u64,
    /// Cursor after the cycle
    pub cursor: Option<u64>,
    pub blocks_processed: u64,
    pub logs_seen: u64,
    pub inserted: u64,
    pub duplicates: u64,
    pub applied: u64,
    pub unrecognized: u64,
    pub failed: u64,
    /// Block that stopped the cycle; retried next time
    pub failed_block: Option<u64>,
}

impl CycleReport {
    fn record(&mut self, outcome: &LogOutcome) {
        match outcome {
            LogOutcome::Applied(_) => self.applied += 1,
            LogOutcome::Skipped(SkipReason::Unrecognized) => self.unrecognized += 1,
            LogOutcome::Skipped(_) => self.duplicates += 1,
            LogOutcome::Failed(_) => self.failed += 1,
        }
    }

    fn log(&self) {
        if self.skipped {
            debug!("Previous cycle still running; skipped");
            return;
        }
        info!(
            head = self.head,
            cursor = ?self.cursor,
            blocks = self.blocks_processed,
            logs = self.logs_seen,
            inserted = self.inserted,
            duplicates = self.duplicates,
            applied = self.applied,
            unrecognized = self.unrecognized,
            failed = self.failed,
            failed_block = ?self.failed_block,
            "Cycle complete"
        );
    }
}

/// Result of a sweep over unprocessed ledger rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub examined: u64,
    pub applied: u64,
    /// Entries dropped from the queue without applying anything
    pub cleared: u64,
    pub failed: u64,
}

/// Retry every queued ledger row that was never marked processed.
///
/// Rows that apply are dequeued in the same batch. Rows that fail stay queued.
/// Stale entries (row missing, already processed, or no longer routed) are dropped.
pub fn reconcile_pending(engine: &Progression<'_>, router: &Router) -> Result<ReconcileReport> {
    let store = engine.store();
    let mut report = ReconcileReport::default();

    for (tx_hash, log_index) in store.pending_events().context("Failed to list pending events")? {
        report.examined += 1;
        let outcome = match store.get_event(tx_hash, log_index)? {
            Some(event) => router.apply(engine, &event)?,
            None => LogOutcome::Skipped(SkipReason::AlreadyProcessed),
        };

        match outcome {
            LogOutcome::Applied(name) => {
                debug!(tx = ?tx_hash, log_index, event = name, "Reconciled event");
                report.applied += 1;
            }
            LogOutcome::Failed(reason) => {
                debug!(tx = ?tx_hash, log_index, reason = reason.as_str(), "Event still failing");
                report.failed += 1;
            }
            LogOutcome::Skipped(_) => {
                let mut set = WriteSet::new();
                set.push(Mutation::ClearPending { tx_hash, log_index });
                store.commit(set).context("Failed to clear pending event")?;
                report.cleared += 1;
            }
        }
    }

    Ok(report)
}

/// Polls the chain and feeds the progression engine.
pub struct Poller<R: ChainReader> {
    store: RocksProgressStore,
    chain: R,
    router: Router,
    config: PollerConfig,
    chain_id: u64,
    in_flight: AtomicBool,
    shutdown: Shutdown,
}

impl<R: ChainReader> Poller<R> {
    pub fn new(
        store: RocksProgressStore,
        chain: R,
        contracts: WatchedContracts,
        config: PollerConfig,
        chain_id: u64,
    ) -> Result<Self> {
        config.validate().context("Invalid poller configuration")?;
        Ok(Self {
            store,
            chain,
            router: Router::new(contracts),
            config,
            chain_id,
            in_flight: AtomicBool::new(false),
            shutdown: Shutdown::new(),
        })
    }

    /// Handle that stops [`Poller::run`] between blocks.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn store(&self) -> &RocksProgressStore {
        &self.store
    }

    fn engine(&self) -> Progression<'_> {
        Progression::new(&self.store).with_deployment_reward(self.config.deployment_reward)
    }

    /// Run one scan from the cursor to the current head.
    ///
    /// Skipped (not queued) if a cycle is already running.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(CycleReport {
                skipped: true,
                ..CycleReport::default()
            });
        }

        let result = self.scan().await;
        self.in_flight.store(false, Ordering::Release);
        result
    }

    async fn scan(&self) -> Result<CycleReport> {
        let cursor = self.store.get_cursor().context("Failed to read cursor")?;
        let head = self
            .chain
            .head_height()
            .await
            .context("Failed to get chain head")?;

        let mut report = CycleReport {
            head,
            cursor,
            ..CycleReport::default()
        };

        // A missing cursor counts as block 0, which carries no logs
        let first = match cursor {
            Some(cursor) => cursor + 1,
            None => self.config.start_block.unwrap_or(1),
        };
        if first > head {
            debug!(?cursor, head, "Up to date");
            return Ok(report);
        }

        info!(from = first, to = head, "Scanning blocks");
        let engine = self.engine();
        let mut height = first;
        let mut stop = false;

        while height <= head && !stop {
            let batch_end = height
                .saturating_add(self.config.batch_size - 1)
                .min(head);
            let mut completed = None;

            while height <= batch_end {
                if self.shutdown.is_triggered() {
                    info!(block = height, "Shutdown requested; stopping scan");
                    stop = true;
                    break;
                }
                if let Err(e) = self.process_block(&engine, height, &mut report).await {
                    warn!(block = height, "Block failed, will retry next cycle: {:#}", e);
                    report.failed_block = Some(height);
                    stop = true;
                    break;
                }
                completed = Some(height);
                report.blocks_processed += 1;
                height += 1;
            }

            if let Some(block) = completed {
                self.store
                    .advance_cursor(block)
                    .with_context(|| format!("Failed to advance cursor to {}", block))?;
                report.cursor = Some(block);
                debug!(cursor = block, "Cursor advanced");
            }
        }

        Ok(report)
    }

    /// Ledger and route every log of one block.
    ///
    /// An unavailable block or receipt, an RPC error, or a ledger write error
    /// fails the block. Decode and handler failures don't.
    async fn process_block(
        &self,
        engine: &Progression<'_>,
        height: u64,
        report: &mut CycleReport,
    ) -> Result<()> {
        let block = self
            .chain
            .block_by_height(height)
            .await
            .with_context(|| format!("Failed to fetch block {}", height))?
            .with_context(|| format!("Block {} not available", height))?;

        for tx in &block.transactions {
            let receipt = self
                .chain
                .transaction_receipt(tx.hash)
                .await
                .with_context(|| format!("Failed to fetch receipt for tx {:?}", tx.hash))?
                .with_context(|| format!("Receipt for tx {:?} not available", tx.hash))?;

            for log in &receipt.logs {
                self.ingest_log(engine, log, report)?;
            }
        }

        debug!(block = height, txs = block.transactions.len(), "Processed block");
        Ok(())
    }

    fn ingest_log(&self, engine: &Progression<'_>, log: &Log, report: &mut CycleReport) -> Result<()> {
        report.logs_seen += 1;

        let row = LedgerEvent::observed(self.chain_id, log, now_secs());
        // Only rows some handler takes enter the pending queue
        let routed = self.router.is_routed(&row);
        let inserted = self
            .store
            .insert_event(&row, routed)
            .with_context(|| format!("Failed to ledger log {:?}/{}", log.transaction_hash, log.log_index))?;
        if !inserted {
            report.record(&LogOutcome::Skipped(SkipReason::Duplicate));
            return Ok(());
        }
        report.inserted += 1;

        if !routed {
            report.record(&LogOutcome::Skipped(SkipReason::Unrecognized));
            return Ok(());
        }
        let outcome = self.router.apply(engine, &row)?;
        report.record(&outcome);
        Ok(())
    }

    /// Sweep unprocessed rows from watched contracts.
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        reconcile_pending(&self.engine(), &self.router)
    }

    /// Poll until shutdown is triggered.
    ///
    /// Cycle errors are logged and retried on the next tick.
    pub async fn run(&self) -> Result<()> {
        info!(
            chain_id = self.chain_id,
            interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            "Starting poller"
        );

        while !self.shutdown.is_triggered() {
            match self.run_cycle().await {
                Ok(report) => report.log(),
                Err(e) => warn!("Poll cycle failed: {:#}", e),
            }

            match self.reconcile() {
                Ok(report) if report.examined > 0 => info!(
                    examined = report.examined,
                    applied = report.applied,
                    cleared = report.cleared,
                    failed = report.failed,
                    "Reconciled pending events"
                ),
                Ok(_) => {}
                Err(e) => warn!("Reconciliation failed: {:#}", e),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = self.shutdown.wait() => {}
            }
        }

        info!("Poller stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{
        contracts, deployed_log, ledger_row, xp_granted_log, ALICE, BOB, XP_SYSTEM,
    };
    use crate::records::XpSource;
    use crate::types::{Block, Receipt, Transaction};
    use alloy_primitives::{Address, B256};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU64;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Chain held in memory. Heights up to the head without a stored block are empty.
    #[derive(Default)]
    struct MemoryChain {
        head: AtomicU64,
        blocks: Mutex<HashMap<u64, Block>>,
        receipts: Mutex<HashMap<B256, Receipt>>,
        /// Trigger this shutdown when the given height is fetched.
        shutdown_at: Mutex<Option<(u64, Shutdown)>>,
    }

    impl MemoryChain {
        fn set_head(&self, head: u64) {
            self.head.store(head, Ordering::SeqCst);
        }

        /// Put a one-transaction block carrying `logs`.
        fn add_block(&self, number: u64, tx: B256, logs: Vec<Log>) {
            self.blocks.lock().unwrap().insert(
                number,
                Block {
                    number,
                    hash: B256::repeat_byte(number as u8),
                    transactions: vec![Transaction {
                        hash: tx,
                        from: ALICE,
                        to: Some(XP_SYSTEM),
                    }],
                },
            );
            self.add_receipt(tx, logs);
        }

        fn add_receipt(&self, tx: B256, logs: Vec<Log>) {
            self.receipts.lock().unwrap().insert(
                tx,
                Receipt {
                    transaction_hash: tx,
                    status: 1,
                    contract_address: None,
                    logs,
                },
            );
        }

        fn drop_receipt(&self, tx: B256) {
            self.receipts.lock().unwrap().remove(&tx);
        }

        fn shutdown_at(&self, height: u64, shutdown: Shutdown) {
            *self.shutdown_at.lock().unwrap() = Some((height, shutdown));
        }
    }

    impl ChainReader for MemoryChain {
        async fn block_by_height(&self, height: u64) -> Result<Option<Block>> {
            if height > self.head.load(Ordering::SeqCst) {
                return Ok(None);
            }
            if let Some((at, shutdown)) = self.shutdown_at.lock().unwrap().as_ref() {
                if *at == height {
                    shutdown.trigger();
                }
            }
            let stored = self.blocks.lock().unwrap().get(&height).cloned();
            Ok(Some(stored.unwrap_or(Block {
                number: height,
                hash: B256::ZERO,
                transactions: vec![],
            })))
        }

        async fn transaction_receipt(&self, tx_hash: B256) -> Result<Option<Receipt>> {
            Ok(self.receipts.lock().unwrap().get(&tx_hash).cloned())
        }

        async fn head_height(&self) -> Result<u64> {
            Ok(self.head.load(Ordering::SeqCst))
        }
    }

    fn tx(n: u8) -> B256 {
        B256::repeat_byte(n)
    }

    fn create_poller(config: PollerConfig) -> (Poller<MemoryChain>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = RocksProgressStore::open(temp_dir.path()).unwrap();
        let poller = Poller::new(store, MemoryChain::default(), contracts(), config, 1).unwrap();
        (poller, temp_dir)
    }

    fn from_block(start: u64) -> PollerConfig {
        PollerConfig {
            start_block: Some(start),
            ..PollerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_fresh_store_scans_from_first_block() {
        let (poller, _temp_dir) = create_poller(PollerConfig::default());
        poller.chain.set_head(5);
        poller
            .chain
            .add_block(2, tx(2), vec![xp_granted_log(ALICE, 30, "early", tx(2), 0, 2)]);

        let report = poller.run_cycle().await.unwrap();
        assert_eq!(report.blocks_processed, 5);
        assert_eq!(report.applied, 1);
        assert_eq!(poller.store().get_cursor().unwrap(), Some(5));
        assert_eq!(poller.store().get_user(ALICE).unwrap().unwrap().xp, 30);
    }

    #[tokio::test]
    async fn test_reingesting_block_is_idempotent() {
        let (poller, _temp_dir) = create_poller(from_block(1));
        poller.chain.set_head(1);
        poller.chain.add_block(
            1,
            tx(1),
            vec![
                xp_granted_log(ALICE, 40, "first", tx(1), 0, 1),
                xp_granted_log(ALICE, 60, "second", tx(1), 1, 1),
            ],
        );

        let engine = poller.engine();
        let mut first = CycleReport::default();
        poller.process_block(&engine, 1, &mut first).await.unwrap();
        let mut second = CycleReport::default();
        poller.process_block(&engine, 1, &mut second).await.unwrap();

        assert_eq!(first.applied, 2);
        assert_eq!(second.duplicates, 2);
        assert_eq!(second.inserted, 0);

        let user = poller.store().get_user(ALICE).unwrap().unwrap();
        assert_eq!(user.xp, 100);
        assert_eq!(poller.store().xp_entries(ALICE).unwrap().len(), 2);
        assert!(engine.check_ledger(ALICE).unwrap().xp_consistent());
    }

    #[tokio::test]
    async fn test_deployment_scenario() {
        let (poller, _temp_dir) = create_poller(from_block(5));
        poller
            .engine()
            .grant_xp(ALICE, 50, XpSource::Manual, "seed", None)
            .unwrap();

        poller.chain.set_head(5);
        poller
            .chain
            .add_block(5, tx(5), vec![deployed_log(ALICE, BOB, 0, tx(5), 0, 5)]);

        let report = poller.run_cycle().await.unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.cursor, Some(5));

        let user = poller.store().get_user(ALICE).unwrap().unwrap();
        assert_eq!(user.xp, 150);
        assert_eq!(user.level, 2);
        assert_eq!(user.total_deployments, 1);

        // Replay of the identical log, plus a second log for the same deployment
        poller.chain.set_head(6);
        poller.chain.add_block(
            6,
            tx(5),
            vec![
                deployed_log(ALICE, BOB, 0, tx(5), 0, 6),
                deployed_log(ALICE, BOB, 0, tx(5), 1, 6),
            ],
        );
        let report = poller.run_cycle().await.unwrap();
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.applied, 1);

        let user = poller.store().get_user(ALICE).unwrap().unwrap();
        assert_eq!(user.xp, 150);
        assert_eq!(user.total_deployments, 1);
    }

    #[tokio::test]
    async fn test_cursor_advances_in_batches_up_to_head() {
        let config = PollerConfig {
            batch_size: 100,
            ..from_block(1)
        };
        let (poller, _temp_dir) = create_poller(config);

        poller.chain.set_head(250);
        let report = poller.run_cycle().await.unwrap();
        assert_eq!(report.blocks_processed, 250);
        assert_eq!(report.cursor, Some(250));
        assert_eq!(poller.store().get_cursor().unwrap(), Some(250));

        // Nothing new
        let report = poller.run_cycle().await.unwrap();
        assert_eq!(report.blocks_processed, 0);
        assert_eq!(poller.store().get_cursor().unwrap(), Some(250));

        poller.chain.set_head(260);
        poller.run_cycle().await.unwrap();
        assert_eq!(poller.store().get_cursor().unwrap(), Some(260));
    }

    #[tokio::test]
    async fn test_failed_block_is_retried() {
        let (poller, _temp_dir) = create_poller(from_block(1));
        poller.chain.set_head(5);
        poller
            .chain
            .add_block(3, tx(3), vec![xp_granted_log(ALICE, 30, "late", tx(3), 0, 3)]);
        poller.chain.drop_receipt(tx(3));

        let report = poller.run_cycle().await.unwrap();
        assert_eq!(report.failed_block, Some(3));
        assert_eq!(report.cursor, Some(2));
        assert_eq!(poller.store().get_cursor().unwrap(), Some(2));
        assert!(poller.store().get_user(ALICE).unwrap().is_none());

        poller
            .chain
            .add_receipt(tx(3), vec![xp_granted_log(ALICE, 30, "late", tx(3), 0, 3)]);
        let report = poller.run_cycle().await.unwrap();
        assert_eq!(report.failed_block, None);
        assert_eq!(report.cursor, Some(5));
        assert_eq!(poller.store().get_user(ALICE).unwrap().unwrap().xp, 30);
    }

    #[tokio::test]
    async fn test_unwatched_logs_are_ledgered_but_not_queued() {
        let (poller, _temp_dir) = create_poller(from_block(1));
        let mut foreign = xp_granted_log(ALICE, 10, "elsewhere", tx(1), 0, 1);
        foreign.address = Address::repeat_byte(0x99);
        poller.chain.set_head(1);
        poller.chain.add_block(1, tx(1), vec![foreign]);

        let report = poller.run_cycle().await.unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.unrecognized, 1);

        let row = poller.store().get_event(tx(1), 0).unwrap().unwrap();
        assert!(!row.processed);
        assert!(poller.store().pending_events().unwrap().is_empty());
        assert!(poller.store().get_user(ALICE).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reconcile_applies_unprocessed_rows() {
        let (poller, _temp_dir) = create_poller(PollerConfig::default());

        // Ledgered by an earlier run that stopped before applying
        let row = ledger_row(&xp_granted_log(ALICE, 75, "recovered", tx(7), 0, 7));
        poller.store().insert_event(&row, true).unwrap();

        let report = poller.reconcile().unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.applied, 1);
        assert_eq!(poller.store().get_user(ALICE).unwrap().unwrap().xp, 75);
        assert!(poller.store().get_event(tx(7), 0).unwrap().unwrap().processed);

        let report = poller.reconcile().unwrap();
        assert_eq!(report.examined, 0);
        assert_eq!(poller.store().get_user(ALICE).unwrap().unwrap().xp, 75);
    }

    #[tokio::test]
    async fn test_cycle_skipped_while_in_flight() {
        let (poller, _temp_dir) = create_poller(from_block(1));
        poller.chain.set_head(3);

        poller.in_flight.store(true, Ordering::SeqCst);
        let report = poller.run_cycle().await.unwrap();
        assert!(report.skipped);
        assert_eq!(poller.store().get_cursor().unwrap(), None);

        poller.in_flight.store(false, Ordering::SeqCst);
        let report = poller.run_cycle().await.unwrap();
        assert!(!report.skipped);
        assert_eq!(report.cursor, Some(3));
    }

    #[tokio::test]
    async fn test_shutdown_mid_batch_keeps_completed_blocks() {
        let (poller, _temp_dir) = create_poller(from_block(1));
        poller.chain.set_head(10);
        poller
            .chain
            .add_block(4, tx(4), vec![xp_granted_log(ALICE, 20, "kept", tx(4), 0, 4)]);
        poller
            .chain
            .add_block(5, tx(5), vec![xp_granted_log(ALICE, 30, "after", tx(5), 0, 5)]);
        poller.chain.shutdown_at(4, poller.shutdown_handle());

        let report = poller.run_cycle().await.unwrap();
        assert_eq!(report.blocks_processed, 4);
        assert_eq!(report.cursor, Some(4));
        assert_eq!(report.failed_block, None);
        assert_eq!(poller.store().get_cursor().unwrap(), Some(4));

        // Block 4 finished; block 5 was never touched
        assert!(poller.store().get_event(tx(4), 0).unwrap().unwrap().processed);
        assert!(poller.store().get_event(tx(5), 0).unwrap().is_none());
        assert_eq!(poller.store().get_user(ALICE).unwrap().unwrap().xp, 20);
    }

    #[tokio::test]
    async fn test_unknown_topic_on_watched_contract_is_not_queued() {
        let (poller, _temp_dir) = create_poller(from_block(1));
        let mut log = xp_granted_log(ALICE, 10, "mystery", tx(1), 0, 1);
        log.topics[0] = B256::repeat_byte(0xee);
        poller.chain.set_head(1);
        poller.chain.add_block(1, tx(1), vec![log]);

        let report = poller.run_cycle().await.unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.unrecognized, 1);
        assert_eq!(report.applied, 0);

        let row = poller.store().get_event(tx(1), 0).unwrap().unwrap();
        assert_eq!(row.contract_address, XP_SYSTEM);
        assert!(!row.processed);
        assert!(poller.store().pending_events().unwrap().is_empty());
        assert!(poller.store().get_user(ALICE).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_returns_after_shutdown() {
        let (poller, _temp_dir) = create_poller(from_block(1));
        poller.chain.set_head(2);

        let shutdown = poller.shutdown_handle();
        shutdown.trigger();
        poller.run().await.unwrap();

        // Stopped before scanning anything
        assert_eq!(poller.store().get_cursor().unwrap(), None);
        assert!(shutdown.is_triggered());
    }
}
