// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Block scanner
//!
//! One scan cycle walks the chain from the persisted cursor to the current
//! chain height. Each next block must link to the cursor through its
//! previous hash; when it does not, the scanner rolls the cursor back and
//! scans the replacement branch on the following iterations.
//!
//! After the walk the cycle rescans the most recent heights, replays
//! persisted unscanned records and purges records that can never resolve.

use super::consumer::NotifyConsumer;
use super::state::{AtomicScannerState, ScannerState};
use crate::chain::ChainSource;
use crate::config::ScannerNodeConfig;
use crate::error::{WalletError, WalletResult};
use crate::extract::TransactionExtractor;
use crate::metrics::ScannerMetrics;
use crate::observer::{AddressFilter, ScanObserver};
use crate::pipeline::{BatchReport, ExtractionPipeline, DEFAULT_MAX_EXTRACTING_WORKERS};
use crate::store::ScannerStore;
use crate::tokens::TokenRegistry;
use crate::types::{AddrBalance, Block, BlockHeader, TokenBalance, UnscannedRecord};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, warn};

/// Reason prefix of records for transactions the node no longer knows.
pub const TX_NOT_FOUND_REASON_PREFIX: &str = "[-5]No information available about transaction";

pub const DEFAULT_ROLLBACK_DEPTH: u64 = 2;

/// What one scan cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub start_height: u64,
    pub end_height: u64,
    pub blocks_scanned: u64,
    pub forks: u64,
    /// Cursor reached the chain height
    pub synced: bool,
    /// Scanner was paused or stopped mid-cycle
    pub interrupted: bool,
    /// Error that ended the height walk early
    pub halted: Option<WalletError>,
    pub rescanned_blocks: u64,
    pub replayed_heights: u64,
    pub purged_records: u64,
}

pub struct BlockScanner {
    symbol: String,
    chain: Arc<dyn ChainSource>,
    store: Option<Arc<dyn ScannerStore>>,
    tokens: Arc<TokenRegistry>,
    filter: Arc<dyn AddressFilter>,
    observers: RwLock<Vec<Arc<dyn ScanObserver>>>,
    pipeline: ExtractionPipeline,
    state: AtomicScannerState,
    rescan_last_block_count: u64,
    rollback_depth: u64,
    metrics: Option<Arc<ScannerMetrics>>,
    // Only one cycle mutates the cursor at a time
    cycle_lock: tokio::sync::Mutex<()>,
}

impl BlockScanner {
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn state(&self) -> ScannerState {
        self.state.get()
    }

    pub fn run(&self) -> WalletResult<()> {
        self.state.run()?;
        info!("[{}] Block scanner running", self.symbol);
        Ok(())
    }

    pub fn pause(&self) -> WalletResult<()> {
        self.state.pause()?;
        info!("[{}] Block scanner paused", self.symbol);
        Ok(())
    }

    pub fn restart(&self) -> WalletResult<()> {
        self.state.restart()?;
        info!("[{}] Block scanner restarted", self.symbol);
        Ok(())
    }

    pub fn stop(&self) {
        self.state.stop();
        info!("[{}] Block scanner stopped", self.symbol);
    }

    pub fn is_scanning(&self) -> bool {
        self.state.is_scanning()
    }

    pub fn add_observer(&self, observer: Arc<dyn ScanObserver>) {
        if let Ok(mut observers) = self.observers.write() {
            observers.push(observer);
        }
    }

    pub fn token_registry(&self) -> &Arc<TokenRegistry> {
        &self.tokens
    }

    fn observers(&self) -> Vec<Arc<dyn ScanObserver>> {
        self.observers
            .read()
            .map(|o| o.clone())
            .unwrap_or_default()
    }

    fn store(&self) -> WalletResult<&Arc<dyn ScannerStore>> {
        self.store.as_ref().ok_or(WalletError::StoreNotConfigured)
    }

    /// Run one scan cycle.
    ///
    /// Only a missing store or an unreadable cursor fail the call; every
    /// other error ends the height walk and is reported in
    /// [`CycleSummary::halted`].
    pub async fn scan_cycle(&self) -> WalletResult<CycleSummary> {
        let _guard = self.cycle_lock.lock().await;
        let store = self.store()?.clone();
        let cursor = self.scanned_block_header().await?;

        let mut current_height = cursor.height;
        let mut current_hash = cursor.hash;
        let mut summary = CycleSummary {
            start_height: current_height,
            ..Default::default()
        };

        loop {
            if !self.state.is_scanning() {
                info!(
                    "[{}] Block scanner is not running, ending cycle at {}",
                    self.symbol, current_height
                );
                summary.interrupted = true;
                summary.end_height = current_height;
                return Ok(summary);
            }

            if let Err(e) = self.tokens.refresh().await {
                error!("[{}] Token registry refresh failed: {}", self.symbol, e);
                summary.halted = Some(e);
                break;
            }

            let max_height = match self.chain.chain_height().await {
                Ok(h) => h,
                Err(e) => {
                    warn!("[{}] Cannot get chain height: {}", self.symbol, e);
                    summary.halted = Some(e);
                    break;
                }
            };
            if let Some(m) = &self.metrics {
                m.chain_height
                    .with_label_values(&[&self.symbol])
                    .set(max_height as i64);
            }

            if current_height >= max_height {
                info!(
                    "[{}] Block scanner has scanned full chain data. Current height: {}",
                    self.symbol, max_height
                );
                summary.synced = true;
                break;
            }

            let next_height = current_height + 1;
            debug!("[{}] Scanning height {}", self.symbol, next_height);
            let block = match self.chain.block_by_height(next_height).await {
                Ok(b) => b,
                Err(e) => {
                    warn!("[{}] Cannot get block {}: {}", self.symbol, next_height, e);
                    summary.halted = Some(e);
                    break;
                }
            };

            if block.prev_hash != current_hash {
                match self
                    .roll_back(store.as_ref(), current_height, &current_hash, &block)
                    .await
                {
                    Ok(rollback) => {
                        current_height = rollback.height;
                        current_hash = rollback.hash;
                        summary.forks += 1;
                    }
                    Err(e) => {
                        error!("[{}] Fork rollback at {} failed: {}", self.symbol, next_height, e);
                        summary.halted = Some(e);
                        break;
                    }
                }
                continue;
            }

            if let Err(e) = self.extract_block(&block).await {
                info!(
                    "[{}] Block {} extracted with errors: {}",
                    self.symbol, block.height, e
                );
            }

            let header = block.header(&self.symbol);
            if let Err(e) = store.save_cursor(&self.symbol, &header).await {
                error!("[{}] Cannot save cursor {}: {}", self.symbol, block.height, e);
                summary.halted = Some(e);
                break;
            }
            if let Err(e) = store.save_local_block(&self.symbol, &block).await {
                warn!("[{}] Cannot cache block {}: {}", self.symbol, block.height, e);
            }
            current_height = block.height;
            current_hash = block.hash.clone();
            summary.blocks_scanned += 1;
            if let Some(m) = &self.metrics {
                m.blocks_scanned.with_label_values(&[&self.symbol]).inc();
                m.last_scanned_height
                    .with_label_values(&[&self.symbol])
                    .set(current_height as i64);
            }

            self.notify_new_block(&header).await;
        }

        summary.end_height = current_height;
        if let (Some(e), Some(m)) = (&summary.halted, &self.metrics) {
            m.scan_cycle_errors
                .with_label_values(&[&self.symbol, e.error_type()])
                .inc();
        }

        summary.rescanned_blocks = self.rescan_last_blocks(current_height).await;
        match self.rescan_failed_records().await {
            Ok(n) => summary.replayed_heights = n,
            Err(e) => error!("[{}] Rescan of failed records failed: {}", self.symbol, e),
        }
        match self.delete_unresolvable_records().await {
            Ok(n) => summary.purged_records = n,
            Err(e) => error!("[{}] Purge of unresolvable records failed: {}", self.symbol, e),
        }
        Ok(summary)
    }

    /// Roll the cursor back after `block` failed to link to it. Returns the
    /// new cursor.
    async fn roll_back(
        &self,
        store: &dyn ScannerStore,
        cursor_height: u64,
        cursor_hash: &str,
        block: &Block,
    ) -> WalletResult<BlockHeader> {
        let fork_height = block.height;
        warn!(
            "[{}] Block has been forked on height {}: local hash {} at {} but chain says {}",
            self.symbol, fork_height, cursor_hash, cursor_height, block.prev_hash
        );

        let orphaned = store
            .get_local_block(&self.symbol, cursor_height)
            .await
            .unwrap_or_else(|e| {
                warn!("[{}] Cannot read local block {}: {}", self.symbol, cursor_height, e);
                None
            });

        let target = fork_height
            .saturating_sub(self.rollback_depth)
            .max(1)
            .min(cursor_height);
        for height in target + 1..fork_height {
            if let Err(e) = store.delete_unscanned_by_height(&self.symbol, height).await {
                warn!(
                    "[{}] Cannot delete unscanned records at {}: {}",
                    self.symbol, height, e
                );
            }
        }

        // At the floor the cached block is the one that just failed to link
        let cached = if target < cursor_height {
            store.get_local_block(&self.symbol, target).await?
        } else {
            None
        };
        let rollback_block = match cached {
            Some(b) => b,
            None => {
                debug!("[{}] Fetching rollback block {} from chain", self.symbol, target);
                self.chain.block_by_height(target).await?
            }
        };
        let cursor = rollback_block.header(&self.symbol);
        store.save_cursor(&self.symbol, &cursor).await?;
        info!(
            "[{}] Rescan block on height {}, hash {}",
            self.symbol, cursor.height, cursor.hash
        );
        if let Some(m) = &self.metrics {
            m.forks_detected.with_label_values(&[&self.symbol]).inc();
            m.last_scanned_height
                .with_label_values(&[&self.symbol])
                .set(cursor.height as i64);
        }

        let mut fork_header = match orphaned {
            Some(b) => b.header(&self.symbol),
            None => BlockHeader {
                hash: cursor_hash.to_string(),
                height: cursor_height,
                symbol: self.symbol.clone(),
                ..Default::default()
            },
        };
        fork_header.fork = true;
        self.notify_new_block(&fork_header).await;

        Ok(cursor)
    }

    async fn notify_new_block(&self, header: &BlockHeader) {
        for observer in self.observers() {
            observer.on_new_block(header).await;
        }
    }

    /// Extract every transaction of `block` and deliver the results.
    async fn extract_block(&self, block: &Block) -> WalletResult<BatchReport> {
        let store = self.store()?.clone();
        let extractor = TransactionExtractor::new(
            &self.symbol,
            self.tokens.snapshot(),
            self.filter.clone(),
        );
        let consumer = Arc::new(NotifyConsumer {
            symbol: self.symbol.clone(),
            height: block.height,
            observers: self.observers(),
            store,
            metrics: self.metrics.clone(),
        });
        self.pipeline
            .extract_batch(
                &extractor,
                block.height,
                &block.hash,
                block.transactions.clone(),
                consumer,
            )
            .await
    }

    /// Fetch and extract one height without touching the cursor. A fetch
    /// failure is recorded as an unscanned block.
    async fn rescan_block(&self, height: u64) -> WalletResult<Block> {
        let block = match self.chain.block_by_height(height).await {
            Ok(b) => b,
            Err(e) => {
                warn!("[{}] Cannot get block {}: {}", self.symbol, height, e);
                let record = UnscannedRecord::new(height, None, e.to_string(), &self.symbol);
                if let Err(save_err) = self.store()?.save_unscanned(record).await {
                    error!(
                        "[{}] Cannot save unscanned block {}: {}",
                        self.symbol, height, save_err
                    );
                } else if let Some(m) = &self.metrics {
                    m.unscanned_records_saved
                        .with_label_values(&[&self.symbol])
                        .inc();
                }
                return Err(e);
            }
        };
        if let Err(e) = self.extract_block(&block).await {
            info!(
                "[{}] Block {} extracted with errors: {}",
                self.symbol, block.height, e
            );
        }
        Ok(block)
    }

    /// Scan one height on demand and announce it as a new block.
    pub async fn scan_block(&self, height: u64) -> WalletResult<()> {
        self.store()?;
        let block = self.rescan_block(height).await?;
        self.notify_new_block(&block.header(&self.symbol)).await;
        Ok(())
    }

    async fn rescan_last_blocks(&self, cursor_height: u64) -> u64 {
        if self.rescan_last_block_count == 0 {
            return 0;
        }
        let from = cursor_height
            .saturating_sub(self.rescan_last_block_count - 1)
            .max(1);
        let mut rescanned = 0;
        for height in from..=cursor_height {
            if self.rescan_block(height).await.is_ok() {
                rescanned += 1;
            }
        }
        rescanned
    }

    /// Re-extract every height that has unscanned records. Records of a
    /// height are deleted once its block extracts without failures.
    pub async fn rescan_failed_records(&self) -> WalletResult<u64> {
        let store = self.store()?;
        let records = store.list_unscanned(&self.symbol).await?;

        let mut by_height: BTreeMap<u64, Vec<String>> = BTreeMap::new();
        for record in records {
            let txs = by_height.entry(record.block_height).or_default();
            if let Some(tx_id) = record.tx_id {
                txs.push(tx_id);
            }
        }

        let mut replayed = 0;
        for (height, tx_ids) in by_height {
            if height == 0 {
                continue;
            }
            info!(
                "[{}] Rescanning height {} for {} failed transactions",
                self.symbol,
                height,
                tx_ids.len()
            );
            let block = match self.chain.block_by_height(height).await {
                Ok(b) => b,
                Err(e) => {
                    warn!("[{}] Cannot get block {}: {}", self.symbol, height, e);
                    continue;
                }
            };
            if let Err(e) = self.extract_block(&block).await {
                warn!("[{}] Rescan of height {} failed: {}", self.symbol, height, e);
                continue;
            }
            store.delete_unscanned_by_height(&self.symbol, height).await?;
            replayed += 1;
        }
        Ok(replayed)
    }

    /// Drop records for transactions the node reports as unknown.
    pub async fn delete_unresolvable_records(&self) -> WalletResult<u64> {
        let store = self.store()?;
        let mut deleted = 0;
        for record in store.list_unscanned(&self.symbol).await? {
            if record.reason.starts_with(TX_NOT_FOUND_REASON_PREFIX) {
                store.delete_unscanned_by_id(&self.symbol, &record.id).await?;
                deleted += 1;
            }
        }
        if deleted > 0 {
            info!("[{}] Deleted {} unresolvable unscanned records", self.symbol, deleted);
        }
        Ok(deleted)
    }

    /// Restart scanning from `height` on the next cycle.
    pub async fn set_rescan_height(&self, height: u64) -> WalletResult<()> {
        if height == 0 {
            return Err(WalletError::InvalidHeight(
                "block height to rescan must be greater than 0".to_string(),
            ));
        }
        let store = self.store()?;
        let block = self.chain.block_by_height(height - 1).await?;
        store
            .save_cursor(&self.symbol, &block.header(&self.symbol))
            .await?;
        info!("[{}] Rescan height set to {}", self.symbol, height);
        Ok(())
    }

    /// The persisted cursor, or the block below the chain tip when nothing
    /// was scanned yet.
    pub async fn scanned_block_header(&self) -> WalletResult<BlockHeader> {
        let store = self.store()?;
        if let Some(cursor) = store.get_cursor(&self.symbol).await? {
            return Ok(cursor);
        }
        let chain_height = self.chain.chain_height().await?;
        let block = self
            .chain
            .block_by_height(chain_height.saturating_sub(1))
            .await?;
        Ok(block.header(&self.symbol))
    }

    pub async fn scanned_block_height(&self) -> WalletResult<u64> {
        Ok(self.scanned_block_header().await?.height)
    }

    /// Header of the chain tip
    pub async fn current_block_header(&self) -> WalletResult<BlockHeader> {
        let height = self.chain.chain_height().await?;
        let block = self.chain.block_by_height(height).await?;
        Ok(block.header(&self.symbol))
    }

    /// Fee-asset balances of `addresses`.
    pub async fn balance_by_address(&self, addresses: &[String]) -> WalletResult<Vec<AddrBalance>> {
        let asset_id = self.tokens.fee_asset_id();
        let mut balances = Vec::with_capacity(addresses.len());
        for address in addresses {
            balances.push(self.chain.address_balance(address, asset_id).await?);
        }
        Ok(balances)
    }

    /// Balances of `asset_id` held by `addresses`, converted with the
    /// token's decimals.
    pub async fn token_balance_by_address(
        &self,
        asset_id: &str,
        addresses: &[String],
    ) -> WalletResult<Vec<TokenBalance>> {
        let token = self.tokens.token(asset_id).await?;
        let mut balances = Vec::with_capacity(addresses.len());
        for address in addresses {
            let balance = self.chain.address_balance(address, asset_id).await?;
            balances.push(TokenBalance {
                address: balance.address,
                asset_id: token.asset_id.clone(),
                symbol: token.symbol.clone(),
                free: token.to_decimal(balance.free)?,
                frozen: token.to_decimal(balance.frozen)?,
                total: token.to_decimal(balance.total)?,
            });
        }
        Ok(balances)
    }
}

/// Builder for [`BlockScanner`] with fluent API
pub struct BlockScannerBuilder {
    symbol: String,
    chain: Arc<dyn ChainSource>,
    tokens: Arc<TokenRegistry>,
    filter: Arc<dyn AddressFilter>,
    store: Option<Arc<dyn ScannerStore>>,
    observers: Vec<Arc<dyn ScanObserver>>,
    max_extracting_workers: usize,
    rescan_last_block_count: u64,
    rollback_depth: u64,
    metrics: Option<Arc<ScannerMetrics>>,
}

impl BlockScannerBuilder {
    pub fn new(
        symbol: &str,
        chain: Arc<dyn ChainSource>,
        tokens: Arc<TokenRegistry>,
        filter: Arc<dyn AddressFilter>,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            chain,
            tokens,
            filter,
            store: None,
            observers: Vec::new(),
            max_extracting_workers: DEFAULT_MAX_EXTRACTING_WORKERS,
            rescan_last_block_count: 0,
            rollback_depth: DEFAULT_ROLLBACK_DEPTH,
            metrics: None,
        }
    }

    /// Builder preloaded with the scanning options of `config`. The token
    /// registry is built from the configured token list.
    pub fn from_config(
        config: &ScannerNodeConfig,
        chain: Arc<dyn ChainSource>,
        filter: Arc<dyn AddressFilter>,
    ) -> Self {
        let tokens = Arc::new(TokenRegistry::new(
            &config.symbol,
            &config.fee_asset_id,
            Arc::new(config.token_source()),
        ));
        Self::new(&config.symbol, chain, tokens, filter)
            .with_max_extracting_workers(config.max_extracting_workers)
            .with_rescan_last_block_count(config.rescan_last_block_count)
            .with_rollback_depth(config.rollback_depth)
    }

    pub fn with_store(mut self, store: Arc<dyn ScannerStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ScanObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn with_max_extracting_workers(mut self, workers: usize) -> Self {
        self.max_extracting_workers = workers;
        self
    }

    pub fn with_rescan_last_block_count(mut self, count: u64) -> Self {
        self.rescan_last_block_count = count;
        self
    }

    /// Values below 2 are raised to 2.
    pub fn with_rollback_depth(mut self, depth: u64) -> Self {
        self.rollback_depth = depth.max(DEFAULT_ROLLBACK_DEPTH);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<ScannerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> BlockScanner {
        let mut pipeline = ExtractionPipeline::new(self.max_extracting_workers);
        if let Some(m) = &self.metrics {
            pipeline = pipeline.with_metrics(m.clone());
        }
        BlockScanner {
            symbol: self.symbol,
            chain: self.chain,
            store: self.store,
            tokens: self.tokens,
            filter: self.filter,
            observers: RwLock::new(self.observers),
            pipeline,
            state: AtomicScannerState::new(),
            rescan_last_block_count: self.rescan_last_block_count,
            rollback_depth: self.rollback_depth,
            metrics: self.metrics,
            cycle_lock: tokio::sync::Mutex::new(()),
        }
    }
}
