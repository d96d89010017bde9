// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Mocks and builders shared by the unit tests.

use crate::chain::ChainSource;
use crate::error::{WalletError, WalletResult};
use crate::extract::ExtractData;
use crate::observer::ScanObserver;
use crate::tokens::{TokenInfo, TokenSnapshot};
use crate::types::{AddrBalance, Block, BlockHeader, RuntimeVersion, Transaction, TransferLeg, TxStatus};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

/// Route `tracing` output to the test harness. Set `RUST_LOG` to see it.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub const GENESIS_HASH: &str = "0xb0a8d493285c2df73290dfb7e61f870f17b41801197a149ca93654499ea3dafe";

pub fn cennz_token_list() -> Vec<TokenInfo> {
    vec![
        TokenInfo::new("1", "CENNZ", 4),
        TokenInfo::new("2", "CPAY", 4),
    ]
}

/// CENNZ ("1") and CPAY ("2"), both 4 decimals, CPAY pays fees.
pub fn cennz_tokens() -> Arc<TokenSnapshot> {
    Arc::new(TokenSnapshot::new(cennz_token_list(), "2").unwrap())
}

pub fn make_tx(tx_id: &str, from: Vec<TransferLeg>, to: Vec<TransferLeg>) -> Transaction {
    Transaction {
        tx_id: tx_id.to_string(),
        timestamp: 1_600_000_000,
        block_height: 0,
        block_hash: String::new(),
        status: TxStatus::Success,
        from_legs: from,
        to_legs: to,
    }
}

pub fn block_hash(branch: &str, height: u64) -> String {
    format!("{branch}-{height}")
}

pub fn make_block(height: u64, hash: &str, prev_hash: &str, transactions: Vec<Transaction>) -> Block {
    Block {
        hash: hash.to_string(),
        prev_hash: prev_hash.to_string(),
        height,
        timestamp: 1_600_000_000 + height,
        finalized: true,
        transactions,
    }
}

/// Blocks `from..=to` on `branch`, each linked to its predecessor on the
/// same branch.
pub fn linked_blocks(branch: &str, from: u64, to: u64) -> Vec<Block> {
    (from..=to)
        .map(|h| {
            make_block(
                h,
                &block_hash(branch, h),
                &block_hash(branch, h.saturating_sub(1)),
                vec![],
            )
        })
        .collect()
}

#[derive(Default)]
struct MockChainState {
    height: u64,
    blocks: BTreeMap<u64, Block>,
    balances: HashMap<(String, String), AddrBalance>,
    failing_heights: HashSet<u64>,
    fail_chain_height: bool,
    submit_responses: VecDeque<WalletResult<String>>,
    submitted: Vec<String>,
    block_requests: Vec<u64>,
}

/// In-memory chain node.
#[derive(Clone, Default)]
pub struct MockChainSource {
    state: Arc<Mutex<MockChainState>>,
}

impl MockChainSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) blocks and raise the chain height to the highest one.
    pub fn add_blocks(&self, blocks: Vec<Block>) {
        let mut state = self.state.lock().unwrap();
        for block in blocks {
            state.height = state.height.max(block.height);
            state.blocks.insert(block.height, block);
        }
    }

    pub fn fail_block(&self, height: u64) {
        self.state.lock().unwrap().failing_heights.insert(height);
    }

    pub fn heal_block(&self, height: u64) {
        self.state.lock().unwrap().failing_heights.remove(&height);
    }

    pub fn fail_chain_height(&self, fail: bool) {
        self.state.lock().unwrap().fail_chain_height = fail;
    }

    pub fn set_balance(&self, address: &str, asset_id: &str, free: u128, nonce: u64) {
        self.state.lock().unwrap().balances.insert(
            (address.to_string(), asset_id.to_string()),
            AddrBalance::new(address, asset_id, free, nonce),
        );
    }

    pub fn push_submit_response(&self, response: WalletResult<String>) {
        self.state
            .lock()
            .unwrap()
            .submit_responses
            .push_back(response);
    }

    pub fn submitted(&self) -> Vec<String> {
        self.state.lock().unwrap().submitted.clone()
    }

    pub fn block_requests(&self) -> Vec<u64> {
        self.state.lock().unwrap().block_requests.clone()
    }
}

#[async_trait::async_trait]
impl ChainSource for MockChainSource {
    async fn chain_height(&self) -> WalletResult<u64> {
        let state = self.state.lock().unwrap();
        if state.fail_chain_height {
            return Err(WalletError::chain("chain_height", "connection refused"));
        }
        Ok(state.height)
    }

    async fn block_by_height(&self, height: u64) -> WalletResult<Block> {
        let mut state = self.state.lock().unwrap();
        state.block_requests.push(height);
        if state.failing_heights.contains(&height) {
            return Err(WalletError::chain("block_by_height", format!("block {height} unavailable")));
        }
        state
            .blocks
            .get(&height)
            .cloned()
            .ok_or(WalletError::BlockNotFound(height))
    }

    async fn address_balance(&self, address: &str, asset_id: &str) -> WalletResult<AddrBalance> {
        let state = self.state.lock().unwrap();
        Ok(state
            .balances
            .get(&(address.to_string(), asset_id.to_string()))
            .cloned()
            .unwrap_or_else(|| {
                // Accounts share one nonce across assets
                let nonce = state
                    .balances
                    .iter()
                    .find(|((a, _), _)| a == address)
                    .map(|(_, b)| b.nonce)
                    .unwrap_or(0);
                AddrBalance::new(address, asset_id, 0, nonce)
            }))
    }

    async fn submit_transaction(&self, raw_hex: &str) -> WalletResult<String> {
        let mut state = self.state.lock().unwrap();
        state.submitted.push(raw_hex.to_string());
        let count = state.submitted.len();
        state
            .submit_responses
            .pop_front()
            .unwrap_or_else(|| Ok(format!("0xtx{count}")))
    }

    async fn genesis_hash(&self) -> WalletResult<String> {
        Ok(GENESIS_HASH.to_string())
    }

    async fn runtime_version(&self) -> WalletResult<RuntimeVersion> {
        Ok(RuntimeVersion {
            spec_version: 36,
            transaction_version: 5,
        })
    }
}

/// Observer that remembers every notification.
#[derive(Default)]
pub struct RecordingObserver {
    pub blocks: Mutex<Vec<BlockHeader>>,
    pub extracted: Mutex<Vec<(String, ExtractData)>>,
    fail_tx: Mutex<HashSet<String>>,
    fail_keys: Mutex<HashSet<String>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make delivery of `tx_id` fail until [`Self::accept_tx`] is called.
    pub fn reject_tx(&self, tx_id: &str) {
        self.fail_tx.lock().unwrap().insert(tx_id.to_string());
    }

    pub fn accept_tx(&self, tx_id: &str) {
        self.fail_tx.lock().unwrap().remove(tx_id);
    }

    /// Make every delivery for `source_key` fail.
    pub fn reject_source_key(&self, source_key: &str) {
        self.fail_keys.lock().unwrap().insert(source_key.to_string());
    }

    pub fn new_blocks(&self) -> Vec<BlockHeader> {
        self.blocks
            .lock()
            .unwrap()
            .iter()
            .filter(|h| !h.fork)
            .cloned()
            .collect()
    }

    pub fn fork_blocks(&self) -> Vec<BlockHeader> {
        self.blocks
            .lock()
            .unwrap()
            .iter()
            .filter(|h| h.fork)
            .cloned()
            .collect()
    }

    pub fn extracted_tx_ids(&self) -> Vec<String> {
        self.extracted
            .lock()
            .unwrap()
            .iter()
            .map(|(_, d)| d.transaction.tx_id.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl ScanObserver for RecordingObserver {
    async fn on_new_block(&self, header: &BlockHeader) {
        self.blocks.lock().unwrap().push(header.clone());
    }

    async fn on_extracted_transaction(&self, source_key: &str, data: &ExtractData) -> WalletResult<()> {
        if self
            .fail_tx
            .lock()
            .unwrap()
            .contains(&data.transaction.tx_id)
        {
            return Err(WalletError::Internal("observer rejected tx".into()));
        }
        if self.fail_keys.lock().unwrap().contains(source_key) {
            return Err(WalletError::Internal("observer rejected key".into()));
        }
        self.extracted
            .lock()
            .unwrap()
            .push((source_key.to_string(), data.clone()));
        Ok(())
    }
}
