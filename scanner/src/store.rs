// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Scanner persistence: cursor, unscanned records, local block cache and
//! cached nonces.

use crate::error::WalletResult;
use crate::types::{Block, BlockHeader, UnscannedRecord};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::debug;

/// Storage used by the block scanner and the nonce manager.
///
/// Everything is keyed by chain symbol so one store can back several
/// scanners.
#[async_trait::async_trait]
pub trait ScannerStore: Send + Sync {
    async fn get_cursor(&self, symbol: &str) -> WalletResult<Option<BlockHeader>>;

    async fn save_cursor(&self, symbol: &str, header: &BlockHeader) -> WalletResult<()>;

    async fn save_unscanned(&self, record: UnscannedRecord) -> WalletResult<()>;

    async fn list_unscanned(&self, symbol: &str) -> WalletResult<Vec<UnscannedRecord>>;

    async fn delete_unscanned_by_height(&self, symbol: &str, height: u64) -> WalletResult<()>;

    async fn delete_unscanned_by_id(&self, symbol: &str, id: &str) -> WalletResult<()>;

    async fn get_local_block(&self, symbol: &str, height: u64) -> WalletResult<Option<Block>>;

    async fn save_local_block(&self, symbol: &str, block: &Block) -> WalletResult<()>;

    async fn get_nonce(&self, symbol: &str, address: &str) -> WalletResult<Option<u64>>;

    async fn set_nonce(&self, symbol: &str, address: &str, nonce: u64) -> WalletResult<()>;
}

#[derive(Default)]
struct SymbolData {
    cursor: Option<BlockHeader>,
    // id -> record
    unscanned: BTreeMap<String, UnscannedRecord>,
    blocks: BTreeMap<u64, Block>,
    nonces: HashMap<String, u64>,
}

/// In-memory [`ScannerStore`]. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<HashMap<String, SymbolData>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of locally cached blocks for `symbol`
    pub async fn local_block_count(&self, symbol: &str) -> usize {
        self.data
            .read()
            .await
            .get(symbol)
            .map(|d| d.blocks.len())
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl ScannerStore for MemoryStore {
    async fn get_cursor(&self, symbol: &str) -> WalletResult<Option<BlockHeader>> {
        Ok(self
            .data
            .read()
            .await
            .get(symbol)
            .and_then(|d| d.cursor.clone()))
    }

    async fn save_cursor(&self, symbol: &str, header: &BlockHeader) -> WalletResult<()> {
        let mut data = self.data.write().await;
        data.entry(symbol.to_string()).or_default().cursor = Some(header.clone());
        Ok(())
    }

    async fn save_unscanned(&self, record: UnscannedRecord) -> WalletResult<()> {
        debug!(
            "[{}] Save unscanned record: height={}, tx={:?}, reason={}",
            record.symbol, record.block_height, record.tx_id, record.reason
        );
        let mut data = self.data.write().await;
        data.entry(record.symbol.clone())
            .or_default()
            .unscanned
            .insert(record.id.clone(), record);
        Ok(())
    }

    async fn list_unscanned(&self, symbol: &str) -> WalletResult<Vec<UnscannedRecord>> {
        Ok(self
            .data
            .read()
            .await
            .get(symbol)
            .map(|d| d.unscanned.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_unscanned_by_height(&self, symbol: &str, height: u64) -> WalletResult<()> {
        if let Some(d) = self.data.write().await.get_mut(symbol) {
            d.unscanned.retain(|_, r| r.block_height != height);
        }
        Ok(())
    }

    async fn delete_unscanned_by_id(&self, symbol: &str, id: &str) -> WalletResult<()> {
        if let Some(d) = self.data.write().await.get_mut(symbol) {
            d.unscanned.remove(id);
        }
        Ok(())
    }

    async fn get_local_block(&self, symbol: &str, height: u64) -> WalletResult<Option<Block>> {
        Ok(self
            .data
            .read()
            .await
            .get(symbol)
            .and_then(|d| d.blocks.get(&height).cloned()))
    }

    async fn save_local_block(&self, symbol: &str, block: &Block) -> WalletResult<()> {
        let mut data = self.data.write().await;
        data.entry(symbol.to_string())
            .or_default()
            .blocks
            .insert(block.height, block.clone());
        Ok(())
    }

    async fn get_nonce(&self, symbol: &str, address: &str) -> WalletResult<Option<u64>> {
        Ok(self
            .data
            .read()
            .await
            .get(symbol)
            .and_then(|d| d.nonces.get(address).copied()))
    }

    async fn set_nonce(&self, symbol: &str, address: &str, nonce: u64) -> WalletResult<()> {
        let mut data = self.data.write().await;
        data.entry(symbol.to_string())
            .or_default()
            .nonces
            .insert(address.to_string(), nonce);
        Ok(())
    }
}
