// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::chain::ChainSource;
use crate::error::WalletResult;
use crate::store::ScannerStore;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Reconciles the locally cached nonce of an address with the one reported
/// by the chain.
///
/// The cache runs ahead of the chain while submitted transactions are still
/// pending, so the larger of the two is used.
pub struct NonceManager {
    symbol: String,
    chain: Arc<dyn ChainSource>,
    store: Arc<dyn ScannerStore>,
    fee_asset_id: String,
}

impl NonceManager {
    pub fn new(
        symbol: &str,
        chain: Arc<dyn ChainSource>,
        store: Arc<dyn ScannerStore>,
        fee_asset_id: &str,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            chain,
            store,
            fee_asset_id: fee_asset_id.to_string(),
        }
    }

    pub async fn address_nonce(&self, address: &str) -> WalletResult<u64> {
        let chain_nonce = self
            .chain
            .address_balance(address, &self.fee_asset_id)
            .await?
            .nonce;
        let cached = match self.store.get_nonce(&self.symbol, address).await {
            Ok(nonce) => nonce.unwrap_or(0),
            Err(e) => {
                warn!("[{}] Cannot read cached nonce of {}: {}", self.symbol, address, e);
                0
            }
        };
        info!(
            "[{}] {} cached nonce: {}, chain nonce: {}",
            self.symbol, address, cached, chain_nonce
        );
        Ok(cached.max(chain_nonce))
    }

    /// A transaction signed with `nonce` was accepted by the node.
    pub async fn record_submitted(&self, address: &str, nonce: u64) {
        self.update(address, nonce.saturating_add(1)).await;
    }

    /// Submission failed. The cache is cleared so the next transaction
    /// follows the chain nonce.
    pub async fn record_failed(&self, address: &str) {
        self.update(address, 0).await;
    }

    async fn update(&self, address: &str, nonce: u64) {
        info!("[{}] {} set nonce {}", self.symbol, address, nonce);
        if let Err(e) = self.store.set_nonce(&self.symbol, address, nonce).await {
            error!("[{}] Cannot cache nonce of {}: {}", self.symbol, address, e);
        }
    }
}
