// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Access to the chain node.

use crate::error::WalletResult;
use crate::types::{AddrBalance, Block, RuntimeVersion};

/// Read and submit operations against a chain node.
///
/// Implementations wrap an RPC client. Transport failures should be returned
/// as [`crate::error::WalletError::ChainSource`] so the scanner treats them
/// as transient.
#[async_trait::async_trait]
pub trait ChainSource: Send + Sync {
    /// Current best block height
    async fn chain_height(&self) -> WalletResult<u64>;

    async fn block_by_height(&self, height: u64) -> WalletResult<Block>;

    /// Balance of one asset for one address. The nonce is the account nonce.
    async fn address_balance(&self, address: &str, asset_id: &str) -> WalletResult<AddrBalance>;

    /// Broadcast a signed, hex encoded extrinsic. Returns the transaction id.
    async fn submit_transaction(&self, raw_hex: &str) -> WalletResult<String>;

    async fn genesis_hash(&self) -> WalletResult<String>;

    async fn runtime_version(&self) -> WalletResult<RuntimeVersion>;
}
