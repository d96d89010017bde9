// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Chain data shared by the scanner, the extractor and the builder.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

/// Keccak-256 over the given parts joined by `_`, hex encoded.
pub(crate) fn keccak_hex(parts: &[&str]) -> String {
    let mut hasher = Keccak256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(b"_");
        }
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// One side of a transfer: who, how much (raw integer units) and which asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLeg {
    pub address: String,
    pub amount: u128,
    pub asset_id: String,
}

impl TransferLeg {
    pub fn new(address: impl Into<String>, amount: u128, asset_id: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            amount,
            asset_id: asset_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TxStatus {
    #[default]
    Success,
    Failed,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Success => "1",
            TxStatus::Failed => "0",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub tx_id: String,
    pub timestamp: u64,
    /// Zero when the node did not report it; the extractor fills it in.
    pub block_height: u64,
    pub block_hash: String,
    pub status: TxStatus,
    pub from_legs: Vec<TransferLeg>,
    pub to_legs: Vec<TransferLeg>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub hash: String,
    pub prev_hash: String,
    pub height: u64,
    pub timestamp: u64,
    pub finalized: bool,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn header(&self, symbol: &str) -> BlockHeader {
        BlockHeader {
            hash: self.hash.clone(),
            prev_hash: self.prev_hash.clone(),
            height: self.height,
            timestamp: self.timestamp,
            fork: false,
            symbol: symbol.to_string(),
        }
    }
}

/// Block identity used for the scan cursor and new-block notifications.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockHeader {
    pub hash: String,
    pub prev_hash: String,
    pub height: u64,
    pub timestamp: u64,
    pub fork: bool,
    pub symbol: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AddrBalance {
    pub address: String,
    pub asset_id: String,
    pub free: u128,
    pub frozen: u128,
    pub total: u128,
    pub nonce: u64,
    pub active: bool,
}

impl AddrBalance {
    pub fn new(address: impl Into<String>, asset_id: impl Into<String>, free: u128, nonce: u64) -> Self {
        Self {
            address: address.into(),
            asset_id: asset_id.into(),
            free,
            frozen: 0,
            total: free,
            nonce,
            active: true,
        }
    }
}

/// Balance of one asset held by an address, in token units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBalance {
    pub address: String,
    pub asset_id: String,
    pub symbol: String,
    pub free: Decimal,
    pub frozen: Decimal,
    pub total: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RuntimeVersion {
    pub spec_version: u32,
    pub transaction_version: u32,
}

/// A block or transaction that has to be scanned again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnscannedRecord {
    pub id: String,
    pub block_height: u64,
    pub tx_id: Option<String>,
    pub reason: String,
    pub symbol: String,
}

impl UnscannedRecord {
    pub fn new(block_height: u64, tx_id: Option<&str>, reason: impl Into<String>, symbol: &str) -> Self {
        let height = block_height.to_string();
        let id = keccak_hex(&[&height, tx_id.unwrap_or_default(), symbol]);
        Self {
            id,
            block_height,
            tx_id: tx_id.map(str::to_string),
            reason: reason.into(),
            symbol: symbol.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unscanned_record_id_is_deterministic() {
        let a = UnscannedRecord::new(10, Some("0xabc"), "timeout", "CENNZ");
        let b = UnscannedRecord::new(10, Some("0xabc"), "another reason", "CENNZ");
        let c = UnscannedRecord::new(10, None, "timeout", "CENNZ");
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert_eq!(a.id.len(), 64);
    }

    #[test]
    fn test_block_header() {
        let block = Block {
            hash: "0x02".into(),
            prev_hash: "0x01".into(),
            height: 2,
            timestamp: 1_600_000_000,
            finalized: true,
            transactions: vec![],
        };
        let header = block.header("CENNZ");
        assert_eq!(header.height, 2);
        assert_eq!(header.prev_hash, "0x01");
        assert!(!header.fork);
        assert_eq!(header.symbol, "CENNZ");
    }
}
