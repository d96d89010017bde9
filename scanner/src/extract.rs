// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-transaction multi-asset extraction
//!
//! A transaction carries ordered outbound and inbound legs, each naming an
//! asset. Extraction groups the legs by asset symbol and, for the addresses
//! the wallet tracks, by source key. Every (symbol, source key) pair gets
//! its input records, output records and one summary.
//!
//! Extraction is a pure function of the transaction, the token snapshot and
//! the address filter, apart from the record creation time.

use crate::error::{WalletError, WalletResult};
use crate::observer::AddressFilter;
use crate::tokens::{TokenInfo, TokenSnapshot};
use crate::types::{keccak_hex, Transaction, TxStatus};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    /// Chain symbol
    pub symbol: String,
    pub is_contract: bool,
    pub contract_id: String,
    pub asset_id: String,
    /// Token symbol
    pub token: String,
    pub name: String,
    pub decimals: u32,
}

impl Coin {
    pub fn for_token(chain: &str, token: &TokenInfo) -> Self {
        Self {
            symbol: chain.to_string(),
            is_contract: true,
            contract_id: token.contract_id(chain),
            asset_id: token.asset_id.clone(),
            token: token.symbol.clone(),
            name: token.name.clone(),
            decimals: token.decimals,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub tx_id: String,
    pub source_tx_id: String,
    pub source_index: u64,
    pub index: u64,
    pub address: String,
    /// Raw integer amount
    pub amount: u128,
    pub coin: Coin,
    pub sid: String,
    pub create_at: u64,
    pub block_height: u64,
    pub block_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub tx_id: String,
    pub index: u64,
    pub address: String,
    pub amount: u128,
    pub coin: Coin,
    pub sid: String,
    pub create_at: u64,
    pub block_height: u64,
    pub block_hash: String,
}

/// Wallet-facing summary of one transaction for one asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxSummary {
    /// `address:rawAmount` for every outbound leg of this asset
    pub from: Vec<String>,
    /// `address:rawAmount` for every inbound leg of this asset
    pub to: Vec<String>,
    pub fees: Decimal,
    pub coin: Coin,
    pub block_hash: String,
    pub block_height: u64,
    pub tx_id: String,
    pub decimals: u32,
    pub confirm_time: u64,
    pub status: TxStatus,
    pub wx_id: String,
}

impl TxSummary {
    /// Fingerprint over the normalized summary fields.
    pub fn fingerprint(&self) -> String {
        let height = self.block_height.to_string();
        let decimals = self.decimals.to_string();
        let fees = self.fees.normalize().to_string();
        let from = self.from.join(",");
        let to = self.to.join(",");
        keccak_hex(&[
            &self.tx_id,
            &self.coin.symbol,
            &self.coin.contract_id,
            &from,
            &to,
            &fees,
            &height,
            &self.block_hash,
            &decimals,
            self.status.as_str(),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractData {
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub transaction: TxSummary,
}

/// Outcome of extracting one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtractResult {
    pub tx_id: String,
    pub block_height: u64,
    pub block_hash: String,
    pub block_time: u64,
    pub success: bool,
    /// token symbol -> source key -> data
    pub data: BTreeMap<String, BTreeMap<String, ExtractData>>,
}

impl ExtractResult {
    pub fn failed(tx_id: &str, block_height: u64, block_hash: &str) -> Self {
        Self {
            tx_id: tx_id.to_string(),
            block_height,
            block_hash: block_hash.to_string(),
            success: false,
            ..Default::default()
        }
    }

    /// Number of (symbol, source key) entries
    pub fn entry_count(&self) -> usize {
        self.data.values().map(|m| m.len()).sum()
    }
}

type Grouped<T> = BTreeMap<String, BTreeMap<String, Vec<T>>>;

struct LegScan<T> {
    records: Grouped<T>,
    // token symbol -> "address:amount"
    parties: HashMap<String, Vec<String>>,
    // asset id -> decimal total
    totals: HashMap<String, Decimal>,
    // token symbol -> token
    tokens: HashMap<String, TokenInfo>,
}

/// Everything a summary needs besides the transaction itself.
struct SummaryParts<'a> {
    from: &'a HashMap<String, Vec<String>>,
    to: &'a HashMap<String, Vec<String>>,
    spent: &'a HashMap<String, Decimal>,
    received: &'a HashMap<String, Decimal>,
    tokens: HashMap<String, TokenInfo>,
    snapshot: &'a TokenSnapshot,
}

impl<'a> SummaryParts<'a> {
    fn new<I, O>(snapshot: &'a TokenSnapshot, inputs: &'a LegScan<I>, outputs: &'a LegScan<O>) -> Self {
        let mut tokens = inputs.tokens.clone();
        tokens.extend(outputs.tokens.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self {
            from: &inputs.parties,
            to: &outputs.parties,
            spent: &inputs.totals,
            received: &outputs.totals,
            tokens,
            snapshot,
        }
    }

    /// Spent minus received for the fee asset, zero for every other asset.
    fn fees(&self, token: &TokenInfo) -> Decimal {
        if !self.snapshot.is_fee_asset(&token.asset_id) {
            return Decimal::ZERO;
        }
        let spent = self.spent.get(&token.asset_id).copied().unwrap_or_default();
        let received = self.received.get(&token.asset_id).copied().unwrap_or_default();
        spent - received
    }
}

/// Extracts wallet records from transactions of one chain.
#[derive(Clone)]
pub struct TransactionExtractor {
    symbol: String,
    snapshot: Arc<TokenSnapshot>,
    filter: Arc<dyn AddressFilter>,
}

impl TransactionExtractor {
    pub fn new(symbol: &str, snapshot: Arc<TokenSnapshot>, filter: Arc<dyn AddressFilter>) -> Self {
        Self {
            symbol: symbol.to_string(),
            snapshot,
            filter,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn extract(&self, block_height: u64, block_hash: &str, mut tx: Transaction) -> ExtractResult {
        if tx.tx_id.is_empty() {
            error!(
                "[{}] Transaction without id at block {}",
                self.symbol, block_height
            );
            return ExtractResult::failed("", block_height, block_hash);
        }
        // Fill in the block context when the node left it out
        if block_height > 0 && tx.block_height == 0 {
            tx.block_height = block_height;
            tx.block_hash = block_hash.to_string();
        }

        let mut result = ExtractResult {
            tx_id: tx.tx_id.clone(),
            block_height: tx.block_height,
            block_hash: tx.block_hash.clone(),
            block_time: tx.timestamp,
            success: true,
            data: BTreeMap::new(),
        };

        let create_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        let inputs = self.scan_legs(&tx, &tx.from_legs, |i, addr, amount, coin| TxInput {
            tx_id: tx.tx_id.clone(),
            source_tx_id: tx.tx_id.clone(),
            source_index: i,
            index: i,
            address: addr.to_string(),
            amount,
            sid: keccak_hex(&[&tx.tx_id, &self.symbol, &coin.contract_id, "in", &i.to_string()]),
            coin,
            create_at,
            block_height: tx.block_height,
            block_hash: tx.block_hash.clone(),
        });
        let outputs = self.scan_legs(&tx, &tx.to_legs, |i, addr, amount, coin| TxOutput {
            tx_id: tx.tx_id.clone(),
            index: i,
            address: addr.to_string(),
            amount,
            sid: keccak_hex(&[&tx.tx_id, &self.symbol, &coin.contract_id, "out", &i.to_string()]),
            coin,
            create_at,
            block_height: tx.block_height,
            block_hash: tx.block_hash.clone(),
        });
        let (mut inputs, mut outputs) = match (inputs, outputs) {
            (Ok(inputs), Ok(outputs)) => (inputs, outputs),
            (Err(e), _) | (_, Err(e)) => {
                error!("[{}] Cannot extract tx {}: {}", self.symbol, tx.tx_id, e);
                return ExtractResult::failed(&tx.tx_id, result.block_height, &result.block_hash);
            }
        };

        let input_records = std::mem::take(&mut inputs.records);
        let output_records = std::mem::take(&mut outputs.records);
        let parts = SummaryParts::new(&self.snapshot, &inputs, &outputs);
        for (token, by_key) in input_records {
            for (source_key, records) in by_key {
                if let Some(data) = self.entry(&mut result, &tx, &parts, &token, &source_key) {
                    data.inputs = records;
                }
            }
        }
        for (token, by_key) in output_records {
            for (source_key, records) in by_key {
                if let Some(data) = self.entry(&mut result, &tx, &parts, &token, &source_key) {
                    data.outputs = records;
                }
            }
        }

        debug!(
            "[{}] Extracted tx {} at block {}: {} entries",
            self.symbol,
            result.tx_id,
            result.block_height,
            result.entry_count()
        );
        result
    }

    /// Classify every leg of one side. Records are only built for tracked
    /// addresses, but every valid leg counts toward parties and totals.
    fn scan_legs<T>(
        &self,
        tx: &Transaction,
        legs: &[crate::types::TransferLeg],
        mut make: impl FnMut(u64, &str, u128, Coin) -> T,
    ) -> WalletResult<LegScan<T>> {
        let mut scan = LegScan {
            records: BTreeMap::new(),
            parties: HashMap::new(),
            totals: HashMap::new(),
            tokens: HashMap::new(),
        };
        for (i, leg) in legs.iter().enumerate() {
            if leg.asset_id.parse::<u64>().is_err() {
                error!(
                    "[{}] Wrong asset id {} in tx {}",
                    self.symbol, leg.asset_id, tx.tx_id
                );
                continue;
            }
            let Some(token) = self.snapshot.get(&leg.asset_id) else {
                error!(
                    "[{}] Unknown asset id {} in tx {}",
                    self.symbol, leg.asset_id, tx.tx_id
                );
                continue;
            };
            let amount = match token.to_decimal(leg.amount) {
                Ok(amount) => amount,
                Err(e) => {
                    error!("[{}] Skipping leg {} of tx {}: {}", self.symbol, i, tx.tx_id, e);
                    continue;
                }
            };

            if let Some(source_key) = self.filter.is_tracked(&leg.address) {
                let coin = Coin::for_token(&self.symbol, token);
                scan.records
                    .entry(token.symbol.clone())
                    .or_default()
                    .entry(source_key)
                    .or_default()
                    .push(make(i as u64, &leg.address, leg.amount, coin));
            }
            scan.parties
                .entry(token.symbol.clone())
                .or_default()
                .push(format!("{}:{}", leg.address, leg.amount));
            let total = scan.totals.entry(token.asset_id.clone()).or_default();
            *total = total.checked_add(amount).ok_or_else(|| {
                WalletError::InvalidAmount(format!(
                    "total of asset {} in tx {} overflows",
                    token.asset_id, tx.tx_id
                ))
            })?;
            scan.tokens
                .entry(token.symbol.clone())
                .or_insert_with(|| token.clone());
        }
        Ok(scan)
    }

    /// Get or create the data entry for (token symbol, source key). The
    /// summary and its fingerprint are built once, on first touch.
    fn entry<'a>(
        &self,
        result: &'a mut ExtractResult,
        tx: &Transaction,
        parts: &SummaryParts,
        token_symbol: &str,
        source_key: &str,
    ) -> Option<&'a mut ExtractData> {
        let token = parts.tokens.get(token_symbol)?;
        let by_key = result.data.entry(token_symbol.to_string()).or_default();
        let data = by_key.entry(source_key.to_string()).or_insert_with(|| {
            let mut summary = TxSummary {
                from: parts.from.get(token_symbol).cloned().unwrap_or_default(),
                to: parts.to.get(token_symbol).cloned().unwrap_or_default(),
                fees: parts.fees(token),
                coin: Coin::for_token(&self.symbol, token),
                block_hash: tx.block_hash.clone(),
                block_height: tx.block_height,
                tx_id: tx.tx_id.clone(),
                decimals: token.decimals,
                confirm_time: tx.timestamp,
                status: tx.status,
                wx_id: String::new(),
            };
            summary.wx_id = summary.fingerprint();
            ExtractData {
                inputs: Vec::new(),
                outputs: Vec::new(),
                transaction: summary,
            }
        });
        Some(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::AddressBook;
    use crate::test_utils::{cennz_tokens, make_tx};
    use crate::types::TransferLeg;
    use std::str::FromStr;

    fn extractor(tracked: &[(&str, &str)]) -> TransactionExtractor {
        let book: AddressBook = tracked.iter().copied().collect();
        TransactionExtractor::new("CENNZ", cennz_tokens(), Arc::new(book))
    }

    #[test]
    fn test_single_asset_transfer_tracked_sender() {
        let ex = extractor(&[("X", "acct-x")]);
        let tx = make_tx(
            "0xaa",
            vec![TransferLeg::new("X", 20000, "2")],
            vec![TransferLeg::new("Y", 20000, "2")],
        );
        let result = ex.extract(10, "0x10", tx);
        assert!(result.success);
        assert_eq!(result.entry_count(), 1);

        let data = &result.data["CPAY"]["acct-x"];
        assert_eq!(data.inputs.len(), 1);
        assert!(data.outputs.is_empty());
        let input = &data.inputs[0];
        assert_eq!(input.address, "X");
        assert_eq!(input.amount, 20000);
        assert_eq!(input.block_height, 10);
        assert_eq!(input.block_hash, "0x10");
        assert_eq!(input.coin.asset_id, "2");
        assert_eq!(input.coin.contract_id, cennz_tokens().get("2").unwrap().contract_id("CENNZ"));

        let summary = &data.transaction;
        assert_eq!(summary.from, vec!["X:20000".to_string()]);
        assert_eq!(summary.to, vec!["Y:20000".to_string()]);
        assert_eq!(summary.decimals, 4);
        assert_eq!(summary.fees, Decimal::ZERO);
        assert_eq!(summary.wx_id, summary.fingerprint());
    }

    #[test]
    fn test_fee_only_for_fee_asset() {
        let ex = extractor(&[("X", "acct-x")]);
        // 105 CPAY out, 100 CPAY in; same for CENNZ
        let tx = make_tx(
            "0xbb",
            vec![
                TransferLeg::new("X", 1_050_000, "2"),
                TransferLeg::new("X", 1_050_000, "1"),
            ],
            vec![
                TransferLeg::new("Y", 1_000_000, "2"),
                TransferLeg::new("Y", 1_000_000, "1"),
            ],
        );
        let result = ex.extract(3, "0x03", tx);
        assert_eq!(result.data["CPAY"]["acct-x"].transaction.fees, Decimal::from(5));
        assert_eq!(result.data["CENNZ"]["acct-x"].transaction.fees, Decimal::ZERO);
    }

    #[test]
    fn test_output_only_summary_gets_fee_rule() {
        let ex = extractor(&[("Y", "acct-y")]);
        let tx = make_tx(
            "0xcc",
            vec![TransferLeg::new("X", 1_050_000, "2")],
            vec![TransferLeg::new("Y", 1_000_000, "2")],
        );
        let result = ex.extract(3, "0x03", tx);
        let data = &result.data["CPAY"]["acct-y"];
        assert!(data.inputs.is_empty());
        assert_eq!(data.outputs.len(), 1);
        assert_eq!(data.transaction.fees, Decimal::from(5));
    }

    #[test]
    fn test_sender_and_receiver_share_one_summary() {
        let ex = extractor(&[("X", "acct"), ("Y", "acct")]);
        let tx = make_tx(
            "0xdd",
            vec![TransferLeg::new("X", 5, "1")],
            vec![TransferLeg::new("Y", 5, "1")],
        );
        let result = ex.extract(4, "0x04", tx);
        assert_eq!(result.entry_count(), 1);
        let data = &result.data["CENNZ"]["acct"];
        assert_eq!(data.inputs.len(), 1);
        assert_eq!(data.outputs.len(), 1);
        assert_ne!(data.inputs[0].sid, data.outputs[0].sid);
    }

    #[test]
    fn test_unknown_and_malformed_assets_are_skipped() {
        let ex = extractor(&[("X", "acct-x")]);
        let tx = make_tx(
            "0xee",
            vec![
                TransferLeg::new("X", 1, "not-a-number"),
                TransferLeg::new("X", 1, "999"),
                TransferLeg::new("X", 7, "1"),
            ],
            vec![],
        );
        let result = ex.extract(5, "0x05", tx);
        assert!(result.success);
        assert_eq!(result.entry_count(), 1);
        let data = &result.data["CENNZ"]["acct-x"];
        assert_eq!(data.inputs.len(), 1);
        // Index follows the leg position in the transaction
        assert_eq!(data.inputs[0].index, 2);
        assert_eq!(data.transaction.from, vec!["X:7".to_string()]);
    }

    #[test]
    fn test_untracked_transaction_yields_nothing() {
        let ex = extractor(&[]);
        let tx = make_tx(
            "0xff",
            vec![TransferLeg::new("X", 1, "1")],
            vec![TransferLeg::new("Y", 1, "1")],
        );
        let result = ex.extract(5, "0x05", tx);
        assert!(result.success);
        assert!(result.data.is_empty());
    }

    #[test]
    fn test_fingerprint_is_stable_across_extractions() {
        let ex = extractor(&[("X", "acct-x")]);
        let tx = make_tx(
            "0x11",
            vec![TransferLeg::new("X", 12345, "2")],
            vec![TransferLeg::new("Y", 12000, "2")],
        );
        let first = ex.extract(8, "0x08", tx.clone());
        let second = ex.extract(8, "0x08", tx.clone());
        let a = &first.data["CPAY"]["acct-x"].transaction;
        let b = &second.data["CPAY"]["acct-x"].transaction;
        assert_eq!(a.wx_id, b.wx_id);
        assert_eq!(a.fees, Decimal::from_str("0.0345").unwrap());

        let moved = ex.extract(8, "0x08-other", tx);
        assert_ne!(moved.data["CPAY"]["acct-x"].transaction.wx_id, a.wx_id);
    }

    #[test]
    fn test_reported_block_context_is_kept() {
        let ex = extractor(&[("X", "acct-x")]);
        let mut tx = make_tx("0x12", vec![TransferLeg::new("X", 1, "1")], vec![]);
        tx.block_height = 42;
        tx.block_hash = "0x42".into();
        let result = ex.extract(43, "0x43", tx);
        assert_eq!(result.block_height, 42);
        assert_eq!(result.data["CENNZ"]["acct-x"].inputs[0].block_hash, "0x42");
    }

    #[test]
    fn test_overflowing_total_fails_transaction() {
        let tokens = TokenSnapshot::new(
            vec![TokenInfo::new("1", "BIG", 0), TokenInfo::new("2", "CPAY", 4)],
            "2",
        )
        .unwrap();
        let book: AddressBook = [("X", "acct-x")].into_iter().collect();
        let ex = TransactionExtractor::new("CENNZ", Arc::new(tokens), Arc::new(book));
        let huge = 50_000_000_000_000_000_000_000_000_000u128;
        let tx = make_tx(
            "0x13",
            vec![TransferLeg::new("X", huge, "1"), TransferLeg::new("X", huge, "1")],
            vec![],
        );

        let result = ex.extract(5, "0x05", tx);
        assert!(!result.success);
        assert_eq!(result.tx_id, "0x13");
        assert!(result.data.is_empty());
    }

    #[test]
    fn test_missing_tx_id_fails() {
        let ex = extractor(&[]);
        let tx = make_tx("", vec![], vec![]);
        let result = ex.extract(1, "0x01", tx);
        assert!(!result.success);
    }
}
