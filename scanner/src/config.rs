// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::pipeline::DEFAULT_MAX_EXTRACTING_WORKERS;
use crate::tokens::{StaticTokenSource, TokenInfo, MAX_TOKEN_DECIMALS};
use crate::transaction::FeesSupport;
use anyhow::anyhow;
use multiasset_scanner_config::Config;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ScannerNodeConfig {
    /// Chain symbol, used as store key, log prefix and metric label
    pub symbol: String,
    #[serde(default = "default_max_extracting_workers")]
    pub max_extracting_workers: usize,
    /// Heights below the cursor rescanned after every cycle
    #[serde(default)]
    pub rescan_last_block_count: u64,
    /// How far a fork rolls the cursor back (at least 2)
    #[serde(default = "default_rollback_depth")]
    pub rollback_depth: u64,
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
    /// Flat fee per transaction in raw units of the fee asset
    pub fixed_fee: u64,
    pub fee_asset_id: String,
    #[serde(default)]
    pub fees_support: FeesSupportConfig,
    pub tokens: Vec<TokenInfo>,
    /// Hex encoded pallet and call index of the asset transfer call
    #[serde(default = "default_transfer_call_index")]
    pub transfer_call_index: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FeesSupportConfig {
    /// Multiplier of the flat fee sent to a sponsored address
    #[serde(default)]
    pub fees_support_scale: Decimal,
    /// Fixed raw amount sent to a sponsored address, wins over the scale
    #[serde(default)]
    pub fix_support_amount: u64,
}

impl Config for ScannerNodeConfig {}

fn default_max_extracting_workers() -> usize {
    DEFAULT_MAX_EXTRACTING_WORKERS
}

fn default_rollback_depth() -> u64 {
    2
}

fn default_scan_interval_secs() -> u64 {
    10
}

fn default_transfer_call_index() -> String {
    "0401".to_string()
}

impl ScannerNodeConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.symbol.is_empty() {
            return Err(anyhow!("symbol must not be empty"));
        }
        if self.max_extracting_workers == 0 {
            return Err(anyhow!("max-extracting-workers must be greater than 0"));
        }
        if self.rollback_depth < 2 {
            return Err(anyhow!(
                "rollback-depth must be at least 2, got {}",
                self.rollback_depth
            ));
        }
        if self.scan_interval_secs == 0 {
            return Err(anyhow!("scan-interval-secs must be greater than 0"));
        }
        let mut seen = HashSet::new();
        for token in &self.tokens {
            if token.asset_id.parse::<u64>().is_err() {
                return Err(anyhow!("asset id {} is not numeric", token.asset_id));
            }
            if token.decimals > MAX_TOKEN_DECIMALS {
                return Err(anyhow!(
                    "asset {} has {} decimals, max is {}",
                    token.asset_id,
                    token.decimals,
                    MAX_TOKEN_DECIMALS
                ));
            }
            if !seen.insert(token.asset_id.as_str()) {
                return Err(anyhow!("asset {} configured twice", token.asset_id));
            }
        }
        if !seen.contains(self.fee_asset_id.as_str()) {
            return Err(anyhow!(
                "fee asset {} is not among the configured tokens",
                self.fee_asset_id
            ));
        }
        if self.fees_support.fees_support_scale.is_sign_negative() {
            return Err(anyhow!("fees-support-scale must not be negative"));
        }
        self.call_index()?;
        Ok(())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn call_index(&self) -> anyhow::Result<[u8; 2]> {
        let bytes = hex::decode(self.transfer_call_index.trim_start_matches("0x"))?;
        bytes
            .try_into()
            .map_err(|b: Vec<u8>| anyhow!("transfer-call-index must be 2 bytes, got {}", b.len()))
    }

    pub fn token_source(&self) -> StaticTokenSource {
        StaticTokenSource::new(self.tokens.clone())
    }

    pub fn fees_support(&self) -> FeesSupport {
        FeesSupport {
            scale: self.fees_support.fees_support_scale,
            fixed_amount: self.fees_support.fix_support_amount as u128,
        }
    }
}
