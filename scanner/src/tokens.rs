// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Token registry
//!
//! Asset metadata is loaded through a [`TokenSource`] and published as an
//! immutable [`TokenSnapshot`]. The scanner refreshes the registry at the
//! start of every height iteration; extraction tasks hold on to the snapshot
//! they were started with, so a refresh never changes a batch in flight.

use crate::error::{WalletError, WalletResult};
use crate::types::keccak_hex;
use arc_swap::ArcSwap;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Largest scale `rust_decimal` can represent
pub const MAX_TOKEN_DECIMALS: u32 = 28;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TokenInfo {
    pub asset_id: String,
    pub symbol: String,
    #[serde(default)]
    pub name: String,
    pub decimals: u32,
}

impl TokenInfo {
    pub fn new(asset_id: &str, symbol: &str, decimals: u32) -> Self {
        Self {
            asset_id: asset_id.to_string(),
            symbol: symbol.to_string(),
            name: symbol.to_string(),
            decimals,
        }
    }

    /// Deterministic contract id for this asset on the `chain` symbol.
    pub fn contract_id(&self, chain: &str) -> String {
        keccak_hex(&[chain, &self.asset_id])
    }

    /// Shift a raw integer amount by the asset's decimals.
    pub fn to_decimal(&self, raw: u128) -> WalletResult<Decimal> {
        let mantissa = i128::try_from(raw)
            .map_err(|_| WalletError::InvalidAmount(format!("{raw} does not fit")))?;
        Decimal::try_from_i128_with_scale(mantissa, self.decimals)
            .map_err(|e| WalletError::InvalidAmount(format!("{raw}: {e}")))
    }

    /// Convert a decimal amount back to raw units, truncating extra precision.
    pub fn to_raw(&self, amount: Decimal) -> WalletResult<u128> {
        if amount.is_sign_negative() {
            return Err(WalletError::InvalidAmount(format!("negative amount {amount}")));
        }
        let factor = Decimal::from_i128_with_scale(10i128.pow(self.decimals), 0);
        amount
            .checked_mul(factor)
            .and_then(|v| v.trunc().to_u128())
            .ok_or_else(|| WalletError::InvalidAmount(format!("{amount} overflows")))
    }
}

/// Immutable view of the known assets.
#[derive(Debug, Clone, Default)]
pub struct TokenSnapshot {
    tokens: HashMap<String, TokenInfo>,
    fee_asset_id: String,
}

impl TokenSnapshot {
    pub fn new(tokens: Vec<TokenInfo>, fee_asset_id: &str) -> WalletResult<Self> {
        let tokens: HashMap<_, _> = tokens
            .into_iter()
            .map(|t| (t.asset_id.clone(), t))
            .collect();
        if let Some(bad) = tokens.values().find(|t| t.decimals > MAX_TOKEN_DECIMALS) {
            return Err(WalletError::TokenRegistry(format!(
                "asset {} has {} decimals",
                bad.asset_id, bad.decimals
            )));
        }
        if !tokens.contains_key(fee_asset_id) {
            return Err(WalletError::TokenRegistry(format!(
                "fee asset {fee_asset_id} is not a known token"
            )));
        }
        Ok(Self {
            tokens,
            fee_asset_id: fee_asset_id.to_string(),
        })
    }

    pub fn get(&self, asset_id: &str) -> Option<&TokenInfo> {
        self.tokens.get(asset_id)
    }

    pub fn fee_token(&self) -> Option<&TokenInfo> {
        self.tokens.get(&self.fee_asset_id)
    }

    pub fn is_fee_asset(&self, asset_id: &str) -> bool {
        self.fee_asset_id == asset_id
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Where token metadata comes from (chain query, config file, ...).
#[async_trait::async_trait]
pub trait TokenSource: Send + Sync {
    async fn load_tokens(&self) -> WalletResult<Vec<TokenInfo>>;
}

/// Fixed token list, usually from the node config.
pub struct StaticTokenSource {
    tokens: Vec<TokenInfo>,
}

impl StaticTokenSource {
    pub fn new(tokens: Vec<TokenInfo>) -> Self {
        Self { tokens }
    }
}

#[async_trait::async_trait]
impl TokenSource for StaticTokenSource {
    async fn load_tokens(&self) -> WalletResult<Vec<TokenInfo>> {
        Ok(self.tokens.clone())
    }
}

pub struct TokenRegistry {
    symbol: String,
    fee_asset_id: String,
    source: Arc<dyn TokenSource>,
    snapshot: ArcSwap<TokenSnapshot>,
}

impl TokenRegistry {
    pub fn new(symbol: &str, fee_asset_id: &str, source: Arc<dyn TokenSource>) -> Self {
        Self {
            symbol: symbol.to_string(),
            fee_asset_id: fee_asset_id.to_string(),
            source,
            snapshot: ArcSwap::from_pointee(TokenSnapshot::default()),
        }
    }

    /// Reload from the source and publish a new snapshot.
    ///
    /// On error the previous snapshot stays in place.
    pub async fn refresh(&self) -> WalletResult<Arc<TokenSnapshot>> {
        let tokens = self.source.load_tokens().await?;
        let snapshot = Arc::new(TokenSnapshot::new(tokens, &self.fee_asset_id)?);
        debug!(
            "[{}] Token registry refreshed with {} assets",
            self.symbol,
            snapshot.len()
        );
        self.snapshot.store(snapshot.clone());
        Ok(snapshot)
    }

    pub fn snapshot(&self) -> Arc<TokenSnapshot> {
        self.snapshot.load_full()
    }

    /// Fee token of the current snapshot
    pub fn fee_token(&self) -> WalletResult<TokenInfo> {
        self.snapshot()
            .fee_token()
            .cloned()
            .ok_or_else(|| WalletError::TokenRegistry("token registry not loaded".into()))
    }

    /// Token of `asset_id`, refreshing once when the snapshot does not know it.
    pub async fn token(&self, asset_id: &str) -> WalletResult<TokenInfo> {
        if let Some(token) = self.snapshot().get(asset_id) {
            return Ok(token.clone());
        }
        self.refresh()
            .await?
            .get(asset_id)
            .cloned()
            .ok_or_else(|| WalletError::TokenRegistry(format!("unknown asset id {asset_id}")))
    }

    pub fn fee_asset_id(&self) -> &str {
        &self.fee_asset_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use std::sync::Mutex;

    struct SwitchingSource {
        tokens: Mutex<Vec<TokenInfo>>,
    }

    #[async_trait::async_trait]
    impl TokenSource for SwitchingSource {
        async fn load_tokens(&self) -> WalletResult<Vec<TokenInfo>> {
            Ok(self.tokens.lock().unwrap().clone())
        }
    }

    #[test]
    fn test_decimal_conversion() {
        let cpay = TokenInfo::new("2", "CPAY", 4);
        assert_eq!(cpay.to_decimal(20000).unwrap(), Decimal::from(2));
        assert_eq!(
            cpay.to_decimal(12345).unwrap(),
            Decimal::from_str("1.2345").unwrap()
        );
        assert_eq!(cpay.to_raw(Decimal::from_str("1.23456").unwrap()).unwrap(), 12345);
        assert!(cpay.to_raw(Decimal::from(-1)).is_err());
        assert!(cpay.to_decimal(u128::MAX).is_err());
    }

    #[test]
    fn test_snapshot_requires_fee_asset() {
        let err = TokenSnapshot::new(vec![TokenInfo::new("1", "CENNZ", 4)], "2").unwrap_err();
        assert_eq!(err.error_type(), "token_registry");
    }

    #[tokio::test]
    async fn test_refresh_keeps_old_snapshot_on_error() {
        let source = Arc::new(SwitchingSource {
            tokens: Mutex::new(vec![
                TokenInfo::new("1", "CENNZ", 4),
                TokenInfo::new("2", "CPAY", 4),
            ]),
        });
        let registry = TokenRegistry::new("CENNZ", "2", source.clone());
        assert!(registry.fee_token().is_err());

        let first = registry.refresh().await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(registry.fee_token().unwrap().symbol, "CPAY");

        // Fee asset dropped by the source: refresh fails, snapshot survives
        *source.tokens.lock().unwrap() = vec![TokenInfo::new("1", "CENNZ", 4)];
        assert!(registry.refresh().await.is_err());
        assert_eq!(registry.snapshot().len(), 2);

        *source.tokens.lock().unwrap() = vec![
            TokenInfo::new("1", "CENNZ", 4),
            TokenInfo::new("2", "CPAY", 4),
            TokenInfo::new("16000", "PLUG", 18),
        ];
        registry.refresh().await.unwrap();
        assert_eq!(registry.snapshot().len(), 3);
        // The old Arc handed out earlier is unchanged
        assert_eq!(first.len(), 2);
    }
}
