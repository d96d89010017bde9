// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Raw transaction construction
//!
//! Funding addresses are picked smallest-sufficient first: wallet addresses
//! are sorted ascending by balance of the transferred asset and the first one
//! that covers the amount and the flat fee is used. Sweeps can pull in a
//! sponsor account that tops up the fee asset of addresses that cannot pay
//! their own fee.

use super::encoding::{CompactTransferEncoder, TransactionEncoder};
use super::nonce::NonceManager;
use super::types::{
    AssetsAccount, FeesSupport, KeySignature, RawTransaction, RawTransactionWithError,
    SummaryRequest, UnsignedTransfer, WalletAddress,
};
use crate::chain::ChainSource;
use crate::config::ScannerNodeConfig;
use crate::error::{WalletError, WalletResult};
use crate::extract::{Coin, TxSummary};
use crate::metrics::ScannerMetrics;
use crate::store::ScannerStore;
use crate::tokens::{TokenInfo, TokenRegistry};
use crate::types::{AddrBalance, TxStatus};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const KIND_TRANSFER: &str = "transfer";
const KIND_SUMMARY: &str = "summary";
const KIND_FEES_SUPPORT: &str = "fees_support";

/// Address chosen to fund a transfer.
struct Funding {
    address: WalletAddress,
    balance: u128,
    fee_balance: AddrBalance,
}

pub struct TransactionBuilder {
    symbol: String,
    chain: Arc<dyn ChainSource>,
    tokens: Arc<TokenRegistry>,
    nonces: NonceManager,
    encoder: Arc<dyn TransactionEncoder>,
    /// Flat fee in raw units of the fee asset
    fixed_fee: u128,
    fees_support: FeesSupport,
    metrics: Option<Arc<ScannerMetrics>>,
}

impl TransactionBuilder {
    pub fn new(
        symbol: &str,
        chain: Arc<dyn ChainSource>,
        store: Arc<dyn ScannerStore>,
        tokens: Arc<TokenRegistry>,
        fixed_fee: u128,
    ) -> Self {
        let nonces = NonceManager::new(symbol, chain.clone(), store, tokens.fee_asset_id());
        Self {
            symbol: symbol.to_string(),
            chain,
            tokens,
            nonces,
            encoder: Arc::new(CompactTransferEncoder::default()),
            fixed_fee,
            fees_support: FeesSupport::default(),
            metrics: None,
        }
    }

    pub fn from_config(
        config: &ScannerNodeConfig,
        chain: Arc<dyn ChainSource>,
        store: Arc<dyn ScannerStore>,
        tokens: Arc<TokenRegistry>,
    ) -> anyhow::Result<Self> {
        let encoder = CompactTransferEncoder::new(config.call_index()?);
        Ok(
            Self::new(&config.symbol, chain, store, tokens, config.fixed_fee as u128)
                .with_encoder(Arc::new(encoder))
                .with_fees_support(config.fees_support()),
        )
    }

    pub fn with_encoder(mut self, encoder: Arc<dyn TransactionEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn with_fees_support(mut self, fees_support: FeesSupport) -> Self {
        self.fees_support = fees_support;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<ScannerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn nonce_manager(&self) -> &NonceManager {
        &self.nonces
    }

    /// The flat fee in units of the fee asset.
    pub async fn fee_rate(&self) -> WalletResult<Decimal> {
        self.fee_token().await?.to_decimal(self.fixed_fee)
    }

    /// Build a transfer of `raw_tx.coin` to its destination.
    pub async fn create_raw_transaction(&self, raw_tx: &mut RawTransaction) -> WalletResult<()> {
        let result = self.select_and_build(raw_tx).await;
        self.record_built(KIND_TRANSFER, &result);
        result
    }

    async fn select_and_build(&self, raw_tx: &mut RawTransaction) -> WalletResult<()> {
        let (_, amount) = raw_tx.destination()?;
        let token = coin_token(&raw_tx.coin);
        let amount = token.to_raw(amount)?;
        let fee_asset_id = self.tokens.fee_asset_id().to_string();

        let balances = self.token_balances(&raw_tx.account, &token.asset_id).await?;

        let mut token_short = false;
        let mut fee_short = None;
        let mut funding = None;
        for (address, balance) in balances {
            if balance.free < amount {
                token_short = true;
                continue;
            }
            let fee_balance = match self.chain.address_balance(&address.address, &fee_asset_id).await {
                Ok(b) => b,
                Err(e) => {
                    warn!("[{}] Cannot get fee balance of {}: {}", self.symbol, address.address, e);
                    continue;
                }
            };
            if fee_balance.free < self.fixed_fee {
                fee_short = Some(format!(
                    "{} has {} of fee asset {}, needs {}",
                    address.address, fee_balance.free, fee_asset_id, self.fixed_fee
                ));
                continue;
            }
            funding = Some(Funding {
                address,
                balance: balance.free,
                fee_balance,
            });
            break;
        }

        let funding = match funding {
            Some(f) => f,
            None if token_short => {
                return Err(WalletError::InsufficientTokenBalance(
                    "the token balance of all addresses is not enough".into(),
                ))
            }
            None => {
                return Err(match fee_short {
                    Some(reason) => WalletError::InsufficientFees(reason),
                    None => WalletError::CreateRawTransactionFailed(format!(
                        "no balance available for account {}",
                        raw_tx.account.account_id
                    )),
                })
            }
        };
        self.build(raw_tx, &funding, None).await
    }

    /// Build a transfer where the funding address must cover amount and fee
    /// from its balance of `raw_tx.coin`. Used for fee sponsorship, where the
    /// transferred asset is the fee asset.
    pub async fn create_simple_raw_transaction(
        &self,
        raw_tx: &mut RawTransaction,
        nonce: Option<u64>,
    ) -> WalletResult<()> {
        let (_, amount) = raw_tx.destination()?;
        let token = coin_token(&raw_tx.coin);
        let amount = token.to_raw(amount)?;
        let total = amount.saturating_add(self.fixed_fee);
        let fee_asset_id = self.tokens.fee_asset_id().to_string();

        let mut funding = None;
        for (address, balance) in self.token_balances(&raw_tx.account, &token.asset_id).await? {
            if balance.free < total {
                continue;
            }
            let fee_balance = match self.chain.address_balance(&address.address, &fee_asset_id).await {
                Ok(b) => b,
                Err(e) => {
                    warn!("[{}] Cannot get fee balance of {}: {}", self.symbol, address.address, e);
                    continue;
                }
            };
            funding = Some(Funding {
                address,
                balance: balance.free,
                fee_balance,
            });
            break;
        }
        let funding = funding.ok_or_else(|| {
            WalletError::InsufficientTokenBalance(format!("the balance: {amount} is not enough"))
        })?;
        self.build(raw_tx, &funding, nonce).await
    }

    /// Sweep every address of the account above `min_transfer` into the
    /// summary address.
    ///
    /// Addresses that cannot pay the fee get a fee top-up from the sponsor
    /// account instead of a sweep, when one is given. Sponsor transactions
    /// use consecutive nonces so they are accepted in order.
    pub async fn create_summary_transactions(
        &self,
        request: &SummaryRequest,
    ) -> WalletResult<Vec<RawTransactionWithError>> {
        let mut sponsor_nonce = match &request.fees_support_account {
            Some(sponsor) => {
                let first = sponsor.addresses.first().ok_or_else(|| {
                    WalletError::AccountHasNoAddress(sponsor.account_id.clone())
                })?;
                Some(self.nonces.address_nonce(&first.address).await?)
            }
            None => None,
        };

        let token = coin_token(&request.coin);
        let min_transfer = token.to_raw(request.min_transfer)?;
        let retained = token.to_raw(request.retained_balance)?;
        if min_transfer < retained {
            return Err(WalletError::CreateRawTransactionFailed(
                "mini transfer amount must be greater than address retained balance".into(),
            ));
        }
        let fee_token = self.fee_token().await?;
        let fees = fee_token.to_decimal(self.fixed_fee)?;

        let mut entries = Vec::new();
        for (address, balance) in self.token_balances(&request.account, &token.asset_id).await? {
            if balance.free < min_transfer || balance.free == 0 {
                continue;
            }
            let sum_amount = balance.free.saturating_sub(retained);
            let fee_balance = match self
                .chain
                .address_balance(&address.address, &fee_token.asset_id)
                .await
            {
                Ok(b) => b,
                Err(e) => {
                    warn!("[{}] Cannot get fee balance of {}: {}", self.symbol, address.address, e);
                    continue;
                }
            };

            if let (true, Some(sponsor), Some(nonce)) = (
                fee_balance.free < self.fixed_fee,
                &request.fees_support_account,
                sponsor_nonce.as_mut(),
            ) {
                let support = self.support_amount(&fee_token, fees, fee_balance.free)?;
                debug!(
                    "[{}] Fees support of {} for {} from account {} (nonce {})",
                    self.symbol, support, address.address, sponsor.account_id, nonce
                );
                let mut raw_tx = RawTransaction::new(
                    sponsor.clone(),
                    Coin::for_token(&self.symbol, &fee_token),
                    &address.address,
                    support,
                );
                let result = self.create_simple_raw_transaction(&mut raw_tx, Some(*nonce)).await;
                self.record_built(KIND_FEES_SUPPORT, &result);
                entries.push(RawTransactionWithError {
                    raw_tx,
                    error: result.err(),
                });
                *nonce += 1;
                continue;
            }

            debug!(
                "[{}] Summary of {} {} from {}",
                self.symbol, sum_amount, token.symbol, address.address
            );
            let mut raw_tx = RawTransaction::new(
                request.account.clone(),
                request.coin.clone(),
                &request.summary_address,
                token.to_decimal(sum_amount)?,
            );
            let funding = Funding {
                address,
                balance: balance.free,
                fee_balance,
            };
            let result = self.build(&mut raw_tx, &funding, None).await;
            self.record_built(KIND_SUMMARY, &result);
            entries.push(RawTransactionWithError {
                raw_tx,
                error: result.err(),
            });
        }
        Ok(entries)
    }

    /// Successful entries of [`Self::create_summary_transactions`].
    pub async fn create_summary_raw_transactions(
        &self,
        request: &SummaryRequest,
    ) -> WalletResult<Vec<RawTransaction>> {
        Ok(self
            .create_summary_transactions(request)
            .await?
            .into_iter()
            .filter(RawTransactionWithError::is_ok)
            .map(|e| e.raw_tx)
            .collect())
    }

    /// Combine the signed slot with the unsigned payload. The transaction is
    /// completed only when the encoder accepts the signature.
    pub async fn verify_raw_transaction(&self, raw_tx: &mut RawTransaction) -> WalletResult<()> {
        if !raw_tx.is_built {
            return Err(WalletError::CreateRawTransactionFailed(
                "transaction is not built".into(),
            ));
        }
        let signed = raw_tx.key_signatures().iter().find_map(|sig| {
            sig.signature
                .as_deref()
                .map(|s| (sig.address.public_key.clone(), s.to_string()))
        });
        let Some((public_key, signature)) = signed else {
            debug!("[{}] Transaction has no signature", self.symbol);
            raw_tx.is_completed = false;
            return Ok(());
        };
        match self
            .encoder
            .attach_signature(&raw_tx.raw_hex, &public_key, &signature)
        {
            Ok(signed) => {
                debug!("[{}] Transaction verify passed", self.symbol);
                raw_tx.raw_hex = signed;
                raw_tx.is_completed = true;
            }
            Err(e) => {
                debug!("[{}] Transaction verify failed: {}", self.symbol, e);
                raw_tx.is_completed = false;
            }
        }
        Ok(())
    }

    /// Broadcast a completed transaction and update the sender's nonce.
    pub async fn submit_raw_transaction(&self, raw_tx: &mut RawTransaction) -> WalletResult<TxSummary> {
        let result = self.submit(raw_tx).await;
        if let Some(m) = &self.metrics {
            match &result {
                Ok(_) => m.tx_submitted.with_label_values(&[&self.symbol]).inc(),
                Err(e) => m
                    .tx_failed
                    .with_label_values(&[&self.symbol, e.error_type()])
                    .inc(),
            }
        }
        result
    }

    async fn submit(&self, raw_tx: &mut RawTransaction) -> WalletResult<TxSummary> {
        if raw_tx.raw_hex.is_empty() {
            return Err(WalletError::SubmitRawTransactionFailed(
                "transaction hex is empty".into(),
            ));
        }
        if !raw_tx.is_completed {
            return Err(WalletError::SubmitRawTransactionFailed(
                "transaction is not completed validation".into(),
            ));
        }
        let signature = raw_tx.key_signatures().first().ok_or_else(|| {
            WalletError::SubmitRawTransactionFailed("transaction has no signer".into())
        })?;
        let from = signature.address.address.clone();
        let nonce = u64::from_str_radix(signature.nonce.trim_start_matches("0x"), 16)
            .map_err(|e| {
                WalletError::SubmitRawTransactionFailed(format!("bad nonce {}: {e}", signature.nonce))
            })?;
        info!("[{}] Submitting transaction from {} with nonce {}", self.symbol, from, nonce);

        let tx_id = match self.chain.submit_transaction(&raw_tx.raw_hex).await {
            Ok(tx_id) => tx_id,
            Err(e) => {
                warn!("[{}] Submit of {} failed: {}", self.symbol, raw_tx.raw_hex, e);
                self.nonces.record_failed(&from).await;
                return Err(WalletError::SubmitRawTransactionFailed(e.to_string()));
            }
        };
        self.nonces.record_submitted(&from, nonce).await;
        raw_tx.tx_id = tx_id.clone();
        raw_tx.is_submitted = true;

        let mut summary = TxSummary {
            from: raw_tx.tx_from.clone(),
            to: raw_tx.tx_to.clone(),
            fees: raw_tx.fees,
            coin: raw_tx.coin.clone(),
            block_hash: String::new(),
            block_height: 0,
            tx_id,
            decimals: raw_tx.coin.decimals,
            confirm_time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
            status: TxStatus::Success,
            wx_id: String::new(),
        };
        summary.wx_id = summary.fingerprint();
        Ok(summary)
    }

    /// Fill in fees, nonce and the signable payload.
    async fn build(
        &self,
        raw_tx: &mut RawTransaction,
        funding: &Funding,
        nonce: Option<u64>,
    ) -> WalletResult<()> {
        let (destination, amount_dec) = raw_tx.destination()?;
        let destination = destination.to_string();
        let token = coin_token(&raw_tx.coin);
        let amount = token.to_raw(amount_dec)?;
        let fee_token = self.fee_token().await?;
        let fees = fee_token.to_decimal(self.fixed_fee)?;

        let sent = if raw_tx.account.find(&destination).is_some() {
            fees
        } else {
            amount_dec + fees
        };
        raw_tx.fees = fees;
        raw_tx.fee_rate = self.fixed_fee.to_string();
        raw_tx.tx_amount = -sent;
        raw_tx.tx_from = vec![format!("{}:{}", funding.address.address, amount_dec)];
        raw_tx.tx_to = vec![format!("{}:{}", destination, amount_dec)];

        let nonce = match nonce.or(raw_tx.requested_nonce()) {
            Some(n) => n,
            None => self
                .nonces
                .address_nonce(&funding.address.address)
                .await
                .map_err(|e| WalletError::CreateRawTransactionFailed(e.to_string()))?,
        };

        if funding.balance < amount {
            return Err(WalletError::InsufficientTokenBalance(format!(
                "the token balance: {amount_dec} is not enough"
            )));
        }
        if funding.fee_balance.free < self.fixed_fee {
            return Err(WalletError::InsufficientFees(format!(
                "the [{}] balance: {} is not enough to pay fee {}",
                fee_token.symbol,
                fee_token.to_decimal(funding.fee_balance.free)?,
                fees
            )));
        }
        raw_tx.set_address_nonce(&funding.address.address, nonce);

        let transfer = self
            .unsigned_transfer(&funding.address, &destination, &token, amount, nonce)
            .await?;
        let (raw_hex, message) = self.encoder.encode_transfer(&transfer)?;
        raw_tx.raw_hex = raw_hex;
        raw_tx.signatures.insert(
            raw_tx.account.account_id.clone(),
            vec![KeySignature {
                address: funding.address.clone(),
                nonce: format!("0x{nonce:x}"),
                message,
                signature: None,
            }],
        );
        raw_tx.is_built = true;
        info!(
            "[{}] Built transfer of {} {} from {} to {} with nonce {}",
            self.symbol, amount_dec, token.symbol, funding.address.address, destination, nonce
        );
        Ok(())
    }

    async fn unsigned_transfer(
        &self,
        from: &WalletAddress,
        destination: &str,
        token: &TokenInfo,
        amount: u128,
        nonce: u64,
    ) -> WalletResult<UnsignedTransfer> {
        let create_failed = |e: WalletError| WalletError::CreateRawTransactionFailed(e.to_string());
        let asset_id = token.asset_id.parse::<u64>().map_err(|_| {
            WalletError::CreateRawTransactionFailed(format!("wrong asset id {}", token.asset_id))
        })?;
        let recipient_public_key = self.encoder.decode_address(destination)?;
        let height = self.chain.chain_height().await.map_err(create_failed)?;
        let block = self.chain.block_by_height(height).await.map_err(create_failed)?;
        let genesis_hash = self.chain.genesis_hash().await.map_err(create_failed)?;
        let version = self.chain.runtime_version().await.map_err(create_failed)?;
        Ok(UnsignedTransfer {
            sender_public_key: from.public_key.clone(),
            recipient_public_key,
            asset_id,
            amount,
            nonce,
            era_height: height,
            block_hash: block.hash,
            genesis_hash,
            spec_version: version.spec_version,
            transaction_version: version.transaction_version,
        })
    }

    /// Support amount for an address holding `free` of the fee asset:
    /// the fixed amount, else `scale` times the fee, else the shortfall.
    fn support_amount(&self, fee_token: &TokenInfo, fees: Decimal, free: u128) -> WalletResult<Decimal> {
        if self.fees_support.fixed_amount > 0 {
            fee_token.to_decimal(self.fees_support.fixed_amount)
        } else if self.fees_support.scale > Decimal::ZERO {
            Ok(self.fees_support.scale * fees)
        } else {
            fee_token.to_decimal(self.fixed_fee.saturating_sub(free))
        }
    }

    /// Balances of `asset_id` for every address of the account, smallest
    /// first. Addresses whose balance cannot be read are skipped.
    async fn token_balances(
        &self,
        account: &AssetsAccount,
        asset_id: &str,
    ) -> WalletResult<Vec<(WalletAddress, AddrBalance)>> {
        if account.addresses.is_empty() {
            return Err(WalletError::AccountHasNoAddress(account.account_id.clone()));
        }
        let mut balances = Vec::with_capacity(account.addresses.len());
        for address in &account.addresses {
            match self.chain.address_balance(&address.address, asset_id).await {
                Ok(b) => balances.push((address.clone(), b)),
                Err(e) => warn!(
                    "[{}] Cannot get balance of {} for asset {}: {}",
                    self.symbol, address.address, asset_id, e
                ),
            }
        }
        balances.sort_by_key(|(_, b)| b.free);
        Ok(balances)
    }

    async fn fee_token(&self) -> WalletResult<TokenInfo> {
        match self.tokens.fee_token() {
            Ok(token) => Ok(token),
            Err(_) => {
                self.tokens.refresh().await?;
                self.tokens.fee_token()
            }
        }
    }

    fn record_built(&self, kind: &str, result: &WalletResult<()>) {
        let Some(m) = &self.metrics else { return };
        match result {
            Ok(()) => m.tx_built.with_label_values(&[&self.symbol, kind]).inc(),
            Err(e) => m
                .tx_failed
                .with_label_values(&[&self.symbol, e.error_type()])
                .inc(),
        }
    }
}

fn coin_token(coin: &Coin) -> TokenInfo {
    TokenInfo::new(&coin.asset_id, &coin.token, coin.decimals)
}
