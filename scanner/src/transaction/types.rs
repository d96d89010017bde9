// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::WalletError;
use crate::extract::Coin;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

const NONCE_PARAM: &str = "nonce";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletAddress {
    pub address: String,
    /// Hex encoded 32-byte public key
    pub public_key: String,
}

impl WalletAddress {
    pub fn new(address: impl Into<String>, public_key: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            public_key: public_key.into(),
        }
    }
}

/// Wallet account and the addresses it controls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetsAccount {
    pub account_id: String,
    pub addresses: Vec<WalletAddress>,
}

impl AssetsAccount {
    pub fn new(account_id: impl Into<String>, addresses: Vec<WalletAddress>) -> Self {
        Self {
            account_id: account_id.into(),
            addresses,
        }
    }

    pub fn find(&self, address: &str) -> Option<&WalletAddress> {
        self.addresses.iter().find(|a| a.address == address)
    }
}

/// Fee sponsorship amounts, in units of the fee asset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeesSupport {
    /// Multiplier of the flat fee
    pub scale: Decimal,
    /// Fixed raw amount, used first when non-zero
    pub fixed_amount: u128,
}

/// Sweep of every address of an account into one summary address.
#[derive(Debug, Clone)]
pub struct SummaryRequest {
    pub account: AssetsAccount,
    pub coin: Coin,
    pub summary_address: String,
    /// Addresses below this balance are left alone
    pub min_transfer: Decimal,
    /// Balance kept on every swept address
    pub retained_balance: Decimal,
    /// Account paying fees for addresses without enough fee asset
    pub fees_support_account: Option<AssetsAccount>,
}

/// A signature slot for one signer of a raw transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySignature {
    pub address: WalletAddress,
    /// `0x` prefixed hex nonce
    pub nonce: String,
    /// Hex message to sign
    pub message: String,
    pub signature: Option<String>,
}

/// Transaction under construction, from request to submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTransaction {
    pub account: AssetsAccount,
    pub coin: Coin,
    /// Destination address -> amount in token units
    pub to: BTreeMap<String, Decimal>,
    pub fees: Decimal,
    /// Flat fee in raw units of the fee asset
    pub fee_rate: String,
    /// Net change of the account balance, negative when sending out
    pub tx_amount: Decimal,
    pub tx_from: Vec<String>,
    pub tx_to: Vec<String>,
    pub raw_hex: String,
    /// account id -> signature slots
    pub signatures: BTreeMap<String, Vec<KeySignature>>,
    /// Free-form parameters. `nonce` holds either a requested nonce or, once
    /// built, the address -> nonce map.
    pub ext_param: Value,
    pub is_built: bool,
    pub is_completed: bool,
    pub is_submitted: bool,
    pub tx_id: String,
}

impl RawTransaction {
    pub fn new(account: AssetsAccount, coin: Coin, to: &str, amount: Decimal) -> Self {
        Self {
            account,
            coin,
            to: BTreeMap::from([(to.to_string(), amount)]),
            fees: Decimal::ZERO,
            fee_rate: String::new(),
            tx_amount: Decimal::ZERO,
            tx_from: vec![],
            tx_to: vec![],
            raw_hex: String::new(),
            signatures: BTreeMap::new(),
            ext_param: Value::Null,
            is_built: false,
            is_completed: false,
            is_submitted: false,
            tx_id: String::new(),
        }
    }

    /// Use `nonce` instead of asking the nonce manager.
    pub fn with_nonce(mut self, nonce: u64) -> Self {
        self.set_ext_param(NONCE_PARAM, json!(nonce));
        self
    }

    pub(crate) fn destination(&self) -> Result<(&str, Decimal), WalletError> {
        self.to
            .iter()
            .next()
            .map(|(to, amount)| (to.as_str(), *amount))
            .ok_or_else(|| WalletError::CreateRawTransactionFailed("no destination".into()))
    }

    pub(crate) fn requested_nonce(&self) -> Option<u64> {
        self.ext_param.get(NONCE_PARAM).and_then(Value::as_u64)
    }

    pub(crate) fn set_address_nonce(&mut self, address: &str, nonce: u64) {
        let mut nonces = match self.ext_param.get(NONCE_PARAM) {
            Some(Value::Object(map)) => map.clone(),
            _ => Default::default(),
        };
        nonces.insert(address.to_string(), json!(nonce));
        self.set_ext_param(NONCE_PARAM, Value::Object(nonces));
    }

    /// Nonce chosen for every signing address, filled in when built.
    pub fn nonce_map(&self) -> BTreeMap<String, u64> {
        match self.ext_param.get(NONCE_PARAM) {
            Some(Value::Object(map)) => map
                .iter()
                .filter_map(|(k, v)| v.as_u64().map(|n| (k.clone(), n)))
                .collect(),
            _ => BTreeMap::new(),
        }
    }

    pub fn key_signatures(&self) -> &[KeySignature] {
        self.signatures
            .get(&self.account.account_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn key_signatures_mut(&mut self) -> Option<&mut Vec<KeySignature>> {
        self.signatures.get_mut(&self.account.account_id)
    }

    fn set_ext_param(&mut self, key: &str, value: Value) {
        if !self.ext_param.is_object() {
            self.ext_param = json!({});
        }
        if let Value::Object(map) = &mut self.ext_param {
            map.insert(key.to_string(), value);
        }
    }
}

/// One entry of a sweep; a failed entry never aborts its siblings.
#[derive(Debug, Clone)]
pub struct RawTransactionWithError {
    pub raw_tx: RawTransaction,
    pub error: Option<WalletError>,
}

impl RawTransactionWithError {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Fields of a transfer the encoder needs to build the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTransfer {
    pub sender_public_key: String,
    pub recipient_public_key: [u8; 32],
    pub asset_id: u64,
    pub amount: u128,
    pub nonce: u64,
    /// Height the mortal era is anchored at
    pub era_height: u64,
    pub block_hash: String,
    pub genesis_hash: String,
    pub spec_version: u32,
    pub transaction_version: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cennz_token_list;

    fn raw_tx() -> RawTransaction {
        let account = AssetsAccount::new("acct", vec![WalletAddress::new("A", "aa")]);
        let coin = Coin::for_token("CENNZ", &cennz_token_list()[0]);
        RawTransaction::new(account, coin, "B", Decimal::new(15, 1))
    }

    #[test]
    fn test_requested_nonce_and_nonce_map() {
        let tx = raw_tx();
        assert_eq!(tx.requested_nonce(), None);
        assert!(tx.nonce_map().is_empty());

        let mut tx = tx.with_nonce(12);
        assert_eq!(tx.requested_nonce(), Some(12));

        tx.set_address_nonce("A", 12);
        tx.set_address_nonce("C", 3);
        assert_eq!(tx.requested_nonce(), None);
        assert_eq!(
            tx.nonce_map(),
            BTreeMap::from([("A".to_string(), 12), ("C".to_string(), 3)])
        );
        assert_eq!(tx.ext_param["nonce"]["A"], json!(12));
    }

    #[test]
    fn test_destination() {
        let tx = raw_tx();
        assert_eq!(tx.destination().unwrap(), ("B", Decimal::new(15, 1)));
        let mut empty = tx;
        empty.to.clear();
        assert!(matches!(
            empty.destination(),
            Err(WalletError::CreateRawTransactionFailed(_))
        ));
    }
}
