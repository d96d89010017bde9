// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::block_scanner::ScannerState;

/// Errors produced by the scanner, the extraction pipeline and the
/// transaction builder.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WalletError {
    // Transient failure talking to the chain node
    #[error("chain source error during {op}: {reason}")]
    ChainSource { op: &'static str, reason: String },

    #[error("block not found: {0}")]
    BlockNotFound(u64),

    #[error("block scanner store is not configured")]
    StoreNotConfigured,

    #[error("store error: {0}")]
    Store(String),

    // Batch finished but some transactions could not be extracted or delivered
    #[error("block {height}: {failed} of {total} transactions failed extraction")]
    BatchExtraction {
        height: u64,
        failed: usize,
        total: usize,
    },

    #[error("extraction of tx {tx_id} failed: {reason}")]
    Extraction { tx_id: String, reason: String },

    #[error("notify of tx {tx_id} at block {height} failed: {reason}")]
    Notify {
        height: u64,
        tx_id: String,
        reason: String,
    },

    #[error("token registry error: {0}")]
    TokenRegistry(String),

    #[error("the balance is not enough: {0}")]
    InsufficientTokenBalance(String),

    #[error("the fees balance is not enough: {0}")]
    InsufficientFees(String),

    #[error("account {0} has no address")]
    AccountHasNoAddress(String),

    #[error("create raw transaction failed: {0}")]
    CreateRawTransactionFailed(String),

    #[error("submit raw transaction failed: {0}")]
    SubmitRawTransactionFailed(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid block height: {0}")]
    InvalidHeight(String),

    #[error("invalid scanner state transition from {from:?} to {to:?}")]
    InvalidStateTransition { from: ScannerState, to: ScannerState },

    #[error("{0}")]
    Internal(String),
}

impl WalletError {
    /// Stable label used for metrics and structured logs.
    pub fn error_type(&self) -> &'static str {
        match self {
            WalletError::ChainSource { .. } => "chain_source",
            WalletError::BlockNotFound(_) => "block_not_found",
            WalletError::StoreNotConfigured => "store_not_configured",
            WalletError::Store(_) => "store",
            WalletError::BatchExtraction { .. } => "batch_extraction",
            WalletError::Extraction { .. } => "extraction",
            WalletError::Notify { .. } => "notify",
            WalletError::TokenRegistry(_) => "token_registry",
            WalletError::InsufficientTokenBalance(_) => "insufficient_token_balance",
            WalletError::InsufficientFees(_) => "insufficient_fees",
            WalletError::AccountHasNoAddress(_) => "account_has_no_address",
            WalletError::CreateRawTransactionFailed(_) => "create_raw_transaction_failed",
            WalletError::SubmitRawTransactionFailed(_) => "submit_raw_transaction_failed",
            WalletError::InvalidAmount(_) => "invalid_amount",
            WalletError::InvalidAddress(_) => "invalid_address",
            WalletError::InvalidHeight(_) => "invalid_height",
            WalletError::InvalidStateTransition { .. } => "invalid_state_transition",
            WalletError::Internal(_) => "internal",
        }
    }

    /// Whether the next scan cycle is expected to get past this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            WalletError::ChainSource { .. }
                | WalletError::BlockNotFound(_)
                | WalletError::Store(_)
                | WalletError::BatchExtraction { .. }
                | WalletError::TokenRegistry(_)
        )
    }

    pub fn chain(op: &'static str, err: impl std::fmt::Display) -> Self {
        WalletError::ChainSource {
            op,
            reason: err.to_string(),
        }
    }
}

pub type WalletResult<T> = Result<T, WalletError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = WalletError::chain("chain_height", "connection refused");
        assert_eq!(err.error_type(), "chain_source");
        assert!(err.is_recoverable());
        assert_eq!(
            err.to_string(),
            "chain source error during chain_height: connection refused"
        );

        assert!(!WalletError::StoreNotConfigured.is_recoverable());
        assert!(!WalletError::InsufficientFees("addr".into()).is_recoverable());
        assert_eq!(
            WalletError::BatchExtraction {
                height: 7,
                failed: 2,
                total: 9
            }
            .to_string(),
            "block 7: 2 of 9 transactions failed extraction"
        );
    }
}
