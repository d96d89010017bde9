// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Transaction construction, nonce tracking and submission.

mod builder;
mod encoding;
mod nonce;
mod types;

pub use builder::TransactionBuilder;
pub use encoding::{CompactTransferEncoder, TransactionEncoder};
pub use nonce::NonceManager;
pub use types::{
    AssetsAccount, FeesSupport, KeySignature, RawTransaction, RawTransactionWithError,
    SummaryRequest, UnsignedTransfer, WalletAddress,
};
