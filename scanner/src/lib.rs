// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

pub mod block_scanner;
pub mod chain;
pub mod config;
pub mod error;
pub mod extract;
pub mod metrics;
pub mod node;
pub mod observer;
pub mod pipeline;
pub mod store;
pub mod tokens;
pub mod transaction;
pub mod types;

#[cfg(test)]
pub mod test_utils;

pub use error::{WalletError, WalletResult};
