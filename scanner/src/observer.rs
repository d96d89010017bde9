// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Address membership and scan notifications.

use crate::error::WalletResult;
use crate::extract::ExtractData;
use crate::types::BlockHeader;
use std::collections::HashMap;
use std::sync::RwLock;

/// Decides which addresses the wallet cares about.
///
/// Called from blocking extraction tasks, so implementations may block.
pub trait AddressFilter: Send + Sync {
    /// Returns the source key (usually the owning account id) of a tracked
    /// address.
    fn is_tracked(&self, address: &str) -> Option<String>;
}

/// Simple in-memory address -> source key map.
#[derive(Default)]
pub struct AddressBook {
    entries: RwLock<HashMap<String, String>>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, address: impl Into<String>, source_key: impl Into<String>) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(address.into(), source_key.into());
        }
    }

    pub fn remove(&self, address: &str) -> Option<String> {
        self.entries.write().ok()?.remove(address)
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AddressFilter for AddressBook {
    fn is_tracked(&self, address: &str) -> Option<String> {
        self.entries.read().ok()?.get(address).cloned()
    }
}

impl<A, S> FromIterator<(A, S)> for AddressBook
where
    A: Into<String>,
    S: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (A, S)>>(iter: I) -> Self {
        let book = AddressBook::new();
        for (address, key) in iter {
            book.insert(address, key);
        }
        book
    }
}

/// Receives scan results. Every call happens on the scanner's single
/// consumer path, never concurrently for one scanner.
#[async_trait::async_trait]
pub trait ScanObserver: Send + Sync {
    /// A block was scanned, or a fork orphaned one (`header.fork == true`).
    async fn on_new_block(&self, header: &BlockHeader);

    /// Extracted data for one (asset symbol, source key) pair of a
    /// transaction. An error makes the scanner record the transaction for a
    /// later retry.
    async fn on_extracted_transaction(
        &self,
        source_key: &str,
        data: &ExtractData,
    ) -> WalletResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_book() {
        let book: AddressBook = [("5Fx", "account-1"), ("5Fy", "account-2")]
            .into_iter()
            .collect();
        assert_eq!(book.len(), 2);
        assert_eq!(book.is_tracked("5Fx").as_deref(), Some("account-1"));
        assert_eq!(book.is_tracked("5Fz"), None);
        assert_eq!(book.remove("5Fy").as_deref(), Some("account-2"));
        assert_eq!(book.is_tracked("5Fy"), None);
    }
}
