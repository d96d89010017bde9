// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::{WalletError, WalletResult};
use crate::extract::ExtractResult;
use crate::metrics::ScannerMetrics;
use crate::observer::ScanObserver;
use crate::pipeline::ExtractConsumer;
use crate::store::ScannerStore;
use crate::types::UnscannedRecord;
use std::sync::Arc;
use tracing::{error, warn};

pub const EXTRACT_FAILED_REASON: &str = "Extract transaction failed.";
pub const NOTIFY_FAILED_REASON: &str = "ExtractData Notify failed.";

/// Delivers extraction results of one block to the observers and records
/// whatever could not be delivered.
pub(crate) struct NotifyConsumer {
    pub(crate) symbol: String,
    pub(crate) height: u64,
    pub(crate) observers: Vec<Arc<dyn ScanObserver>>,
    pub(crate) store: Arc<dyn ScannerStore>,
    pub(crate) metrics: Option<Arc<ScannerMetrics>>,
}

impl NotifyConsumer {
    async fn record_unscanned(&self, tx_id: &str, reason: &str) {
        let record = UnscannedRecord::new(self.height, Some(tx_id), reason, &self.symbol);
        match self.store.save_unscanned(record).await {
            Ok(()) => {
                if let Some(m) = &self.metrics {
                    m.unscanned_records_saved
                        .with_label_values(&[&self.symbol])
                        .inc();
                }
            }
            Err(e) => error!(
                "[{}] Failed to save unscanned record for tx {} at {}: {}",
                self.symbol, tx_id, self.height, e
            ),
        }
    }
}

#[async_trait::async_trait]
impl ExtractConsumer for NotifyConsumer {
    async fn consume(&self, result: ExtractResult) -> WalletResult<()> {
        if !result.success {
            warn!(
                "[{}] Extraction of tx {} at block {} failed",
                self.symbol, result.tx_id, self.height
            );
            self.record_unscanned(&result.tx_id, EXTRACT_FAILED_REASON)
                .await;
            return Err(WalletError::Extraction {
                tx_id: result.tx_id,
                reason: EXTRACT_FAILED_REASON.to_string(),
            });
        }

        // A failed delivery must not starve the other observers or source keys
        let mut failures = Vec::new();
        for by_key in result.data.values() {
            for (source_key, data) in by_key {
                for observer in &self.observers {
                    if let Err(e) = observer.on_extracted_transaction(source_key, data).await {
                        error!(
                            "[{}] Notify of tx {} ({}) at block {} failed: {}",
                            self.symbol, result.tx_id, source_key, self.height, e
                        );
                        failures.push(format!("{source_key}: {e}"));
                    }
                }
            }
        }
        if failures.is_empty() {
            return Ok(());
        }

        self.record_unscanned(&result.tx_id, NOTIFY_FAILED_REASON)
            .await;
        Err(WalletError::Notify {
            height: self.height,
            tx_id: result.tx_id,
            reason: failures.join("; "),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::TransactionExtractor;
    use crate::observer::AddressBook;
    use crate::store::MemoryStore;
    use crate::test_utils::{cennz_tokens, make_tx, RecordingObserver};
    use crate::types::TransferLeg;

    fn consumer(observers: Vec<Arc<dyn ScanObserver>>, store: Arc<MemoryStore>) -> NotifyConsumer {
        NotifyConsumer {
            symbol: "CENNZ".to_string(),
            height: 12,
            observers,
            store,
            metrics: None,
        }
    }

    fn two_key_result() -> ExtractResult {
        let book: AddressBook = [("X", "acct-x"), ("Y", "acct-y")].into_iter().collect();
        let extractor = TransactionExtractor::new("CENNZ", cennz_tokens(), Arc::new(book));
        let tx = make_tx(
            "0xt1",
            vec![TransferLeg::new("X", 50, "1")],
            vec![TransferLeg::new("Y", 50, "1")],
        );
        extractor.extract(12, "0x0c", tx)
    }

    fn keys(observer: &RecordingObserver) -> Vec<String> {
        observer
            .extracted
            .lock()
            .unwrap()
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    #[tokio::test]
    async fn test_rejected_key_does_not_block_other_deliveries() {
        let picky = RecordingObserver::new();
        picky.reject_source_key("acct-x");
        let relaxed = RecordingObserver::new();
        let store = Arc::new(MemoryStore::new());
        let consumer = consumer(
            vec![picky.clone() as Arc<dyn ScanObserver>, relaxed.clone()],
            store.clone(),
        );

        let err = consumer.consume(two_key_result()).await.unwrap_err();
        match err {
            WalletError::Notify { height, tx_id, reason } => {
                assert_eq!(height, 12);
                assert_eq!(tx_id, "0xt1");
                assert!(reason.starts_with("acct-x: "));
            }
            other => panic!("unexpected error {other:?}"),
        }

        assert_eq!(keys(&picky), vec!["acct-y".to_string()]);
        assert_eq!(
            keys(&relaxed),
            vec!["acct-x".to_string(), "acct-y".to_string()]
        );
        let records = store.list_unscanned("CENNZ").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].block_height, 12);
        assert_eq!(records[0].tx_id.as_deref(), Some("0xt1"));
        assert_eq!(records[0].reason, NOTIFY_FAILED_REASON);
    }

    #[tokio::test]
    async fn test_failed_extraction_is_recorded() {
        let observer = RecordingObserver::new();
        let store = Arc::new(MemoryStore::new());
        let consumer = consumer(vec![observer.clone() as Arc<dyn ScanObserver>], store.clone());

        let err = consumer
            .consume(ExtractResult::failed("0xt2", 12, "0x0c"))
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "extraction");
        assert!(keys(&observer).is_empty());
        let records = store.list_unscanned("CENNZ").await.unwrap();
        assert_eq!(records[0].reason, EXTRACT_FAILED_REASON);
    }
}
