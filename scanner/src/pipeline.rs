// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Bounded-concurrency extraction of one block's transactions
//!
//! ```text
//!  producer ──(≤ N extraction tasks)──► dispatch buffer ──► consumer
//! ```
//!
//! The producer admits at most `max_workers` extraction tasks at a time
//! through a semaphore. Finished results queue up in the dispatch loop's
//! FIFO buffer and are forwarded to a single consumer task whenever it can
//! take one. The consumer counts completions and tells the dispatch loop to
//! quit once every transaction has been handled.

use crate::error::{WalletError, WalletResult};
use crate::extract::{ExtractResult, TransactionExtractor};
use crate::metrics::ScannerMetrics;
use crate::types::Transaction;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, error, warn};

/// Default number of concurrent extraction tasks
pub const DEFAULT_MAX_EXTRACTING_WORKERS: usize = 20;

/// Receives every extraction result of a batch, one at a time.
#[async_trait::async_trait]
pub trait ExtractConsumer: Send + Sync {
    /// Handle one result. An error counts the transaction as failed.
    async fn consume(&self, result: ExtractResult) -> WalletResult<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub total: usize,
    pub delivered: usize,
    pub failed: usize,
    pub peak_in_flight: usize,
}

pub struct ExtractionPipeline {
    max_workers: usize,
    metrics: Option<Arc<ScannerMetrics>>,
}

impl ExtractionPipeline {
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<ScannerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Extract every transaction of a block and hand the results to
    /// `consumer`.
    ///
    /// Returns after all results were consumed. Fails with
    /// [`WalletError::BatchExtraction`] when any extraction or consume call
    /// failed; the consumer is expected to have recorded those for retry.
    pub async fn extract_batch(
        &self,
        extractor: &TransactionExtractor,
        block_height: u64,
        block_hash: &str,
        txs: Vec<Transaction>,
        consumer: Arc<dyn ExtractConsumer>,
    ) -> WalletResult<BatchReport> {
        let total = txs.len();
        if total == 0 {
            return Ok(BatchReport::default());
        }
        let symbol = extractor.symbol().to_string();
        let timer = self.metrics.as_ref().map(|m| {
            m.batch_extraction_latency
                .with_label_values(&[&symbol])
                .start_timer()
        });

        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        // Results from extraction tasks. Sized so a task never waits on send.
        let (producer_tx, mut producer_rx) = mpsc::channel::<ExtractResult>(total);
        let (worker_tx, worker_rx) = mpsc::channel::<ExtractResult>(1);
        let (quit_tx, mut quit_rx) = oneshot::channel::<()>();

        let producer = self.spawn_producer(
            extractor.clone(),
            block_height,
            block_hash.to_string(),
            txs,
            producer_tx,
            in_flight,
            peak.clone(),
        );
        let consumer_task = spawn_consumer(
            consumer,
            worker_rx,
            total,
            failed.clone(),
            done.clone(),
            quit_tx,
        );

        let mut buffer: VecDeque<ExtractResult> = VecDeque::new();
        loop {
            tokio::select! {
                Some(result) = producer_rx.recv() => {
                    buffer.push_back(result);
                }
                permit = worker_tx.reserve(), if !buffer.is_empty() => {
                    match permit {
                        Ok(permit) => {
                            if let Some(result) = buffer.pop_front() {
                                permit.send(result);
                            }
                        }
                        Err(_) => {
                            error!("[{}] Extraction consumer of block {} is gone", symbol, block_height);
                            break;
                        }
                    }
                }
                _ = &mut quit_rx => {
                    break;
                }
                else => break,
            }
        }
        drop(worker_tx);

        if let Err(e) = consumer_task.await {
            error!("[{}] Extraction consumer of block {} panicked: {}", symbol, block_height, e);
        }
        producer.abort();

        let delivered = done.load(Ordering::SeqCst);
        // Anything never consumed counts as failed
        let failed = failed.load(Ordering::SeqCst) + total.saturating_sub(delivered);
        let report = BatchReport {
            total,
            delivered,
            failed,
            peak_in_flight: peak.load(Ordering::SeqCst),
        };
        if let Some(timer) = timer {
            timer.observe_duration();
        }
        if let Some(m) = &self.metrics {
            m.extraction_failures
                .with_label_values(&[&symbol])
                .inc_by(failed as u64);
        }

        if failed > 0 {
            warn!(
                "[{}] Block {}: {} of {} transactions failed extraction",
                symbol, block_height, failed, total
            );
            return Err(WalletError::BatchExtraction {
                height: block_height,
                failed,
                total,
            });
        }
        debug!(
            "[{}] Block {} extracted: {} transactions, peak {} workers",
            symbol, block_height, total, report.peak_in_flight
        );
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_producer(
        &self,
        extractor: TransactionExtractor,
        block_height: u64,
        block_hash: String,
        txs: Vec<Transaction>,
        producer_tx: mpsc::Sender<ExtractResult>,
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    ) -> tokio::task::JoinHandle<()> {
        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let gauge = self.metrics.as_ref().map(|m| {
            m.extraction_in_flight
                .with_label_values(&[extractor.symbol()])
        });
        tokio::spawn(async move {
            for tx in txs {
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                let extractor = extractor.clone();
                let block_hash = block_hash.clone();
                let producer_tx = producer_tx.clone();
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                let gauge = gauge.clone();
                tokio::spawn(async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    if let Some(g) = &gauge {
                        g.inc();
                    }

                    let tx_id = tx.tx_id.clone();
                    let task_hash = block_hash.clone();
                    let result = tokio::task::spawn_blocking(move || {
                        extractor.extract(block_height, &task_hash, tx)
                    })
                    .await
                    .unwrap_or_else(|e| {
                        error!("Extraction task for tx {} panicked: {}", tx_id, e);
                        ExtractResult::failed(&tx_id, block_height, &block_hash)
                    });

                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    if let Some(g) = &gauge {
                        g.dec();
                    }
                    drop(permit);
                    let _ = producer_tx.send(result).await;
                });
            }
        })
    }
}

fn spawn_consumer(
    consumer: Arc<dyn ExtractConsumer>,
    mut worker_rx: mpsc::Receiver<ExtractResult>,
    total: usize,
    failed: Arc<AtomicUsize>,
    done: Arc<AtomicUsize>,
    quit_tx: oneshot::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(result) = worker_rx.recv().await {
            let ok = result.success;
            let tx_id = result.tx_id.clone();
            if let Err(e) = consumer.consume(result).await {
                debug!("Consume of tx {} failed: {}", tx_id, e);
                failed.fetch_add(1, Ordering::SeqCst);
            } else if !ok {
                failed.fetch_add(1, Ordering::SeqCst);
            }
            if done.fetch_add(1, Ordering::SeqCst) + 1 == total {
                let _ = quit_tx.send(());
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::AddressBook;
    use crate::test_utils::{cennz_tokens, make_tx};
    use crate::types::TransferLeg;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CountingConsumer {
        seen: Mutex<HashMap<String, usize>>,
        fail_tx: Option<String>,
    }

    #[async_trait::async_trait]
    impl ExtractConsumer for CountingConsumer {
        async fn consume(&self, result: ExtractResult) -> WalletResult<()> {
            *self
                .seen
                .lock()
                .unwrap()
                .entry(result.tx_id.clone())
                .or_default() += 1;
            if self.fail_tx.as_deref() == Some(result.tx_id.as_str()) {
                return Err(WalletError::Internal("boom".into()));
            }
            Ok(())
        }
    }

    fn extractor() -> TransactionExtractor {
        let book: AddressBook = [("X", "acct-x")].into_iter().collect();
        TransactionExtractor::new("CENNZ", cennz_tokens(), Arc::new(book))
    }

    fn txs(count: usize) -> Vec<Transaction> {
        (0..count)
            .map(|i| {
                make_tx(
                    &format!("0x{i:04x}"),
                    vec![TransferLeg::new("X", 100 + i as u128, "1")],
                    vec![TransferLeg::new("Y", 100 + i as u128, "1")],
                )
            })
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_every_result_delivered_once_within_worker_limit() {
        let pipeline = ExtractionPipeline::new(20);
        let consumer = Arc::new(CountingConsumer::default());
        let report = pipeline
            .extract_batch(&extractor(), 7, "0x07", txs(50), consumer.clone())
            .await
            .unwrap();

        assert_eq!(report.total, 50);
        assert_eq!(report.delivered, 50);
        assert_eq!(report.failed, 0);
        assert!(report.peak_in_flight >= 1);
        assert!(report.peak_in_flight <= 20);

        let seen = consumer.seen.lock().unwrap();
        assert_eq!(seen.len(), 50);
        assert!(seen.values().all(|count| *count == 1));
    }

    struct SlowFilter;

    impl crate::observer::AddressFilter for SlowFilter {
        fn is_tracked(&self, address: &str) -> Option<String> {
            std::thread::sleep(std::time::Duration::from_millis(30));
            (address == "X").then(|| "acct-x".to_string())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_slow_extraction_fills_worker_limit() {
        let extractor = TransactionExtractor::new("CENNZ", cennz_tokens(), Arc::new(SlowFilter));
        let pipeline = ExtractionPipeline::new(20);
        let consumer = Arc::new(CountingConsumer::default());
        let report = pipeline
            .extract_batch(&extractor, 7, "0x07", txs(50), consumer.clone())
            .await
            .unwrap();

        assert_eq!(report.delivered, 50);
        assert_eq!(report.failed, 0);
        assert_eq!(report.peak_in_flight, 20);
        assert_eq!(consumer.seen.lock().unwrap().len(), 50);
    }

    #[tokio::test]
    async fn test_single_worker() {
        let pipeline = ExtractionPipeline::new(1);
        let consumer = Arc::new(CountingConsumer::default());
        let report = pipeline
            .extract_batch(&extractor(), 7, "0x07", txs(5), consumer.clone())
            .await
            .unwrap();
        assert_eq!(report.peak_in_flight, 1);
        assert_eq!(report.delivered, 5);
    }

    #[tokio::test]
    async fn test_empty_batch_succeeds() {
        let pipeline = ExtractionPipeline::new(4);
        let consumer = Arc::new(CountingConsumer::default());
        let report = pipeline
            .extract_batch(&extractor(), 7, "0x07", vec![], consumer.clone())
            .await
            .unwrap();
        assert_eq!(report, BatchReport::default());
        assert!(consumer.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failures_are_counted_after_full_batch() {
        let pipeline = ExtractionPipeline::new(3);
        let consumer = Arc::new(CountingConsumer {
            fail_tx: Some("0x0002".to_string()),
            ..Default::default()
        });
        let mut batch = txs(6);
        // Extraction failure: no tx id
        batch.push(make_tx("", vec![], vec![]));

        let err = pipeline
            .extract_batch(&extractor(), 9, "0x09", batch, consumer.clone())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            WalletError::BatchExtraction {
                height: 9,
                failed: 2,
                total: 7
            }
        );
        // Every result still reached the consumer
        let seen = consumer.seen.lock().unwrap();
        assert_eq!(seen.values().sum::<usize>(), 7);
    }

    #[tokio::test]
    async fn test_metrics_record_failures() {
        let metrics = Arc::new(ScannerMetrics::new_for_testing());
        let pipeline = ExtractionPipeline::new(2).with_metrics(metrics.clone());
        let consumer = Arc::new(CountingConsumer {
            fail_tx: Some("0x0000".to_string()),
            ..Default::default()
        });
        assert!(pipeline
            .extract_batch(&extractor(), 1, "0x01", txs(3), consumer)
            .await
            .is_err());
        assert_eq!(
            metrics
                .extraction_failures
                .with_label_values(&["CENNZ"])
                .get(),
            1
        );
        assert_eq!(
            metrics
                .extraction_in_flight
                .with_label_values(&["CENNZ"])
                .get(),
            0
        );
    }
}
