// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_gauge_vec_with_registry, HistogramVec, IntCounterVec, IntGaugeVec, Registry,
};

const BATCH_LATENCY_SEC_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10., 30., 60., 120.,
];

/// Scanner and builder metrics. Every metric carries the chain symbol label.
#[derive(Clone, Debug)]
pub struct ScannerMetrics {
    pub(crate) blocks_scanned: IntCounterVec,
    pub(crate) forks_detected: IntCounterVec,
    pub(crate) extraction_failures: IntCounterVec,
    pub(crate) unscanned_records_saved: IntCounterVec,
    pub(crate) scan_cycle_errors: IntCounterVec,

    pub(crate) last_scanned_height: IntGaugeVec,
    pub(crate) chain_height: IntGaugeVec,
    pub(crate) extraction_in_flight: IntGaugeVec,

    pub(crate) batch_extraction_latency: HistogramVec,

    pub(crate) tx_built: IntCounterVec,
    pub(crate) tx_submitted: IntCounterVec,
    pub(crate) tx_failed: IntCounterVec,
}

impl ScannerMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            blocks_scanned: register_int_counter_vec_with_registry!(
                "scanner_blocks_scanned",
                "Total number of blocks scanned",
                &["symbol"],
                registry,
            )
            .unwrap(),
            forks_detected: register_int_counter_vec_with_registry!(
                "scanner_forks_detected",
                "Total number of chain forks detected",
                &["symbol"],
                registry,
            )
            .unwrap(),
            extraction_failures: register_int_counter_vec_with_registry!(
                "scanner_extraction_failures",
                "Total number of transactions that failed extraction or delivery",
                &["symbol"],
                registry,
            )
            .unwrap(),
            unscanned_records_saved: register_int_counter_vec_with_registry!(
                "scanner_unscanned_records_saved",
                "Total number of unscanned records written for later retry",
                &["symbol"],
                registry,
            )
            .unwrap(),
            scan_cycle_errors: register_int_counter_vec_with_registry!(
                "scanner_scan_cycle_errors",
                "Total number of errors that halted a scan cycle, by error type",
                &["symbol", "type"],
                registry,
            )
            .unwrap(),
            last_scanned_height: register_int_gauge_vec_with_registry!(
                "scanner_last_scanned_height",
                "Height of the scan cursor",
                &["symbol"],
                registry,
            )
            .unwrap(),
            chain_height: register_int_gauge_vec_with_registry!(
                "scanner_chain_height",
                "Latest chain height reported by the node",
                &["symbol"],
                registry,
            )
            .unwrap(),
            extraction_in_flight: register_int_gauge_vec_with_registry!(
                "scanner_extraction_in_flight",
                "Number of extraction tasks currently running",
                &["symbol"],
                registry,
            )
            .unwrap(),
            batch_extraction_latency: register_histogram_vec_with_registry!(
                "scanner_batch_extraction_latency",
                "Time to extract and deliver all transactions of one block",
                &["symbol"],
                BATCH_LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            tx_built: register_int_counter_vec_with_registry!(
                "scanner_tx_built",
                "Total number of raw transactions built",
                &["symbol", "kind"],
                registry,
            )
            .unwrap(),
            tx_submitted: register_int_counter_vec_with_registry!(
                "scanner_tx_submitted",
                "Total number of transactions submitted successfully",
                &["symbol"],
                registry,
            )
            .unwrap(),
            tx_failed: register_int_counter_vec_with_registry!(
                "scanner_tx_failed",
                "Total number of transactions that failed to build or submit, by error type",
                &["symbol", "type"],
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Self {
        let registry = Registry::new();
        Self::new(&registry)
    }
}
