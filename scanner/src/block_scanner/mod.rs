// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Block scanning with fork detection
//!
//! - `scanner`: the scan cycle, rollback and retry of failed records
//! - `state`: Run/Pause/Restart/Stop lifecycle
//! - `consumer`: delivery of extraction results to observers

mod consumer;
mod scanner;
mod state;


pub use consumer::{EXTRACT_FAILED_REASON, NOTIFY_FAILED_REASON};
pub use scanner::{
    BlockScanner, BlockScannerBuilder, CycleSummary, DEFAULT_ROLLBACK_DEPTH,
    TX_NOT_FOUND_REASON_PREFIX,
};
pub use state::{AtomicScannerState, ScannerState};
