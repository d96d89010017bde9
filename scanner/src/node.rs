// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Periodic driver for a [`BlockScanner`].

use crate::block_scanner::{BlockScanner, ScannerState};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Run a scan cycle every `interval` while the scanner is in
/// [`ScannerState::Scanning`]. Paused scanners are skipped; the task ends
/// when `cancel` fires or the scanner is stopped. A cycle error that the
/// next tick cannot get past stops the scanner.
pub fn spawn_scanner_task(
    scanner: Arc<BlockScanner>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        run_scanner_task(scanner, interval, cancel).await;
    })
}

async fn run_scanner_task(
    scanner: Arc<BlockScanner>,
    interval: Duration,
    cancel: CancellationToken,
) {
    info!(
        "[{}] Starting scanner task (interval={:?})",
        scanner.symbol(),
        interval
    );
    let mut interval = time::interval(interval);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("[{}] Scanner task cancelled", scanner.symbol());
                break;
            }
            _ = interval.tick() => {
                match scanner.state() {
                    ScannerState::Stopped => {
                        info!("[{}] Scanner stopped, ending task", scanner.symbol());
                        break;
                    }
                    ScannerState::Scanning => {}
                    _ => continue,
                }
                match scanner.scan_cycle().await {
                    Ok(summary) => debug!(
                        "[{}] Scan cycle {} -> {}: {} blocks, {} forks",
                        scanner.symbol(),
                        summary.start_height,
                        summary.end_height,
                        summary.blocks_scanned,
                        summary.forks
                    ),
                    Err(e) if e.is_recoverable() => {
                        warn!("[{}] Scan cycle failed, retrying next tick: {}", scanner.symbol(), e)
                    }
                    Err(e) => {
                        error!("[{}] Scan cycle failed, stopping scanner: {}", scanner.symbol(), e);
                        scanner.stop();
                        break;
                    }
                }
            }
        }
    }
}
