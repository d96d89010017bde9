// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Lock-free scanner lifecycle.
//!
//! ```text
//! Idle ──run──► Scanning ──pause──► Paused
//!                  ▲                  │
//!                  └─────restart──────┘
//! any ──stop──► Stopped (terminal)
//! ```

use crate::error::{WalletError, WalletResult};
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ScannerState {
    Idle = 0,
    Scanning = 1,
    Paused = 2,
    Stopped = 3,
}

impl ScannerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ScannerState::Idle,
            1 => ScannerState::Scanning,
            2 => ScannerState::Paused,
            _ => ScannerState::Stopped,
        }
    }
}

#[derive(Debug)]
pub struct AtomicScannerState {
    state: AtomicU8,
}

impl Default for AtomicScannerState {
    fn default() -> Self {
        Self::new()
    }
}

impl AtomicScannerState {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ScannerState::Idle as u8),
        }
    }

    pub fn get(&self) -> ScannerState {
        ScannerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Idle → Scanning
    pub fn run(&self) -> WalletResult<()> {
        self.transition(ScannerState::Idle, ScannerState::Scanning)
    }

    /// Scanning → Paused
    pub fn pause(&self) -> WalletResult<()> {
        self.transition(ScannerState::Scanning, ScannerState::Paused)
    }

    /// Paused → Scanning
    pub fn restart(&self) -> WalletResult<()> {
        self.transition(ScannerState::Paused, ScannerState::Scanning)
    }

    /// Any → Stopped. Stopping twice is fine.
    pub fn stop(&self) {
        self.state
            .store(ScannerState::Stopped as u8, Ordering::Release);
    }

    pub fn is_scanning(&self) -> bool {
        self.get() == ScannerState::Scanning
    }

    fn transition(&self, from: ScannerState, to: ScannerState) -> WalletResult<()> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| WalletError::InvalidStateTransition {
                from: ScannerState::from_u8(actual),
                to,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let state = AtomicScannerState::new();
        assert_eq!(state.get(), ScannerState::Idle);
        assert!(!state.is_scanning());

        state.run().unwrap();
        assert!(state.is_scanning());
        state.pause().unwrap();
        assert_eq!(state.get(), ScannerState::Paused);
        state.restart().unwrap();
        assert!(state.is_scanning());

        state.stop();
        assert_eq!(state.get(), ScannerState::Stopped);
        state.stop();
        assert_eq!(state.get(), ScannerState::Stopped);
    }

    #[test]
    fn test_invalid_transitions() {
        let state = AtomicScannerState::new();
        assert_eq!(
            state.pause().unwrap_err(),
            WalletError::InvalidStateTransition {
                from: ScannerState::Idle,
                to: ScannerState::Paused
            }
        );
        assert!(state.restart().is_err());
        state.run().unwrap();
        assert!(state.run().is_err());

        state.stop();
        // Stopped is terminal
        assert!(state.run().is_err());
        assert!(state.restart().is_err());
        assert_eq!(state.get(), ScannerState::Stopped);
    }
}
