/// BLE scan window management
///
/// Scanning runs in bounded windows to limit power draw: a window of
/// `scan_window_ms` is opened every `restart_interval_ms`. The scanner here
/// only tracks state; the mesh transport's upkeep loop drives the radio.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::MeshConfig;

/// BLE scanning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleScanConfig {
    /// Length of one scan window in milliseconds (default 10s)
    pub scan_window_ms: u64,
    /// Interval between window starts in milliseconds (default 30s)
    pub restart_interval_ms: u64,
}

impl Default for BleScanConfig {
    fn default() -> Self {
        Self {
            scan_window_ms: 10_000,
            restart_interval_ms: 30_000,
        }
    }
}

impl From<&MeshConfig> for BleScanConfig {
    fn from(mesh: &MeshConfig) -> Self {
        Self {
            scan_window_ms: mesh.scan_window_ms,
            restart_interval_ms: mesh.scan_restart_interval_ms,
        }
    }
}

impl BleScanConfig {
    /// Create a new scan configuration
    pub fn new(scan_window_ms: u64, restart_interval_ms: u64) -> Result<Self, ScannerError> {
        let config = Self {
            scan_window_ms,
            restart_interval_ms,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ScannerError> {
        if self.scan_window_ms > self.restart_interval_ms {
            return Err(ScannerError::InvalidScanConfig(
                "Scan window must be <= restart interval".to_string(),
            ));
        }
        if self.scan_window_ms == 0 || self.restart_interval_ms == 0 {
            return Err(ScannerError::InvalidScanConfig(
                "Scan intervals must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.scan_window_ms)
    }

    /// Idle time between the end of one window and the start of the next
    pub fn pause(&self) -> Duration {
        Duration::from_millis(self.restart_interval_ms.saturating_sub(self.scan_window_ms))
    }

    /// Percentage of time spent scanning
    pub fn duty_cycle_percent(&self) -> u8 {
        if self.restart_interval_ms == 0 {
            return 0;
        }
        ((self.scan_window_ms * 100) / self.restart_interval_ms).min(100) as u8
    }
}

/// Scanner state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScannerState {
    /// Idle, not scanning
    Idle,
    /// Inside a scan window
    Scanning,
    /// Between windows
    Paused,
    /// Last window failed to start; next cycle retries
    Failed,
}

/// Errors for scanner operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScannerError {
    #[error("Invalid scan configuration: {0}")]
    InvalidScanConfig(String),
    #[error("Scanner already scanning")]
    AlreadyScanning,
    #[error("Scanner not scanning")]
    NotScanning,
}

/// Bookkeeping for the scan upkeep loop
#[derive(Debug)]
pub struct BleScanner {
    config: BleScanConfig,
    state: ScannerState,
    windows_started: u64,
    failures: u64,
}

impl BleScanner {
    pub fn new(config: BleScanConfig) -> Self {
        Self {
            config,
            state: ScannerState::Idle,
            windows_started: 0,
            failures: 0,
        }
    }

    pub fn config(&self) -> &BleScanConfig {
        &self.config
    }

    pub fn state(&self) -> ScannerState {
        self.state
    }

    pub fn windows_started(&self) -> u64 {
        self.windows_started
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Enter a scan window
    pub fn begin_window(&mut self) -> Result<(), ScannerError> {
        if self.state == ScannerState::Scanning {
            return Err(ScannerError::AlreadyScanning);
        }
        self.state = ScannerState::Scanning;
        self.windows_started += 1;
        Ok(())
    }

    /// Leave the current scan window
    pub fn end_window(&mut self) -> Result<(), ScannerError> {
        if self.state != ScannerState::Scanning {
            return Err(ScannerError::NotScanning);
        }
        self.state = ScannerState::Paused;
        Ok(())
    }

    /// Record a scan failure; the loop restarts on its next cycle
    pub fn record_failure(&mut self) {
        self.failures += 1;
        self.state = ScannerState::Failed;
    }

    pub fn stop(&mut self) {
        self.state = ScannerState::Idle;
    }
}
