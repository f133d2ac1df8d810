//! Runtime configuration for TokenMesh nodes
//!
//! Every timeout, retry count and buffer size used by the transport, the
//! chunked session layer and the transfer coordinator lives here. Defaults
//! are tuned for BLE links between two phones.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Smallest ATT MTU every BLE stack must support
pub const BLE_DEFAULT_MTU: u16 = 23;

/// Largest ATT MTU a central may request
pub const BLE_MAX_MTU: u16 = 517;

/// Errors produced while validating configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid mesh configuration: {0}")]
    InvalidMesh(String),
    #[error("Invalid chunking configuration: {0}")]
    InvalidChunking(String),
    #[error("Invalid transfer configuration: {0}")]
    InvalidTransfer(String),
}

/// Mesh transport settings (connection attempts, MTU, scan/advertise upkeep)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Connection attempts per outbound message
    pub send_retries: u32,
    /// Backoff step between attempts; attempt N waits N * step
    pub retry_backoff_ms: u64,
    /// Upper bound for each awaited radio step (connect, discover, MTU, write)
    pub step_timeout_ms: u64,
    /// MTU assumed before negotiation
    pub default_mtu: u16,
    /// MTU requested after service discovery
    pub requested_mtu: u16,
    /// Length of one low-power scan window
    pub scan_window_ms: u64,
    /// Interval at which the upkeep loop restarts scanning
    pub scan_restart_interval_ms: u64,
    /// Delay between opening the server and starting to advertise
    pub advertise_delay_ms: u64,
    /// Capacity of the mesh event stream
    pub event_buffer: usize,
    /// Number of recent events replayed to late subscribers
    pub event_replay: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            send_retries: 3,
            retry_backoff_ms: 500,
            step_timeout_ms: 10_000,
            default_mtu: BLE_DEFAULT_MTU,
            requested_mtu: 512,
            scan_window_ms: 10_000,
            scan_restart_interval_ms: 30_000,
            advertise_delay_ms: 500,
            event_buffer: 128,
            event_replay: 10,
        }
    }
}

impl MeshConfig {
    /// Set the number of send attempts
    pub fn with_send_retries(mut self, retries: u32) -> Self {
        self.send_retries = retries;
        self
    }

    /// Set the per-step radio timeout
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the scan window and restart interval
    pub fn with_scan_timing(mut self, window: Duration, interval: Duration) -> Self {
        self.scan_window_ms = window.as_millis() as u64;
        self.scan_restart_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(attempt as u64))
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn scan_window(&self) -> Duration {
        Duration::from_millis(self.scan_window_ms)
    }

    pub fn scan_restart_interval(&self) -> Duration {
        Duration::from_millis(self.scan_restart_interval_ms)
    }

    pub fn advertise_delay(&self) -> Duration {
        Duration::from_millis(self.advertise_delay_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.send_retries == 0 {
            return Err(ConfigError::InvalidMesh(
                "send_retries must be at least 1".to_string(),
            ));
        }
        if self.step_timeout_ms == 0 {
            return Err(ConfigError::InvalidMesh(
                "step_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.default_mtu < BLE_DEFAULT_MTU {
            return Err(ConfigError::InvalidMesh(format!(
                "default_mtu must be >= {}",
                BLE_DEFAULT_MTU
            )));
        }
        if self.requested_mtu < self.default_mtu || self.requested_mtu > BLE_MAX_MTU {
            return Err(ConfigError::InvalidMesh(format!(
                "requested_mtu must be within {}..={}",
                self.default_mtu, BLE_MAX_MTU
            )));
        }
        if self.scan_window_ms == 0 || self.scan_window_ms > self.scan_restart_interval_ms {
            return Err(ConfigError::InvalidMesh(
                "Scan window must be > 0 and <= scan restart interval".to_string(),
            ));
        }
        if self.event_buffer == 0 || self.event_replay > self.event_buffer {
            return Err(ConfigError::InvalidMesh(
                "event_replay must not exceed a non-zero event_buffer".to_string(),
            ));
        }
        Ok(())
    }
}

/// Chunked binary session settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Largest chunk on the wire, header included
    pub max_chunk_size: usize,
    /// Pause between consecutive chunks
    pub inter_chunk_delay_ms: u64,
    /// Attempts per chunk before the session fails
    pub max_retries: u32,
    /// Backoff step between chunk attempts
    pub retry_backoff_ms: u64,
    /// Idle time after which an inbound session is abandoned
    pub session_timeout_ms: u64,
    /// How often idle sessions are swept
    pub sweep_interval_ms: u64,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 512,
            inter_chunk_delay_ms: 50,
            max_retries: 3,
            retry_backoff_ms: 200,
            session_timeout_ms: 30_000,
            sweep_interval_ms: 5_000,
        }
    }
}

impl ChunkConfig {
    /// Set the maximum on-wire chunk size
    pub fn with_max_chunk_size(mut self, size: usize) -> Self {
        self.max_chunk_size = size;
        self
    }

    /// Set the delay between chunks
    pub fn with_inter_chunk_delay(mut self, delay: Duration) -> Self {
        self.inter_chunk_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn inter_chunk_delay(&self) -> Duration {
        Duration::from_millis(self.inter_chunk_delay_ms)
    }

    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(attempt as u64))
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Header plus at least one byte of payload
        if self.max_chunk_size <= crate::session::CHUNK_HEADER_SIZE {
            return Err(ConfigError::InvalidChunking(format!(
                "max_chunk_size must exceed the {}-byte header",
                crate::session::CHUNK_HEADER_SIZE
            )));
        }
        if self.max_chunk_size > crate::transport::ble::MAX_CHARACTERISTIC_SIZE {
            return Err(ConfigError::InvalidChunking(format!(
                "max_chunk_size must be <= {}",
                crate::transport::ble::MAX_CHARACTERISTIC_SIZE
            )));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::InvalidChunking(
                "max_retries must be at least 1".to_string(),
            ));
        }
        if self.session_timeout_ms == 0 || self.sweep_interval_ms == 0 {
            return Err(ConfigError::InvalidChunking(
                "Session timeout and sweep interval must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Transfer coordinator settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// How long a sender waits for the recipient's decision
    pub approval_timeout_ms: u64,
    /// Overall deadline once the address/package exchange starts
    pub transfer_timeout_ms: u64,
    /// Delay before a completed transfer is removed
    pub completion_grace_ms: u64,
    /// Delay before a rejected transfer is removed
    pub rejection_grace_ms: u64,
    /// Upper bound for each identity collaborator call
    pub identity_timeout_ms: u64,
    /// Encoded envelopes larger than this travel as chunked sessions
    pub chunk_threshold: usize,
    /// Retry failed JSON sends in the compact legacy form where one exists
    pub legacy_fallback: bool,
    /// Number of retired transfer ids remembered
    pub retired_capacity: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            approval_timeout_ms: 30_000,
            transfer_timeout_ms: 60_000,
            completion_grace_ms: 5_000,
            rejection_grace_ms: 3_000,
            identity_timeout_ms: 15_000,
            chunk_threshold: crate::transport::ble::MAX_CHARACTERISTIC_SIZE,
            legacy_fallback: false,
            retired_capacity: 256,
        }
    }
}

impl TransferConfig {
    /// Set the approval timeout
    pub fn with_approval_timeout(mut self, timeout: Duration) -> Self {
        self.approval_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the overall transfer timeout
    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Enable or disable the compact legacy fallback
    pub fn with_legacy_fallback(mut self, enabled: bool) -> Self {
        self.legacy_fallback = enabled;
        self
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_millis(self.approval_timeout_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn completion_grace(&self) -> Duration {
        Duration::from_millis(self.completion_grace_ms)
    }

    pub fn rejection_grace(&self) -> Duration {
        Duration::from_millis(self.rejection_grace_ms)
    }

    pub fn identity_timeout(&self) -> Duration {
        Duration::from_millis(self.identity_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.approval_timeout_ms == 0 || self.transfer_timeout_ms == 0 {
            return Err(ConfigError::InvalidTransfer(
                "Timeouts must be > 0".to_string(),
            ));
        }
        if self.identity_timeout_ms == 0 {
            return Err(ConfigError::InvalidTransfer(
                "identity_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.chunk_threshold == 0 {
            return Err(ConfigError::InvalidTransfer(
                "chunk_threshold must be > 0".to_string(),
            ));
        }
        if self.retired_capacity == 0 {
            return Err(ConfigError::InvalidTransfer(
                "retired_capacity must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Complete node configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenMeshConfig {
    pub mesh: MeshConfig,
    pub chunking: ChunkConfig,
    pub transfer: TransferConfig,
}

impl TokenMeshConfig {
    /// Validate every section
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.mesh.validate()?;
        self.chunking.validate()?;
        self.transfer.validate()?;
        Ok(())
    }
}
