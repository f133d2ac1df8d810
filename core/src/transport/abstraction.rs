//! Radio abstraction layer for TokenMesh
//!
//! The platform BLE stack is reached through [`RadioAdapter`]: one awaitable
//! call per command, plus a single multiplexed channel of [`RadioEvent`]s for
//! everything the radio reports unsolicited (scan hits, inbound writes,
//! connection changes).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

/// Opaque handle for an outbound (client role) connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionHandle(pub u64);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// How a characteristic value is written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    /// Write request, acknowledged by the server
    Default,
    /// Write command, not acknowledged
    NoResponse,
    /// Queued partial write at a byte offset, applied on execute
    Prepared { offset: usize },
}

/// Characteristic as reported by remote service discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCharacteristic {
    pub uuid: u128,
    pub supports_write_no_response: bool,
}

/// Service layout exposed by the local GATT server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub service: u128,
    pub characteristics: Vec<u128>,
}

/// Unsolicited radio callbacks, multiplexed onto one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    /// An advertisement was seen during a scan window
    ScanResult {
        address: String,
        name: Option<String>,
        service_uuids: Vec<u128>,
    },
    /// The platform aborted the running scan
    ScanFailed { error_code: i32 },
    /// A remote central wrote to one of our characteristics
    WriteRequest {
        device: String,
        characteristic: u128,
        value: Vec<u8>,
        prepared: bool,
        offset: usize,
    },
    /// A remote central committed (or cancelled) its prepared writes
    ExecuteWrite { device: String, execute: bool },
    /// A remote central connected to or disconnected from our server
    ConnectionStateChanged { device: String, connected: bool },
}

/// Sending half of the radio event channel
pub type RadioEventSink = mpsc::Sender<RadioEvent>;

/// Command interface to the platform BLE stack
#[async_trait]
pub trait RadioAdapter: Send + Sync {
    /// Local device address
    fn local_address(&self) -> String;

    /// Start advertising the given service UUID
    async fn start_advertise(&self, service: u128) -> Result<(), TransportError>;

    /// Stop advertising
    async fn stop_advertise(&self) -> Result<(), TransportError>;

    /// Start scanning for advertisements carrying `service`; hits go to `events`
    async fn start_scan(&self, service: u128, events: RadioEventSink)
        -> Result<(), TransportError>;

    /// Stop the running scan
    async fn stop_scan(&self) -> Result<(), TransportError>;

    /// Open the inbound GATT server; writes and connection changes go to `events`
    async fn open_server(
        &self,
        descriptor: ServiceDescriptor,
        events: RadioEventSink,
    ) -> Result<(), TransportError>;

    /// Close the inbound GATT server
    async fn close_server(&self) -> Result<(), TransportError>;

    /// Connect to a remote device as a client
    async fn connect(&self, address: &str) -> Result<ConnectionHandle, TransportError>;

    /// Discover `service` on the remote device and list its characteristics
    async fn discover_service(
        &self,
        handle: ConnectionHandle,
        service: u128,
    ) -> Result<Vec<RemoteCharacteristic>, TransportError>;

    /// Request a larger MTU; returns the negotiated value
    async fn request_mtu(&self, handle: ConnectionHandle, mtu: u16)
        -> Result<u16, TransportError>;

    /// Write a characteristic value
    async fn write_characteristic(
        &self,
        handle: ConnectionHandle,
        characteristic: u128,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), TransportError>;

    /// Commit (`true`) or discard (`false`) queued prepared writes
    async fn execute_write(&self, handle: ConnectionHandle, execute: bool)
        -> Result<(), TransportError>;

    /// Tear down an outbound connection
    async fn disconnect(&self, handle: ConnectionHandle) -> Result<(), TransportError>;
}

/// Errors from the radio and the mesh transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport not initialized")]
    NotInitialized,
    #[error("Radio unavailable: {0}")]
    RadioUnavailable(String),
    #[error("Advertising failed: {0}")]
    AdvertiseFailed(String),
    #[error("Scan failed with code {0}")]
    ScanFailed(i32),
    #[error("GATT server error: {0}")]
    ServerFailed(String),
    #[error("Connection to {0} failed")]
    ConnectFailed(String),
    #[error("Service not found on {0}")]
    ServiceNotFound(String),
    #[error("Characteristic {0:#x} not found")]
    CharacteristicNotFound(u128),
    #[error("MTU negotiation failed: {0}")]
    MtuFailed(String),
    #[error("Write failed: {0}")]
    WriteFailed(String),
    #[error("Unknown connection {0}")]
    UnknownConnection(ConnectionHandle),
    #[error("Timed out while {0}")]
    Timeout(String),
    #[error("Event channel closed")]
    ChannelClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_handle_display() {
        assert_eq!(ConnectionHandle(7).to_string(), "conn#7");
    }

    #[test]
    fn test_transport_error_messages() {
        let err = TransportError::Timeout("CONNECTING".to_string());
        assert_eq!(err.to_string(), "Timed out while CONNECTING");

        let err = TransportError::CharacteristicNotFound(0x2A90);
        assert_eq!(err.to_string(), "Characteristic 0x2a90 not found");
    }
}
