// TokenMesh Core: proximity token transfer over a BLE mesh
//
// Three layers, bottom up: the mesh transport moves bytes between nearby
// devices, chunked sessions carry bodies too large for one write, and the
// transfer coordinator runs the permission/address/package conversation.

pub mod config;
pub mod session;
pub mod transfer;
pub mod transport;

use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;

pub use config::{ChunkConfig, ConfigError, MeshConfig, TokenMeshConfig, TransferConfig};
pub use session::{ChunkSink, ChunkedSessionManager, SessionError, SessionEvent};
pub use transfer::{
    ActiveTransfer, CoordinatorError, CoordinatorEvent, Identity, IdentityError,
    IdentityProvider, MeshLink, ProtocolError, Token, TransferApprovalRequest,
    TransferCoordinator, TransferRole, TransferState,
};
pub use transport::{MeshEvent, MeshTransport, Peer, RadioAdapter, TransportError};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TokenMeshError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),
    #[error("Coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),
    #[error("Already running")]
    AlreadyRunning,
}

// ============================================================================
// NODE
// ============================================================================

/// One device: transport, chunked sessions and the coordinator, wired together
pub struct TokenMeshNode {
    config: TokenMeshConfig,
    transport: Arc<MeshTransport>,
    sessions: ChunkedSessionManager,
    coordinator: TransferCoordinator,
    running: RwLock<bool>,
}

impl TokenMeshNode {
    pub fn new(
        config: TokenMeshConfig,
        radio: Arc<dyn RadioAdapter>,
        identity: Arc<dyn IdentityProvider>,
        sender_identity: Identity,
        device_name: impl Into<String>,
    ) -> Result<Self, TokenMeshError> {
        config.validate()?;

        let transport = Arc::new(MeshTransport::new(radio, config.mesh.clone()));
        let sessions = ChunkedSessionManager::new(config.chunking.clone());
        let coordinator = TransferCoordinator::new(
            config.transfer.clone(),
            transport.clone(),
            identity,
            sender_identity,
            device_name,
            sessions.clone(),
        );

        Ok(Self {
            config,
            transport,
            sessions,
            coordinator,
            running: RwLock::new(false),
        })
    }

    /// Bring up the radio side, then start the coordinator
    pub async fn start(&self) -> Result<(), TokenMeshError> {
        if *self.running.read() {
            return Err(TokenMeshError::AlreadyRunning);
        }

        tracing::info!("TokenMesh node starting...");
        self.transport.initialize().await?;
        self.coordinator.start();
        *self.running.write() = true;
        tracing::info!(
            address = %self.transport.local_address(),
            "TokenMesh node started"
        );
        Ok(())
    }

    pub async fn stop(&self) {
        if !*self.running.read() {
            return;
        }

        tracing::info!("TokenMesh node stopping...");
        self.coordinator.shutdown();
        self.transport.shutdown().await;
        *self.running.write() = false;
        tracing::info!("TokenMesh node stopped");
    }

    pub fn is_running(&self) -> bool {
        *self.running.read()
    }

    pub fn config(&self) -> &TokenMeshConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<MeshTransport> {
        &self.transport
    }

    pub fn sessions(&self) -> &ChunkedSessionManager {
        &self.sessions
    }

    pub fn coordinator(&self) -> &TransferCoordinator {
        &self.coordinator
    }
}
