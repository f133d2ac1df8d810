//! Transfer protocol coordination
//!
//! A token moves between two devices as a short conversation:
//! permission request and response, address exchange, an offline package,
//! and a completion receipt. Each side tracks its half of the conversation
//! as an [`ActiveTransfer`] driven through [`TransferState`].

pub mod coordinator;
pub mod identity;
pub mod link;
pub mod protocol;
pub mod types;

pub use coordinator::TransferCoordinator;
pub use identity::{IdentityError, IdentityProvider};
pub use link::MeshLink;
pub use protocol::{
    decode_inbound, encode_compact, encode_envelope, Envelope, Inbound, LegacyMessage,
    MessageBody, MessageType, ProtocolError, MAX_ENVELOPE_SIZE,
};
pub use types::{
    ActiveTransfer, CoordinatorEvent, Identity, Token, TransferApprovalRequest, TransferRole,
    TransferState,
};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinatorError {
    #[error("Coordinator not started")]
    NotRunning,
    #[error("Unknown transfer: {0}")]
    UnknownTransfer(String),
    #[error("Transfer already exists: {0}")]
    DuplicateTransfer(String),
    #[error("Transfer {transfer_id} cannot move from {from} to {to}")]
    InvalidTransition {
        transfer_id: String,
        from: TransferState,
        to: TransferState,
    },
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
