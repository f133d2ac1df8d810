// Transfer state machine and the values that flow through it

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Lifecycle state of a single transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferState {
    RequestingPermission,
    Approved,
    Rejected,
    WaitingForAddress,
    GeneratingAddress,
    CreatingPackage,
    SendingPackage,
    WaitingForPackage,
    CompletingTransfer,
    Completed,
    Failed,
}

impl TransferState {
    /// Terminal states are never left
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Rejected | TransferState::Failed
        )
    }

    /// Whether `self -> next` is a legal edge
    pub fn can_transition_to(&self, next: TransferState) -> bool {
        use TransferState::*;

        if self.is_terminal() {
            return false;
        }
        if matches!(next, Rejected | Failed) {
            return true;
        }
        matches!(
            (self, next),
            // Sender
            (RequestingPermission, WaitingForAddress)
                | (WaitingForAddress, CreatingPackage)
                | (CreatingPackage, SendingPackage)
                | (SendingPackage, Completed)
                // Recipient
                | (Approved, GeneratingAddress)
                | (GeneratingAddress, WaitingForPackage)
                | (WaitingForPackage, CompletingTransfer)
                | (CompletingTransfer, Completed)
        )
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferState::RequestingPermission => "REQUESTING_PERMISSION",
            TransferState::Approved => "APPROVED",
            TransferState::Rejected => "REJECTED",
            TransferState::WaitingForAddress => "WAITING_FOR_ADDRESS",
            TransferState::GeneratingAddress => "GENERATING_ADDRESS",
            TransferState::CreatingPackage => "CREATING_PACKAGE",
            TransferState::SendingPackage => "SENDING_PACKAGE",
            TransferState::WaitingForPackage => "WAITING_FOR_PACKAGE",
            TransferState::CompletingTransfer => "COMPLETING_TRANSFER",
            TransferState::Completed => "COMPLETED",
            TransferState::Failed => "FAILED",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferRole {
    Sender,
    Recipient,
}

/// A token held in the local wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub id: String,
    pub token_type: String,
    pub name: String,
    /// Serialized token body handed to the identity collaborator
    pub json_data: String,
}

impl Token {
    pub fn new(
        id: impl Into<String>,
        token_type: impl Into<String>,
        name: impl Into<String>,
        json_data: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            token_type: token_type.into(),
            name: name.into(),
            json_data: json_data.into(),
        }
    }

    /// Short text shown to the recipient before approving
    pub fn preview(&self) -> String {
        format!("{}: {}", self.token_type, self.name)
    }
}

/// One-time identity material produced by the identity collaborator
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub secret: Vec<u8>,
    pub nonce: Vec<u8>,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never log secret material
        f.debug_struct("Identity")
            .field("secret", &"<redacted>")
            .field("nonce", &hex::encode(&self.nonce))
            .finish()
    }
}

/// A transfer tracked by the coordinator
#[derive(Debug, Clone)]
pub struct ActiveTransfer {
    pub transfer_id: String,
    /// Address of the remote device
    pub peer_id: String,
    pub token_id: String,
    /// Present on the sender side
    pub token: Option<Token>,
    pub role: TransferRole,
    pub state: TransferState,
    /// Unix timestamp (ms)
    pub created_at: u64,
    /// Recipient side: identity that derived the address and completes the package
    pub recipient_identity: Option<Identity>,
    /// Recipient side: token type named in the transfer request
    pub token_type: Option<String>,
}

impl ActiveTransfer {
    pub fn sender(transfer_id: &str, peer_id: &str, token: Token, state: TransferState) -> Self {
        Self {
            transfer_id: transfer_id.to_string(),
            peer_id: peer_id.to_string(),
            token_id: token.id.clone(),
            token_type: Some(token.token_type.clone()),
            token: Some(token),
            role: TransferRole::Sender,
            state,
            created_at: now_ms(),
            recipient_identity: None,
        }
    }

    pub fn recipient(transfer_id: &str, peer_id: &str, state: TransferState) -> Self {
        Self {
            transfer_id: transfer_id.to_string(),
            peer_id: peer_id.to_string(),
            token_id: String::new(),
            token: None,
            role: TransferRole::Recipient,
            state,
            created_at: now_ms(),
            recipient_identity: None,
            token_type: None,
        }
    }
}

/// A permission request waiting for the local user's decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferApprovalRequest {
    pub transfer_id: String,
    pub sender_peer_id: String,
    pub sender_name: String,
    pub token_type: String,
    pub token_name: String,
    pub token_preview: String,
    /// Unix timestamp (ms) the request arrived
    pub timestamp: u64,
}

/// Notifications for the host application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    StateChanged {
        transfer_id: String,
        from: Option<TransferState>,
        to: TransferState,
    },
    ApprovalRequested(TransferApprovalRequest),
    /// Recipient: the token was applied and can be stored
    TokenReceived {
        transfer_id: String,
        token_json: String,
    },
    /// Sender: the recipient confirmed; the token can be removed locally
    TokenSent {
        transfer_id: String,
        token_id: String,
    },
    TransferFailed {
        transfer_id: String,
        reason: String,
    },
    TransferCleanedUp {
        transfer_id: String,
        final_state: TransferState,
    },
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
