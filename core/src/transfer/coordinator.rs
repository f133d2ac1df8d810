// Drives both halves of a token transfer over the mesh
//
// Every state change goes through `transition`, which enforces the state
// graph under the table lock. Each stage runs under its own timeout so a
// vanished peer or an unanswered approval always ends in a terminal state.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::identity::{IdentityError, IdentityProvider};
use super::link::MeshLink;
use super::protocol::{
    decode_inbound, encode_compact, encode_envelope, AddressResponse, Envelope, Inbound,
    MessageBody, PermissionRequest, TransferComplete, TransferPackage, TransferRequest,
};
use super::types::{
    now_ms, ActiveTransfer, CoordinatorEvent, Identity, Token, TransferApprovalRequest,
    TransferRole, TransferState,
};
use super::CoordinatorError;
use crate::config::TransferConfig;
use crate::session::{ChunkedSessionManager, SessionError, SessionEvent, SessionRole};
use crate::transport::{MeshEvent, Peer};

const APPROVAL_TIMEOUT_REASON: &str = "Approval timeout";
const TRANSFER_TIMEOUT_REASON: &str = "Transfer timeout";

/// Bounded record of cleaned-up transfers
struct Retired {
    order: VecDeque<String>,
    states: HashMap<String, TransferState>,
    capacity: usize,
}

impl Retired {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            states: HashMap::new(),
            capacity,
        }
    }

    fn record(&mut self, transfer_id: &str, state: TransferState) {
        if self.states.insert(transfer_id.to_string(), state).is_none() {
            self.order.push_back(transfer_id.to_string());
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.states.remove(&oldest);
            }
        }
    }

    fn get(&self, transfer_id: &str) -> Option<TransferState> {
        self.states.get(transfer_id).copied()
    }
}

struct Inner {
    config: TransferConfig,
    link: Arc<dyn MeshLink>,
    identity: Arc<dyn IdentityProvider>,
    sender_identity: Identity,
    device_name: String,
    sessions: ChunkedSessionManager,
    transfers: Mutex<HashMap<String, ActiveTransfer>>,
    pending: Mutex<Vec<TransferApprovalRequest>>,
    retired: Mutex<Retired>,
    timeouts: Mutex<HashMap<String, JoinHandle<()>>>,
    approvals_tx: watch::Sender<Vec<TransferApprovalRequest>>,
    states_tx: watch::Sender<HashMap<String, TransferState>>,
    events: broadcast::Sender<CoordinatorEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

/// Runs the transfer protocol for every transfer on this device
#[derive(Clone)]
pub struct TransferCoordinator {
    inner: Arc<Inner>,
}

impl TransferCoordinator {
    pub fn new(
        config: TransferConfig,
        link: Arc<dyn MeshLink>,
        identity: Arc<dyn IdentityProvider>,
        sender_identity: Identity,
        device_name: impl Into<String>,
        sessions: ChunkedSessionManager,
    ) -> Self {
        let (approvals_tx, _) = watch::channel(Vec::new());
        let (states_tx, _) = watch::channel(HashMap::new());
        let (events, _) = broadcast::channel(256);
        let retired = Retired::new(config.retired_capacity);
        Self {
            inner: Arc::new(Inner {
                config,
                link,
                identity,
                sender_identity,
                device_name: device_name.into(),
                sessions,
                transfers: Mutex::new(HashMap::new()),
                pending: Mutex::new(Vec::new()),
                retired: Mutex::new(retired),
                timeouts: Mutex::new(HashMap::new()),
                approvals_tx,
                states_tx,
                events,
                tasks: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Start consuming mesh events. Safe to call repeatedly.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut events = self.inner.link.subscribe();
        let coordinator = self.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    MeshEvent::MessageReceived {
                        message,
                        from_device,
                    } => coordinator.dispatch(message, from_device),
                    MeshEvent::ChunkReceived { chunk, from_device } => {
                        let reassembled = coordinator
                            .inner
                            .sessions
                            .receive_chunk(&from_device, &chunk);
                        match reassembled {
                            Ok(Some(body)) => coordinator.dispatch(body, from_device),
                            Ok(None) => {}
                            Err(e) => {
                                warn!(peer = %from_device, "Dropping chunk: {}", e)
                            }
                        }
                    }
                    MeshEvent::Error { message } => debug!("Mesh error: {}", message),
                    _ => {}
                }
            }
            debug!("Mesh event stream closed");
        });

        let mut session_events = self.inner.sessions.subscribe();
        let coordinator = self.clone();
        let watcher = tokio::spawn(async move {
            loop {
                match session_events.recv().await {
                    Ok(SessionEvent::Failed {
                        session_id,
                        role: SessionRole::Receiver,
                        error,
                    }) => coordinator.on_inbound_session_failed(&session_id, &error).await,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Skipped {} session events", skipped)
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        let sweeper = self.inner.sessions.spawn_sweeper();
        self.inner.tasks.lock().extend([pump, watcher, sweeper]);
        info!(device = %self.inner.device_name, "Transfer coordinator started");
    }

    /// Stop background work and cancel all timers
    pub fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        let timers: Vec<JoinHandle<()>> = self
            .inner
            .timeouts
            .lock()
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for timer in timers {
            timer.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn dispatch(&self, message: Vec<u8>, from_device: String) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.handle_incoming(&message, &from_device).await;
        });
    }

    // ---- observers ----

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.inner.events.subscribe()
    }

    pub fn pending_approvals(&self) -> Vec<TransferApprovalRequest> {
        self.inner.pending.lock().clone()
    }

    pub fn watch_pending_approvals(&self) -> watch::Receiver<Vec<TransferApprovalRequest>> {
        self.inner.approvals_tx.subscribe()
    }

    pub fn transfer_states(&self) -> HashMap<String, TransferState> {
        self.inner.states_tx.borrow().clone()
    }

    pub fn watch_transfer_states(&self) -> watch::Receiver<HashMap<String, TransferState>> {
        self.inner.states_tx.subscribe()
    }

    pub fn active_transfer(&self, transfer_id: &str) -> Option<ActiveTransfer> {
        self.inner.transfers.lock().get(transfer_id).cloned()
    }

    pub fn active_transfers(&self) -> Vec<ActiveTransfer> {
        self.inner.transfers.lock().values().cloned().collect()
    }

    /// Current state, or the final state of a cleaned-up transfer
    pub fn final_state(&self, transfer_id: &str) -> Option<TransferState> {
        let active = self.state_of(transfer_id);
        active.or_else(|| self.inner.retired.lock().get(transfer_id))
    }

    /// Peers in range, for choosing a recipient
    pub fn discovered_peers(&self) -> Vec<Peer> {
        self.inner.link.peers()
    }

    // ---- sender operations ----

    /// Ask `peer_id` for permission to send `token`. Returns the new transfer id.
    pub async fn initiate_transfer(
        &self,
        token: Token,
        peer_id: &str,
        peer_name: &str,
    ) -> Result<String, CoordinatorError> {
        if !self.is_running() {
            return Err(CoordinatorError::NotRunning);
        }

        let transfer_id = Uuid::new_v4().to_string();
        let request = PermissionRequest {
            sender_name: self.inner.device_name.clone(),
            token_type: token.token_type.clone(),
            token_name: token.name.clone(),
            token_preview: token.preview(),
        };
        self.insert_transfer(ActiveTransfer::sender(
            &transfer_id,
            peer_id,
            token,
            TransferState::RequestingPermission,
        ))?;
        info!(
            transfer_id = %transfer_id,
            peer = %peer_id,
            "Requesting permission from {}",
            peer_name
        );

        self.arm_timeout(
            &transfer_id,
            self.inner.config.approval_timeout(),
            APPROVAL_TIMEOUT_REASON,
            Some(TransferState::RequestingPermission),
        );

        let envelope = Envelope::new(&transfer_id, MessageBody::PermissionRequest(request));
        if !self.send_envelope(peer_id, &envelope).await {
            self.fail_transfer(&transfer_id, "Failed to send permission request", false)
                .await;
        }
        Ok(transfer_id)
    }

    /// Send `token` without an approval round, for already-trusted peers
    pub async fn initiate_direct_transfer(
        &self,
        token: Token,
        peer_id: &str,
    ) -> Result<String, CoordinatorError> {
        if !self.is_running() {
            return Err(CoordinatorError::NotRunning);
        }

        let transfer_id = Uuid::new_v4().to_string();
        let request = TransferRequest {
            token_type: token.token_type.clone(),
            token_id: token.id.clone(),
        };
        self.insert_transfer(ActiveTransfer::sender(
            &transfer_id,
            peer_id,
            token,
            TransferState::WaitingForAddress,
        ))?;
        info!(transfer_id = %transfer_id, peer = %peer_id, "Starting direct transfer");

        self.arm_timeout(
            &transfer_id,
            self.inner.config.transfer_timeout(),
            TRANSFER_TIMEOUT_REASON,
            None,
        );

        let envelope = Envelope::new(&transfer_id, MessageBody::TransferRequest(request));
        if !self.send_envelope(peer_id, &envelope).await {
            self.fail_transfer(&transfer_id, "Failed to send transfer request", false)
                .await;
        }
        Ok(transfer_id)
    }

    // ---- recipient operations ----

    /// Accept a pending request. Returns `false` if there was nothing to accept.
    pub async fn approve_transfer(&self, transfer_id: &str) -> bool {
        let request = match self.take_pending(transfer_id) {
            Some(request) => request,
            None => {
                debug!(transfer_id = %transfer_id, "No pending approval");
                return false;
            }
        };

        let transfer = ActiveTransfer::recipient(
            transfer_id,
            &request.sender_peer_id,
            TransferState::Approved,
        );
        if let Err(e) = self.insert_transfer(transfer) {
            warn!(transfer_id = %transfer_id, "Cannot approve: {}", e);
            return false;
        }
        self.arm_timeout(
            transfer_id,
            self.inner.config.transfer_timeout(),
            TRANSFER_TIMEOUT_REASON,
            None,
        );

        let response = Envelope::permission_response(transfer_id, true);
        if !self.send_envelope(&request.sender_peer_id, &response).await {
            self.fail_transfer(transfer_id, "Failed to send approval", false)
                .await;
        }
        true
    }

    /// Decline a pending request. Returns `false` if there was nothing to decline.
    pub async fn reject_transfer(&self, transfer_id: &str) -> bool {
        let request = match self.take_pending(transfer_id) {
            Some(request) => request,
            None => {
                debug!(transfer_id = %transfer_id, "No pending approval");
                return false;
            }
        };

        let transfer = ActiveTransfer::recipient(
            transfer_id,
            &request.sender_peer_id,
            TransferState::Rejected,
        );
        if let Err(e) = self.insert_transfer(transfer) {
            warn!(transfer_id = %transfer_id, "Cannot reject: {}", e);
            return false;
        }

        let response = Envelope::permission_response(transfer_id, false);
        if !self.send_envelope(&request.sender_peer_id, &response).await {
            warn!(transfer_id = %transfer_id, "Rejection could not be delivered");
        }
        self.schedule_cleanup(transfer_id, self.inner.config.rejection_grace());
        true
    }

    /// Abort a transfer locally and tell the peer
    pub async fn cancel_transfer(&self, transfer_id: &str) -> bool {
        let pending = self
            .inner
            .pending
            .lock()
            .iter()
            .any(|r| r.transfer_id == transfer_id);
        if pending {
            return self.reject_transfer(transfer_id).await;
        }
        self.fail_transfer(transfer_id, "Cancelled", true).await
    }

    // ---- inbound ----

    /// Handle raw bytes from `from_device`. Bad input is logged and dropped.
    pub async fn handle_incoming(&self, bytes: &[u8], from_device: &str) {
        let envelope = match decode_inbound(bytes) {
            Ok(Inbound::Envelope(envelope)) => envelope,
            Ok(Inbound::Legacy(legacy)) => match legacy.into_envelope() {
                Some(envelope) => envelope,
                None => {
                    debug!(peer = %from_device, "Ignoring compact details request");
                    return;
                }
            },
            Ok(Inbound::Diagnostic) => {
                trace!(peer = %from_device, "Ignoring diagnostic message");
                return;
            }
            Err(e) => {
                warn!(peer = %from_device, "Dropping undecodable message: {}", e);
                return;
            }
        };

        let transfer_id = envelope.transfer_id.clone();
        let retired = self.inner.retired.lock().get(&transfer_id);
        if let Some(state) = retired {
            debug!(
                transfer_id = %transfer_id,
                "Dropping {:?} for retired transfer ({})",
                envelope.message_type(),
                state
            );
            return;
        }

        match envelope.body {
            MessageBody::PermissionRequest(request) => {
                self.on_permission_request(&transfer_id, from_device, request)
            }
            MessageBody::PermissionResponse(response) => {
                self.on_permission_response(&transfer_id, from_device, response.approved)
                    .await
            }
            MessageBody::TransferRequest(request) => {
                self.on_transfer_request(&transfer_id, from_device, request)
                    .await
            }
            MessageBody::AddressResponse(AddressResponse { address }) => {
                self.on_address_response(&transfer_id, from_device, &address)
                    .await
            }
            MessageBody::TransferPackage(TransferPackage { offline_package }) => {
                self.on_transfer_package(&transfer_id, from_device, &offline_package)
                    .await
            }
            MessageBody::TransferComplete(complete) => {
                self.on_transfer_complete(&transfer_id, from_device, complete)
                    .await
            }
            MessageBody::TransferError(payload) => {
                self.on_transfer_error(&transfer_id, from_device, &payload.error)
                    .await
            }
        }
    }

    fn on_permission_request(&self, transfer_id: &str, from: &str, request: PermissionRequest) {
        let known = self.inner.transfers.lock().contains_key(transfer_id);
        let approval = TransferApprovalRequest {
            transfer_id: transfer_id.to_string(),
            sender_peer_id: from.to_string(),
            sender_name: request.sender_name,
            token_type: request.token_type,
            token_name: request.token_name,
            token_preview: request.token_preview,
            timestamp: now_ms(),
        };

        {
            let mut pending = self.inner.pending.lock();
            if known || pending.iter().any(|r| r.transfer_id == transfer_id) {
                debug!(transfer_id = %transfer_id, "Duplicate permission request");
                return;
            }
            pending.push(approval.clone());
            self.inner.approvals_tx.send_replace(pending.clone());
        }
        self.arm_approval_expiry(transfer_id);

        info!(
            transfer_id = %transfer_id,
            peer = %from,
            "{} wants to send {}",
            approval.sender_name,
            approval.token_preview
        );
        self.emit(CoordinatorEvent::ApprovalRequested(approval));
    }

    async fn on_permission_response(&self, transfer_id: &str, from: &str, approved: bool) {
        let transfer = match self.lookup(transfer_id, from, TransferRole::Sender) {
            Some(transfer) => transfer,
            None => return,
        };

        if !approved {
            if self
                .transition(
                    transfer_id,
                    Some(TransferState::RequestingPermission),
                    TransferState::Rejected,
                )
                .is_ok()
            {
                self.cancel_timeout(transfer_id);
                self.schedule_cleanup(transfer_id, self.inner.config.rejection_grace());
            }
            return;
        }

        if self
            .transition(
                transfer_id,
                Some(TransferState::RequestingPermission),
                TransferState::WaitingForAddress,
            )
            .is_err()
        {
            return;
        }
        self.arm_timeout(
            transfer_id,
            self.inner.config.transfer_timeout(),
            TRANSFER_TIMEOUT_REASON,
            None,
        );

        let request = TransferRequest {
            token_type: transfer
                .token
                .as_ref()
                .map(|t| t.token_type.clone())
                .unwrap_or_default(),
            token_id: transfer.token_id.clone(),
        };
        let envelope = Envelope::new(transfer_id, MessageBody::TransferRequest(request));
        if !self.send_envelope(&transfer.peer_id, &envelope).await {
            self.fail_transfer(transfer_id, "Failed to send transfer request", false)
                .await;
        }
    }

    async fn on_transfer_request(&self, transfer_id: &str, from: &str, request: TransferRequest) {
        let existing = self.inner.transfers.lock().get(transfer_id).cloned();
        match existing {
            Some(transfer) => {
                if transfer.peer_id != from || transfer.role != TransferRole::Recipient {
                    warn!(transfer_id = %transfer_id, peer = %from, "Transfer request from wrong peer");
                    return;
                }
                if self
                    .transition(
                        transfer_id,
                        Some(TransferState::Approved),
                        TransferState::GeneratingAddress,
                    )
                    .is_err()
                {
                    return;
                }
            }
            None => {
                let pending = self
                    .inner
                    .pending
                    .lock()
                    .iter()
                    .any(|r| r.transfer_id == transfer_id);
                if pending {
                    debug!(transfer_id = %transfer_id, "Transfer request before approval");
                    return;
                }
                let transfer =
                    ActiveTransfer::recipient(transfer_id, from, TransferState::GeneratingAddress);
                if self.insert_transfer(transfer).is_err() {
                    return;
                }
                self.arm_timeout(
                    transfer_id,
                    self.inner.config.transfer_timeout(),
                    TRANSFER_TIMEOUT_REASON,
                    None,
                );
            }
        }

        self.update_transfer(transfer_id, |t| {
            t.token_id = request.token_id.clone();
            t.token_type = Some(request.token_type.clone());
        });

        let identity = match self
            .bounded("generate identity", self.inner.identity.generate_identity())
            .await
        {
            Ok(identity) => identity,
            Err(e) => {
                self.send_error(transfer_id, &format!("Address generation failed: {}", e))
                    .await;
                return;
            }
        };
        let address = match self
            .bounded(
                "derive address",
                self.inner
                    .identity
                    .derive_address(&identity, &request.token_type, &request.token_id),
            )
            .await
        {
            Ok(address) => address,
            Err(e) => {
                self.send_error(transfer_id, &format!("Address generation failed: {}", e))
                    .await;
                return;
            }
        };

        self.update_transfer(transfer_id, |t| t.recipient_identity = Some(identity));
        if self
            .transition(
                transfer_id,
                Some(TransferState::GeneratingAddress),
                TransferState::WaitingForPackage,
            )
            .is_err()
        {
            return;
        }

        let envelope = Envelope::new(
            transfer_id,
            MessageBody::AddressResponse(AddressResponse { address }),
        );
        if !self.send_envelope(from, &envelope).await {
            self.fail_transfer(transfer_id, "Failed to send address", false)
                .await;
        }
    }

    async fn on_address_response(&self, transfer_id: &str, from: &str, address: &str) {
        let transfer = match self.lookup(transfer_id, from, TransferRole::Sender) {
            Some(transfer) => transfer,
            None => return,
        };
        if self
            .transition(
                transfer_id,
                Some(TransferState::WaitingForAddress),
                TransferState::CreatingPackage,
            )
            .is_err()
        {
            return;
        }

        let token_json = match transfer.token {
            Some(token) => token.json_data,
            None => {
                self.send_error(transfer_id, "Missing token").await;
                return;
            }
        };
        let package = match self
            .bounded(
                "create package",
                self.inner.identity.create_offline_transfer_package(
                    &self.inner.sender_identity,
                    address,
                    &token_json,
                ),
            )
            .await
        {
            Ok(package) => package,
            Err(e) => {
                self.send_error(transfer_id, &format!("Package creation failed: {}", e))
                    .await;
                return;
            }
        };

        if self
            .transition(
                transfer_id,
                Some(TransferState::CreatingPackage),
                TransferState::SendingPackage,
            )
            .is_err()
        {
            return;
        }

        let envelope = Envelope::new(
            transfer_id,
            MessageBody::TransferPackage(TransferPackage {
                offline_package: package,
            }),
        );
        let bytes = match encode_envelope(&envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.send_error(transfer_id, &format!("Package encoding failed: {}", e))
                    .await;
                return;
            }
        };

        let sent = if bytes.len() > self.inner.config.chunk_threshold {
            debug!(transfer_id = %transfer_id, "Package is {} bytes, chunking", bytes.len());
            match self
                .inner
                .sessions
                .send_payload(transfer_id, &transfer.peer_id, &bytes, self.inner.link.as_ref())
                .await
            {
                Ok(()) => true,
                Err(e) => {
                    warn!(transfer_id = %transfer_id, "Chunked package send failed: {}", e);
                    false
                }
            }
        } else {
            self.inner.link.send(&transfer.peer_id, &bytes).await
        };

        if !sent {
            self.fail_transfer(transfer_id, "Failed to send transfer package", false)
                .await;
        }
    }

    async fn on_transfer_package(&self, transfer_id: &str, from: &str, package: &str) {
        let transfer = match self.lookup(transfer_id, from, TransferRole::Recipient) {
            Some(transfer) => transfer,
            None => return,
        };
        if self
            .transition(
                transfer_id,
                Some(TransferState::WaitingForPackage),
                TransferState::CompletingTransfer,
            )
            .is_err()
        {
            return;
        }
        self.cancel_timeout(transfer_id);

        let identity = match transfer.recipient_identity {
            Some(identity) => identity,
            None => {
                self.send_error(transfer_id, "Missing recipient identity")
                    .await;
                return;
            }
        };
        let token_json = match self
            .bounded(
                "complete transfer",
                self.inner
                    .identity
                    .complete_offline_transfer(&identity, package),
            )
            .await
        {
            Ok(token_json) => token_json,
            Err(e) => {
                self.send_error(transfer_id, &format!("Transfer completion failed: {}", e))
                    .await;
                return;
            }
        };

        if self
            .transition(
                transfer_id,
                Some(TransferState::CompletingTransfer),
                TransferState::Completed,
            )
            .is_err()
        {
            return;
        }
        self.emit(CoordinatorEvent::TokenReceived {
            transfer_id: transfer_id.to_string(),
            token_json: token_json.clone(),
        });

        let envelope = Envelope::new(
            transfer_id,
            MessageBody::TransferComplete(TransferComplete {
                success: true,
                token_json: Some(token_json),
            }),
        );
        if !self.send_envelope(from, &envelope).await {
            warn!(transfer_id = %transfer_id, "Completion receipt could not be delivered");
        }
        self.schedule_cleanup(transfer_id, self.inner.config.completion_grace());
    }

    async fn on_transfer_complete(&self, transfer_id: &str, from: &str, complete: TransferComplete) {
        let transfer = match self.lookup(transfer_id, from, TransferRole::Sender) {
            Some(transfer) => transfer,
            None => return,
        };

        if !complete.success {
            self.fail_transfer(transfer_id, "Recipient could not complete the transfer", false)
                .await;
            return;
        }

        if self
            .transition(
                transfer_id,
                Some(TransferState::SendingPackage),
                TransferState::Completed,
            )
            .is_err()
        {
            return;
        }
        self.cancel_timeout(transfer_id);
        self.emit(CoordinatorEvent::TokenSent {
            transfer_id: transfer_id.to_string(),
            token_id: transfer.token_id,
        });
        self.schedule_cleanup(transfer_id, self.inner.config.completion_grace());
    }

    async fn on_transfer_error(&self, transfer_id: &str, from: &str, error: &str) {
        let withdrawn = {
            let mut pending = self.inner.pending.lock();
            let before = pending.len();
            pending.retain(|r| !(r.transfer_id == transfer_id && r.sender_peer_id == from));
            let withdrawn = pending.len() != before;
            if withdrawn {
                self.inner.approvals_tx.send_replace(pending.clone());
            }
            withdrawn
        };
        if withdrawn {
            self.cancel_timeout(transfer_id);
            info!(transfer_id = %transfer_id, "Request withdrawn by sender: {}", error);
            self.inner
                .retired
                .lock()
                .record(transfer_id, TransferState::Failed);
            self.emit(CoordinatorEvent::TransferFailed {
                transfer_id: transfer_id.to_string(),
                reason: error.to_string(),
            });
            return;
        }

        let peer = self.inner.transfers.lock().get(transfer_id).map(|t| t.peer_id.clone());
        match peer {
            Some(peer) if peer == from => {
                warn!(transfer_id = %transfer_id, "Peer reported error: {}", error);
                self.fail_transfer(transfer_id, error, false).await;
            }
            Some(_) => warn!(transfer_id = %transfer_id, peer = %from, "Error from wrong peer"),
            None => debug!(transfer_id = %transfer_id, "Error for unknown transfer"),
        }
    }

    /// A partial chunked body from `device` was abandoned
    async fn on_inbound_session_failed(&self, device: &str, error: &SessionError) {
        let waiting: Vec<String> = self
            .inner
            .transfers
            .lock()
            .values()
            .filter(|t| {
                t.role == TransferRole::Recipient
                    && t.peer_id == device
                    && t.state == TransferState::WaitingForPackage
            })
            .map(|t| t.transfer_id.clone())
            .collect();
        if waiting.is_empty() {
            debug!(peer = %device, "Abandoned chunked body matches no transfer: {}", error);
            return;
        }

        let reason = format!("Package delivery failed: {}", error);
        for transfer_id in waiting {
            self.fail_transfer(&transfer_id, &reason, true).await;
        }
    }

    /// Drop a request nobody answered in time
    async fn expire_pending(&self, transfer_id: &str) {
        let request = match self.take_pending(transfer_id) {
            Some(request) => request,
            None => return,
        };
        self.inner.timeouts.lock().remove(transfer_id);
        self.inner
            .retired
            .lock()
            .record(transfer_id, TransferState::Failed);
        warn!(
            transfer_id = %transfer_id,
            peer = %request.sender_peer_id,
            "Request from {} was never answered",
            request.sender_name
        );

        let notice = Envelope::error(transfer_id, APPROVAL_TIMEOUT_REASON);
        if !self.send_envelope(&request.sender_peer_id, &notice).await {
            debug!(transfer_id = %transfer_id, "Sender could not be notified");
        }
        self.emit(CoordinatorEvent::TransferFailed {
            transfer_id: transfer_id.to_string(),
            reason: APPROVAL_TIMEOUT_REASON.to_string(),
        });
    }

    // ---- failure and cleanup ----

    /// Fail a live transfer because a timer expired
    pub async fn handle_transfer_timeout(&self, transfer_id: &str, reason: &str) -> bool {
        self.cancel_timeout(transfer_id);
        let live = self
            .state_of(transfer_id)
            .is_some_and(|state| !state.is_terminal());
        if !live {
            return false;
        }
        warn!(transfer_id = %transfer_id, "{}", reason);
        self.fail_transfer(transfer_id, reason, true).await
    }

    /// Remove a transfer and remember its final state
    pub fn cleanup_transfer(&self, transfer_id: &str) -> bool {
        self.cancel_timeout(transfer_id);
        let removed = {
            let mut transfers = self.inner.transfers.lock();
            let removed = transfers.remove(transfer_id);
            if let Some(transfer) = &removed {
                self.inner
                    .retired
                    .lock()
                    .record(transfer_id, transfer.state);
                self.publish_states(&transfers);
            }
            removed
        };

        match removed {
            Some(transfer) => {
                debug!(transfer_id = %transfer_id, "Cleaned up in {}", transfer.state);
                self.emit(CoordinatorEvent::TransferCleanedUp {
                    transfer_id: transfer_id.to_string(),
                    final_state: transfer.state,
                });
                true
            }
            None => false,
        }
    }

    async fn send_error(&self, transfer_id: &str, reason: &str) {
        self.fail_transfer(transfer_id, reason, true).await;
    }

    /// Move to FAILED, optionally tell the peer, then clean up
    async fn fail_transfer(&self, transfer_id: &str, reason: &str, notify: bool) -> bool {
        let found = self
            .inner
            .transfers
            .lock()
            .get(transfer_id)
            .map(|t| (t.peer_id.clone(), t.role, t.state));
        let (peer, role, state) = match found {
            Some(found) => found,
            None => return false,
        };
        if let Err(e) = self.transition(transfer_id, None, TransferState::Failed) {
            debug!("Not failing transfer: {}", e);
            return false;
        }
        self.cancel_timeout(transfer_id);
        warn!(transfer_id = %transfer_id, "Transfer failed: {}", reason);

        if role == TransferRole::Recipient && state == TransferState::WaitingForPackage {
            self.inner.sessions.discard_inbound(&peer);
        }

        if notify && !self.send_envelope(&peer, &Envelope::error(transfer_id, reason)).await {
            debug!(transfer_id = %transfer_id, "Peer could not be notified");
        }
        self.emit(CoordinatorEvent::TransferFailed {
            transfer_id: transfer_id.to_string(),
            reason: reason.to_string(),
        });
        self.cleanup_transfer(transfer_id);
        true
    }

    fn schedule_cleanup(&self, transfer_id: &str, after: Duration) {
        let coordinator = self.clone();
        let transfer_id = transfer_id.to_string();
        tokio::spawn(async move {
            sleep(after).await;
            coordinator.cleanup_transfer(&transfer_id);
        });
    }

    fn arm_timeout(
        &self,
        transfer_id: &str,
        after: Duration,
        reason: &'static str,
        only_in: Option<TransferState>,
    ) {
        let coordinator = self.clone();
        let id = transfer_id.to_string();
        let timer = tokio::spawn(async move {
            sleep(after).await;
            // Drop our own handle so nothing downstream aborts this task
            coordinator.inner.timeouts.lock().remove(&id);
            let state = coordinator.state_of(&id);
            if only_in.is_some() && state != only_in {
                return;
            }
            coordinator.handle_transfer_timeout(&id, reason).await;
        });
        self.store_timer(transfer_id, timer);
    }

    /// Replaced by the transfer timer once the request is approved
    fn arm_approval_expiry(&self, transfer_id: &str) {
        let coordinator = self.clone();
        let id = transfer_id.to_string();
        let after = self.inner.config.approval_timeout();
        let timer = tokio::spawn(async move {
            sleep(after).await;
            coordinator.expire_pending(&id).await;
        });
        self.store_timer(transfer_id, timer);
    }

    fn store_timer(&self, transfer_id: &str, timer: JoinHandle<()>) {
        let previous = self
            .inner
            .timeouts
            .lock()
            .insert(transfer_id.to_string(), timer);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn cancel_timeout(&self, transfer_id: &str) {
        let timer = self.inner.timeouts.lock().remove(transfer_id);
        if let Some(timer) = timer {
            timer.abort();
        }
    }

    // ---- table ----

    /// The only place transfer state changes
    fn transition(
        &self,
        transfer_id: &str,
        expected: Option<TransferState>,
        to: TransferState,
    ) -> Result<TransferState, CoordinatorError> {
        let from = {
            let mut transfers = self.inner.transfers.lock();
            let transfer = transfers
                .get_mut(transfer_id)
                .ok_or_else(|| CoordinatorError::UnknownTransfer(transfer_id.to_string()))?;
            let from = transfer.state;
            if expected.is_some_and(|e| e != from) || !from.can_transition_to(to) {
                debug!(transfer_id = %transfer_id, "Ignoring {} -> {}", from, to);
                return Err(CoordinatorError::InvalidTransition {
                    transfer_id: transfer_id.to_string(),
                    from,
                    to,
                });
            }
            transfer.state = to;
            self.publish_states(&transfers);
            from
        };

        info!(transfer_id = %transfer_id, "{} -> {}", from, to);
        self.emit(CoordinatorEvent::StateChanged {
            transfer_id: transfer_id.to_string(),
            from: Some(from),
            to,
        });
        Ok(from)
    }

    fn insert_transfer(&self, transfer: ActiveTransfer) -> Result<(), CoordinatorError> {
        let transfer_id = transfer.transfer_id.clone();
        let state = transfer.state;
        {
            let mut transfers = self.inner.transfers.lock();
            if transfers.contains_key(&transfer_id)
                || self.inner.retired.lock().get(&transfer_id).is_some()
            {
                return Err(CoordinatorError::DuplicateTransfer(transfer_id));
            }
            transfers.insert(transfer_id.clone(), transfer);
            self.publish_states(&transfers);
        }

        info!(transfer_id = %transfer_id, "New transfer in {}", state);
        self.emit(CoordinatorEvent::StateChanged {
            transfer_id,
            from: None,
            to: state,
        });
        Ok(())
    }

    fn update_transfer(&self, transfer_id: &str, update: impl FnOnce(&mut ActiveTransfer)) {
        if let Some(transfer) = self.inner.transfers.lock().get_mut(transfer_id) {
            update(transfer);
        }
    }

    fn lookup(&self, transfer_id: &str, from: &str, role: TransferRole) -> Option<ActiveTransfer> {
        let transfer = self.inner.transfers.lock().get(transfer_id).cloned();
        match transfer {
            Some(t) if t.peer_id == from && t.role == role => Some(t),
            Some(_) => {
                warn!(transfer_id = %transfer_id, peer = %from, "Message does not match transfer");
                None
            }
            None => {
                debug!(transfer_id = %transfer_id, "Message for unknown transfer");
                None
            }
        }
    }

    fn state_of(&self, transfer_id: &str) -> Option<TransferState> {
        self.inner.transfers.lock().get(transfer_id).map(|t| t.state)
    }

    fn take_pending(&self, transfer_id: &str) -> Option<TransferApprovalRequest> {
        let mut pending = self.inner.pending.lock();
        let index = pending.iter().position(|r| r.transfer_id == transfer_id)?;
        let request = pending.remove(index);
        self.inner.approvals_tx.send_replace(pending.clone());
        Some(request)
    }

    fn publish_states(&self, transfers: &HashMap<String, ActiveTransfer>) {
        let states = transfers
            .iter()
            .map(|(id, t)| (id.clone(), t.state))
            .collect();
        self.inner.states_tx.send_replace(states);
    }

    fn emit(&self, event: CoordinatorEvent) {
        let _ = self.inner.events.send(event);
    }

    // ---- outbound ----

    async fn send_envelope(&self, peer: &str, envelope: &Envelope) -> bool {
        let bytes = match encode_envelope(envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(transfer_id = %envelope.transfer_id, "Cannot encode message: {}", e);
                return false;
            }
        };
        if self.inner.link.send(peer, &bytes).await {
            return true;
        }

        if self.inner.config.legacy_fallback {
            if let Some(compact) = encode_compact(envelope) {
                debug!(transfer_id = %envelope.transfer_id, "Retrying in compact form");
                return self.inner.link.send(peer, compact.as_bytes()).await;
            }
        }
        false
    }

    async fn bounded<T, F>(&self, what: &str, operation: F) -> Result<T, IdentityError>
    where
        F: Future<Output = Result<T, IdentityError>>,
    {
        match timeout(self.inner.config.identity_timeout(), operation).await {
            Ok(result) => result,
            Err(_) => Err(IdentityError::Timeout(what.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChunkConfig;
    use crate::session::{split_payload, ChunkSink};
    use crate::transfer::identity::MockIdentityProvider;
    use crate::transfer::protocol::{PermissionResponse, TransferErrorPayload};
    use crate::transport::{EventBus, EventSubscription};
    use async_trait::async_trait;

    const BOB: &str = "BB:02";

    #[derive(Default)]
    struct RecordingLink {
        bus: Option<EventBus>,
        sent: Mutex<Vec<(String, Vec<u8>)>>,
        chunks: Mutex<Vec<(String, Vec<u8>)>>,
        fail_json: AtomicBool,
        fail_all: AtomicBool,
    }

    impl RecordingLink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                bus: Some(EventBus::new(64, 0)),
                ..Default::default()
            })
        }

        fn raw_sent(&self) -> Vec<Vec<u8>> {
            self.sent.lock().iter().map(|(_, b)| b.clone()).collect()
        }

        fn envelopes(&self) -> Vec<Envelope> {
            self.raw_sent()
                .iter()
                .filter_map(|b| match decode_inbound(b) {
                    Ok(Inbound::Envelope(e)) => Some(e),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl ChunkSink for RecordingLink {
        async fn send_chunk(&self, peer: &str, chunk: &[u8]) -> bool {
            if self.fail_all.load(Ordering::SeqCst) {
                return false;
            }
            self.chunks.lock().push((peer.to_string(), chunk.to_vec()));
            true
        }
    }

    #[async_trait]
    impl MeshLink for RecordingLink {
        async fn send(&self, peer: &str, payload: &[u8]) -> bool {
            if self.fail_all.load(Ordering::SeqCst) {
                return false;
            }
            if self.fail_json.load(Ordering::SeqCst) && payload.first() == Some(&b'{') {
                return false;
            }
            self.sent.lock().push((peer.to_string(), payload.to_vec()));
            true
        }

        fn subscribe(&self) -> EventSubscription {
            match &self.bus {
                Some(bus) => bus.subscribe(),
                None => EventBus::new(1, 0).subscribe(),
            }
        }

        fn peers(&self) -> Vec<Peer> {
            Vec::new()
        }
    }

    fn identity(tag: u8) -> Identity {
        Identity {
            secret: vec![tag; 4],
            nonce: vec![tag],
        }
    }

    fn token() -> Token {
        Token::new("tok-1", "ticket", "Concert", r#"{"seat":"A1"}"#)
    }

    fn happy_identity() -> MockIdentityProvider {
        let mut mock = MockIdentityProvider::new();
        mock.expect_generate_identity()
            .returning(|| Ok(identity(7)));
        mock.expect_derive_address()
            .returning(|_, token_type, token_id| Ok(format!("addr:{}:{}", token_type, token_id)));
        mock.expect_create_offline_transfer_package()
            .returning(|_, address, json| Ok(format!("pkg|{}|{}", address, json)));
        mock.expect_complete_offline_transfer()
            .returning(|_, package| Ok(package.rsplit('|').next().unwrap_or("").to_string()));
        mock
    }

    fn coordinator_with(
        link: &Arc<RecordingLink>,
        identity_provider: MockIdentityProvider,
        config: TransferConfig,
    ) -> TransferCoordinator {
        let coordinator = TransferCoordinator::new(
            config,
            link.clone(),
            Arc::new(identity_provider),
            identity(1),
            "Alice",
            ChunkedSessionManager::new(ChunkConfig::default()),
        );
        coordinator.start();
        coordinator
    }

    fn coordinator(link: &Arc<RecordingLink>) -> TransferCoordinator {
        coordinator_with(link, happy_identity(), TransferConfig::default())
    }

    async fn feed(coordinator: &TransferCoordinator, envelope: Envelope) {
        let bytes = encode_envelope(&envelope).expect("encode");
        coordinator.handle_incoming(&bytes, BOB).await;
    }

    fn permission_request(transfer_id: &str) -> Envelope {
        Envelope::new(
            transfer_id,
            MessageBody::PermissionRequest(PermissionRequest {
                sender_name: "Bob".into(),
                token_type: "ticket".into(),
                token_name: "Concert".into(),
                token_preview: "ticket: Concert".into(),
            }),
        )
    }

    fn transfer_request(transfer_id: &str) -> Envelope {
        Envelope::new(
            transfer_id,
            MessageBody::TransferRequest(TransferRequest {
                token_type: "ticket".into(),
                token_id: "tok-1".into(),
            }),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_initiate_sends_permission_request() {
        let link = RecordingLink::new();
        let alice = coordinator(&link);

        let id = alice
            .initiate_transfer(token(), BOB, "Bob")
            .await
            .expect("initiate");

        let sent = link.envelopes();
        assert_eq!(sent.len(), 1);
        match &sent[0].body {
            MessageBody::PermissionRequest(r) => {
                assert_eq!(r.sender_name, "Alice");
                assert_eq!(r.token_preview, "ticket: Concert");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            alice.transfer_states().get(&id),
            Some(&TransferState::RequestingPermission)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_initiate_requires_start() {
        let link = RecordingLink::new();
        let alice = TransferCoordinator::new(
            TransferConfig::default(),
            link.clone(),
            Arc::new(MockIdentityProvider::new()),
            identity(1),
            "Alice",
            ChunkedSessionManager::new(ChunkConfig::default()),
        );
        assert_eq!(
            alice.initiate_transfer(token(), BOB, "Bob").await,
            Err(CoordinatorError::NotRunning)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_approval_timeout_fails_and_notifies() {
        let link = RecordingLink::new();
        let alice = coordinator(&link);
        let id = alice
            .initiate_transfer(token(), BOB, "Bob")
            .await
            .expect("initiate");

        sleep(Duration::from_millis(29_000)).await;
        assert_eq!(alice.final_state(&id), Some(TransferState::RequestingPermission));

        sleep(Duration::from_millis(2_000)).await;
        assert_eq!(alice.final_state(&id), Some(TransferState::Failed));
        assert!(alice.active_transfer(&id).is_none());

        let last = link.envelopes().pop().expect("error sent");
        assert_eq!(
            last.body,
            MessageBody::TransferError(TransferErrorPayload {
                error: "Approval timeout".into()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_permission_send_fails_transfer() {
        let link = RecordingLink::new();
        link.fail_all.store(true, Ordering::SeqCst);
        let alice = coordinator(&link);

        let id = alice
            .initiate_transfer(token(), BOB, "Bob")
            .await
            .expect("initiate");
        assert_eq!(alice.final_state(&id), Some(TransferState::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_approve_twice_sends_one_response() {
        let link = RecordingLink::new();
        let carol = coordinator(&link);
        feed(&carol, permission_request("t1")).await;

        let pending = carol.pending_approvals();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].sender_peer_id, BOB);

        assert!(carol.approve_transfer("t1").await);
        assert!(!carol.approve_transfer("t1").await);
        assert!(!carol.reject_transfer("t1").await);

        assert_eq!(
            link.envelopes(),
            vec![Envelope::permission_response("t1", true)]
        );
        assert_eq!(carol.final_state("t1"), Some(TransferState::Approved));
        assert!(carol.pending_approvals().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_permission_request_ignored() {
        let link = RecordingLink::new();
        let carol = coordinator(&link);
        let mut events = carol.subscribe();

        feed(&carol, permission_request("t1")).await;
        feed(&carol, permission_request("t1")).await;
        assert_eq!(carol.pending_approvals().len(), 1);

        let mut requested = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, CoordinatorEvent::ApprovalRequested(_)) {
                requested += 1;
            }
        }
        assert_eq!(requested, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reject_cleans_up_after_grace() {
        let link = RecordingLink::new();
        let carol = coordinator(&link);
        feed(&carol, permission_request("t1")).await;

        assert!(carol.reject_transfer("t1").await);
        assert_eq!(
            link.envelopes(),
            vec![Envelope::permission_response("t1", false)]
        );
        assert!(carol.active_transfer("t1").is_some());

        sleep(Duration::from_millis(3_100)).await;
        assert!(carol.active_transfer("t1").is_none());
        assert_eq!(carol.final_state("t1"), Some(TransferState::Rejected));

        // A late request cannot bring it back
        feed(&carol, permission_request("t1")).await;
        assert!(carol.pending_approvals().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sender_happy_path() {
        let link = RecordingLink::new();
        let alice = coordinator(&link);
        let mut events = alice.subscribe();
        let id = alice
            .initiate_transfer(token(), BOB, "Bob")
            .await
            .expect("initiate");

        feed(&alice, Envelope::permission_response(&id, true)).await;
        assert_eq!(alice.final_state(&id), Some(TransferState::WaitingForAddress));
        assert_eq!(link.envelopes()[1], transfer_request(&id));

        feed(
            &alice,
            Envelope::new(
                &id,
                MessageBody::AddressResponse(AddressResponse {
                    address: "addr-bob".into(),
                }),
            ),
        )
        .await;
        assert_eq!(alice.final_state(&id), Some(TransferState::SendingPackage));
        assert_eq!(
            link.envelopes()[2].body,
            MessageBody::TransferPackage(TransferPackage {
                offline_package: r#"pkg|addr-bob|{"seat":"A1"}"#.into()
            })
        );

        feed(
            &alice,
            Envelope::new(
                &id,
                MessageBody::TransferComplete(TransferComplete {
                    success: true,
                    token_json: None,
                }),
            ),
        )
        .await;
        assert_eq!(alice.final_state(&id), Some(TransferState::Completed));

        let mut token_sent = false;
        while let Ok(event) = events.try_recv() {
            if let CoordinatorEvent::TokenSent { token_id, .. } = event {
                token_sent = token_id == "tok-1";
            }
        }
        assert!(token_sent);

        sleep(Duration::from_millis(4_000)).await;
        assert!(alice.active_transfer(&id).is_some());
        sleep(Duration::from_millis(1_500)).await;
        assert!(alice.active_transfer(&id).is_none());
        assert_eq!(alice.final_state(&id), Some(TransferState::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sender_rejected_never_sends_request() {
        let link = RecordingLink::new();
        let alice = coordinator(&link);
        let id = alice
            .initiate_transfer(token(), BOB, "Bob")
            .await
            .expect("initiate");

        feed(&alice, Envelope::permission_response(&id, false)).await;
        assert_eq!(alice.final_state(&id), Some(TransferState::Rejected));

        // Approval timer was cancelled
        sleep(Duration::from_secs(40)).await;
        assert_eq!(alice.final_state(&id), Some(TransferState::Rejected));
        assert!(link
            .envelopes()
            .iter()
            .all(|e| !matches!(e.body, MessageBody::TransferRequest(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recipient_happy_path() {
        let link = RecordingLink::new();
        let carol = coordinator(&link);
        let mut events = carol.subscribe();

        feed(&carol, permission_request("t1")).await;
        assert!(carol.approve_transfer("t1").await);
        feed(&carol, transfer_request("t1")).await;

        assert_eq!(carol.final_state("t1"), Some(TransferState::WaitingForPackage));
        let transfer = carol.active_transfer("t1").expect("active");
        assert_eq!(transfer.token_id, "tok-1");
        assert_eq!(transfer.recipient_identity, Some(identity(7)));
        assert_eq!(
            link.envelopes()[1].body,
            MessageBody::AddressResponse(AddressResponse {
                address: "addr:ticket:tok-1".into()
            })
        );

        feed(
            &carol,
            Envelope::new(
                "t1",
                MessageBody::TransferPackage(TransferPackage {
                    offline_package: r#"pkg|addr|{"seat":"A1"}"#.into(),
                }),
            ),
        )
        .await;
        assert_eq!(carol.final_state("t1"), Some(TransferState::Completed));
        assert_eq!(
            link.envelopes()[2].body,
            MessageBody::TransferComplete(TransferComplete {
                success: true,
                token_json: Some(r#"{"seat":"A1"}"#.into())
            })
        );

        let mut received = None;
        while let Ok(event) = events.try_recv() {
            if let CoordinatorEvent::TokenReceived { token_json, .. } = event {
                received = Some(token_json);
            }
        }
        assert_eq!(received.as_deref(), Some(r#"{"seat":"A1"}"#));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transfer_request_before_approval_ignored() {
        let link = RecordingLink::new();
        let carol = coordinator(&link);
        feed(&carol, permission_request("t1")).await;
        feed(&carol, transfer_request("t1")).await;

        assert!(carol.active_transfer("t1").is_none());
        assert!(link.envelopes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_direct_request_creates_recipient_transfer() {
        let link = RecordingLink::new();
        let carol = coordinator(&link);
        feed(&carol, transfer_request("d1")).await;

        let transfer = carol.active_transfer("d1").expect("active");
        assert_eq!(transfer.role, TransferRole::Recipient);
        assert_eq!(transfer.state, TransferState::WaitingForPackage);

        // Sender vanished: overall timeout applies
        sleep(Duration::from_secs(61)).await;
        assert_eq!(carol.final_state("d1"), Some(TransferState::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_package_failure_reports_error() {
        let link = RecordingLink::new();
        let mut mock = MockIdentityProvider::new();
        mock.expect_create_offline_transfer_package()
            .returning(|_, _, _| Err(IdentityError::PackageCreation("insufficient balance".into())));
        let alice = coordinator_with(&link, mock, TransferConfig::default());

        let id = alice
            .initiate_direct_transfer(token(), BOB)
            .await
            .expect("initiate");
        feed(
            &alice,
            Envelope::new(
                &id,
                MessageBody::AddressResponse(AddressResponse {
                    address: "addr".into(),
                }),
            ),
        )
        .await;

        assert_eq!(alice.final_state(&id), Some(TransferState::Failed));
        match &link.envelopes().last().expect("error").body {
            MessageBody::TransferError(e) => assert!(e.error.contains("insufficient balance")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_large_package_is_chunked() {
        let link = RecordingLink::new();
        let mut mock = MockIdentityProvider::new();
        mock.expect_create_offline_transfer_package()
            .returning(|_, _, _| Ok("p".repeat(3000)));
        let alice = coordinator_with(&link, mock, TransferConfig::default());

        let id = alice
            .initiate_direct_transfer(token(), BOB)
            .await
            .expect("initiate");
        feed(
            &alice,
            Envelope::new(
                &id,
                MessageBody::AddressResponse(AddressResponse {
                    address: "addr".into(),
                }),
            ),
        )
        .await;

        assert_eq!(alice.final_state(&id), Some(TransferState::SendingPackage));
        let chunks = link.chunks.lock().len();
        assert!(chunks >= 6, "expected chunked send, got {}", chunks);
        assert!(link
            .envelopes()
            .iter()
            .all(|e| !matches!(e.body, MessageBody::TransferPackage(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_error_fails_transfer() {
        let link = RecordingLink::new();
        let alice = coordinator(&link);
        let id = alice
            .initiate_transfer(token(), BOB, "Bob")
            .await
            .expect("initiate");

        feed(&alice, Envelope::error(&id, "Cancelled")).await;
        assert_eq!(alice.final_state(&id), Some(TransferState::Failed));
        // No error echoed back
        assert_eq!(link.envelopes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_withdraws_pending_approval() {
        let link = RecordingLink::new();
        let carol = coordinator(&link);
        feed(&carol, permission_request("t1")).await;
        feed(&carol, Envelope::error("t1", "Approval timeout")).await;

        assert!(carol.pending_approvals().is_empty());
        assert!(!carol.approve_transfer("t1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_request_expires() {
        let link = RecordingLink::new();
        let carol = coordinator(&link);
        let mut events = carol.subscribe();
        let approvals = carol.watch_pending_approvals();
        feed(&carol, permission_request("t1")).await;

        sleep(Duration::from_millis(29_000)).await;
        assert_eq!(carol.pending_approvals().len(), 1);

        sleep(Duration::from_millis(2_000)).await;
        assert!(carol.pending_approvals().is_empty());
        assert!(approvals.borrow().is_empty());
        assert_eq!(carol.final_state("t1"), Some(TransferState::Failed));
        assert!(!carol.approve_transfer("t1").await);
        assert_eq!(link.envelopes(), vec![Envelope::error("t1", "Approval timeout")]);

        let mut failed = None;
        while let Ok(event) = events.try_recv() {
            if let CoordinatorEvent::TransferFailed { reason, .. } = event {
                failed = Some(reason);
            }
        }
        assert_eq!(failed.as_deref(), Some("Approval timeout"));

        // A late duplicate cannot bring it back
        feed(&carol, permission_request("t1")).await;
        assert!(carol.pending_approvals().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_approved_request_does_not_expire() {
        let link = RecordingLink::new();
        let carol = coordinator(&link);
        feed(&carol, permission_request("t1")).await;

        sleep(Duration::from_millis(10_000)).await;
        assert!(carol.approve_transfer("t1").await);

        sleep(Duration::from_millis(25_000)).await;
        assert_eq!(carol.final_state("t1"), Some(TransferState::Approved));
        assert_eq!(
            link.envelopes(),
            vec![Envelope::permission_response("t1", true)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_chunked_package_fails_recipient() {
        let link = RecordingLink::new();
        let carol = coordinator(&link);
        let bus = link.bus.clone().expect("bus");
        feed(&carol, transfer_request("d1")).await;
        assert_eq!(carol.final_state("d1"), Some(TransferState::WaitingForPackage));

        let chunks = split_payload(&[b'x'; 1200], 512).expect("split");
        bus.publish(MeshEvent::ChunkReceived {
            chunk: chunks[0].clone(),
            from_device: BOB.into(),
        });
        sleep(Duration::from_millis(10)).await;
        assert_eq!(carol.inner.sessions.inbound_count(), 1);

        // Session timeout plus one sweep, well before the transfer timeout
        sleep(Duration::from_secs(36)).await;
        assert_eq!(carol.final_state("d1"), Some(TransferState::Failed));
        match &link.envelopes().last().expect("error sent").body {
            MessageBody::TransferError(e) => {
                assert!(e.error.contains("timed out"), "unexpected reason {}", e.error)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_recipient_discards_partial_body() {
        let link = RecordingLink::new();
        let carol = coordinator(&link);
        let bus = link.bus.clone().expect("bus");
        feed(&carol, transfer_request("d1")).await;

        let chunks = split_payload(&[b'x'; 1200], 512).expect("split");
        for chunk in &chunks[..2] {
            bus.publish(MeshEvent::ChunkReceived {
                chunk: chunk.clone(),
                from_device: BOB.into(),
            });
        }
        sleep(Duration::from_millis(10)).await;
        assert_eq!(carol.inner.sessions.inbound_count(), 1);

        feed(&carol, Envelope::error("d1", "Cancelled")).await;
        assert_eq!(carol.final_state("d1"), Some(TransferState::Failed));
        assert_eq!(carol.inner.sessions.inbound_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_transfer_notifies_peer() {
        let link = RecordingLink::new();
        let alice = coordinator(&link);
        let id = alice
            .initiate_transfer(token(), BOB, "Bob")
            .await
            .expect("initiate");

        assert!(alice.cancel_transfer(&id).await);
        assert!(!alice.cancel_transfer(&id).await);
        assert_eq!(
            link.envelopes().last().map(|e| e.body.clone()),
            Some(MessageBody::TransferError(TransferErrorPayload {
                error: "Cancelled".into()
            }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_peer_ignored() {
        let link = RecordingLink::new();
        let alice = coordinator(&link);
        let id = alice
            .initiate_transfer(token(), BOB, "Bob")
            .await
            .expect("initiate");

        let bytes = encode_envelope(&Envelope::permission_response(&id, true)).expect("encode");
        alice.handle_incoming(&bytes, "EE:05").await;
        assert_eq!(alice.final_state(&id), Some(TransferState::RequestingPermission));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_input_does_not_disturb_others() {
        let link = RecordingLink::new();
        let alice = coordinator(&link);
        let id = alice
            .initiate_transfer(token(), BOB, "Bob")
            .await
            .expect("initiate");

        alice.handle_incoming(b"{not json", BOB).await;
        alice.handle_incoming(b"TEST_PING", BOB).await;
        alice.handle_incoming(b"TFER_DTL:x", BOB).await;
        assert_eq!(alice.final_state(&id), Some(TransferState::RequestingPermission));
    }

    #[tokio::test(start_paused = true)]
    async fn test_compact_approval_accepted() {
        let link = RecordingLink::new();
        let alice = coordinator(&link);
        let id = alice
            .initiate_transfer(token(), BOB, "Bob")
            .await
            .expect("initiate");

        alice
            .handle_incoming(format!("TFER_APR:{}", id).as_bytes(), BOB)
            .await;
        assert_eq!(alice.final_state(&id), Some(TransferState::WaitingForAddress));
    }

    #[tokio::test(start_paused = true)]
    async fn test_legacy_fallback_on_json_failure() {
        let link = RecordingLink::new();
        link.fail_json.store(true, Ordering::SeqCst);
        let config = TransferConfig::default().with_legacy_fallback(true);
        let carol = coordinator_with(&link, happy_identity(), config);

        feed(&carol, permission_request("t1")).await;
        assert!(carol.approve_transfer("t1").await);

        assert_eq!(link.raw_sent(), vec![b"TFER_APR:t1".to_vec()]);
        assert_eq!(carol.final_state("t1"), Some(TransferState::Approved));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_via_mesh_events() {
        let link = RecordingLink::new();
        let carol = coordinator(&link);
        let bus = link.bus.clone().expect("bus");

        let bytes = encode_envelope(&permission_request("t9")).expect("encode");
        bus.publish(MeshEvent::MessageReceived {
            message: bytes,
            from_device: BOB.into(),
        });
        sleep(Duration::from_millis(10)).await;

        let pending = carol.pending_approvals();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].transfer_id, "t9");
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_states_follow_transitions() {
        let link = RecordingLink::new();
        let alice = coordinator(&link);
        let mut states = alice.watch_transfer_states();
        let id = alice
            .initiate_transfer(token(), BOB, "Bob")
            .await
            .expect("initiate");

        assert!(states.has_changed().expect("open"));
        assert_eq!(
            states.borrow_and_update().get(&id),
            Some(&TransferState::RequestingPermission)
        );

        feed(&alice, Envelope::permission_response(&id, true)).await;
        assert_eq!(
            states.borrow_and_update().get(&id),
            Some(&TransferState::WaitingForAddress)
        );
    }

    #[test]
    fn test_retired_is_bounded() {
        let mut retired = Retired::new(2);
        retired.record("a", TransferState::Completed);
        retired.record("b", TransferState::Failed);
        retired.record("c", TransferState::Rejected);

        assert_eq!(retired.get("a"), None);
        assert_eq!(retired.get("b"), Some(TransferState::Failed));
        assert_eq!(retired.get("c"), Some(TransferState::Rejected));
    }

    #[test]
    fn test_permission_response_payload_shape() {
        let bytes = encode_envelope(&Envelope::new(
            "t1",
            MessageBody::PermissionResponse(PermissionResponse { approved: true }),
        ))
        .expect("encode");
        let text = String::from_utf8(bytes).expect("utf8");
        assert!(text.contains("\"approved\":true"));
    }
}
