//! Mesh transport service
//!
//! Runs both BLE roles at once: an always-open GATT server for inbound
//! messages, and short-lived client connections for outbound ones. A
//! background upkeep task keeps advertising on and opens bounded scan
//! windows; a second task turns radio callbacks into [`MeshEvent`]s.
//!
//! Every outbound message is one or more attempts of
//! `CONNECTING → DISCOVERING → NEGOTIATING_MTU → WRITING`, each step bounded
//! by a timeout, and every attempt ends by disconnecting.

use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, trace, warn};

use super::abstraction::{
    ConnectionHandle, RadioAdapter, RadioEvent, RadioEventSink, TransportError, WriteType,
};
use super::ble::gatt::{
    mesh_service_descriptor, split_for_prepared_write, usable_payload, GattCharacteristic,
    PreparedWriteBuffer, MESH_SERVICE_UUID,
};
use super::ble::scanner::{BleScanConfig, BleScanner, ScannerState};
use super::discovery::{Peer, PeerTable};
use super::events::{EventBus, EventSubscription, MeshEvent};
use crate::config::MeshConfig;

/// Phase of a single outbound send attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPhase {
    Idle,
    Connecting,
    Discovering,
    NegotiatingMtu,
    Writing,
    Success,
    Failed,
}

impl fmt::Display for SendPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SendPhase::Idle => "IDLE",
            SendPhase::Connecting => "CONNECTING",
            SendPhase::Discovering => "DISCOVERING",
            SendPhase::NegotiatingMtu => "NEGOTIATING_MTU",
            SendPhase::Writing => "WRITING",
            SendPhase::Success => "SUCCESS",
            SendPhase::Failed => "FAILED",
        };
        write!(f, "{}", name)
    }
}

struct SendAttempt<'a> {
    peer: &'a str,
    phase: SendPhase,
}

impl<'a> SendAttempt<'a> {
    fn new(peer: &'a str) -> Self {
        Self {
            peer,
            phase: SendPhase::Idle,
        }
    }

    fn advance(&mut self, next: SendPhase) {
        trace!(peer = %self.peer, "{} -> {}", self.phase, next);
        self.phase = next;
    }
}

/// Outcome of one scan window
enum ScanOutcome {
    Completed,
    Aborted,
    FailedToStart,
}

struct Shared {
    radio: Arc<dyn RadioAdapter>,
    config: MeshConfig,
    peers: PeerTable,
    events: EventBus,
    prepared: Mutex<PreparedWriteBuffer>,
    connections: Mutex<HashMap<String, ConnectionHandle>>,
    send_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    scanner: Mutex<BleScanner>,
    scan_restart: Notify,
}

/// BLE mesh transport: discovery, outbound sends, inbound assembly
pub struct MeshTransport {
    shared: Arc<Shared>,
    initialized: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MeshTransport {
    pub fn new(radio: Arc<dyn RadioAdapter>, config: MeshConfig) -> Self {
        let events = EventBus::new(config.event_buffer, config.event_replay);
        let scanner = BleScanner::new(BleScanConfig::from(&config));
        Self {
            shared: Arc::new(Shared {
                radio,
                config,
                peers: PeerTable::new(),
                events,
                prepared: Mutex::new(PreparedWriteBuffer::new()),
                connections: Mutex::new(HashMap::new()),
                send_locks: Mutex::new(HashMap::new()),
                scanner: Mutex::new(scanner),
                scan_restart: Notify::new(),
            }),
            initialized: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Open the server and start advertising and scanning. Safe to call repeatedly.
    pub async fn initialize(&self) -> Result<(), TransportError> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            debug!("Mesh transport already initialized");
            return Ok(());
        }

        let (tx, rx) = mpsc::channel(self.shared.config.event_buffer);
        if let Err(e) = self
            .shared
            .radio
            .open_server(mesh_service_descriptor(), tx.clone())
            .await
        {
            error!("Failed to open GATT server: {}", e);
            self.initialized.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let pump = tokio::spawn(run_event_pump(Arc::clone(&self.shared), rx));
        let upkeep = tokio::spawn(run_upkeep(Arc::clone(&self.shared), tx));
        self.tasks.lock().extend([pump, upkeep]);

        info!(
            address = %self.shared.radio.local_address(),
            "Mesh transport initialized"
        );
        self.shared.events.publish(MeshEvent::Initialized);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn local_address(&self) -> String {
        self.shared.radio.local_address()
    }

    /// Peers seen advertising the mesh service, most recently seen first
    pub fn discover_peers(&self) -> Vec<Peer> {
        self.shared.peers.snapshot()
    }

    /// Subscribe to mesh events (recent events are replayed first)
    pub fn subscribe(&self) -> EventSubscription {
        self.shared.events.subscribe()
    }

    pub fn scanner_state(&self) -> ScannerState {
        self.shared.scanner.lock().state()
    }

    pub fn scan_failures(&self) -> u64 {
        self.shared.scanner.lock().failures()
    }

    /// Send a message with the configured number of attempts
    pub async fn send_message(&self, peer: &str, payload: &[u8]) -> bool {
        self.send_message_with_retries(peer, payload, self.shared.config.send_retries)
            .await
    }

    /// Send a message, trying up to `retries` times with linear backoff
    pub async fn send_message_with_retries(&self, peer: &str, payload: &[u8], retries: u32) -> bool {
        self.send_with_retries(peer, GattCharacteristic::Message, payload, retries)
            .await
    }

    /// Write one chunk to the peer's chunk characteristic (single attempt)
    pub async fn send_chunk(&self, peer: &str, chunk: &[u8]) -> bool {
        self.send_with_retries(peer, GattCharacteristic::ChunkData, chunk, 1)
            .await
    }

    async fn send_with_retries(
        &self,
        peer: &str,
        characteristic: GattCharacteristic,
        payload: &[u8],
        retries: u32,
    ) -> bool {
        if !self.is_initialized() {
            warn!(peer = %peer, "Send requested before initialization");
            return false;
        }

        let _lease = self.shared.lease_send(peer).await;

        let attempts = retries.max(1);
        for attempt in 1..=attempts {
            match self.shared.attempt_send(peer, characteristic, payload).await {
                Ok(mtu) => {
                    debug!(
                        peer = %peer,
                        attempt,
                        mtu,
                        "Sent {} bytes",
                        payload.len()
                    );
                    return true;
                }
                Err(e) => {
                    warn!(peer = %peer, attempt, "Send attempt failed: {}", e);
                    if attempt < attempts {
                        sleep(self.shared.config.retry_backoff(attempt)).await;
                    }
                }
            }
        }

        self.shared.events.publish(MeshEvent::Error {
            message: format!("Failed to send to {} after {} attempts", peer, attempts),
        });
        false
    }

    /// Stop background tasks, scanning, advertising and the server
    pub async fn shutdown(&self) {
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return;
        }

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        // Wait until the pump and upkeep loops are gone before touching the radio
        join_all(tasks).await;

        let radio = &self.shared.radio;
        if let Err(e) = radio.stop_scan().await {
            debug!("stop_scan during shutdown: {}", e);
        }
        if let Err(e) = radio.stop_advertise().await {
            debug!("stop_advertise during shutdown: {}", e);
        }
        let held: Vec<ConnectionHandle> = self
            .shared
            .connections
            .lock()
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        join_all(held.into_iter().map(|handle| radio.disconnect(handle))).await;
        if let Err(e) = radio.close_server().await {
            debug!("close_server during shutdown: {}", e);
        }

        self.shared.scanner.lock().stop();
        info!("Mesh transport shut down");
    }
}

impl Drop for MeshTransport {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// Exclusive right to send to one peer
struct SendLease<'a> {
    shared: &'a Shared,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SendLease<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        prune_send_locks(&mut self.shared.send_locks.lock());
    }
}

/// Forget locks nobody holds or waits on. Clones are only taken under the
/// map lock, so a count of one cannot race with a new holder.
fn prune_send_locks(locks: &mut HashMap<String, Arc<tokio::sync::Mutex<()>>>) {
    locks.retain(|_, lock| Arc::strong_count(lock) > 1);
}

impl Shared {
    /// Wait for exclusive use of `peer`. Released even if the send is cancelled.
    async fn lease_send(&self, peer: &str) -> SendLease<'_> {
        let lock = {
            let mut locks = self.send_locks.lock();
            prune_send_locks(&mut locks);
            locks.entry(peer.to_string()).or_default().clone()
        };
        let guard = lock.lock_owned().await;
        SendLease {
            shared: self,
            guard: Some(guard),
        }
    }

    async fn step<T, F>(&self, phase: SendPhase, fut: F) -> Result<T, TransportError>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        match timeout(self.config.step_timeout(), fut).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(phase.to_string())),
        }
    }

    /// One full attempt; returns the MTU the write went out at
    async fn attempt_send(
        &self,
        peer: &str,
        characteristic: GattCharacteristic,
        payload: &[u8],
    ) -> Result<u16, TransportError> {
        let mut attempt = SendAttempt::new(peer);

        // At most one outbound connection per peer
        let stale = self.connections.lock().remove(peer);
        if let Some(stale) = stale {
            debug!(peer = %peer, "Closing previous connection {}", stale);
            if let Err(e) = self.step(SendPhase::Idle, self.radio.disconnect(stale)).await {
                debug!(peer = %peer, "Closing connection {} failed: {}", stale, e);
            }
        }

        attempt.advance(SendPhase::Connecting);
        let handle = match self.step(attempt.phase, self.radio.connect(peer)).await {
            Ok(handle) => handle,
            Err(e) => {
                attempt.advance(SendPhase::Failed);
                return Err(e);
            }
        };
        self.connections.lock().insert(peer.to_string(), handle);

        let result = self
            .write_connected(&mut attempt, handle, characteristic, payload)
            .await;

        let failed_in = attempt.phase;
        attempt.advance(if result.is_ok() {
            SendPhase::Success
        } else {
            SendPhase::Failed
        });

        {
            let mut connections = self.connections.lock();
            if connections.get(peer) == Some(&handle) {
                connections.remove(peer);
            }
        }
        if let Err(e) = self.step(attempt.phase, self.radio.disconnect(handle)).await {
            debug!(peer = %peer, "Disconnect after {} failed: {}", attempt.phase, e);
        }

        if let Err(e) = &result {
            debug!(peer = %peer, phase = %failed_in, "Attempt failed: {}", e);
        }
        result
    }

    async fn write_connected(
        &self,
        attempt: &mut SendAttempt<'_>,
        handle: ConnectionHandle,
        characteristic: GattCharacteristic,
        payload: &[u8],
    ) -> Result<u16, TransportError> {
        attempt.advance(SendPhase::Discovering);
        let remote = self
            .step(
                attempt.phase,
                self.radio.discover_service(handle, MESH_SERVICE_UUID),
            )
            .await?;
        let target = remote
            .iter()
            .find(|c| c.uuid == characteristic.uuid())
            .ok_or(TransportError::CharacteristicNotFound(characteristic.uuid()))?;

        attempt.advance(SendPhase::NegotiatingMtu);
        let mtu = match self
            .step(
                attempt.phase,
                self.radio.request_mtu(handle, self.config.requested_mtu),
            )
            .await
        {
            Ok(mtu) => mtu,
            Err(e) => {
                debug!(
                    peer = %attempt.peer,
                    "MTU negotiation failed, staying at {}: {}",
                    self.config.default_mtu,
                    e
                );
                self.config.default_mtu
            }
        };

        attempt.advance(SendPhase::Writing);
        let uuid = characteristic.uuid();
        if payload.len() <= usable_payload(mtu) {
            let write_type = if target.supports_write_no_response {
                WriteType::NoResponse
            } else {
                WriteType::Default
            };
            self.step(
                attempt.phase,
                self.radio
                    .write_characteristic(handle, uuid, payload, write_type),
            )
            .await?;
            return Ok(mtu);
        }

        let parts = split_for_prepared_write(payload, mtu)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        trace!(peer = %attempt.peer, parts = parts.len(), "Using prepared writes");
        for (offset, part) in parts {
            let written = self
                .step(
                    attempt.phase,
                    self.radio
                        .write_characteristic(handle, uuid, part, WriteType::Prepared { offset }),
                )
                .await;
            if let Err(e) = written {
                let _ = self
                    .step(attempt.phase, self.radio.execute_write(handle, false))
                    .await;
                return Err(e);
            }
        }
        self.step(attempt.phase, self.radio.execute_write(handle, true))
            .await?;
        Ok(mtu)
    }

    fn handle_radio_event(&self, event: RadioEvent) {
        match event {
            RadioEvent::ScanResult {
                address,
                name,
                service_uuids,
            } => {
                if !service_uuids.contains(&MESH_SERVICE_UUID) {
                    return;
                }
                if self.peers.upsert(&address, name.as_deref()) {
                    info!(peer = %address, name = ?name, "Discovered mesh peer");
                }
                self.events
                    .publish(MeshEvent::DeviceDiscovered { address, name });
            }
            RadioEvent::ScanFailed { error_code } => {
                warn!("Scan aborted by radio (code {})", error_code);
                self.events.publish(MeshEvent::Error {
                    message: format!("Scan failed with code {}", error_code),
                });
                self.scan_restart.notify_one();
            }
            RadioEvent::WriteRequest {
                device,
                characteristic,
                value,
                prepared,
                offset,
            } => {
                if !prepared {
                    self.deliver(&device, characteristic, value);
                    return;
                }
                let appended = self
                    .prepared
                    .lock()
                    .append(&device, characteristic, offset, &value);
                if let Err(e) = appended {
                    warn!(peer = %device, "Prepared write rejected: {}", e);
                    self.events.publish(MeshEvent::Error {
                        message: format!("Prepared write from {} rejected: {}", device, e),
                    });
                }
            }
            RadioEvent::ExecuteWrite { device, execute } => {
                if !execute {
                    if self.prepared.lock().discard(&device) {
                        debug!(peer = %device, "Prepared writes cancelled");
                    }
                    return;
                }
                let assembled = self.prepared.lock().execute(&device);
                match assembled {
                    Ok(Some((characteristic, value))) => {
                        self.deliver(&device, characteristic, value)
                    }
                    Ok(None) => debug!(peer = %device, "Execute with nothing queued"),
                    Err(e) => {
                        warn!(peer = %device, "Prepared write reassembly failed: {}", e);
                        self.events.publish(MeshEvent::Error {
                            message: format!("Reassembly from {} failed: {}", device, e),
                        });
                    }
                }
            }
            RadioEvent::ConnectionStateChanged { device, connected } => {
                if connected {
                    trace!(peer = %device, "Central connected");
                } else if self.prepared.lock().discard(&device) {
                    debug!(peer = %device, "Dropped unfinished prepared write");
                }
            }
        }
    }

    fn deliver(&self, device: &str, characteristic: u128, value: Vec<u8>) {
        match GattCharacteristic::from_uuid(characteristic) {
            Some(GattCharacteristic::Message) => {
                debug!(peer = %device, "Received {} byte message", value.len());
                self.events.publish(MeshEvent::MessageReceived {
                    message: value,
                    from_device: device.to_string(),
                });
            }
            Some(GattCharacteristic::ChunkData) => {
                self.events.publish(MeshEvent::ChunkReceived {
                    chunk: value,
                    from_device: device.to_string(),
                });
            }
            None => warn!(peer = %device, "Write to unknown characteristic {:#x}", characteristic),
        }
    }

    async fn scan_window(&self, events: &RadioEventSink) -> ScanOutcome {
        let _ = self.scanner.lock().begin_window();
        if let Err(e) = self.radio.start_scan(MESH_SERVICE_UUID, events.clone()).await {
            self.scanner.lock().record_failure();
            warn!("Scan failed to start: {}", e);
            self.events.publish(MeshEvent::Error {
                message: format!("Scan failed to start: {}", e),
            });
            return ScanOutcome::FailedToStart;
        }
        trace!("Scan window opened");

        let aborted = tokio::select! {
            _ = sleep(self.config.scan_window()) => false,
            _ = self.scan_restart.notified() => true,
        };

        if let Err(e) = self.radio.stop_scan().await {
            debug!("stop_scan failed: {}", e);
        }
        if aborted {
            self.scanner.lock().record_failure();
            ScanOutcome::Aborted
        } else {
            let _ = self.scanner.lock().end_window();
            ScanOutcome::Completed
        }
    }
}

async fn run_event_pump(shared: Arc<Shared>, mut rx: mpsc::Receiver<RadioEvent>) {
    while let Some(event) = rx.recv().await {
        shared.handle_radio_event(event);
    }
    debug!("Radio event channel closed");
}

async fn run_upkeep(shared: Arc<Shared>, events: RadioEventSink) {
    sleep(shared.config.advertise_delay()).await;
    if let Err(e) = shared.radio.start_advertise(MESH_SERVICE_UUID).await {
        warn!("Advertising failed: {}", e);
        shared.events.publish(MeshEvent::Error {
            message: format!("Advertising failed: {}", e),
        });
    }

    let pause = shared
        .config
        .scan_restart_interval()
        .saturating_sub(shared.config.scan_window());
    loop {
        let wait = match shared.scan_window(&events).await {
            ScanOutcome::Completed => pause,
            ScanOutcome::Aborted | ScanOutcome::FailedToStart => {
                debug!("Restarting scan after failure");
                shared.config.retry_backoff(1)
            }
        };
        tokio::select! {
            _ = sleep(wait) => {}
            _ = shared.scan_restart.notified() => {
                debug!("Scan restart requested");
            }
        }
    }
}
