//! In-memory radio for tests and demos.
//!
//! A [`RadioHub`] stands in for the air: every [`LoopbackRadio`] registered on
//! it can advertise, scan, serve and connect to the others, and all
//! unsolicited callbacks are delivered over the same `RadioEvent` channels a
//! platform adapter would use. The hub can also inject failures (unreachable
//! peers, MTU refusals, scan aborts, stalled writes).

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::gatt::{usable_payload, PREPARE_WRITE_HEADER_SIZE};
use crate::config::BLE_DEFAULT_MTU;
use crate::transport::abstraction::{
    ConnectionHandle, RadioAdapter, RadioEvent, RadioEventSink, RemoteCharacteristic,
    ServiceDescriptor, TransportError, WriteType,
};

/// Per-radio operation counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RadioStats {
    pub connects: u64,
    pub disconnects: u64,
    pub writes: u64,
    pub prepared_writes: u64,
    pub executes: u64,
    pub mtu_requests: u64,
}

struct Link {
    target: String,
    mtu: u16,
}

struct Node {
    name: String,
    advertising: Option<u128>,
    scanning: Option<(u128, RadioEventSink)>,
    server: Option<(ServiceDescriptor, RadioEventSink)>,
    reachable: bool,
    refuse_mtu: bool,
    stall_writes: bool,
    failing_scans: u32,
    links: HashMap<ConnectionHandle, Link>,
    stats: RadioStats,
}

impl Node {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            advertising: None,
            scanning: None,
            server: None,
            reachable: true,
            refuse_mtu: false,
            stall_writes: false,
            failing_scans: 0,
            links: HashMap::new(),
            stats: RadioStats::default(),
        }
    }
}

struct HubInner {
    nodes: HashMap<String, Node>,
    next_handle: u64,
    max_mtu: u16,
}

/// Shared medium connecting loopback radios
pub struct RadioHub {
    inner: Mutex<HubInner>,
}

impl RadioHub {
    /// Create a hub that grants MTUs up to 512
    pub fn new() -> Arc<Self> {
        Self::with_max_mtu(512)
    }

    pub fn with_max_mtu(max_mtu: u16) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HubInner {
                nodes: HashMap::new(),
                next_handle: 1,
                max_mtu,
            }),
        })
    }

    /// Register a radio with the given address and advertised name
    pub fn radio(self: &Arc<Self>, address: &str, name: &str) -> Arc<LoopbackRadio> {
        self.inner
            .lock()
            .nodes
            .insert(address.to_string(), Node::new(name));
        Arc::new(LoopbackRadio {
            hub: Arc::clone(self),
            address: address.to_string(),
        })
    }

    /// Make a device (un)reachable; unreachable devices refuse connections and writes
    pub fn set_reachable(&self, address: &str, reachable: bool) {
        if let Some(node) = self.inner.lock().nodes.get_mut(address) {
            node.reachable = reachable;
        }
    }

    /// Make MTU requests from `address` fail
    pub fn refuse_mtu(&self, address: &str, refuse: bool) {
        if let Some(node) = self.inner.lock().nodes.get_mut(address) {
            node.refuse_mtu = refuse;
        }
    }

    /// Make writes from `address` hang until the caller gives up
    pub fn stall_writes(&self, address: &str, stall: bool) {
        if let Some(node) = self.inner.lock().nodes.get_mut(address) {
            node.stall_writes = stall;
        }
    }

    /// Make the next `count` scan starts on `address` fail
    pub fn fail_scans(&self, address: &str, count: u32) {
        if let Some(node) = self.inner.lock().nodes.get_mut(address) {
            node.failing_scans = count;
        }
    }

    /// Abort the running scan on `address` the way a platform stack would
    pub async fn abort_scan(&self, address: &str, error_code: i32) -> bool {
        let sink = {
            let mut inner = self.inner.lock();
            inner
                .nodes
                .get_mut(address)
                .and_then(|node| node.scanning.take())
                .map(|(_, sink)| sink)
        };
        match sink {
            Some(sink) => sink.send(RadioEvent::ScanFailed { error_code }).await.is_ok(),
            None => false,
        }
    }

    pub fn stats(&self, address: &str) -> RadioStats {
        self.inner
            .lock()
            .nodes
            .get(address)
            .map(|node| node.stats)
            .unwrap_or_default()
    }

    /// Outbound connections currently held by `address`
    pub fn open_connections(&self, address: &str) -> usize {
        self.inner
            .lock()
            .nodes
            .get(address)
            .map(|node| node.links.len())
            .unwrap_or(0)
    }

    pub fn is_scanning(&self, address: &str) -> bool {
        self.inner
            .lock()
            .nodes
            .get(address)
            .map(|node| node.scanning.is_some())
            .unwrap_or(false)
    }

    pub fn is_advertising(&self, address: &str) -> bool {
        self.inner
            .lock()
            .nodes
            .get(address)
            .map(|node| node.advertising.is_some())
            .unwrap_or(false)
    }
}

async fn deliver(batch: Vec<(RadioEventSink, RadioEvent)>) {
    for (sink, event) in batch {
        if sink.send(event).await.is_err() {
            debug!("loopback event dropped: receiver gone");
        }
    }
}

/// One device on a [`RadioHub`]
pub struct LoopbackRadio {
    hub: Arc<RadioHub>,
    address: String,
}

impl LoopbackRadio {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn hub(&self) -> &Arc<RadioHub> {
        &self.hub
    }

    /// Resolve an outbound link to its target's server sink
    fn route(
        &self,
        handle: ConnectionHandle,
    ) -> Result<(String, u16, ServiceDescriptor, RadioEventSink), TransportError> {
        let inner = self.hub.inner.lock();
        let node = inner
            .nodes
            .get(&self.address)
            .ok_or_else(|| TransportError::RadioUnavailable(self.address.clone()))?;
        let link = node
            .links
            .get(&handle)
            .ok_or(TransportError::UnknownConnection(handle))?;
        let target = inner
            .nodes
            .get(&link.target)
            .filter(|t| t.reachable && node.reachable)
            .ok_or_else(|| TransportError::WriteFailed(format!("{} unreachable", link.target)))?;
        let (descriptor, sink) = target
            .server
            .clone()
            .ok_or_else(|| TransportError::ServerFailed(format!("{} has no server", link.target)))?;
        Ok((link.target.clone(), link.mtu, descriptor, sink))
    }
}

#[async_trait]
impl RadioAdapter for LoopbackRadio {
    fn local_address(&self) -> String {
        self.address.clone()
    }

    async fn start_advertise(&self, service: u128) -> Result<(), TransportError> {
        let batch = {
            let mut inner = self.hub.inner.lock();
            let node = inner
                .nodes
                .get_mut(&self.address)
                .ok_or_else(|| TransportError::RadioUnavailable(self.address.clone()))?;
            node.advertising = Some(service);
            let name = node.name.clone();

            inner
                .nodes
                .iter()
                .filter(|(addr, _)| **addr != self.address)
                .filter_map(|(_, other)| other.scanning.as_ref())
                .filter(|(scan_service, _)| *scan_service == service)
                .map(|(_, sink)| {
                    (
                        sink.clone(),
                        RadioEvent::ScanResult {
                            address: self.address.clone(),
                            name: Some(name.clone()),
                            service_uuids: vec![service],
                        },
                    )
                })
                .collect::<Vec<_>>()
        };
        deliver(batch).await;
        Ok(())
    }

    async fn stop_advertise(&self) -> Result<(), TransportError> {
        if let Some(node) = self.hub.inner.lock().nodes.get_mut(&self.address) {
            node.advertising = None;
        }
        Ok(())
    }

    async fn start_scan(
        &self,
        service: u128,
        events: RadioEventSink,
    ) -> Result<(), TransportError> {
        let batch = {
            let mut inner = self.hub.inner.lock();
            let node = inner
                .nodes
                .get_mut(&self.address)
                .ok_or_else(|| TransportError::RadioUnavailable(self.address.clone()))?;
            if node.failing_scans > 0 {
                node.failing_scans -= 1;
                return Err(TransportError::ScanFailed(2));
            }
            node.scanning = Some((service, events.clone()));

            inner
                .nodes
                .iter()
                .filter(|(addr, other)| **addr != self.address && other.advertising == Some(service))
                .map(|(addr, other)| {
                    (
                        events.clone(),
                        RadioEvent::ScanResult {
                            address: addr.clone(),
                            name: Some(other.name.clone()),
                            service_uuids: vec![service],
                        },
                    )
                })
                .collect::<Vec<_>>()
        };
        deliver(batch).await;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        if let Some(node) = self.hub.inner.lock().nodes.get_mut(&self.address) {
            node.scanning = None;
        }
        Ok(())
    }

    async fn open_server(
        &self,
        descriptor: ServiceDescriptor,
        events: RadioEventSink,
    ) -> Result<(), TransportError> {
        let mut inner = self.hub.inner.lock();
        let node = inner
            .nodes
            .get_mut(&self.address)
            .ok_or_else(|| TransportError::RadioUnavailable(self.address.clone()))?;
        if node.server.is_some() {
            return Err(TransportError::ServerFailed("Server already open".to_string()));
        }
        node.server = Some((descriptor, events));
        Ok(())
    }

    async fn close_server(&self) -> Result<(), TransportError> {
        if let Some(node) = self.hub.inner.lock().nodes.get_mut(&self.address) {
            node.server = None;
        }
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<ConnectionHandle, TransportError> {
        let (handle, sink) = {
            let mut guard = self.hub.inner.lock();
            let inner = &mut *guard;

            let local_ok = inner
                .nodes
                .get(&self.address)
                .map(|n| n.reachable)
                .unwrap_or(false);
            let sink = inner
                .nodes
                .get(address)
                .filter(|t| t.reachable && local_ok)
                .and_then(|t| t.server.as_ref())
                .map(|(_, sink)| sink.clone())
                .ok_or_else(|| TransportError::ConnectFailed(address.to_string()))?;

            let handle = ConnectionHandle(inner.next_handle);
            inner.next_handle += 1;

            let node = inner
                .nodes
                .get_mut(&self.address)
                .ok_or_else(|| TransportError::RadioUnavailable(self.address.clone()))?;
            node.links.insert(
                handle,
                Link {
                    target: address.to_string(),
                    mtu: BLE_DEFAULT_MTU,
                },
            );
            node.stats.connects += 1;
            (handle, sink)
        };

        deliver(vec![(
            sink,
            RadioEvent::ConnectionStateChanged {
                device: self.address.clone(),
                connected: true,
            },
        )])
        .await;
        Ok(handle)
    }

    async fn discover_service(
        &self,
        handle: ConnectionHandle,
        service: u128,
    ) -> Result<Vec<RemoteCharacteristic>, TransportError> {
        let (target, _, descriptor, _) = self.route(handle)?;
        if descriptor.service != service {
            return Err(TransportError::ServiceNotFound(target));
        }
        Ok(descriptor
            .characteristics
            .iter()
            .map(|uuid| RemoteCharacteristic {
                uuid: *uuid,
                supports_write_no_response: true,
            })
            .collect())
    }

    async fn request_mtu(
        &self,
        handle: ConnectionHandle,
        mtu: u16,
    ) -> Result<u16, TransportError> {
        let mut guard = self.hub.inner.lock();
        let inner = &mut *guard;
        let max_mtu = inner.max_mtu;
        let node = inner
            .nodes
            .get_mut(&self.address)
            .ok_or_else(|| TransportError::RadioUnavailable(self.address.clone()))?;
        node.stats.mtu_requests += 1;
        if node.refuse_mtu {
            return Err(TransportError::MtuFailed("Request refused".to_string()));
        }
        let link = node
            .links
            .get_mut(&handle)
            .ok_or(TransportError::UnknownConnection(handle))?;
        link.mtu = mtu.min(max_mtu).max(BLE_DEFAULT_MTU);
        Ok(link.mtu)
    }

    async fn write_characteristic(
        &self,
        handle: ConnectionHandle,
        characteristic: u128,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), TransportError> {
        let (_, mtu, descriptor, sink) = self.route(handle)?;
        if !descriptor.characteristics.contains(&characteristic) {
            return Err(TransportError::CharacteristicNotFound(characteristic));
        }

        let (prepared, offset, limit) = match write_type {
            WriteType::Prepared { offset } => (
                true,
                offset,
                (mtu as usize).saturating_sub(PREPARE_WRITE_HEADER_SIZE),
            ),
            WriteType::Default | WriteType::NoResponse => (false, 0, usable_payload(mtu)),
        };
        if value.len() > limit {
            return Err(TransportError::WriteFailed(format!(
                "{} bytes exceeds {} allowed at MTU {}",
                value.len(),
                limit,
                mtu
            )));
        }

        let stalled = match self.hub.inner.lock().nodes.get_mut(&self.address) {
            Some(node) => {
                if prepared {
                    node.stats.prepared_writes += 1;
                } else {
                    node.stats.writes += 1;
                }
                node.stall_writes
            }
            None => false,
        };
        if stalled {
            std::future::pending::<()>().await;
        }

        sink.send(RadioEvent::WriteRequest {
            device: self.address.clone(),
            characteristic,
            value: value.to_vec(),
            prepared,
            offset,
        })
        .await
        .map_err(|_| TransportError::ChannelClosed)
    }

    async fn execute_write(
        &self,
        handle: ConnectionHandle,
        execute: bool,
    ) -> Result<(), TransportError> {
        let (_, _, _, sink) = self.route(handle)?;
        if let Some(node) = self.hub.inner.lock().nodes.get_mut(&self.address) {
            node.stats.executes += 1;
        }
        sink.send(RadioEvent::ExecuteWrite {
            device: self.address.clone(),
            execute,
        })
        .await
        .map_err(|_| TransportError::ChannelClosed)
    }

    async fn disconnect(&self, handle: ConnectionHandle) -> Result<(), TransportError> {
        let sink = {
            let mut guard = self.hub.inner.lock();
            let inner = &mut *guard;
            let node = inner
                .nodes
                .get_mut(&self.address)
                .ok_or_else(|| TransportError::RadioUnavailable(self.address.clone()))?;
            let link = node
                .links
                .remove(&handle)
                .ok_or(TransportError::UnknownConnection(handle))?;
            node.stats.disconnects += 1;
            inner
                .nodes
                .get(&link.target)
                .and_then(|t| t.server.as_ref())
                .map(|(_, sink)| sink.clone())
        };

        if let Some(sink) = sink {
            deliver(vec![(
                sink,
                RadioEvent::ConnectionStateChanged {
                    device: self.address.clone(),
                    connected: false,
                },
            )])
            .await;
        }
        Ok(())
    }
}
