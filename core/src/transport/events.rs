//! Mesh event stream
//!
//! A bounded broadcast stream with a short replay window: subscribers that
//! attach late first receive the most recent events, then live ones.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

/// Events published by the mesh transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeshEvent {
    /// Server, advertising and scanning are up
    Initialized,
    /// A complete message arrived on the message characteristic
    MessageReceived { message: Vec<u8>, from_device: String },
    /// A chunk of a larger body arrived on the chunk characteristic
    ChunkReceived { chunk: Vec<u8>, from_device: String },
    /// A mesh peer was seen advertising
    DeviceDiscovered { address: String, name: Option<String> },
    /// Non-fatal transport problem
    Error { message: String },
}

struct BusInner {
    sender: broadcast::Sender<MeshEvent>,
    replay: VecDeque<MeshEvent>,
    replay_capacity: usize,
}

/// Broadcast stream with replay for late subscribers
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    pub fn new(capacity: usize, replay_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                sender,
                replay: VecDeque::with_capacity(replay_capacity),
                replay_capacity,
            })),
        }
    }

    pub fn publish(&self, event: MeshEvent) {
        let mut inner = self.inner.lock();
        if inner.replay_capacity > 0 {
            if inner.replay.len() == inner.replay_capacity {
                inner.replay.pop_front();
            }
            inner.replay.push_back(event.clone());
        }
        // No subscribers is not an error
        let _ = inner.sender.send(event);
    }

    /// Subscribe, starting with the replay window
    pub fn subscribe(&self) -> EventSubscription {
        let inner = self.inner.lock();
        EventSubscription {
            backlog: inner.replay.clone(),
            receiver: inner.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().sender.receiver_count()
    }
}

/// A subscriber's view of the event stream
pub struct EventSubscription {
    backlog: VecDeque<MeshEvent>,
    receiver: broadcast::Receiver<MeshEvent>,
}

impl EventSubscription {
    /// Next event; `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<MeshEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Mesh event subscriber lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is ready
    pub fn try_recv(&mut self) -> Option<MeshEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
