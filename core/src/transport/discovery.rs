// Peer discovery table
//
// Peers are learned from advertisements carrying the mesh service UUID and
// refreshed every time they are seen again. Nothing here is persisted.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A device seen advertising the mesh service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Radio address, used to connect
    pub address: String,
    /// Advertised device name, or the address when none was advertised
    pub display_name: String,
    /// Unix timestamp (ms) of the latest sighting
    pub last_seen: u64,
}

struct PeerEntry {
    peer: Peer,
    // Breaks ties between sightings within the same millisecond
    sequence: u64,
}

/// Concurrent table of discovered peers
#[derive(Clone, Default)]
pub struct PeerTable {
    peers: Arc<RwLock<HashMap<String, PeerEntry>>>,
    sequence: Arc<AtomicU64>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a peer. Returns `true` when the peer is new.
    pub fn upsert(&self, address: &str, name: Option<&str>) -> bool {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;

        let mut peers = self.peers.write();
        let is_new = !peers.contains_key(address);
        let entry = peers.entry(address.to_string()).or_insert_with(|| PeerEntry {
            peer: Peer {
                address: address.to_string(),
                display_name: address.to_string(),
                last_seen: 0,
            },
            sequence: 0,
        });

        // A later advertisement without a name keeps the one we already have
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            entry.peer.display_name = name.to_string();
        }
        entry.peer.last_seen = now_ms();
        entry.sequence = sequence;
        is_new
    }

    pub fn get(&self, address: &str) -> Option<Peer> {
        self.peers.read().get(address).map(|e| e.peer.clone())
    }

    pub fn remove(&self, address: &str) -> Option<Peer> {
        self.peers.write().remove(address).map(|e| e.peer)
    }

    /// Snapshot of all peers, most recently seen first
    pub fn snapshot(&self) -> Vec<Peer> {
        let peers = self.peers.read();
        let mut entries: Vec<&PeerEntry> = peers.values().collect();
        entries.sort_by(|a, b| {
            b.peer
                .last_seen
                .cmp(&a.peer.last_seen)
                .then(b.sequence.cmp(&a.sequence))
        });
        entries.into_iter().map(|e| e.peer.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}
