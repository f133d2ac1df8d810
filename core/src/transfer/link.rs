// Link between the coordinator and the mesh

use async_trait::async_trait;

use crate::session::ChunkSink;
use crate::transport::{EventSubscription, MeshTransport, Peer};

/// What the coordinator needs from the mesh
#[async_trait]
pub trait MeshLink: ChunkSink {
    /// Deliver a complete message; `false` once retries are exhausted
    async fn send(&self, peer: &str, payload: &[u8]) -> bool;

    /// Inbound messages and chunks
    fn subscribe(&self) -> EventSubscription;

    /// Peers currently in range
    fn peers(&self) -> Vec<Peer>;
}

#[async_trait]
impl ChunkSink for MeshTransport {
    async fn send_chunk(&self, peer: &str, chunk: &[u8]) -> bool {
        MeshTransport::send_chunk(self, peer, chunk).await
    }
}

#[async_trait]
impl MeshLink for MeshTransport {
    async fn send(&self, peer: &str, payload: &[u8]) -> bool {
        self.send_message(peer, payload).await
    }

    fn subscribe(&self) -> EventSubscription {
        MeshTransport::subscribe(self)
    }

    fn peers(&self) -> Vec<Peer> {
        self.discover_peers()
    }
}
