// Chunked sessions: send bodies chunk by chunk and reassemble inbound ones
//
// Inbound chunks are stored by index, so duplicates and out-of-order arrival
// are harmless. A body is handed off only once every index is present.
// Each outbound body gets a fresh tag; an inbound chunk with a new tag
// replaces whatever the device had left unfinished.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::chunk::{parse_chunk, split_payload_tagged};
use super::SessionError;
use crate::config::ChunkConfig;

/// Destination for outbound chunks
#[async_trait]
pub trait ChunkSink: Send + Sync {
    /// Deliver one framed chunk to `peer`; `false` on failure
    async fn send_chunk(&self, peer: &str, chunk: &[u8]) -> bool;
}

/// Which side of a session this node is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Sender,
    Receiver,
}

/// Progress and outcome notifications
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Progress {
        session_id: String,
        role: SessionRole,
        fraction: f32,
    },
    Completed {
        session_id: String,
        role: SessionRole,
        bytes: usize,
    },
    Failed {
        session_id: String,
        role: SessionRole,
        error: SessionError,
    },
}

/// State of one chunked transfer
#[derive(Debug)]
pub struct ChunkedSession {
    pub session_id: String,
    pub role: SessionRole,
    pub tag: u16,
    pub total_chunks: u16,
    pub received_chunks: HashMap<u16, Vec<u8>>,
    pub last_activity: Instant,
    pub retry_count: u32,
}

impl ChunkedSession {
    fn new(session_id: &str, role: SessionRole, tag: u16, total_chunks: u16) -> Self {
        Self {
            session_id: session_id.to_string(),
            role,
            tag,
            total_chunks,
            received_chunks: HashMap::new(),
            last_activity: Instant::now(),
            retry_count: 0,
        }
    }

    fn progress(&self) -> f32 {
        self.received_chunks.len() as f32 / self.total_chunks as f32
    }

    /// Concatenate in index order; fails if any index is missing
    fn assemble(&self) -> Result<Vec<u8>, SessionError> {
        let mut body = Vec::new();
        let mut missing = 0usize;
        for index in 0..self.total_chunks {
            match self.received_chunks.get(&index) {
                Some(part) => body.extend_from_slice(part),
                None => missing += 1,
            }
        }
        if missing > 0 {
            return Err(SessionError::Incomplete { missing });
        }
        Ok(body)
    }
}

/// Tracks inbound and outbound chunked sessions
#[derive(Clone)]
pub struct ChunkedSessionManager {
    config: ChunkConfig,
    inbound: Arc<Mutex<HashMap<String, ChunkedSession>>>,
    outbound: Arc<Mutex<HashMap<String, ChunkedSession>>>,
    next_tag: Arc<AtomicU16>,
    events: broadcast::Sender<SessionEvent>,
}

impl ChunkedSessionManager {
    pub fn new(config: ChunkConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            inbound: Arc::new(Mutex::new(HashMap::new())),
            outbound: Arc::new(Mutex::new(HashMap::new())),
            // Random start so a restarted sender does not reuse its last tag
            next_tag: Arc::new(AtomicU16::new(uuid::Uuid::new_v4().as_u128() as u16)),
            events,
        }
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Send `payload` to `peer` as a sequence of chunks
    pub async fn send_payload<S>(
        &self,
        session_id: &str,
        peer: &str,
        payload: &[u8],
        sink: &S,
    ) -> Result<(), SessionError>
    where
        S: ChunkSink + ?Sized,
    {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        let chunks = split_payload_tagged(payload, self.config.max_chunk_size, tag)?;
        let total = chunks.len();
        self.outbound.lock().insert(
            session_id.to_string(),
            ChunkedSession::new(session_id, SessionRole::Sender, tag, total as u16),
        );
        info!(
            session = %session_id,
            peer = %peer,
            tag,
            "Sending {} bytes in {} chunks",
            payload.len(),
            total
        );

        let result = self.send_chunks(session_id, peer, &chunks, sink).await;
        self.outbound.lock().remove(session_id);

        match &result {
            Ok(()) => self.emit(SessionEvent::Completed {
                session_id: session_id.to_string(),
                role: SessionRole::Sender,
                bytes: payload.len(),
            }),
            Err(e) => {
                warn!(session = %session_id, "Chunked send failed: {}", e);
                self.emit(SessionEvent::Failed {
                    session_id: session_id.to_string(),
                    role: SessionRole::Sender,
                    error: e.clone(),
                });
            }
        }
        result
    }

    async fn send_chunks<S>(
        &self,
        session_id: &str,
        peer: &str,
        chunks: &[Vec<u8>],
        sink: &S,
    ) -> Result<(), SessionError>
    where
        S: ChunkSink + ?Sized,
    {
        let total = chunks.len();
        for (index, chunk) in chunks.iter().enumerate() {
            if index > 0 {
                sleep(self.config.inter_chunk_delay()).await;
            }

            let mut attempt = 0;
            loop {
                attempt += 1;
                if sink.send_chunk(peer, chunk).await {
                    break;
                }
                if attempt >= self.config.max_retries {
                    return Err(SessionError::SendFailed {
                        index: index as u16,
                        attempts: attempt,
                    });
                }
                self.touch_outbound(session_id, |session| session.retry_count += 1);
                debug!(session = %session_id, index, attempt, "Retrying chunk");
                sleep(self.config.retry_backoff(attempt)).await;
            }

            self.touch_outbound(session_id, |session| {
                session.received_chunks.insert(index as u16, Vec::new());
                session.last_activity = Instant::now();
            });
            self.emit(SessionEvent::Progress {
                session_id: session_id.to_string(),
                role: SessionRole::Sender,
                fraction: (index + 1) as f32 / total as f32,
            });
        }
        Ok(())
    }

    fn touch_outbound(&self, session_id: &str, update: impl FnOnce(&mut ChunkedSession)) {
        let mut outbound = self.outbound.lock();
        if let Some(session) = outbound.get_mut(session_id) {
            update(session);
        }
    }

    /// Store one inbound chunk for `session_id`.
    ///
    /// Returns the reassembled body once every chunk is present. A chunk
    /// tagged for a different body than the open session starts over.
    pub fn receive_chunk(
        &self,
        session_id: &str,
        raw: &[u8],
    ) -> Result<Option<Vec<u8>>, SessionError> {
        let (header, payload) = parse_chunk(raw)?;

        let (fraction, complete) = {
            let mut inbound = self.inbound.lock();
            let superseded = inbound
                .get(session_id)
                .filter(|open| open.tag != header.tag)
                .map(|open| (open.tag, open.received_chunks.len(), open.total_chunks));
            if let Some((old_tag, received, total)) = superseded {
                debug!(
                    session = %session_id,
                    old_tag,
                    new_tag = header.tag,
                    "Dropping unfinished body ({}/{} chunks)",
                    received,
                    total
                );
                inbound.remove(session_id);
            }

            let session = inbound
                .entry(session_id.to_string())
                .or_insert_with(|| {
                    ChunkedSession::new(
                        session_id,
                        SessionRole::Receiver,
                        header.tag,
                        header.total,
                    )
                });

            if session.total_chunks != header.total {
                return Err(SessionError::TotalMismatch {
                    expected: session.total_chunks,
                    got: header.total,
                });
            }

            session
                .received_chunks
                .entry(header.index)
                .or_insert_with(|| payload.to_vec());
            session.last_activity = Instant::now();

            let complete = if session.received_chunks.len() == session.total_chunks as usize {
                let body = session.assemble();
                inbound.remove(session_id);
                Some(body)
            } else {
                None
            };
            (session_fraction(&inbound, session_id, complete.is_some()), complete)
        };

        self.emit(SessionEvent::Progress {
            session_id: session_id.to_string(),
            role: SessionRole::Receiver,
            fraction,
        });

        match complete {
            None => Ok(None),
            Some(Ok(body)) => {
                debug!(session = %session_id, "Reassembled {} bytes", body.len());
                self.emit(SessionEvent::Completed {
                    session_id: session_id.to_string(),
                    role: SessionRole::Receiver,
                    bytes: body.len(),
                });
                Ok(Some(body))
            }
            Some(Err(e)) => {
                self.emit(SessionEvent::Failed {
                    session_id: session_id.to_string(),
                    role: SessionRole::Receiver,
                    error: e.clone(),
                });
                Err(e)
            }
        }
    }

    /// Abandon inbound sessions idle for longer than the session timeout
    pub fn expire_stale(&self) -> Vec<String> {
        let timeout = self.config.session_timeout();
        let expired: Vec<ChunkedSession> = {
            let mut inbound = self.inbound.lock();
            let stale: Vec<String> = inbound
                .iter()
                .filter(|(_, s)| s.last_activity.elapsed() >= timeout)
                .map(|(id, _)| id.clone())
                .collect();
            stale.iter().filter_map(|id| inbound.remove(id)).collect()
        };

        expired
            .into_iter()
            .map(|session| {
                warn!(
                    session = %session.session_id,
                    "Session timed out with {}/{} chunks",
                    session.received_chunks.len(),
                    session.total_chunks
                );
                self.emit(SessionEvent::Failed {
                    session_id: session.session_id.clone(),
                    role: SessionRole::Receiver,
                    error: SessionError::Timeout {
                        received: session.received_chunks.len(),
                        total: session.total_chunks as usize,
                    },
                });
                session.session_id
            })
            .collect()
    }

    /// Periodically expire idle sessions
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.sweep_interval());
            loop {
                ticker.tick().await;
                manager.expire_stale();
            }
        })
    }

    /// Forget any partial body from `session_id`
    pub fn discard_inbound(&self, session_id: &str) -> bool {
        let removed = self.inbound.lock().remove(session_id);
        if let Some(session) = &removed {
            debug!(
                session = %session_id,
                "Discarded partial body ({}/{} chunks)",
                session.received_chunks.len(),
                session.total_chunks
            );
        }
        removed.is_some()
    }

    /// Progress of an inbound session, if one is open
    pub fn inbound_progress(&self, session_id: &str) -> Option<f32> {
        self.inbound.lock().get(session_id).map(|s| s.progress())
    }

    pub fn inbound_count(&self) -> usize {
        self.inbound.lock().len()
    }

    pub fn outbound_count(&self) -> usize {
        self.outbound.lock().len()
    }
}

fn session_fraction(
    inbound: &HashMap<String, ChunkedSession>,
    session_id: &str,
    completed: bool,
) -> f32 {
    if completed {
        return 1.0;
    }
    inbound.get(session_id).map(|s| s.progress()).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::chunk::{split_payload, ChunkHeader};
    use std::time::Duration;

    /// Records chunks; fails the first `failures` sends
    struct RecordingSink {
        chunks: Mutex<Vec<Vec<u8>>>,
        failures: Mutex<u32>,
    }

    impl RecordingSink {
        fn new(failures: u32) -> Self {
            Self {
                chunks: Mutex::new(Vec::new()),
                failures: Mutex::new(failures),
            }
        }
    }

    #[async_trait]
    impl ChunkSink for RecordingSink {
        async fn send_chunk(&self, _peer: &str, chunk: &[u8]) -> bool {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return false;
            }
            self.chunks.lock().push(chunk.to_vec());
            true
        }
    }

    fn body(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_then_receive() {
        let manager = ChunkedSessionManager::new(ChunkConfig::default());
        let sink = RecordingSink::new(0);
        let data = body(3000);

        manager
            .send_payload("t1", "peer", &data, &sink)
            .await
            .expect("Send should succeed");

        let chunks = sink.chunks.lock().clone();
        assert_eq!(chunks.len(), 6);

        let mut result = None;
        for chunk in &chunks {
            result = manager.receive_chunk("dev", chunk).expect("Chunk accepted");
        }
        assert_eq!(result, Some(data));
        assert_eq!(manager.inbound_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_reports_progress() {
        let manager = ChunkedSessionManager::new(ChunkConfig::default());
        let mut events = manager.subscribe();
        let sink = RecordingSink::new(0);

        manager
            .send_payload("t1", "peer", &body(1500), &sink)
            .await
            .expect("Send should succeed");

        let mut fractions = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::Progress { fraction, .. } = event {
                fractions.push(fraction);
            }
        }
        assert_eq!(fractions.len(), 3);
        assert!((fractions[2] - 1.0).abs() < f32::EPSILON);
        assert!(fractions.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunk_retry_then_success() {
        let manager = ChunkedSessionManager::new(ChunkConfig::default());
        let sink = RecordingSink::new(2);

        manager
            .send_payload("t1", "peer", &body(100), &sink)
            .await
            .expect("Third attempt should succeed");
        assert_eq!(sink.chunks.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunk_retries_exhausted() {
        let manager = ChunkedSessionManager::new(ChunkConfig::default());
        let sink = RecordingSink::new(10);

        let result = manager.send_payload("t1", "peer", &body(100), &sink).await;
        assert_eq!(
            result,
            Err(SessionError::SendFailed {
                index: 0,
                attempts: 3
            })
        );
        assert_eq!(manager.outbound_count(), 0);
    }

    #[test]
    fn test_duplicates_and_gaps() {
        let manager = ChunkedSessionManager::new(ChunkConfig::default());
        let chunks = split_payload(&body(1200), 512).expect("Split");
        assert_eq!(chunks.len(), 3);

        assert_eq!(manager.receive_chunk("dev", &chunks[2]), Ok(None));
        assert_eq!(manager.receive_chunk("dev", &chunks[2]), Ok(None));
        assert_eq!(manager.receive_chunk("dev", &chunks[0]), Ok(None));
        let progress = manager.inbound_progress("dev").expect("Open session");
        assert!((progress - 2.0 / 3.0).abs() < 1e-6);

        let result = manager.receive_chunk("dev", &chunks[1]).expect("Accepted");
        assert_eq!(result, Some(body(1200)));
    }

    #[test]
    fn test_total_mismatch_rejected() {
        let manager = ChunkedSessionManager::new(ChunkConfig::default());
        let a = ChunkHeader::new(0, 3, 1).expect("header");
        let b = ChunkHeader::new(1, 4, 1).expect("header");
        let mut first = a.to_bytes().to_vec();
        first.push(1);
        let mut second = b.to_bytes().to_vec();
        second.push(2);

        assert_eq!(manager.receive_chunk("dev", &first), Ok(None));
        assert_eq!(
            manager.receive_chunk("dev", &second),
            Err(SessionError::TotalMismatch {
                expected: 3,
                got: 4
            })
        );
    }

    #[test]
    fn test_new_body_replaces_unfinished_one() {
        let manager = ChunkedSessionManager::new(ChunkConfig::default());
        let first = split_payload_tagged(&[0xAA; 1200], 512, 1).expect("Split");
        let second = split_payload_tagged(&[0xBB; 1200], 512, 2).expect("Split");

        assert_eq!(manager.receive_chunk("AA:01", &first[0]), Ok(None));
        assert_eq!(manager.receive_chunk("AA:01", &first[1]), Ok(None));

        let mut result = None;
        for chunk in &second {
            result = manager.receive_chunk("AA:01", chunk).expect("Accepted");
        }
        assert_eq!(result, Some(vec![0xBB; 1200]));
        assert_eq!(manager.inbound_count(), 0);
    }

    #[test]
    fn test_new_body_with_different_total_is_accepted() {
        let manager = ChunkedSessionManager::new(ChunkConfig::default());
        let first = split_payload_tagged(&[0xAA; 1200], 512, 7).expect("Split");
        let second = split_payload_tagged(&[0xBB; 600], 512, 8).expect("Split");
        assert_eq!(second.len(), 2);

        assert_eq!(manager.receive_chunk("AA:01", &first[0]), Ok(None));
        assert_eq!(manager.receive_chunk("AA:01", &second[1]), Ok(None));
        assert_eq!(
            manager.receive_chunk("AA:01", &second[0]),
            Ok(Some(vec![0xBB; 600]))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_sends_use_distinct_tags() {
        let manager = ChunkedSessionManager::new(ChunkConfig::default());
        let sink = RecordingSink::new(0);

        manager
            .send_payload("t1", "peer", &body(1200), &sink)
            .await
            .expect("Send should succeed");
        manager
            .send_payload("t2", "peer", &body(1200), &sink)
            .await
            .expect("Send should succeed");

        let tags: Vec<u16> = sink
            .chunks
            .lock()
            .iter()
            .map(|c| parse_chunk(c).expect("Parse").0.tag)
            .collect();
        assert_eq!(tags.len(), 6);
        assert!(tags[..3].iter().all(|t| *t == tags[0]));
        assert!(tags[3..].iter().all(|t| *t == tags[3]));
        assert_ne!(tags[0], tags[3]);
    }

    #[test]
    fn test_discard_inbound() {
        let manager = ChunkedSessionManager::new(ChunkConfig::default());
        let chunks = split_payload(&body(1200), 512).expect("Split");
        manager.receive_chunk("dev", &chunks[0]).expect("Accepted");

        assert!(manager.discard_inbound("dev"));
        assert!(!manager.discard_inbound("dev"));
        assert_eq!(manager.inbound_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_times_out() {
        let manager = ChunkedSessionManager::new(ChunkConfig::default());
        let mut events = manager.subscribe();
        let chunks = split_payload(&body(1200), 512).expect("Split");
        manager.receive_chunk("dev", &chunks[0]).expect("Accepted");

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(manager.expire_stale().is_empty());

        tokio::time::advance(Duration::from_secs(21)).await;
        assert_eq!(manager.expire_stale(), vec!["dev".to_string()]);
        assert_eq!(manager.inbound_count(), 0);

        let mut timed_out = false;
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::Failed { error, .. } = event {
                timed_out = matches!(error, SessionError::Timeout { received: 1, total: 3 });
            }
        }
        assert!(timed_out);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_expires_sessions() {
        let manager = ChunkedSessionManager::new(ChunkConfig::default());
        let chunks = split_payload(&body(1200), 512).expect("Split");
        manager.receive_chunk("dev", &chunks[0]).expect("Accepted");

        let sweeper = manager.spawn_sweeper();
        sleep(Duration::from_secs(40)).await;
        assert_eq!(manager.inbound_count(), 0);
        sweeper.abort();
    }
}
