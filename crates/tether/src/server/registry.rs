//! Live session set and fan-out

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::protocol::ServerEvent;

/// Unique per-process session identifier (never reused)
pub type SessionId = u64;

/// Receiving half of a session, owned by the transport
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    rx: mpsc::Receiver<Arc<ServerEvent>>,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Next queued event; `None` once the session is removed from the registry
    pub async fn recv(&mut self) -> Option<Arc<ServerEvent>> {
        self.rx.recv().await
    }

    /// Next queued event without waiting
    pub fn try_recv(&mut self) -> Option<Arc<ServerEvent>> {
        self.rx.try_recv().ok()
    }
}

/// Registry counters (snapshot)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub sessions_connected: usize,
    pub sessions_opened: u64,
    pub sessions_evicted: u64,
    pub events_sent: u64,
    pub events_dropped: u64,
}

struct AtomicRegistryStats {
    sessions_connected: AtomicUsize,
    sessions_opened: AtomicU64,
    sessions_evicted: AtomicU64,
    events_sent: AtomicU64,
    events_dropped: AtomicU64,
}

impl AtomicRegistryStats {
    fn new() -> Self {
        Self {
            sessions_connected: AtomicUsize::new(0),
            sessions_opened: AtomicU64::new(0),
            sessions_evicted: AtomicU64::new(0),
            events_sent: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> RegistryStats {
        RegistryStats {
            sessions_connected: self.sessions_connected.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_evicted: self.sessions_evicted.load(Ordering::Relaxed),
            events_sent: self.events_sent.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
        }
    }
}

struct SessionEntry {
    tx: mpsc::Sender<Arc<ServerEvent>>,
    connected_at: Instant,
    /// Consecutive events dropped because the queue was full
    consecutive_drops: AtomicU32,
}

/// Outcome of one delivery attempt
enum Delivery {
    Sent,
    Dropped,
    Evict,
}

/// Set of live sessions.
///
/// Each session has a bounded FIFO queue; the registry only ever `try_send`s
/// into it, so fan-out never waits on a client. A closed queue, or a queue
/// that stays full for `max_consecutive_drops` events in a row, evicts the
/// session. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
    next_id: AtomicU64,
    buffer: usize,
    max_consecutive_drops: u32,
    stats: AtomicRegistryStats,
}

impl ConnectionRegistry {
    /// `buffer` is the per-session queue depth
    pub fn new(buffer: usize, max_consecutive_drops: u32) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                buffer: buffer.max(1),
                max_consecutive_drops: max_consecutive_drops.max(1),
                stats: AtomicRegistryStats::new(),
            }),
        }
    }

    /// Add a session whose queue starts with `replay`.
    ///
    /// The replay is queued before the session becomes visible to
    /// broadcasts, so it always precedes any pushed event.
    pub fn register(&self, replay: Vec<ServerEvent>) -> Session {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.buffer.max(replay.len() + 1));

        for event in replay {
            // Capacity covers the whole replay
            let _ = tx.try_send(Arc::new(event));
        }

        let mut sessions = self.inner.sessions.write();
        sessions.insert(
            id,
            SessionEntry {
                tx,
                connected_at: Instant::now(),
                consecutive_drops: AtomicU32::new(0),
            },
        );
        self.inner
            .stats
            .sessions_connected
            .store(sessions.len(), Ordering::Relaxed);
        self.inner
            .stats
            .sessions_opened
            .fetch_add(1, Ordering::Relaxed);

        info!(session = id, live = sessions.len(), "Session registered");
        Session { id, rx }
    }

    /// Remove a session. Returns false if it was already gone.
    pub fn unregister(&self, id: SessionId) -> bool {
        let mut sessions = self.inner.sessions.write();
        match sessions.remove(&id) {
            Some(entry) => {
                self.inner
                    .stats
                    .sessions_connected
                    .store(sessions.len(), Ordering::Relaxed);
                info!(
                    session = id,
                    live = sessions.len(),
                    connected_secs = entry.connected_at.elapsed().as_secs(),
                    "Session unregistered"
                );
                true
            }
            None => {
                debug!(session = id, "Session already unregistered");
                false
            }
        }
    }

    /// Deliver `event` to every live session. Returns how many accepted it.
    pub fn broadcast(&self, event: ServerEvent) -> usize {
        let event = Arc::new(event);
        let mut delivered = 0;
        let mut evict = Vec::new();

        {
            let sessions = self.inner.sessions.read();
            for (id, entry) in sessions.iter() {
                match self.deliver(*id, entry, &event) {
                    Delivery::Sent => delivered += 1,
                    Delivery::Dropped => {}
                    Delivery::Evict => evict.push(*id),
                }
            }
        }

        for id in evict {
            self.evict(id);
        }
        delivered
    }

    /// Deliver `event` to one session. Returns false if it was not queued.
    pub fn send_to(&self, id: SessionId, event: ServerEvent) -> bool {
        let outcome = {
            let sessions = self.inner.sessions.read();
            match sessions.get(&id) {
                Some(entry) => self.deliver(id, entry, &Arc::new(event)),
                None => {
                    debug!(session = id, "Unicast to unknown session");
                    return false;
                }
            }
        };
        match outcome {
            Delivery::Sent => true,
            Delivery::Dropped => false,
            Delivery::Evict => {
                self.evict(id);
                false
            }
        }
    }

    fn deliver(&self, id: SessionId, entry: &SessionEntry, event: &Arc<ServerEvent>) -> Delivery {
        match entry.tx.try_send(Arc::clone(event)) {
            Ok(()) => {
                entry.consecutive_drops.store(0, Ordering::Relaxed);
                self.inner.stats.events_sent.fetch_add(1, Ordering::Relaxed);
                Delivery::Sent
            }
            Err(TrySendError::Full(_)) => {
                self.inner
                    .stats
                    .events_dropped
                    .fetch_add(1, Ordering::Relaxed);
                let drops = entry.consecutive_drops.fetch_add(1, Ordering::Relaxed) + 1;
                if drops >= self.inner.max_consecutive_drops {
                    warn!(session = id, drops, "Session unresponsive, evicting");
                    Delivery::Evict
                } else {
                    debug!(session = id, event = event.name(), drops, "Session queue full, dropped event");
                    Delivery::Dropped
                }
            }
            Err(TrySendError::Closed(_)) => {
                debug!(session = id, "Session queue closed");
                Delivery::Evict
            }
        }
    }

    fn evict(&self, id: SessionId) {
        if self.unregister(id) {
            self.inner
                .stats
                .sessions_evicted
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drop every session; their transports see end-of-queue
    pub fn close_all(&self) {
        let mut sessions = self.inner.sessions.write();
        let count = sessions.len();
        sessions.clear();
        self.inner
            .stats
            .sessions_connected
            .store(0, Ordering::Relaxed);
        if count > 0 {
            info!(count, "Closed all sessions");
        }
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.inner.sessions.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.read().is_empty()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.inner.sessions.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn stats(&self) -> RegistryStats {
        self.inner.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn light(status: bool) -> ServerEvent {
        ServerEvent::LightStatus { status }
    }

    fn drain(session: &mut Session) -> Vec<ServerEvent> {
        std::iter::from_fn(|| session.try_recv())
            .map(|e| (*e).clone())
            .collect()
    }

    #[test]
    fn session_ids_are_unique_and_monotonic() {
        let registry = ConnectionRegistry::new(8, 4);
        let a = registry.register(Vec::new());
        let b = registry.register(Vec::new());
        assert!(a.id() < b.id());
        assert_eq!(registry.session_ids(), vec![a.id(), b.id()]);
    }

    #[test]
    fn replay_precedes_broadcasts() {
        let registry = ConnectionRegistry::new(2, 4);
        // Replay longer than the buffer still fits
        let mut session = registry.register(vec![light(true), light(false), light(true)]);
        registry.broadcast(light(false));
        assert_eq!(
            drain(&mut session),
            vec![light(true), light(false), light(true), light(false)]
        );
    }

    #[test]
    fn unregister_is_idempotent() {
        let registry = ConnectionRegistry::new(8, 4);
        let session = registry.register(Vec::new());
        assert!(registry.unregister(session.id()));
        assert!(!registry.unregister(session.id()));
        assert!(registry.is_empty());
        assert_eq!(registry.stats().sessions_connected, 0);
    }

    #[test]
    fn failed_session_does_not_block_others() {
        let registry = ConnectionRegistry::new(8, 4);
        let dead = registry.register(Vec::new());
        let mut alive = registry.register(Vec::new());
        let dead_id = dead.id();
        drop(dead);

        let delivered = registry.broadcast(light(true));
        assert_eq!(delivered, 1);
        assert_eq!(drain(&mut alive), vec![light(true)]);
        assert!(!registry.contains(dead_id));
        assert_eq!(registry.stats().sessions_evicted, 1);
    }

    #[test]
    fn full_queue_drops_then_evicts() {
        let registry = ConnectionRegistry::new(1, 3);
        let stuck = registry.register(Vec::new());
        let mut healthy = registry.register(Vec::new());

        // First event fills the stuck queue
        registry.broadcast(light(true));
        drain(&mut healthy);
        // Two drops: still registered
        registry.broadcast(light(false));
        drain(&mut healthy);
        registry.broadcast(light(true));
        drain(&mut healthy);
        assert!(registry.contains(stuck.id()));

        // Third consecutive drop evicts
        registry.broadcast(light(false));
        assert!(!registry.contains(stuck.id()));
        assert_eq!(drain(&mut healthy), vec![light(false)]);

        let stats = registry.stats();
        assert_eq!(stats.events_dropped, 3);
        assert_eq!(stats.sessions_evicted, 1);
        assert_eq!(stats.sessions_connected, 1);
    }

    #[test]
    fn drop_counter_resets_after_successful_send() {
        let registry = ConnectionRegistry::new(1, 2);
        let mut slow = registry.register(Vec::new());

        registry.broadcast(light(true));
        registry.broadcast(light(false)); // dropped (1)
        drain(&mut slow);
        registry.broadcast(light(true)); // sent, counter reset
        registry.broadcast(light(false)); // dropped (1)
        assert!(registry.contains(slow.id()));
    }

    #[test]
    fn send_to_reaches_only_target() {
        let registry = ConnectionRegistry::new(8, 4);
        let mut a = registry.register(Vec::new());
        let mut b = registry.register(Vec::new());

        assert!(registry.send_to(a.id(), light(true)));
        assert_eq!(drain(&mut a), vec![light(true)]);
        assert!(drain(&mut b).is_empty());
        assert!(!registry.send_to(9999, light(true)));
    }

    #[tokio::test]
    async fn close_all_ends_session_streams() {
        let registry = ConnectionRegistry::new(8, 4);
        let mut session = registry.register(vec![light(true)]);
        registry.close_all();

        // Queued events are still delivered, then the stream ends
        assert_eq!(session.recv().await.as_deref(), Some(&light(true)));
        assert!(session.recv().await.is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn per_session_order_is_preserved() {
        let registry = ConnectionRegistry::new(64, 4);
        let mut session = registry.register(Vec::new());
        for i in 0..20 {
            registry.broadcast(light(i % 2 == 0));
        }
        let received = drain(&mut session);
        let expected: Vec<ServerEvent> = (0..20).map(|i| light(i % 2 == 0)).collect();
        assert_eq!(received, expected);
    }
}
