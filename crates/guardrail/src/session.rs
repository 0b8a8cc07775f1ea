//! Session manager.
//!
//! A session is one MCP connection lifecycle: a cryptographically random
//! id, a bounded FIFO of serialized JSON-RPC replies, and a weak notion
//! of the SSE writer (the writer task holds the session Arc; the manager
//! only tracks whether one is attached). The map is sharded so fan-out
//! never serializes on a global lock.
//!
//! Session ids never appear in logs in plaintext; use [`Session::log_id`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::sync::Notify;
use tracing::{debug, info};

use guardrail_protocol::ClientInfo;

/// Default bound on queued replies per session.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default idle timeout.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(3600);

/// Sweep interval for the eviction task.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Tombstones kept so expired sessions answer 410 instead of 404.
const TOMBSTONE_CAP: usize = 1024;

const SHARD_COUNT: usize = 16;

/// Why a session lookup failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupError {
    /// Never seen (or tombstone rolled off): 404.
    Unknown,
    /// Existed and idled out: 410.
    Expired,
}

/// One live session.
pub struct Session {
    id: String,
    created_at: Instant,
    last_activity: Mutex<Instant>,
    client_info: Mutex<Option<ClientInfo>>,
    initialized: AtomicBool,
    queue: Mutex<VecDeque<String>>,
    queue_capacity: usize,
    /// Wakes the SSE writer when a reply lands.
    notify: Notify,
    writer_attached: AtomicBool,
    dropped_replies: AtomicU64,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish()
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Session {
    fn new(id: String, queue_capacity: usize) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now,
            last_activity: Mutex::new(now),
            client_info: Mutex::new(None),
            initialized: AtomicBool::new(false),
            queue: Mutex::new(VecDeque::new()),
            queue_capacity,
            notify: Notify::new(),
            writer_attached: AtomicBool::new(false),
            dropped_replies: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Hashed prefix safe for log output.
    pub fn log_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.id.as_bytes());
        hex::encode(hasher.finalize())[..8].to_string()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Refresh the activity clock.
    pub fn touch(&self) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }

    /// Record the client reported by initialize.
    pub fn set_client_info(&self, info: ClientInfo) {
        if let Ok(mut slot) = self.client_info.lock() {
            *slot = Some(info);
        }
        self.initialized.store(true, Ordering::SeqCst);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn client_info(&self) -> Option<ClientInfo> {
        self.client_info.lock().ok().and_then(|slot| slot.clone())
    }

    /// Enqueue a serialized reply. On overflow the oldest queued reply is
    /// dropped (the client can retry that RPC); the producer never blocks.
    /// Returns the number of replies dropped by this call.
    pub fn enqueue_reply(&self, serialized: String) -> u64 {
        let mut dropped = 0;
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(serialized);
            while queue.len() > self.queue_capacity {
                queue.pop_front();
                dropped += 1;
            }
        }
        if dropped > 0 {
            self.dropped_replies.fetch_add(dropped, Ordering::Relaxed);
        }
        self.notify.notify_one();
        dropped
    }

    /// Dequeue the next reply, if any.
    pub fn dequeue_reply(&self) -> Option<String> {
        self.queue.lock().ok().and_then(|mut queue| queue.pop_front())
    }

    /// Wait until a reply may be available.
    pub async fn reply_available(&self) {
        self.notify.notified().await;
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn dropped_replies(&self) -> u64 {
        self.dropped_replies.load(Ordering::Relaxed)
    }

    /// Attach the SSE writer; only one writer at a time.
    pub fn attach_writer(&self) -> bool {
        !self.writer_attached.swap(true, Ordering::SeqCst)
    }

    /// Detach the writer; queued replies survive for the next subscriber.
    pub fn detach_writer(&self) {
        self.writer_attached.store(false, Ordering::SeqCst);
    }

    pub fn has_writer(&self) -> bool {
        self.writer_attached.load(Ordering::SeqCst)
    }
}

/// Process-wide session table.
pub struct SessionManager {
    shards: Vec<RwLock<HashMap<String, Arc<Session>>>>,
    tombstones: Mutex<VecDeque<String>>,
    idle_timeout: Duration,
    queue_capacity: usize,
}

impl SessionManager {
    pub fn new(idle_timeout: Duration, queue_capacity: usize) -> Self {
        Self {
            shards: (0..SHARD_COUNT)
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
            tombstones: Mutex::new(VecDeque::new()),
            idle_timeout,
            queue_capacity,
        }
    }

    fn shard(&self, session_id: &str) -> &RwLock<HashMap<String, Arc<Session>>> {
        let mut hash = 0usize;
        for byte in session_id.bytes() {
            hash = hash.wrapping_mul(31).wrapping_add(byte as usize);
        }
        &self.shards[hash % SHARD_COUNT]
    }

    /// Create a session with a fresh CSPRNG id.
    pub fn create(&self) -> Arc<Session> {
        let id = generate_session_id();
        let session = Arc::new(Session::new(id.clone(), self.queue_capacity));
        if let Ok(mut shard) = self.shard(&id).write() {
            shard.insert(id, Arc::clone(&session));
        }
        debug!(session = %session.log_id(), "session created");
        session
    }

    /// Look up a live session; distinguishes unknown from expired.
    pub fn get(&self, session_id: &str) -> Result<Arc<Session>, LookupError> {
        if let Ok(shard) = self.shard(session_id).read() {
            if let Some(session) = shard.get(session_id) {
                if session.idle_for() < self.idle_timeout {
                    return Ok(Arc::clone(session));
                }
            }
        }
        // Either evicted already or idle past the timeout but not yet
        // swept; both answer 410. Sweep-and-recheck keeps it consistent.
        if let Ok(shard) = self.shard(session_id).read() {
            if shard.contains_key(session_id) {
                return Err(LookupError::Expired);
            }
        }
        if let Ok(tombstones) = self.tombstones.lock() {
            if tombstones.iter().any(|t| t == session_id) {
                return Err(LookupError::Expired);
            }
        }
        Err(LookupError::Unknown)
    }

    /// Remove a session, leaving a tombstone.
    pub fn evict(&self, session_id: &str) {
        let removed = self
            .shard(session_id)
            .write()
            .ok()
            .and_then(|mut shard| shard.remove(session_id));
        if let Some(session) = removed {
            session.notify.notify_one();
            if let Ok(mut tombstones) = self.tombstones.lock() {
                tombstones.push_back(session_id.to_string());
                while tombstones.len() > TOMBSTONE_CAP {
                    tombstones.pop_front();
                }
            }
            debug!(session = %session.log_id(), "session evicted");
        }
    }

    /// Evict every session idle past the timeout; returns how many.
    pub fn sweep(&self) -> usize {
        let mut expired = Vec::new();
        for shard in &self.shards {
            if let Ok(shard) = shard.read() {
                for (id, session) in shard.iter() {
                    if session.idle_for() >= self.idle_timeout {
                        expired.push(id.clone());
                    }
                }
            }
        }
        for id in &expired {
            self.evict(id);
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "idle sessions evicted");
        }
        expired.len()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.read().map(|s| s.len()).unwrap_or(0))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn the background sweeper.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                manager.sweep();
            }
        })
    }
}

/// 192 bits from the OS CSPRNG, URL-safe base64. Never derived from time.
fn generate_session_id() -> String {
    let mut bytes = [0u8; 24];
    OsRng.fill_bytes(&mut bytes);
    format!("sess_{}", URL_SAFE_NO_PAD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn manager() -> SessionManager {
        SessionManager::new(DEFAULT_IDLE_TIMEOUT, 4)
    }

    #[test]
    fn ids_are_unique_and_url_safe() {
        let mut seen = HashSet::new();
        for _ in 0..256 {
            let id = generate_session_id();
            assert!(id.starts_with("sess_"));
            // 24 bytes -> 32 base64 chars.
            assert_eq!(id.len(), 5 + 32);
            assert!(id[5..]
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn log_id_is_not_the_session_id() {
        let manager = manager();
        let session = manager.create();
        let log_id = session.log_id();
        assert_eq!(log_id.len(), 8);
        assert!(!session.id().contains(&log_id));
    }

    #[test]
    fn create_get_touch_evict() {
        let manager = manager();
        let session = manager.create();
        let id = session.id().to_string();

        assert!(manager.get(&id).is_ok());
        session.touch();

        manager.evict(&id);
        assert_eq!(manager.get(&id), Err(LookupError::Expired));
        assert_eq!(manager.get("sess_never-existed"), Err(LookupError::Unknown));
    }

    #[test]
    fn queue_overflow_drops_oldest() {
        let manager = manager();
        let session = manager.create();

        for n in 0..4 {
            assert_eq!(session.enqueue_reply(format!("r{}", n)), 0);
        }
        // Capacity 4: the fifth push evicts r0.
        assert_eq!(session.enqueue_reply("r4".to_string()), 1);
        assert_eq!(session.dropped_replies(), 1);

        assert_eq!(session.dequeue_reply().as_deref(), Some("r1"));
        assert_eq!(session.dequeue_reply().as_deref(), Some("r2"));
        assert_eq!(session.dequeue_reply().as_deref(), Some("r3"));
        assert_eq!(session.dequeue_reply().as_deref(), Some("r4"));
        assert_eq!(session.dequeue_reply(), None);
    }

    #[test]
    fn replies_are_fifo() {
        let manager = manager();
        let session = manager.create();
        session.enqueue_reply("a".to_string());
        session.enqueue_reply("b".to_string());
        assert_eq!(session.dequeue_reply().as_deref(), Some("a"));
        assert_eq!(session.dequeue_reply().as_deref(), Some("b"));
    }

    #[test]
    fn writer_attaches_once() {
        let manager = manager();
        let session = manager.create();
        assert!(session.attach_writer());
        assert!(!session.attach_writer());
        session.detach_writer();
        assert!(session.attach_writer());
    }

    #[test]
    fn sweep_evicts_only_idle() {
        let manager = SessionManager::new(Duration::from_millis(0), 4);
        let session = manager.create();
        let id = session.id().to_string();

        // Zero timeout: everything is instantly idle.
        assert_eq!(manager.sweep(), 1);
        assert_eq!(manager.get(&id), Err(LookupError::Expired));
        assert!(manager.is_empty());
    }

    #[test]
    fn just_under_timeout_is_live() {
        let manager = SessionManager::new(Duration::from_secs(60), 4);
        let session = manager.create();
        assert_eq!(manager.sweep(), 0);
        assert!(manager.get(session.id()).is_ok());
    }

    #[tokio::test]
    async fn notify_wakes_waiter() {
        let manager = manager();
        let session = manager.create();
        let waiter = Arc::clone(&session);

        let handle = tokio::spawn(async move {
            waiter.reply_available().await;
            waiter.dequeue_reply()
        });

        // Give the waiter a beat to park, then enqueue.
        tokio::time::sleep(Duration::from_millis(10)).await;
        session.enqueue_reply("wake".to_string());

        let got = handle.await.unwrap();
        assert_eq!(got.as_deref(), Some("wake"));
    }
}
