//! Per-user read cache of message views.
//!
//! Never authoritative: a miss means "ask the message store", not "no
//! messages". Each entry lives for a fixed window after its last [`put`].
//!
//! Expiry is debounced per user. Every `put` stamps the entry with a fresh
//! generation and schedules an eviction task for that generation; a task only
//! evicts the entry if it still carries the generation it was scheduled for,
//! so an older timer can never evict data written after it. `get` also
//! treats an entry past its deadline as a miss, in case its timer has not
//! run yet.
//!
//! A read-through takes a [`ReadTicket`] before reading the store. Every
//! `append` or `invalidate` for that user moves the user's epoch, and a
//! `put` whose ticket is older than the current epoch is discarded: its view
//! may be missing the write that moved it.
//!
//! [`put`]: ReadCache::put

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use parley_shared::Message;

// ---------------------------------------------------------------------------
// Cached entry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CacheEntry {
    messages: Vec<Message>,
    generation: u64,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_fresh(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    epochs: HashMap<String, u64>,
}

impl CacheState {
    fn epoch(&self, username: &str) -> u64 {
        self.epochs.get(username).copied().unwrap_or(0)
    }

    fn bump(&mut self, username: &str) {
        *self.epochs.entry(username.to_string()).or_default() += 1;
    }
}

/// Write epoch of one user's view, taken before a store read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadTicket(u64);

// ---------------------------------------------------------------------------
// Read cache
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ReadCache {
    state: Arc<RwLock<CacheState>>,
    next_generation: Arc<AtomicU64>,
    ttl: Duration,
}

impl ReadCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            state: Arc::new(RwLock::new(CacheState::default())),
            next_generation: Arc::new(AtomicU64::new(0)),
            ttl,
        }
    }

    pub async fn get(&self, username: &str) -> Option<Vec<Message>> {
        let state = self.state.read().await;
        state
            .entries
            .get(username)
            .filter(|entry| entry.is_fresh())
            .map(|entry| entry.messages.clone())
    }

    pub async fn ticket(&self, username: &str) -> ReadTicket {
        ReadTicket(self.state.read().await.epoch(username))
    }

    /// Store (or overwrite) a user's view and restart its expiry window.
    ///
    /// Returns false, storing nothing, if the user's view was written to
    /// after `ticket` was taken.
    pub async fn put(&self, username: &str, ticket: ReadTicket, messages: Vec<Message>) -> bool {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.state.write().await;
            if state.epoch(username) != ticket.0 {
                debug!(user = %username, "Discarding stale read-through view");
                return false;
            }
            state.entries.insert(
                username.to_string(),
                CacheEntry {
                    messages,
                    generation,
                    expires_at: Instant::now() + self.ttl,
                },
            );
        }

        let state = self.state.clone();
        let ttl = self.ttl;
        let username = username.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let mut state = state.write().await;
            if state
                .entries
                .get(&username)
                .is_some_and(|entry| entry.generation == generation)
            {
                state.entries.remove(&username);
                debug!(user = %username, "Read cache entry expired");
            }
        });
        true
    }

    /// Insert a message into an existing view, keeping identifier order.
    ///
    /// Does nothing to the views of users without a live entry, and does not
    /// extend the entry's lifetime.
    pub async fn append(&self, username: &str, message: &Message) {
        let mut state = self.state.write().await;
        state.bump(username);
        if let Some(entry) = state.entries.get_mut(username).filter(|e| e.is_fresh()) {
            let at = entry.messages.partition_point(|m| m.id < message.id);
            entry.messages.insert(at, message.clone());
        }
    }

    /// Drop a user's view so the next read goes to the store.
    pub async fn invalidate(&self, username: &str) {
        let mut state = self.state.write().await;
        state.bump(username);
        if state.entries.remove(username).is_some() {
            debug!(user = %username, "Read cache entry invalidated");
        }
    }
}
