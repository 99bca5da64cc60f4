//! Live connection registry.
//!
//! Each open socket is represented by a [`ConnectionHandle`] wrapping the
//! sending half of that socket's outbound queue. A single writer task owns
//! the socket sink and drains the queue, so any number of tasks may push to
//! a connection without racing on the underlying transport.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use parley_shared::Message;

#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    username: String,
    tx: mpsc::Sender<Message>,
}

impl ConnectionHandle {
    /// Create a handle and the receiver its writer task should drain.
    pub fn new(username: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = Self {
            id: Uuid::new_v4(),
            username: username.into(),
            tx,
        };
        (handle, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queue a message without waiting. Returns false if the queue is full or
    /// the writer has gone away.
    pub fn try_push(&self, message: Message) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(user = %self.username, conn = %self.id, "Dropping push for slow connection");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<String, ConnectionHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle under its username, returning the handle it replaced.
    ///
    /// The replaced handle is dropped by the caller, which closes its queue
    /// and lets the old writer task finish.
    pub async fn register(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let username = handle.username.clone();
        let conn = handle.id;
        let replaced = self.connections.write().await.insert(username.clone(), handle);

        match &replaced {
            Some(old) => info!(user = %username, conn = %conn, old = %old.id, "Connection replaced"),
            None => info!(user = %username, conn = %conn, "Connection registered"),
        }
        replaced
    }

    /// Remove the entry for `username` if it still belongs to connection `id`.
    ///
    /// Returns false when a newer connection has taken over the username.
    pub async fn deregister(&self, username: &str, id: Uuid) -> bool {
        let mut connections = self.connections.write().await;
        if connections.get(username).is_some_and(|h| h.id == id) {
            connections.remove(username);
            info!(user = %username, conn = %id, "Connection closed");
            true
        } else {
            false
        }
    }

    /// Push to one user if they have an open connection.
    pub async fn push(&self, username: &str, message: &Message) -> bool {
        match self.connections.read().await.get(username) {
            Some(handle) => handle.try_push(message.clone()),
            None => false,
        }
    }

    /// Push to every listed user that has an open connection. Returns the
    /// users that were reached.
    pub async fn push_many<'a>(
        &self,
        usernames: impl IntoIterator<Item = &'a str>,
        message: &Message,
    ) -> Vec<String> {
        let connections = self.connections.read().await;
        usernames
            .into_iter()
            .filter(|name| {
                connections
                    .get(*name)
                    .is_some_and(|handle| handle.try_push(message.clone()))
            })
            .map(str::to_string)
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }
}
