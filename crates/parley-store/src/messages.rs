//! The persistent message store.
//!
//! Every query is a linear scan over the full history; no index is kept.
//! Identifiers are assigned inside the serialized write as one past the
//! highest identifier handed out so far, so concurrent appends never share
//! an identifier and deleting the newest message does not free its
//! identifier. The high-water mark is kept in memory and reseeded from the
//! stored maximum on open: only the identifiers of newest messages deleted
//! before a restart can be handed out again.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use parley_shared::{Message, MessageId, NewMessage};

use crate::document::Collection;
use crate::error::{Result, StoreError};

/// A user's messages packaged for download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedHistory {
    pub user: String,
    pub messages: Vec<Message>,
    pub export_date: DateTime<Utc>,
}

/// Optional bounds for [`MessageStore::search`]. Both bounds are exclusive.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeRange {
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
}

impl TimeRange {
    fn contains(&self, at: DateTime<Utc>) -> bool {
        self.after.map_or(true, |after| at > after) && self.before.map_or(true, |before| at < before)
    }
}

pub struct MessageStore {
    messages: Collection<Message>,
    last_id: AtomicU64,
}

impl MessageStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let messages = Collection::open(path).await?;
        let last_id = messages
            .read(|messages: &[Message]| messages.iter().map(|m| m.id).max().unwrap_or(0))
            .await;
        Ok(Self {
            messages,
            last_id: AtomicU64::new(last_id),
        })
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Persist a new message and return it with its assigned identifier.
    pub async fn append(&self, draft: NewMessage) -> Result<Message> {
        let message = self
            .messages
            .mutate(|messages| {
                let id = self.last_id.load(Ordering::Relaxed) + 1;
                self.last_id.store(id, Ordering::Relaxed);
                let message = draft.into_message(id, Utc::now());
                messages.push(message.clone());
                Ok(message)
            })
            .await?;

        debug!(id = message.id, from = %message.from_user, to = %message.to_user, "Message stored");
        Ok(message)
    }

    /// Replace the content of a message owned by `acting_user`.
    pub async fn edit(&self, id: MessageId, acting_user: &str, content: String) -> Result<Message> {
        self.messages
            .mutate(|messages| {
                let message = messages
                    .iter_mut()
                    .find(|m| m.id == id)
                    .ok_or_else(|| StoreError::NotFound(format!("message {id}")))?;

                if message.from_user != acting_user {
                    return Err(StoreError::Unauthorized(
                        "can only edit your own messages".into(),
                    ));
                }

                message.content = content;
                message.is_edited = true;
                message.edited_at = Some(Utc::now());
                Ok(message.clone())
            })
            .await
    }

    /// Remove a message owned by `acting_user`. Returns the removed message.
    pub async fn delete(&self, id: MessageId, acting_user: &str) -> Result<Message> {
        self.messages
            .mutate(|messages| {
                let index = messages
                    .iter()
                    .position(|m| m.id == id)
                    .ok_or_else(|| StoreError::NotFound(format!("message {id}")))?;

                if messages[index].from_user != acting_user {
                    return Err(StoreError::Unauthorized(
                        "can only delete your own messages".into(),
                    ));
                }

                Ok(messages.remove(index))
            })
            .await
    }

    /// Set the read flag. Only the direct recipient may do this.
    pub async fn mark_read(&self, id: MessageId, acting_user: &str) -> Result<Message> {
        self.messages
            .mutate(|messages| {
                let message = messages
                    .iter_mut()
                    .find(|m| m.id == id)
                    .ok_or_else(|| StoreError::NotFound(format!("message {id}")))?;

                if message.to_user != acting_user {
                    return Err(StoreError::Unauthorized(
                        "only the recipient can mark a message as read".into(),
                    ));
                }

                message.is_read = true;
                Ok(message.clone())
            })
            .await
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Every stored message, in insertion order.
    pub async fn load_all(&self) -> Vec<Message> {
        self.messages.snapshot().await
    }

    pub async fn count(&self) -> usize {
        self.messages.read(|messages| messages.len()).await
    }

    pub async fn get(&self, id: MessageId) -> Option<Message> {
        self.messages
            .read(|messages| messages.iter().find(|m| m.id == id).cloned())
            .await
    }

    /// Messages the user sent, received directly, or received as a group member.
    pub async fn for_participant(&self, username: &str) -> Vec<Message> {
        self.messages
            .read(|messages| {
                messages
                    .iter()
                    .filter(|m| m.involves(username))
                    .cloned()
                    .collect()
            })
            .await
    }

    /// Case-insensitive substring search over the user's messages, optionally
    /// restricted to a time window. An empty query matches everything.
    pub async fn search(&self, username: &str, query: &str, range: TimeRange) -> Vec<Message> {
        let needle = query.to_lowercase();
        self.messages
            .read(|messages| {
                messages
                    .iter()
                    .filter(|m| m.involves(username) && range.contains(m.created_at))
                    .filter(|m| needle.is_empty() || m.content.to_lowercase().contains(&needle))
                    .cloned()
                    .collect()
            })
            .await
    }

    /// Number of unread direct messages addressed to the user.
    pub async fn unread_count(&self, username: &str) -> usize {
        self.messages
            .read(|messages| {
                messages
                    .iter()
                    .filter(|m| m.to_user == username && !m.is_read)
                    .count()
            })
            .await
    }

    /// Direct conversation between two users, in stored order.
    pub async fn history(&self, user1: &str, user2: &str) -> Vec<Message> {
        self.messages
            .read(|messages| {
                messages
                    .iter()
                    .filter(|m| m.is_between(user1, user2))
                    .cloned()
                    .collect()
            })
            .await
    }

    /// Distinct group member lists the user belongs to, in order of first use.
    ///
    /// Lists are compared as ordered sequences: the same members in a
    /// different order form a different group.
    pub async fn groups_for(&self, username: &str) -> Vec<Vec<String>> {
        self.messages
            .read(|messages| {
                let mut seen: HashSet<&[String]> = HashSet::new();
                let mut groups = Vec::new();
                for message in messages.iter().filter(|m| m.is_group) {
                    let members = message.group_users.as_slice();
                    if members.iter().any(|u| u == username) && seen.insert(members) {
                        groups.push(members.to_vec());
                    }
                }
                groups
            })
            .await
    }

    pub async fn export(&self, username: &str) -> ExportedHistory {
        ExportedHistory {
            user: username.to_string(),
            messages: self.for_participant(username).await,
            export_date: Utc::now(),
        }
    }
}
