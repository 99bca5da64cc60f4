//! Inbound chat event pipeline.
//!
//! One [`Dispatcher`] is shared by every socket mailbox worker and every HTTP
//! handler. For each event it runs, in order: validation, formatting,
//! persistence, cache update, live delivery and notification. Each step takes
//! its own component's lock; nothing is held across steps.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use parley_shared::content::ContentPipeline;
use parley_shared::protocol::ChatEvent;
use parley_shared::{Message, MessageId, NotificationKind};
use parley_store::{MessageStore, UserStore};

use crate::cache::ReadCache;
use crate::error::ServerError;
use crate::notifications::NotificationService;
use crate::registry::ConnectionRegistry;

/// Response body for a newly created group.
#[derive(Debug, Clone, Serialize)]
pub struct GroupCreated {
    pub id: usize,
    pub name: String,
    pub users: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Dispatcher {
    messages: Arc<MessageStore>,
    users: Arc<UserStore>,
    cache: ReadCache,
    registry: ConnectionRegistry,
    notifications: NotificationService,
    pipeline: ContentPipeline,
}

impl Dispatcher {
    pub fn new(
        messages: Arc<MessageStore>,
        users: Arc<UserStore>,
        cache: ReadCache,
        registry: ConnectionRegistry,
        notifications: NotificationService,
        pipeline: ContentPipeline,
    ) -> Self {
        Self {
            messages,
            users,
            cache,
            registry,
            notifications,
            pipeline,
        }
    }

    /// Run one event authored by `from` through the full pipeline and return
    /// the stored message.
    pub async fn dispatch(&self, from: &str, event: ChatEvent) -> Result<Message, ServerError> {
        let draft = event.into_draft(from)?;

        if !draft.is_group() && !self.users.exists(&draft.to_user).await {
            return Err(ServerError::NotFound(format!("user '{}'", draft.to_user)));
        }
        if let Some(target) = draft.reply_to {
            if self.messages.get(target).await.is_none() {
                return Err(ServerError::NotFound(format!("message {target}")));
            }
        }

        let draft = self.pipeline.format_draft(draft);
        let message = self.messages.append(draft).await?;

        self.cache.append(&message.from_user, &message).await;
        for member in message.audience() {
            if member != message.from_user {
                self.cache.append(member, &message).await;
            }
        }

        self.deliver(&message).await;
        self.notify(&message).await;
        Ok(message)
    }

    /// Push a message to every recipient with an open connection.
    ///
    /// Offline recipients get nothing now; the message is already stored and
    /// shows up on their next history fetch.
    pub async fn deliver(&self, message: &Message) {
        if message.is_group {
            let reached = self.registry.push_many(message.audience(), message).await;
            debug!(id = message.id, reached = ?reached, "Group delivery");
        } else if self.registry.push(&message.to_user, message).await {
            debug!(id = message.id, to = %message.to_user, "Live delivery");
        }
    }

    async fn notify(&self, message: &Message) {
        let sender = &message.from_user;

        if message.is_group {
            let members: Vec<String> = message
                .group_users
                .iter()
                .filter(|m| *m != sender)
                .cloned()
                .collect();
            self.notifications
                .add_group(&members, &format!("New group message from {sender}"))
                .await;
        } else if message.reply_to.is_some() {
            self.notifications
                .add(
                    &message.to_user,
                    NotificationKind::Reply,
                    &format!("{sender} replied to your message"),
                )
                .await;
        } else {
            self.notifications
                .add(
                    &message.to_user,
                    NotificationKind::NewMessage,
                    &format!("New message from {sender}"),
                )
                .await;
        }
    }

    /// The user's messages, served from the read cache when possible.
    pub async fn messages_for(&self, username: &str) -> Vec<Message> {
        let ticket = self.cache.ticket(username).await;
        if let Some(cached) = self.cache.get(username).await {
            return cached;
        }
        let messages = self.messages.for_participant(username).await;
        self.cache.put(username, ticket, messages.clone()).await;
        messages
    }

    pub async fn edit(
        &self,
        id: MessageId,
        acting_user: &str,
        content: &str,
    ) -> Result<Message, ServerError> {
        if content.trim().is_empty() {
            return Err(ServerError::BadRequest("message content cannot be empty".into()));
        }

        // Re-apply the group prefix and attachment marker of the original.
        let mut draft = self
            .messages
            .get(id)
            .await
            .ok_or_else(|| ServerError::NotFound(format!("message {id}")))?;
        draft.content = content.trim().to_string();
        draft.is_edited = false;
        let formatted = self.pipeline.format_message(draft).content;

        let edited = self.messages.edit(id, acting_user, formatted).await?;
        self.invalidate_for(&edited).await;

        let mut live = edited.clone();
        if let Some(at) = edited.edited_at {
            live.content.push_str(&parley_shared::content::edited_suffix(at));
        }
        self.deliver(&live).await;

        info!(id, user = %acting_user, "Message edited");
        Ok(edited)
    }

    pub async fn delete(&self, id: MessageId, acting_user: &str) -> Result<Message, ServerError> {
        let removed = self.messages.delete(id, acting_user).await?;
        self.invalidate_for(&removed).await;
        info!(id, user = %acting_user, "Message deleted");
        Ok(removed)
    }

    pub async fn mark_read(&self, id: MessageId, acting_user: &str) -> Result<Message, ServerError> {
        let message = self.messages.mark_read(id, acting_user).await?;
        self.invalidate_for(&message).await;
        Ok(message)
    }

    /// Create a group by sending its first message. The creator is appended
    /// to the member list.
    pub async fn create_group(
        &self,
        creator: &str,
        name: &str,
        mut users: Vec<String>,
    ) -> Result<GroupCreated, ServerError> {
        let id = self.messages.groups_for(creator).await.len() + 1;
        users.push(creator.to_string());

        let event = ChatEvent {
            content: format!("Group '{name}' created by {creator}"),
            is_group: true,
            group_users: users,
            ..Default::default()
        };
        let message = self.dispatch(creator, event).await?;

        info!(user = %creator, group = %name, members = message.group_users.len(), "Group created");
        Ok(GroupCreated {
            id,
            name: name.to_string(),
            users: message.group_users,
            created_at: message.created_at,
        })
    }

    async fn invalidate_for(&self, message: &Message) {
        self.cache.invalidate(&message.from_user).await;
        for member in message.audience() {
            self.cache.invalidate(member).await;
        }
    }
}

/// A running mailbox worker. See [`spawn_mailbox`].
pub struct MailboxWorker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl MailboxWorker {
    /// Let the event being dispatched, if any, run to completion, then stop.
    /// Events still queued are dropped.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Mailbox worker failed");
        }
    }
}

/// Start the mailbox worker for one connection.
///
/// The returned sender is the connection's mailbox. `send` on it waits while
/// the mailbox is full, which throttles the connection's reader. The worker
/// is a detached task, so dropping the reader's future never interrupts an
/// event mid-dispatch.
pub fn spawn_mailbox(
    dispatcher: Dispatcher,
    username: String,
    capacity: usize,
) -> (mpsc::Sender<ChatEvent>, MailboxWorker) {
    let (tx, mut rx) = mpsc::channel::<ChatEvent>(capacity);
    let (shutdown, mut stopping) = watch::channel(false);

    let handle = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                _ = stopping.changed() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if let Err(e) = dispatcher.dispatch(&username, event).await {
                warn!(user = %username, error = %e, "Dropping chat event");
            }
        }
        debug!(user = %username, "Mailbox closed");
    });

    (tx, MailboxWorker { shutdown, handle })
}
