use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use parley_shared::{Notification, NotificationKind};

use crate::webhook::WebhookQueue;

#[derive(Default)]
struct Inner {
    notifications: HashMap<String, Vec<Notification>>,
    webhooks: Vec<String>,
}

impl Inner {
    /// Append a notification for `user_id`. Identifiers count up per user.
    fn push(&mut self, user_id: &str, kind: NotificationKind, message: &str) -> Notification {
        let list = self.notifications.entry(user_id.to_string()).or_default();
        let notification = Notification {
            id: list.len() as u64 + 1,
            user_id: user_id.to_string(),
            kind,
            message: message.to_string(),
            read: false,
            created_at: Utc::now(),
        };
        list.push(notification.clone());
        notification
    }

    fn filtered(&self, user_id: &str, keep: impl Fn(&Notification) -> bool) -> Vec<Notification> {
        self.notifications
            .get(user_id)
            .map(|list| list.iter().filter(|n| keep(n)).cloned().collect())
            .unwrap_or_default()
    }
}

/// Per-user alerts held in memory, plus webhook fan-out for new ones.
///
/// All state sits behind one service-wide lock. Webhook delivery happens on
/// the queue's worker, never while the lock is held.
#[derive(Clone)]
pub struct NotificationService {
    inner: Arc<RwLock<Inner>>,
    webhooks: WebhookQueue,
}

impl NotificationService {
    pub fn new(webhooks: WebhookQueue, urls: Vec<String>) -> Self {
        let inner = Inner {
            webhooks: urls,
            ..Default::default()
        };
        Self {
            inner: Arc::new(RwLock::new(inner)),
            webhooks,
        }
    }

    pub async fn add(&self, user_id: &str, kind: NotificationKind, message: &str) -> Notification {
        let (notification, urls) = {
            let mut inner = self.inner.write().await;
            let notification = inner.push(user_id, kind, message);
            (notification, inner.webhooks.clone())
        };

        debug!(user = %user_id, id = notification.id, kind = ?kind, "Notification added");
        self.webhooks.enqueue(urls, notification.clone());
        notification
    }

    /// Fan one group notification out to every listed member in a single pass.
    pub async fn add_group(&self, members: &[String], message: &str) -> Vec<Notification> {
        let (created, urls) = {
            let mut inner = self.inner.write().await;
            let created: Vec<Notification> = members
                .iter()
                .map(|member| inner.push(member, NotificationKind::GroupMessage, message))
                .collect();
            (created, inner.webhooks.clone())
        };

        for notification in &created {
            self.webhooks.enqueue(urls.clone(), notification.clone());
        }
        created
    }

    pub async fn unread(&self, user_id: &str) -> Vec<Notification> {
        self.inner.read().await.filtered(user_id, |n| !n.read)
    }

    pub async fn all(&self, user_id: &str) -> Vec<Notification> {
        self.inner.read().await.filtered(user_id, |_| true)
    }

    pub async fn group(&self, user_id: &str) -> Vec<Notification> {
        self.inner
            .read()
            .await
            .filtered(user_id, |n| n.kind == NotificationKind::GroupMessage)
    }

    /// Returns false if the user has no notification with that identifier.
    pub async fn mark_read(&self, user_id: &str, id: u64) -> bool {
        let mut inner = self.inner.write().await;
        match inner
            .notifications
            .get_mut(user_id)
            .and_then(|list| list.iter_mut().find(|n| n.id == id))
        {
            Some(notification) => {
                notification.read = true;
                true
            }
            None => false,
        }
    }

    pub async fn mark_all_read(&self, user_id: &str) {
        if let Some(list) = self.inner.write().await.notifications.get_mut(user_id) {
            list.iter_mut().for_each(|n| n.read = true);
        }
    }

    pub async fn clear_all(&self, user_id: &str) {
        self.inner.write().await.notifications.remove(user_id);
    }

    pub async fn add_webhook(&self, url: String) {
        info!(url = %url, "Webhook registered");
        self.inner.write().await.webhooks.push(url);
    }

    pub async fn webhooks(&self) -> Vec<String> {
        self.inner.read().await.webhooks.clone()
    }
}
