use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;

use parley_shared::UserStatus;

/// In-memory presence and typing state.
///
/// Typing flags are keyed by (sender, recipient) and never time out: a flag
/// stays set until the sender reports that they stopped.
#[derive(Clone, Default)]
pub struct PresenceTracker {
    statuses: Arc<RwLock<HashMap<String, UserStatus>>>,
    typing: Arc<RwLock<HashMap<String, HashMap<String, bool>>>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_online(&self, username: &str, online: bool) {
        let now = Utc::now();
        let mut statuses = self.statuses.write().await;
        let status = statuses
            .entry(username.to_string())
            .or_insert_with(|| UserStatus {
                is_online: online,
                last_seen: now,
                last_typing: None,
            });
        status.is_online = online;
        status.last_seen = now;
        debug!(user = %username, online, "Presence updated");
    }

    /// Status for `username`. Users never seen are reported online as of now.
    pub async fn status(&self, username: &str) -> UserStatus {
        self.statuses
            .read()
            .await
            .get(username)
            .cloned()
            .unwrap_or_else(|| UserStatus {
                is_online: true,
                last_seen: Utc::now(),
                last_typing: None,
            })
    }

    pub async fn set_typing(&self, from: &str, to: &str, typing: bool) {
        self.typing
            .write()
            .await
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string(), typing);

        if typing {
            if let Some(status) = self.statuses.write().await.get_mut(from) {
                status.last_typing = Some(Utc::now());
            }
        }
    }

    pub async fn is_typing(&self, from: &str, to: &str) -> bool {
        self.typing
            .read()
            .await
            .get(from)
            .and_then(|targets| targets.get(to))
            .copied()
            .unwrap_or(false)
    }
}
