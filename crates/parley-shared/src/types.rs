use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::GROUP_RECIPIENT;

/// Message identifier, unique within the message store.
pub type MessageId = u64;

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A file carried inline with a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    /// Base64 (standard alphabet) encoded file contents.
    pub file_data: String,
}

/// A single chat message, direct or group.
///
/// Group messages carry the recipient marker `"group"` and the ordered member
/// list they were addressed to. Documents that store the attachment as flat
/// `has_file`/`file_name`/`file_data` fields also load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "StoredMessage")]
pub struct Message {
    pub id: MessageId,
    pub from_user: String,
    pub to_user: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_users: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
}

/// Wire shape accepted when reading a [`Message`].
#[derive(Deserialize)]
struct StoredMessage {
    id: MessageId,
    from_user: String,
    to_user: String,
    content: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    is_read: bool,
    #[serde(default)]
    is_group: bool,
    #[serde(default)]
    group_users: Vec<String>,
    #[serde(default)]
    attachment: Option<Attachment>,
    #[serde(default)]
    has_file: bool,
    #[serde(default)]
    file_name: String,
    #[serde(default)]
    file_data: String,
    #[serde(default)]
    is_edited: bool,
    #[serde(default)]
    edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    reply_to: Option<MessageId>,
}

impl From<StoredMessage> for Message {
    fn from(stored: StoredMessage) -> Self {
        let flat = (stored.has_file && !stored.file_name.is_empty()).then(|| Attachment {
            file_name: stored.file_name,
            file_data: stored.file_data,
        });
        Self {
            id: stored.id,
            from_user: stored.from_user,
            to_user: stored.to_user,
            content: stored.content,
            created_at: stored.created_at,
            is_read: stored.is_read,
            is_group: stored.is_group,
            group_users: stored.group_users,
            attachment: stored.attachment.or(flat),
            is_edited: stored.is_edited,
            edited_at: stored.edited_at.filter(|_| stored.is_edited),
            reply_to: stored.reply_to,
        }
    }
}

impl Message {
    /// Whether `username` sent, received, or is a group member of this message.
    pub fn involves(&self, username: &str) -> bool {
        self.from_user == username
            || self.to_user == username
            || (self.is_group && self.group_users.iter().any(|u| u == username))
    }

    /// Whether this message belongs to the direct conversation between `a` and `b`.
    pub fn is_between(&self, a: &str, b: &str) -> bool {
        (self.from_user == a && self.to_user == b) || (self.from_user == b && self.to_user == a)
    }

    /// Users that receive this message: the recipient of a direct message, or
    /// every listed member of a group message.
    pub fn audience(&self) -> Vec<&str> {
        if self.is_group {
            self.group_users.iter().map(String::as_str).collect()
        } else {
            vec![self.to_user.as_str()]
        }
    }
}

/// A message that has been validated but not yet assigned an identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub from_user: String,
    pub to_user: String,
    pub content: String,
    pub group_users: Vec<String>,
    pub attachment: Option<Attachment>,
    pub reply_to: Option<MessageId>,
}

impl NewMessage {
    pub fn direct(from: impl Into<String>, to: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            from_user: from.into(),
            to_user: to.into(),
            content: content.into(),
            group_users: Vec::new(),
            attachment: None,
            reply_to: None,
        }
    }

    pub fn group(from: impl Into<String>, members: Vec<String>, content: impl Into<String>) -> Self {
        Self {
            from_user: from.into(),
            to_user: GROUP_RECIPIENT.to_string(),
            content: content.into(),
            group_users: members,
            attachment: None,
            reply_to: None,
        }
    }

    pub fn is_group(&self) -> bool {
        !self.group_users.is_empty()
    }

    /// Materialize into a stored message with the given identifier and timestamp.
    pub fn into_message(self, id: MessageId, created_at: DateTime<Utc>) -> Message {
        let is_group = self.is_group();
        Message {
            id,
            from_user: self.from_user,
            to_user: self.to_user,
            content: self.content,
            created_at,
            is_read: false,
            is_group,
            group_users: self.group_users,
            attachment: self.attachment,
            is_edited: false,
            edited_at: None,
            reply_to: self.reply_to,
        }
    }
}

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// Per-user client preferences.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserSettings {
    #[serde(default)]
    pub sound_enabled: bool,
    #[serde(default)]
    pub notify_enabled: bool,
    #[serde(default)]
    pub dark_theme: bool,
    #[serde(default)]
    pub show_read_status: bool,
}

/// A registered account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: u64,
    pub username: String,
    /// PHC-formatted password hash. Never the plain password.
    pub password: String,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_online: bool,
    /// Base64 encoded avatar image.
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub settings: UserSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
}

/// Editable profile fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileUpdate {
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
}

/// Public view of a user, without the password hash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub id: u64,
    pub username: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub is_online: bool,
    pub avatar: String,
    pub display_name: Option<String>,
    pub bio: Option<String>,
}

impl From<&User> for UserProfile {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            last_seen: user.last_seen,
            is_online: user.is_online,
            avatar: user.avatar.clone(),
            display_name: user.display_name.clone(),
            bio: user.bio.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

/// Presence snapshot for one user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserStatus {
    pub is_online: bool,
    pub last_seen: DateTime<Utc>,
    pub last_typing: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Notification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    NewMessage,
    GroupMessage,
    Reply,
    System,
}

/// A per-user alert. Identifiers are unique per recipient only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    pub id: u64,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub message: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}
