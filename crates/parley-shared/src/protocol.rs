use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::types::{Attachment, Message, MessageId, NewMessage};
use crate::validation::{validate_attachment, validate_content, validate_group, validate_recipient};

/// Inbound chat event, as sent by a client over the socket or the send API.
///
/// The shape is a subset of [`Message`]: clients may send a full message
/// object and server-owned fields (`id`, `from_user`, `created_at`, flags)
/// are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatEvent {
    #[serde(default)]
    pub to_user: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub group_users: Vec<String>,
    #[serde(default)]
    pub attachment: Option<Attachment>,
    #[serde(default)]
    pub reply_to: Option<MessageId>,
}

impl ChatEvent {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Validate and turn into a draft authored by `from`.
    pub fn into_draft(self, from: &str) -> Result<NewMessage, ValidationError> {
        if let Some(attachment) = &self.attachment {
            validate_attachment(attachment)?;
        }
        let content = validate_content(&self.content, self.attachment.is_some())?;

        let mut draft = if self.is_group {
            NewMessage::group(from, validate_group(&self.group_users)?, content)
        } else {
            NewMessage::direct(from, validate_recipient(&self.to_user)?, content)
        };
        draft.attachment = self.attachment;
        draft.reply_to = self.reply_to;
        Ok(draft)
    }
}

/// Encode a message as an outbound socket text frame.
pub fn encode_message(message: &Message) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::constants::GROUP_RECIPIENT;

    #[test]
    fn test_full_message_shape_decodes() {
        let sent = NewMessage::direct("mallory", "bob", "hi").into_message(99, Utc::now());
        let text = encode_message(&sent).unwrap();

        let event = ChatEvent::from_json(&text).unwrap();
        let draft = event.into_draft("alice").unwrap();
        assert_eq!(draft.from_user, "alice");
        assert_eq!(draft.to_user, "bob");
        assert_eq!(draft.content, "hi");
    }

    #[test]
    fn test_group_event_uses_marker() {
        let event = ChatEvent::from_json(
            r#"{"is_group": true, "group_users": ["bob", "carol", "dave"], "content": "yo"}"#,
        )
        .unwrap();
        let draft = event.into_draft("alice").unwrap();
        assert_eq!(draft.to_user, GROUP_RECIPIENT);
        assert_eq!(draft.group_users, vec!["bob", "carol", "dave"]);
    }

    #[test]
    fn test_malformed_frame_rejected() {
        assert!(ChatEvent::from_json("not json").is_err());
        assert!(ChatEvent::from_json(r#"{"content": 5}"#).is_err());
    }

    #[test]
    fn test_short_recipient_rejected() {
        let event = ChatEvent {
            to_user: "bo".to_string(),
            content: "hi".to_string(),
            ..Default::default()
        };
        assert_eq!(
            event.into_draft("alice"),
            Err(ValidationError::RecipientTooShort { min: 3 })
        );
    }
}
