//! Message content pipeline.
//!
//! Raw text goes through a [`ContentRenderer`] (markdown rendering and HTML
//! sanitization are an external concern plugged in here), then the fixed
//! emoji table is applied last. [`ContentPipeline::format_message`] adds the
//! presentation markers for group messages, attachments and edits.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::types::{Message, NewMessage};

/// Token to glyph substitutions, applied after rendering.
///
/// `&lt;3` is listed because renderers escape `<` before substitution runs.
pub const EMOJI_TABLE: &[(&str, &str)] = &[
    (":thumbsup:", "👍"),
    (":fire:", "🔥"),
    (":star:", "⭐"),
    (":ok:", "👌"),
    (":)", "😊"),
    (":(", "😢"),
    (":D", "😃"),
    (":P", "😛"),
    ("&lt;3", "❤️"),
    ("<3", "❤️"),
];

pub const GROUP_PREFIX: &str = "[Group Message]";

/// Pure text transform standing in for markdown rendering plus sanitization.
pub trait ContentRenderer: Send + Sync {
    fn render(&self, raw: &str) -> String;
}

/// Renderer that escapes HTML metacharacters and leaves everything else as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct EscapingRenderer;

impl ContentRenderer for EscapingRenderer {
    fn render(&self, raw: &str) -> String {
        let mut out = String::with_capacity(raw.len());
        for c in raw.chars() {
            match c {
                '&' => out.push_str("&amp;"),
                '<' => out.push_str("&lt;"),
                '>' => out.push_str("&gt;"),
                '"' => out.push_str("&quot;"),
                '\'' => out.push_str("&#39;"),
                _ => out.push(c),
            }
        }
        out
    }
}

pub fn substitute_emoji(text: &str) -> String {
    EMOJI_TABLE
        .iter()
        .fold(text.to_string(), |acc, (token, glyph)| acc.replace(token, glyph))
}

/// Suffix appended to edited messages, e.g. ` (edited at 14:03:27)`.
pub fn edited_suffix(edited_at: DateTime<Utc>) -> String {
    format!(" (edited at {})", edited_at.format("%H:%M:%S"))
}

#[derive(Clone)]
pub struct ContentPipeline {
    renderer: Arc<dyn ContentRenderer>,
}

impl ContentPipeline {
    pub fn new(renderer: Arc<dyn ContentRenderer>) -> Self {
        Self { renderer }
    }

    /// Render then substitute emoji.
    pub fn process(&self, raw: &str) -> String {
        substitute_emoji(&self.renderer.render(raw))
    }

    /// Produce the stored form of an inbound draft.
    pub fn format_draft(&self, mut draft: NewMessage) -> NewMessage {
        let file_name = draft.attachment.as_ref().map(|a| a.file_name.as_str());
        draft.content = self.decorate(&draft.content, draft.is_group(), file_name);
        draft
    }

    /// Produce the broadcast form of a stored message.
    pub fn format_message(&self, mut msg: Message) -> Message {
        let file_name = msg.attachment.as_ref().map(|a| a.file_name.as_str());
        let mut content = self.decorate(&msg.content, msg.is_group, file_name);

        if msg.is_edited {
            if let Some(at) = msg.edited_at {
                content.push_str(&edited_suffix(at));
            }
        }

        msg.content = content;
        msg
    }

    fn decorate(&self, raw: &str, is_group: bool, attachment: Option<&str>) -> String {
        let mut content = self.process(raw);

        if is_group {
            content = format!("{GROUP_PREFIX} {content}");
        }

        if let Some(name) = attachment {
            content.push_str(&format!("\n[Attachment: {name}]"));
        }

        content
    }
}

impl Default for ContentPipeline {
    fn default() -> Self {
        Self::new(Arc::new(EscapingRenderer))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::types::Attachment;

    #[test]
    fn test_escape_then_emoji() {
        let pipeline = ContentPipeline::default();
        assert_eq!(pipeline.process("<b>hi</b> :)"), "&lt;b&gt;hi&lt;/b&gt; 😊");
        assert_eq!(pipeline.process("I <3 rust :fire:"), "I ❤️ rust 🔥");
    }

    #[test]
    fn test_format_group_with_attachment() {
        let mut draft = NewMessage::group("alice", vec!["bob".into(), "carol".into()], "look :D");
        draft.attachment = Some(Attachment {
            file_name: "plan.pdf".to_string(),
            file_data: String::new(),
        });
        let msg = draft.into_message(1, Utc::now());

        let formatted = ContentPipeline::default().format_message(msg);
        assert_eq!(formatted.content, "[Group Message] look 😃\n[Attachment: plan.pdf]");
    }

    #[test]
    fn test_format_draft_keeps_routing() {
        let draft = NewMessage::direct("alice", "bob", "<i>hey</i> :thumbsup:");
        let formatted = ContentPipeline::default().format_draft(draft);
        assert_eq!(formatted.content, "&lt;i&gt;hey&lt;/i&gt; 👍");
        assert_eq!(formatted.to_user, "bob");
    }

    #[test]
    fn test_format_edited_suffix() {
        let mut msg = NewMessage::direct("alice", "bob", "fixed").into_message(3, Utc::now());
        msg.is_edited = true;
        msg.edited_at = Some(Utc.with_ymd_and_hms(2024, 5, 1, 9, 8, 7).unwrap());

        let formatted = ContentPipeline::default().format_message(msg);
        assert_eq!(formatted.content, "fixed (edited at 09:08:07)");
    }
}
