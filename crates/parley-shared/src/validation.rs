//! Input checks shared by the HTTP and socket paths.
//!
//! These are pure functions: existence checks that need a store (recipient
//! exists, replied-to message exists) live with the caller.

use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::constants::{
    MAX_DOCUMENT_SIZE, MAX_IMAGE_SIZE, MAX_VIDEO_SIZE, MIN_GROUP_RECIPIENTS, MIN_PASSWORD_LEN,
    MIN_USERNAME_LEN,
};
use crate::error::ValidationError;
use crate::types::Attachment;

/// Broad attachment category, each with its own size ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
    Document,
}

impl MediaKind {
    /// Classify by file extension. Returns `None` for disallowed types.
    pub fn from_file_name(file_name: &str) -> Option<Self> {
        let ext = Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)?;

        match ext.as_str() {
            "jpg" | "jpeg" | "png" | "gif" => Some(Self::Image),
            "mp4" | "webm" | "mov" => Some(Self::Video),
            "pdf" | "doc" | "docx" | "txt" => Some(Self::Document),
            _ => None,
        }
    }

    pub fn max_size(self) -> usize {
        match self {
            Self::Image => MAX_IMAGE_SIZE,
            Self::Video => MAX_VIDEO_SIZE,
            Self::Document => MAX_DOCUMENT_SIZE,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Document => "file",
        }
    }
}

/// Check registration input. Returns the trimmed username.
pub fn validate_credentials(username: &str, password: &str) -> Result<String, ValidationError> {
    let username = username.trim();
    if username.chars().count() < MIN_USERNAME_LEN {
        return Err(ValidationError::UsernameTooShort {
            min: MIN_USERNAME_LEN,
        });
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ValidationError::PasswordTooShort {
            min: MIN_PASSWORD_LEN,
        });
    }
    Ok(username.to_string())
}

/// Check a recipient name. Returns the trimmed name.
pub fn validate_recipient(to: &str) -> Result<String, ValidationError> {
    let to = to.trim();
    if to.chars().count() < MIN_USERNAME_LEN {
        return Err(ValidationError::RecipientTooShort {
            min: MIN_USERNAME_LEN,
        });
    }
    Ok(to.to_string())
}

/// Message content must be non-blank unless an attachment carries the payload.
pub fn validate_content(content: &str, has_attachment: bool) -> Result<String, ValidationError> {
    let content = content.trim();
    if content.is_empty() && !has_attachment {
        return Err(ValidationError::EmptyContent);
    }
    Ok(content.to_string())
}

/// Group messages need at least two recipients. Blank entries are dropped,
/// order is preserved.
pub fn validate_group(members: &[String]) -> Result<Vec<String>, ValidationError> {
    let members: Vec<String> = members
        .iter()
        .map(|m| m.trim())
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .collect();

    if members.len() < MIN_GROUP_RECIPIENTS {
        return Err(ValidationError::TooFewRecipients {
            min: MIN_GROUP_RECIPIENTS,
        });
    }
    Ok(members)
}

/// Check type and decoded size of an inline attachment.
pub fn validate_attachment(attachment: &Attachment) -> Result<MediaKind, ValidationError> {
    let kind = MediaKind::from_file_name(&attachment.file_name).ok_or_else(|| {
        ValidationError::UnsupportedFileType(attachment.file_name.clone())
    })?;

    let size = STANDARD
        .decode(attachment.file_data.as_bytes())
        .map_err(|_| ValidationError::InvalidEncoding)?
        .len();

    if size > kind.max_size() {
        return Err(ValidationError::FileTooLarge {
            kind: kind.label(),
            size,
            max: kind.max_size(),
        });
    }
    Ok(kind)
}
