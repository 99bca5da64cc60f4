use thiserror::Error;

/// Input rejected before it reaches any store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("message content cannot be empty")]
    EmptyContent,

    #[error("username must be at least {min} characters")]
    UsernameTooShort { min: usize },

    #[error("password must be at least {min} characters")]
    PasswordTooShort { min: usize },

    #[error("recipient must be at least {min} characters")]
    RecipientTooShort { min: usize },

    #[error("group must have at least {min} recipients")]
    TooFewRecipients { min: usize },

    #[error("unsupported file type: {0}")]
    UnsupportedFileType(String),

    #[error("{kind} too large: {size} bytes (max {max})")]
    FileTooLarge {
        kind: &'static str,
        size: usize,
        max: usize,
    },

    #[error("attachment is not valid base64")]
    InvalidEncoding,
}
