/// Recipient marker stored in `to_user` for group messages
pub const GROUP_RECIPIENT: &str = "group";

/// Per-connection inbound mailbox capacity
pub const DEFAULT_MAILBOX_CAPACITY: usize = 10;

/// Per-connection outbound send queue capacity
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// Read cache entry lifetime in seconds (5 minutes)
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;

/// Minimum username length (after trimming)
pub const MIN_USERNAME_LEN: usize = 3;

/// Minimum password length
pub const MIN_PASSWORD_LEN: usize = 6;

/// Minimum number of recipients in a group message
pub const MIN_GROUP_RECIPIENTS: usize = 2;

/// Attachment size limits in bytes, by category
pub const MAX_IMAGE_SIZE: usize = 10 * 1024 * 1024;
pub const MAX_VIDEO_SIZE: usize = 50 * 1024 * 1024;
pub const MAX_DOCUMENT_SIZE: usize = 20 * 1024 * 1024;

/// Default HTTP API port
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Persisted document file names inside the data directory
pub const USERS_FILE: &str = "users.json";
pub const MESSAGES_FILE: &str = "messages.json";
