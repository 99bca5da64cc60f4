//! # parley-store
//!
//! Durable storage for the chat service: two independently locked JSON
//! documents, one holding every [`Message`](parley_shared::Message) and one
//! holding every [`User`](parley_shared::User). Each document is kept in
//! memory and rewritten in full, atomically, on every mutation.

pub mod document;
pub mod messages;
pub mod users;

mod error;

pub use error::{Result, StoreError};
pub use messages::{ExportedHistory, MessageStore, TimeRange};
pub use users::UserStore;
