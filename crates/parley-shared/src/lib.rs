//! # parley-shared
//!
//! Types and rules shared by the store and the server: the message, user and
//! notification models, the socket frame shape, input validation, and the
//! content formatting pipeline.

pub mod constants;
pub mod content;
pub mod error;
pub mod protocol;
pub mod types;
pub mod validation;

pub use error::ValidationError;
pub use types::*;
