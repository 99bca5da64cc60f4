//! Password hashing and bearer sessions.
//!
//! The chat core only ever sees an already-verified username; this module is
//! the boundary that produces one.

use std::collections::HashMap;
use std::sync::Arc;

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use axum::http::{header, HeaderMap};
use tokio::sync::RwLock;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::ServerError;

/// Hash a password with argon2 on the blocking pool.
pub async fn hash_password(password: String) -> Result<String, ServerError> {
    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| ServerError::Internal(format!("password hashing failed: {e}")))
    })
    .await
    .map_err(|e| ServerError::Internal(e.to_string()))?
}

pub async fn verify_password(password: String, stored_hash: String) -> bool {
    tokio::task::spawn_blocking(move || {
        let hash = match PasswordHash::new(&stored_hash) {
            Ok(hash) => hash,
            Err(e) => {
                error!("failed to parse password hash: {e}");
                return false;
            }
        };
        Argon2::default()
            .verify_password(password.as_bytes(), &hash)
            .is_ok()
    })
    .await
    .unwrap_or(false)
}

/// Opaque bearer tokens mapped to usernames. Sessions live until logout or
/// restart.
#[derive(Clone, Default)]
pub struct SessionTable {
    sessions: Arc<RwLock<HashMap<String, String>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn issue(&self, username: &str) -> String {
        let token = Uuid::new_v4().simple().to_string();
        self.sessions
            .write()
            .await
            .insert(token.clone(), username.to_string());
        debug!(user = %username, "Session issued");
        token
    }

    pub async fn revoke(&self, token: &str) -> Option<String> {
        self.sessions.write().await.remove(token)
    }

    pub async fn resolve(&self, token: &str) -> Option<String> {
        self.sessions.read().await.get(token).cloned()
    }

    /// Resolve the `Authorization: Bearer <token>` header to a username.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<String, ServerError> {
        let token = bearer_token(headers).ok_or(ServerError::Unauthenticated)?;
        self.resolve(token).await.ok_or(ServerError::Unauthenticated)
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}
