use std::path::PathBuf;

use chrono::Utc;
use tracing::{debug, info};

use parley_shared::{ProfileUpdate, User, UserSettings};

use crate::document::Collection;
use crate::error::{Result, StoreError};

/// Registered accounts. The chat core only reads usernames and writes the
/// online flag and last-seen time; everything else belongs to the account
/// owner.
pub struct UserStore {
    users: Collection<User>,
}

impl UserStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            users: Collection::open(path).await?,
        })
    }

    /// Create an account. Fails with `Conflict` if the username is taken.
    ///
    /// The uniqueness check and the insert happen in one serialized write, so
    /// concurrent registrations of the same name yield exactly one account.
    pub async fn register(&self, username: &str, password_hash: String) -> Result<User> {
        let username = username.trim().to_string();

        let user = self
            .users
            .mutate(|users| {
                if users.iter().any(|u| u.username == username) {
                    return Err(StoreError::Conflict(format!("user '{username}' already exists")));
                }

                let user = User {
                    id: users.iter().map(|u| u.id).max().unwrap_or(0) + 1,
                    username,
                    password: password_hash,
                    last_seen: None,
                    is_online: false,
                    avatar: String::new(),
                    settings: UserSettings::default(),
                    display_name: None,
                    bio: None,
                };
                users.push(user.clone());
                Ok(user)
            })
            .await?;

        info!(user = %user.username, id = user.id, "Registered user");
        Ok(user)
    }

    pub async fn find(&self, username: &str) -> Option<User> {
        self.users
            .read(|users| users.iter().find(|u| u.username == username).cloned())
            .await
    }

    pub async fn exists(&self, username: &str) -> bool {
        self.users
            .read(|users| users.iter().any(|u| u.username == username))
            .await
    }

    /// Record the online flag and stamp last-seen with the current time.
    pub async fn set_online(&self, username: &str, online: bool) -> Result<()> {
        self.update(username, |user| {
            user.is_online = online;
            user.last_seen = Some(Utc::now());
        })
        .await?;
        debug!(user = %username, online, "Updated user online flag");
        Ok(())
    }

    pub async fn online_users(&self) -> Vec<String> {
        self.users
            .read(|users| {
                users
                    .iter()
                    .filter(|u| u.is_online)
                    .map(|u| u.username.clone())
                    .collect()
            })
            .await
    }

    pub async fn update_avatar(&self, username: &str, avatar: String) -> Result<User> {
        self.update(username, |user| user.avatar = avatar).await
    }

    pub async fn update_settings(&self, username: &str, settings: UserSettings) -> Result<User> {
        self.update(username, |user| user.settings = settings).await
    }

    /// Apply the fields present in `profile`; absent fields are left alone.
    pub async fn update_profile(&self, username: &str, profile: ProfileUpdate) -> Result<User> {
        self.update(username, |user| {
            if let Some(avatar) = profile.avatar {
                user.avatar = avatar;
            }
            if profile.display_name.is_some() {
                user.display_name = profile.display_name;
            }
            if profile.bio.is_some() {
                user.bio = profile.bio;
            }
        })
        .await
    }

    async fn update(&self, username: &str, apply: impl FnOnce(&mut User)) -> Result<User> {
        self.users
            .mutate(|users| {
                let user = users
                    .iter_mut()
                    .find(|u| u.username == username)
                    .ok_or_else(|| StoreError::NotFound(format!("user '{username}'")))?;
                apply(user);
                Ok(user.clone())
            })
            .await
    }
}
