//! Whole-document JSON persistence.
//!
//! Each [`Collection`] owns one ordered array of records, mirrored in memory
//! and rewritten in full on every mutation. Writers are serialized by the
//! collection's lock, which is held across the file write, so two mutations
//! can never interleave their read-modify-write cycles. A mutation only
//! becomes visible in memory after the new document has been durably
//! renamed into place.
//!
//! Once a change has been applied, its write and the in-memory swap run on a
//! spawned task that owns the lock guard. Dropping the caller's future from
//! that point on cannot leave the file ahead of memory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};

/// One persisted JSON file.
#[derive(Debug, Clone)]
pub struct JsonDocument {
    path: PathBuf,
}

impl JsonDocument {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Read every record. Never fails: a missing, unreadable or malformed file
    /// yields an empty sequence.
    pub async fn load<T: DeserializeOwned>(&self) -> Vec<T> {
        let data = match fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "Document unreadable, starting empty");
                return Vec::new();
            }
        };

        match serde_json::from_slice(&data) {
            Ok(records) => records,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Document malformed, starting empty");
                Vec::new()
            }
        }
    }

    /// Replace the whole document. The new contents are written to a staging
    /// file and renamed over the old one, so readers of the file see either
    /// the previous or the new document, never a mix.
    pub async fn save<T: Serialize>(&self, records: &[T]) -> Result<()> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
        records.serialize(&mut serializer)?;

        let staging = self.staging_path();
        let mut file = fs::File::create(&staging).await?;
        file.write_all(&buf).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&staging, &self.path).await?;
        debug!(path = %self.path.display(), records = records.len(), bytes = buf.len(), "Document saved");
        Ok(())
    }
}

/// An in-memory mirror of a [`JsonDocument`] guarded by a read/write lock.
#[derive(Debug)]
pub struct Collection<T> {
    document: JsonDocument,
    records: Arc<RwLock<Vec<T>>>,
}

impl<T> Collection<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Open the document at `path`, creating its directory and an empty
    /// document if neither exists yet.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let document = JsonDocument::new(path);

        if let Some(parent) = document.path().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let records = if fs::try_exists(document.path()).await.unwrap_or(false) {
            document.load().await
        } else {
            document.save::<T>(&[]).await?;
            Vec::new()
        };

        info!(path = %document.path().display(), records = records.len(), "Opened document");

        Ok(Self {
            document,
            records: Arc::new(RwLock::new(records)),
        })
    }

    pub fn path(&self) -> &Path {
        self.document.path()
    }

    /// Run a query under shared access.
    pub async fn read<R>(&self, query: impl FnOnce(&[T]) -> R) -> R {
        let records = self.records.read().await;
        query(&records)
    }

    /// Clone of every record, in stored order.
    pub async fn snapshot(&self) -> Vec<T> {
        self.records.read().await.clone()
    }

    /// Apply `change` to a copy of the records and persist it.
    ///
    /// If `change` returns an error, or persisting fails, nothing is written
    /// and the in-memory records are left exactly as they were.
    pub async fn mutate<R>(&self, change: impl FnOnce(&mut Vec<T>) -> Result<R>) -> Result<R> {
        let mut records = self.records.clone().write_owned().await;
        let mut next = records.clone();
        let out = change(&mut next)?;

        let document = self.document.clone();
        let commit = tokio::spawn(async move {
            document.save(&next).await?;
            *records = next;
            Ok::<_, StoreError>(())
        });
        commit.await??;
        Ok(out)
    }
}
