//! Versioned document store
//!
//! Provisions are persisted as JSON documents with optimistic locking:
//! every update names the version it was based on, and a write based on
//! a stale version fails instead of overwriting a concurrent change.
//!
//! Two implementations are provided: [`MemoryStore`] for embedding and
//! tests, and [`FileStore`] which keeps one file per document under
//! `<root>/.provflow/documents/`.

use crate::error::{CloudError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

const STORE_DIR: &str = ".provflow";
const DOCUMENTS_DIR: &str = "documents";
const LOCK_STALE_HOURS: i64 = 1;

/// A document as held by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub id: i64,
    pub name: String,

    /// Incremented on every successful update
    pub version: u64,

    pub body: serde_json::Value,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Creates a document and returns its id
    async fn allocate(&self, name: &str, body: serde_json::Value) -> Result<i64>;

    async fn info(&self, id: i64) -> Result<StoredDocument>;

    /// Replaces the body if `expected_version` is still current and
    /// returns the new version
    async fn update(&self, id: i64, body: serde_json::Value, expected_version: u64) -> Result<u64>;

    /// Removes the document together with its lock
    async fn delete(&self, id: i64) -> Result<()>;

    /// Takes the exclusive lock of a document
    async fn lock(&self, id: i64) -> Result<()>;

    async fn unlock(&self, id: i64) -> Result<()>;
}

/// In-process document store
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    next_id: i64,
    documents: HashMap<i64, StoredDocument>,
    locks: HashSet<i64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_locked(&self, id: i64) -> bool {
        self.inner.lock().await.locks.contains(&id)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.documents.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn allocate(&self, name: &str, body: serde_json::Value) -> Result<i64> {
        let mut inner = self.inner.lock().await;
        let id = inner.next_id;
        inner.next_id += 1;
        inner.documents.insert(
            id,
            StoredDocument {
                id,
                name: name.to_string(),
                version: 1,
                body,
            },
        );
        tracing::debug!(document_id = id, "Allocated document");
        Ok(id)
    }

    async fn info(&self, id: i64) -> Result<StoredDocument> {
        let inner = self.inner.lock().await;
        inner
            .documents
            .get(&id)
            .cloned()
            .ok_or(CloudError::DocumentNotFound(id))
    }

    async fn update(&self, id: i64, body: serde_json::Value, expected_version: u64) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let doc = inner
            .documents
            .get_mut(&id)
            .ok_or(CloudError::DocumentNotFound(id))?;

        if doc.version != expected_version {
            return Err(CloudError::StaleVersion {
                id,
                expected: expected_version,
                found: doc.version,
            });
        }

        doc.version += 1;
        doc.body = body;
        Ok(doc.version)
    }

    async fn delete(&self, id: i64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .documents
            .remove(&id)
            .ok_or(CloudError::DocumentNotFound(id))?;
        inner.locks.remove(&id);
        Ok(())
    }

    async fn lock(&self, id: i64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if !inner.documents.contains_key(&id) {
            return Err(CloudError::DocumentNotFound(id));
        }
        if !inner.locks.insert(id) {
            return Err(CloudError::LockError(format!("Document {} is already locked", id)));
        }
        Ok(())
    }

    async fn unlock(&self, id: i64) -> Result<()> {
        self.inner.lock().await.locks.remove(&id);
        Ok(())
    }
}

/// Lock information
#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    holder: String,
    acquired_at: DateTime<Utc>,
}

/// File-backed document store
pub struct FileStore {
    /// Project root directory
    project_root: PathBuf,

    /// Serializes read-compare-write cycles within this process
    write_guard: Mutex<()>,
}

impl FileStore {
    pub fn new(project_root: impl AsRef<Path>) -> Self {
        Self {
            project_root: project_root.as_ref().to_path_buf(),
            write_guard: Mutex::new(()),
        }
    }

    fn documents_dir(&self) -> PathBuf {
        self.project_root.join(STORE_DIR).join(DOCUMENTS_DIR)
    }

    fn document_path(&self, id: i64) -> PathBuf {
        self.documents_dir().join(format!("{}.json", id))
    }

    fn backup_path(&self, id: i64) -> PathBuf {
        self.documents_dir().join(format!("{}.json.backup", id))
    }

    fn lock_path(&self, id: i64) -> PathBuf {
        self.documents_dir().join(format!("{}.lock.json", id))
    }

    async fn ensure_documents_dir(&self) -> Result<()> {
        let dir = self.documents_dir();
        if !dir.exists() {
            fs::create_dir_all(&dir).await?;
            tracing::debug!("Created document directory: {}", dir.display());
        }
        Ok(())
    }

    async fn read(&self, id: i64) -> Result<StoredDocument> {
        let path = self.document_path(id);
        if !path.exists() {
            return Err(CloudError::DocumentNotFound(id));
        }
        let content = fs::read_to_string(&path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    async fn write(&self, doc: &StoredDocument) -> Result<()> {
        let path = self.document_path(doc.id);
        let backup = self.backup_path(doc.id);

        // Keep the previous revision around
        if path.exists() {
            if backup.exists() {
                fs::remove_file(&backup).await?;
            }
            fs::rename(&path, &backup).await?;
        }

        let content = serde_json::to_string_pretty(doc)?;
        fs::write(&path, content).await?;
        Ok(())
    }

    async fn next_id(&self) -> Result<i64> {
        let mut next = 0;
        let mut entries = fs::read_dir(self.documents_dir()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(stem) = file_name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if let Ok(id) = stem.parse::<i64>() {
                next = next.max(id + 1);
            }
        }
        Ok(next)
    }
}

#[async_trait]
impl DocumentStore for FileStore {
    async fn allocate(&self, name: &str, body: serde_json::Value) -> Result<i64> {
        let _guard = self.write_guard.lock().await;
        self.ensure_documents_dir().await?;

        let id = self.next_id().await?;
        self.write(&StoredDocument {
            id,
            name: name.to_string(),
            version: 1,
            body,
        })
        .await?;

        tracing::debug!(document_id = id, "Allocated document");
        Ok(id)
    }

    async fn info(&self, id: i64) -> Result<StoredDocument> {
        self.read(id).await
    }

    async fn update(&self, id: i64, body: serde_json::Value, expected_version: u64) -> Result<u64> {
        let _guard = self.write_guard.lock().await;
        let mut doc = self.read(id).await?;

        if doc.version != expected_version {
            return Err(CloudError::StaleVersion {
                id,
                expected: expected_version,
                found: doc.version,
            });
        }

        doc.version += 1;
        doc.body = body;
        self.write(&doc).await?;

        tracing::debug!(document_id = id, version = doc.version, "Saved document");
        Ok(doc.version)
    }

    async fn delete(&self, id: i64) -> Result<()> {
        let _guard = self.write_guard.lock().await;
        let path = self.document_path(id);
        if !path.exists() {
            return Err(CloudError::DocumentNotFound(id));
        }
        fs::remove_file(&path).await?;

        for extra in [self.backup_path(id), self.lock_path(id)] {
            if extra.exists() {
                fs::remove_file(&extra).await?;
            }
        }
        Ok(())
    }

    async fn lock(&self, id: i64) -> Result<()> {
        let _guard = self.write_guard.lock().await;
        if !self.document_path(id).exists() {
            return Err(CloudError::DocumentNotFound(id));
        }

        let lock_path = self.lock_path(id);

        // Check for existing lock
        if lock_path.exists() {
            let content = fs::read_to_string(&lock_path).await?;
            let lock_info: LockInfo = serde_json::from_str(&content)?;

            let age = Utc::now().signed_duration_since(lock_info.acquired_at);
            if age.num_hours() < LOCK_STALE_HOURS {
                return Err(CloudError::LockError(format!(
                    "Document {} is locked by {} since {}",
                    id, lock_info.holder, lock_info.acquired_at
                )));
            }

            tracing::warn!("Removing stale lock from {}", lock_info.holder);
        }

        let lock_info = LockInfo {
            holder: std::env::var("HOSTNAME")
                .or_else(|_| std::env::var("HOST"))
                .unwrap_or_else(|_| "unknown".to_string()),
            acquired_at: Utc::now(),
        };

        let content = serde_json::to_string_pretty(&lock_info)?;
        fs::write(&lock_path, content).await?;

        tracing::debug!(document_id = id, "Acquired document lock");
        Ok(())
    }

    async fn unlock(&self, id: i64) -> Result<()> {
        let _guard = self.write_guard.lock().await;
        let lock_path = self.lock_path(id);
        if lock_path.exists() {
            fs::remove_file(&lock_path).await?;
            tracing::debug!(document_id = id, "Released document lock");
        }
        Ok(())
    }
}
