//! Document collection backing the ledger.
//!
//! Two backends: an in-process [`MemoryStore`] and a [`JsonFileStore`] that keeps the
//! whole collection in one JSON file and rewrites it on every mutation.

use crate::error::{RateWatchError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    // Only tests read oldest-first; the ledger always walks newest-first.
    #[cfg(test)]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    /// Instant the collection is ordered by.
    pub order_key: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub body: Value,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn append(&self, order_key: DateTime<Utc>, body: Value) -> Result<Document>;

    async fn query(&self, order: SortOrder, limit: Option<usize>) -> Result<Vec<Document>>;

    async fn delete(&self, id: &str) -> Result<()>;
}

fn new_document(order_key: DateTime<Utc>, body: Value) -> Document {
    Document {
        id: Uuid::new_v4().to_string(),
        order_key,
        created_at: Utc::now(),
        body,
    }
}

fn select(mut docs: Vec<Document>, order: SortOrder, limit: Option<usize>) -> Vec<Document> {
    // Stable sort keeps insertion order for equal keys.
    docs.sort_by_key(|d| d.order_key);
    if order == SortOrder::Descending {
        docs.reverse();
    }
    if let Some(limit) = limit {
        docs.truncate(limit);
    }
    docs
}

#[derive(Default)]
pub struct MemoryStore {
    docs: Mutex<Vec<Document>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Document>> {
        self.docs.lock().unwrap_or_else(|p| p.into_inner())
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Inserts a document verbatim, bypassing the ledger's write path.
    pub fn insert_raw(&self, order_key: DateTime<Utc>, body: Value) -> Document {
        let doc = new_document(order_key, body);
        self.lock().push(doc.clone());
        doc
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn append(&self, order_key: DateTime<Utc>, body: Value) -> Result<Document> {
        Ok(self.insert_raw(order_key, body))
    }

    async fn query(&self, order: SortOrder, limit: Option<usize>) -> Result<Vec<Document>> {
        Ok(select(self.lock().clone(), order, limit))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.lock().retain(|d| d.id != id);
        Ok(())
    }
}

pub struct JsonFileStore {
    path: PathBuf,
    // Serializes read-modify-write cycles on the file.
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn read_all(&self) -> Result<Vec<Document>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(Vec::new()),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                RateWatchError::Store(format!("corrupt ledger file {}: {}", self.path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_all(&self, docs: &[Document]) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(docs)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("Wrote {} documents to {}", docs.len(), self.path.display());
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for JsonFileStore {
    async fn append(&self, order_key: DateTime<Utc>, body: Value) -> Result<Document> {
        let _guard = self.write_lock.lock().await;
        let mut docs = self.read_all().await?;
        let doc = new_document(order_key, body);
        docs.push(doc.clone());
        self.write_all(&docs).await?;
        Ok(doc)
    }

    async fn query(&self, order: SortOrder, limit: Option<usize>) -> Result<Vec<Document>> {
        let _guard = self.write_lock.lock().await;
        Ok(select(self.read_all().await?, order, limit))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut docs = self.read_all().await?;
        let before = docs.len();
        docs.retain(|d| d.id != id);
        if docs.len() != before {
            self.write_all(&docs).await?;
        }
        Ok(())
    }
}
