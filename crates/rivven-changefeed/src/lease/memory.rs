//! In-memory document store
//!
//! Suitable for tests and single-process simulation. Etags are taken from one
//! monotonically increasing counter, so an etag is never reused for the same
//! document even after delete and re-create.

use super::document::{LeaseDocumentStore, StoredDocument};
use crate::error::{ChangeFeedError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    etag: u64,
    body: serde_json::Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }

    fn to_document(&self, id: &str) -> StoredDocument {
        StoredDocument {
            id: id.to_string(),
            etag: self.etag.to_string(),
            body: self.body.clone(),
        }
    }
}

/// Thread-safe in-memory [`LeaseDocumentStore`]
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    documents: RwLock<BTreeMap<String, Entry>>,
    next_etag: AtomicU64,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_etag(&self) -> u64 {
        self.next_etag.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Number of live documents
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.documents
            .read()
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LeaseDocumentStore for InMemoryDocumentStore {
    async fn read(&self, id: &str) -> Result<Option<StoredDocument>> {
        let now = Instant::now();
        Ok(self
            .documents
            .read()
            .get(id)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.to_document(id)))
    }

    async fn create(
        &self,
        id: &str,
        body: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<StoredDocument> {
        let now = Instant::now();
        let mut documents = self.documents.write();
        if documents.get(id).is_some_and(|entry| entry.is_live(now)) {
            return Err(ChangeFeedError::Conflict(id.to_string()));
        }

        let entry = Entry {
            etag: self.next_etag(),
            body,
            expires_at: ttl.map(|ttl| now + ttl),
        };
        let document = entry.to_document(id);
        documents.insert(id.to_string(), entry);
        Ok(document)
    }

    async fn replace(
        &self,
        id: &str,
        body: serde_json::Value,
        if_match: &str,
    ) -> Result<StoredDocument> {
        let now = Instant::now();
        let mut documents = self.documents.write();
        let entry = documents
            .get_mut(id)
            .filter(|entry| entry.is_live(now))
            .ok_or_else(|| ChangeFeedError::LeaseNotFound(id.to_string()))?;

        if entry.etag.to_string() != if_match {
            return Err(ChangeFeedError::PreconditionFailed(id.to_string()));
        }

        entry.etag = self.next_etag();
        entry.body = body;
        Ok(entry.to_document(id))
    }

    async fn delete(&self, id: &str, if_match: Option<&str>) -> Result<bool> {
        let now = Instant::now();
        let mut documents = self.documents.write();
        let Some(entry) = documents.get(id) else {
            return Ok(false);
        };
        if !entry.is_live(now) {
            documents.remove(id);
            return Ok(false);
        }
        if let Some(etag) = if_match {
            if entry.etag.to_string() != etag {
                return Err(ChangeFeedError::PreconditionFailed(id.to_string()));
            }
        }
        documents.remove(id);
        Ok(true)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<StoredDocument>> {
        let now = Instant::now();
        Ok(self
            .documents
            .read()
            .range(prefix.to_string()..)
            .take_while(|(id, _)| id.starts_with(prefix))
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(id, entry)| entry.to_document(id))
            .collect())
    }
}
