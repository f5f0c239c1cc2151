//! # Blob Store
//!
//! `scheme://bucket/key` locators and the blob store seam used by both
//! executors. Map tasks write result blobs here; reduce tasks probe for
//! their existence before fetching. Writers to the same key are idempotent
//! overwrites, which is what makes at-least-once delivery acceptable.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{PipelineError, Result};

/// Parsed `scheme://bucket/key` blob locator
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Locator {
    pub scheme: String,
    pub bucket: String,
    pub key: String,
}

impl Locator {
    pub fn parse(raw: &str) -> Result<Self> {
        let (scheme, rest) = raw.split_once("://").ok_or_else(|| {
            PipelineError::invalid_message(format!("locator '{raw}' has no scheme"))
        })?;
        let (bucket, key) = rest.split_once('/').ok_or_else(|| {
            PipelineError::invalid_message(format!("locator '{raw}' has no key"))
        })?;
        if scheme.is_empty() || bucket.is_empty() || key.is_empty() {
            return Err(PipelineError::invalid_message(format!(
                "locator '{raw}' has empty components"
            )));
        }
        Ok(Self {
            scheme: scheme.to_string(),
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.bucket, self.key)
    }
}

/// Blob store contract: put/get/exists over locators
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, locator: &Locator, bytes: Vec<u8>, content_type: &str) -> Result<()>;

    async fn get(&self, locator: &Locator) -> Result<Vec<u8>>;

    async fn exists(&self, locator: &Locator) -> Result<bool>;
}

/// Filesystem-backed blob store rooted at a directory; buckets map to
/// subdirectories.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, locator: &Locator) -> PathBuf {
        self.root.join(&locator.bucket).join(&locator.key)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, locator: &Locator, bytes: Vec<u8>, _content_type: &str) -> Result<()> {
        let path = self.path_for(locator);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PipelineError::blob("put", locator.to_string(), e.to_string()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| PipelineError::blob("put", locator.to_string(), e.to_string()))
    }

    async fn get(&self, locator: &Locator) -> Result<Vec<u8>> {
        tokio::fs::read(self.path_for(locator))
            .await
            .map_err(|e| PipelineError::blob("get", locator.to_string(), e.to_string()))
    }

    async fn exists(&self, locator: &Locator) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.path_for(locator))
            .await
            .map_err(|e| PipelineError::blob("exists", locator.to_string(), e.to_string()))?)
    }
}

/// In-memory blob store for tests
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<HashMap<Locator, Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, locator: &Locator, bytes: Vec<u8>, _content_type: &str) -> Result<()> {
        self.blobs.write().await.insert(locator.clone(), bytes);
        Ok(())
    }

    async fn get(&self, locator: &Locator) -> Result<Vec<u8>> {
        self.blobs
            .read()
            .await
            .get(locator)
            .cloned()
            .ok_or_else(|| PipelineError::blob("get", locator.to_string(), "not found"))
    }

    async fn exists(&self, locator: &Locator) -> Result<bool> {
        Ok(self.blobs.read().await.contains_key(locator))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locator_parse() {
        let locator = Locator::parse("blob://minutes/results/123-0.json").unwrap();
        assert_eq!(locator.scheme, "blob");
        assert_eq!(locator.bucket, "minutes");
        assert_eq!(locator.key, "results/123-0.json");
        assert_eq!(locator.to_string(), "blob://minutes/results/123-0.json");
    }

    #[test]
    fn test_locator_rejects_malformed() {
        assert!(Locator::parse("no-scheme").is_err());
        assert!(Locator::parse("blob://bucket-only").is_err());
        assert!(Locator::parse("://bucket/key").is_err());
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryBlobStore::new();
        let locator = Locator::parse("blob://b/k.json").unwrap();

        assert!(!store.exists(&locator).await.unwrap());
        store
            .put(&locator, b"{\"a\":1}".to_vec(), "application/json")
            .await
            .unwrap();
        assert!(store.exists(&locator).await.unwrap());
        assert_eq!(store.get(&locator).await.unwrap(), b"{\"a\":1}");
    }

    #[tokio::test]
    async fn test_fs_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        let locator = Locator::parse("blob://minutes/nested/chunk.txt").unwrap();

        assert!(!store.exists(&locator).await.unwrap());
        store
            .put(&locator, b"hello".to_vec(), "text/plain")
            .await
            .unwrap();
        assert!(store.exists(&locator).await.unwrap());
        assert_eq!(store.get(&locator).await.unwrap(), b"hello");
    }
}
