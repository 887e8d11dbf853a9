//! JSON snapshots of the vector-store collection.
//!
//! A backup captures ids, documents and metadatas of every entry. Embeddings
//! are included only while the collection is smaller than the configured
//! limit; larger collections are re-embedded from their documents on
//! restore instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::SyncError;
use crate::models::{Embedding, Metadata};
use crate::store::StoreClient;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupData {
    pub ids: Vec<String>,
    pub documents: Vec<String>,
    pub metadatas: Vec<Metadata>,
    /// Empty when the collection was at or above the embedding limit.
    #[serde(default)]
    pub embeddings: Vec<Embedding>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupArchive {
    pub timestamp: DateTime<Utc>,
    pub collection_name: String,
    pub embedding_model: String,
    pub total_documents: usize,
    pub data: BackupData,
}

pub struct BackupManager {
    dir: PathBuf,
    embedding_limit: usize,
}

impl BackupManager {
    pub fn new(dir: impl Into<PathBuf>, embedding_limit: usize) -> Self {
        Self {
            dir: dir.into(),
            embedding_limit,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot `collection_name` into a new timestamped file and return its path.
    pub async fn create(
        &self,
        store: &StoreClient,
        collection_name: &str,
        embedding_model: &str,
    ) -> Result<PathBuf, SyncError> {
        let collection = store
            .get_collection(collection_name)
            .await?
            .ok_or_else(|| {
                SyncError::Store(format!("collection {} does not exist", collection_name))
            })?;

        let count = store.count(&collection).await?;
        let include_embeddings = count < self.embedding_limit;
        if !include_embeddings {
            tracing::info!(
                count,
                limit = self.embedding_limit,
                "collection too large, backing up without embeddings"
            );
        }
        let dump = store.get_all(&collection, include_embeddings).await?;

        let now = Utc::now();
        let archive = BackupArchive {
            timestamp: now,
            collection_name: collection_name.to_string(),
            embedding_model: embedding_model.to_string(),
            total_documents: dump.ids.len(),
            data: BackupData {
                ids: dump.ids,
                documents: dump.documents,
                metadatas: dump.metadatas,
                embeddings: dump.embeddings.unwrap_or_default(),
            },
        };

        std::fs::create_dir_all(&self.dir)?;
        let path = self
            .dir
            .join(format!("chroma_backup_{}.json", now.format("%Y%m%d_%H%M%S")));
        let json = serde_json::to_string_pretty(&archive)?;
        std::fs::write(&path, json)?;

        tracing::info!(
            path = %path.display(),
            documents = archive.total_documents,
            "backup written"
        );
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<BackupArchive, SyncError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{AlertSink, ErrorAnalyzer, ErrorRecord};
    use crate::models::EntryBatch;
    use crate::retry::RetryPolicy;
    use crate::store::memory::InMemoryStore;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct QuietSink;

    impl AlertSink for QuietSink {
        fn alert(&self, _record: &ErrorRecord, _recent_count: usize) {}
    }

    fn client() -> StoreClient {
        StoreClient::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(ErrorAnalyzer::with_sink(Arc::new(QuietSink))),
        )
        .with_policies(
            RetryPolicy::store_connect().with_max_backoff(0.0),
            RetryPolicy::store_operations().with_max_backoff(0.0),
        )
    }

    async fn seed(store: &StoreClient, n: usize) {
        let coll = store.get_or_create_collection("bouldering_advice").await.unwrap();
        let batch = EntryBatch::new(
            (0..n).map(|i| format!("doc_{}", i)).collect(),
            (0..n).map(|i| format!("beta {}", i)).collect(),
            (0..n).map(|_| Metadata::new()).collect(),
            (0..n).map(|_| vec![0.5, 0.5]).collect(),
        )
        .unwrap();
        store.add(&coll, &batch).await.unwrap();
    }

    #[tokio::test]
    async fn test_large_collection_skips_embeddings() {
        let tmp = TempDir::new().unwrap();
        let store = client();
        seed(&store, 10).await;

        let manager = BackupManager::new(tmp.path().join("backups"), 5);
        let path = manager
            .create(&store, "bouldering_advice", "models/embedding-001")
            .await
            .unwrap();

        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("chroma_backup_") && name.ends_with(".json"));

        let archive = BackupManager::load(&path).unwrap();
        assert_eq!(archive.total_documents, 10);
        assert_eq!(archive.data.ids.len(), 10);
        assert_eq!(archive.data.documents.len(), 10);
        assert_eq!(archive.data.metadatas.len(), 10);
        assert!(archive.data.embeddings.is_empty());
        assert_eq!(archive.embedding_model, "models/embedding-001");
    }

    #[tokio::test]
    async fn test_small_collection_keeps_embeddings() {
        let tmp = TempDir::new().unwrap();
        let store = client();
        seed(&store, 3).await;

        let manager = BackupManager::new(tmp.path(), 1000);
        let path = manager.create(&store, "bouldering_advice", "m").await.unwrap();
        let archive = BackupManager::load(&path).unwrap();
        assert_eq!(archive.data.embeddings.len(), 3);
    }

    #[tokio::test]
    async fn test_missing_collection_fails() {
        let tmp = TempDir::new().unwrap();
        let manager = BackupManager::new(tmp.path(), 1000);
        let err = manager.create(&client(), "nope", "m").await.unwrap_err();
        assert!(matches!(err, SyncError::Store(_)));
    }
}
