//! Vector store abstraction.
//!
//! The [`VectorStore`] trait is the capability every backend provides;
//! [`StoreClient`] layers connection tracking and retry policies on top.
//!
//! | Backend | Use |
//! |---------|-----|
//! | [`ChromaStore`](chroma::ChromaStore) | Chroma server over its REST API |
//! | [`InMemoryStore`](memory::InMemoryStore) | tests and `--mock-services` runs |

pub mod chroma;
pub mod memory;

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::analyzer::ErrorAnalyzer;
use crate::config::VectorStoreConfig;
use crate::error::{ErrorKind, SyncError};
use crate::models::{CollectionDump, CollectionHandle, EntryBatch, QueryMatch};
use crate::retry::{retry_with_hook, RetryPolicy};

/// Operations against a vector database.
///
/// All operations are async (via `async-trait`). In-memory implementations
/// return immediately-ready futures.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Short backend name for logs.
    fn backend(&self) -> &str;
    /// Lightweight liveness probe.
    async fn heartbeat(&self) -> Result<(), SyncError>;
    async fn get_collection(&self, name: &str) -> Result<Option<CollectionHandle>, SyncError>;
    async fn get_or_create_collection(&self, name: &str) -> Result<CollectionHandle, SyncError>;
    async fn delete_collection(&self, name: &str) -> Result<(), SyncError>;
    async fn add(&self, collection: &CollectionHandle, batch: &EntryBatch) -> Result<(), SyncError>;
    async fn delete(&self, collection: &CollectionHandle, ids: &[String]) -> Result<(), SyncError>;
    /// Nearest neighbours of `embedding`, closest first.
    async fn query(
        &self,
        collection: &CollectionHandle,
        embedding: &[f32],
        k: usize,
    ) -> Result<Vec<QueryMatch>, SyncError>;
    async fn count(&self, collection: &CollectionHandle) -> Result<usize, SyncError>;
    async fn get_all(
        &self,
        collection: &CollectionHandle,
        include_embeddings: bool,
    ) -> Result<CollectionDump, SyncError>;
}

/// Create the backend for this run.
pub fn create_store(
    config: &VectorStoreConfig,
    mock: bool,
) -> Result<Arc<dyn VectorStore>, SyncError> {
    if mock {
        return Ok(Arc::new(memory::InMemoryStore::new()));
    }
    let url = config
        .url
        .as_deref()
        .ok_or_else(|| SyncError::Configuration("CHROMA_DB_URL is not set".into()))?;
    Ok(Arc::new(chroma::ChromaStore::new(url, config.timeout_secs)?))
}

/// Retrying front of a [`VectorStore`].
///
/// `connect` probes with the adaptive policy; CRUD calls use the fixed
/// policy. A connection-class failure marks the client stale and the next
/// call probes again before doing work.
pub struct StoreClient {
    backend: Arc<dyn VectorStore>,
    analyzer: Arc<ErrorAnalyzer>,
    connect_policy: RetryPolicy,
    ops_policy: RetryPolicy,
    connected: AtomicBool,
}

impl StoreClient {
    pub fn new(backend: Arc<dyn VectorStore>, analyzer: Arc<ErrorAnalyzer>) -> Self {
        Self {
            backend,
            analyzer,
            connect_policy: RetryPolicy::store_connect(),
            ops_policy: RetryPolicy::store_operations(),
            connected: AtomicBool::new(false),
        }
    }

    pub fn with_policies(mut self, connect: RetryPolicy, ops: RetryPolicy) -> Self {
        self.connect_policy = connect;
        self.ops_policy = ops;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Verify the store is reachable. No-op once connected.
    pub async fn connect(&self) -> Result<(), SyncError> {
        if self.is_connected() {
            return Ok(());
        }
        retry_with_hook(
            &self.connect_policy,
            "store.connect",
            &self.analyzer,
            |_| {},
            move || self.backend.heartbeat(),
        )
        .await?;
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!(backend = self.backend.backend(), "connected to vector store");
        Ok(())
    }

    /// Single liveness probe, bypassing the connection cache.
    pub async fn heartbeat(&self) -> Result<(), SyncError> {
        self.backend.heartbeat().await
    }

    async fn ensure_connected(&self) -> Result<(), SyncError> {
        if !self.is_connected() {
            self.backend.heartbeat().await?;
            self.connected.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn mark_stale(&self, err: &SyncError) {
        if matches!(
            err.kind(),
            ErrorKind::StoreConnection | ErrorKind::Network
        ) {
            tracing::debug!("marking vector store connection stale");
            self.connected.store(false, Ordering::SeqCst);
        }
    }

    pub async fn get_collection(&self, name: &str) -> Result<Option<CollectionHandle>, SyncError> {
        retry_with_hook(
            &self.ops_policy,
            "store.get_collection",
            &self.analyzer,
            |e| self.mark_stale(e),
            move || async move {
                self.ensure_connected().await?;
                self.backend.get_collection(name).await
            },
        )
        .await
    }

    pub async fn get_or_create_collection(&self, name: &str) -> Result<CollectionHandle, SyncError> {
        retry_with_hook(
            &self.ops_policy,
            "store.get_or_create_collection",
            &self.analyzer,
            |e| self.mark_stale(e),
            move || async move {
                self.ensure_connected().await?;
                self.backend.get_or_create_collection(name).await
            },
        )
        .await
    }

    /// Drop the collection if present, then create it empty.
    pub async fn recreate_collection(&self, name: &str) -> Result<CollectionHandle, SyncError> {
        if self.get_collection(name).await?.is_some() {
            retry_with_hook(
                &self.ops_policy,
                "store.delete_collection",
                &self.analyzer,
                |e| self.mark_stale(e),
                move || async move {
                    self.ensure_connected().await?;
                    self.backend.delete_collection(name).await
                },
            )
            .await?;
            tracing::info!(collection = name, "deleted existing collection");
        }
        self.get_or_create_collection(name).await
    }

    pub async fn add(&self, collection: &CollectionHandle, batch: &EntryBatch) -> Result<(), SyncError> {
        retry_with_hook(
            &self.ops_policy,
            "store.add",
            &self.analyzer,
            |e| self.mark_stale(e),
            move || async move {
                self.ensure_connected().await?;
                self.backend.add(collection, batch).await
            },
        )
        .await
    }

    pub async fn delete(&self, collection: &CollectionHandle, ids: &[String]) -> Result<(), SyncError> {
        retry_with_hook(
            &self.ops_policy,
            "store.delete",
            &self.analyzer,
            |e| self.mark_stale(e),
            move || async move {
                self.ensure_connected().await?;
                self.backend.delete(collection, ids).await
            },
        )
        .await
    }

    pub async fn query(
        &self,
        collection: &CollectionHandle,
        embedding: &[f32],
        k: usize,
    ) -> Result<Vec<QueryMatch>, SyncError> {
        retry_with_hook(
            &self.ops_policy,
            "store.query",
            &self.analyzer,
            |e| self.mark_stale(e),
            move || async move {
                self.ensure_connected().await?;
                self.backend.query(collection, embedding, k).await
            },
        )
        .await
    }

    pub async fn count(&self, collection: &CollectionHandle) -> Result<usize, SyncError> {
        retry_with_hook(
            &self.ops_policy,
            "store.count",
            &self.analyzer,
            |e| self.mark_stale(e),
            move || async move {
                self.ensure_connected().await?;
                self.backend.count(collection).await
            },
        )
        .await
    }

    pub async fn get_all(
        &self,
        collection: &CollectionHandle,
        include_embeddings: bool,
    ) -> Result<CollectionDump, SyncError> {
        retry_with_hook(
            &self.ops_policy,
            "store.get_all",
            &self.analyzer,
            |e| self.mark_stale(e),
            move || async move {
                self.ensure_connected().await?;
                self.backend.get_all(collection, include_embeddings).await
            },
        )
        .await
    }
}
