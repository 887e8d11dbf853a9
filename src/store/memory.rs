//! In-memory [`VectorStore`] implementation for tests and offline runs.
//!
//! Uses a `HashMap` of collections behind `std::sync::RwLock`. Entries keep
//! insertion order; adding an existing id replaces it. Query is brute-force
//! cosine distance over every stored vector.
//!
//! The store counts heartbeat/add/delete calls and can be told to fail the
//! next few calls, so pipeline tests can assert which operations ran.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use uuid::Uuid;

use crate::embedding::cosine_similarity;
use crate::error::SyncError;
use crate::models::{CollectionDump, CollectionHandle, Embedding, EntryBatch, Metadata, QueryMatch};

use super::VectorStore;

struct StoredEntry {
    id: String,
    document: String,
    metadata: Metadata,
    embedding: Embedding,
}

struct StoredCollection {
    id: String,
    entries: Vec<StoredEntry>,
}

pub struct InMemoryStore {
    collections: RwLock<HashMap<String, StoredCollection>>,
    heartbeat_calls: AtomicUsize,
    add_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    heartbeat_failures: AtomicUsize,
    add_failures: Mutex<VecDeque<SyncError>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            heartbeat_calls: AtomicUsize::new(0),
            add_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
            heartbeat_failures: AtomicUsize::new(0),
            add_failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Calls to `heartbeat` so far.
    pub fn heartbeat_calls(&self) -> usize {
        self.heartbeat_calls.load(Ordering::SeqCst)
    }

    /// Calls to `add` so far, including failed ones.
    pub fn add_calls(&self) -> usize {
        self.add_calls.load(Ordering::SeqCst)
    }

    /// Calls to `delete` and `delete_collection` so far.
    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    /// Make the next `n` heartbeats fail with a connection error.
    pub fn fail_heartbeats(&self, n: usize) {
        self.heartbeat_failures.store(n, Ordering::SeqCst);
    }

    /// Queue an error for an upcoming `add` call. Queued errors are consumed in order.
    pub fn fail_next_add(&self, error: SyncError) {
        self.add_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(error);
    }

    fn missing(name: &str) -> SyncError {
        SyncError::Store(format!("collection {} does not exist", name))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorStore for InMemoryStore {
    fn backend(&self) -> &str {
        "memory"
    }

    async fn heartbeat(&self) -> Result<(), SyncError> {
        self.heartbeat_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.heartbeat_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.heartbeat_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(SyncError::StoreConnection("in-memory store unavailable".into()));
        }
        Ok(())
    }

    async fn get_collection(&self, name: &str) -> Result<Option<CollectionHandle>, SyncError> {
        let collections = self.collections.read().unwrap_or_else(|e| e.into_inner());
        Ok(collections.get(name).map(|c| CollectionHandle {
            id: c.id.clone(),
            name: name.to_string(),
        }))
    }

    async fn get_or_create_collection(&self, name: &str) -> Result<CollectionHandle, SyncError> {
        let mut collections = self.collections.write().unwrap_or_else(|e| e.into_inner());
        let coll = collections
            .entry(name.to_string())
            .or_insert_with(|| StoredCollection {
                id: Uuid::new_v4().to_string(),
                entries: Vec::new(),
            });
        Ok(CollectionHandle {
            id: coll.id.clone(),
            name: name.to_string(),
        })
    }

    async fn delete_collection(&self, name: &str) -> Result<(), SyncError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let mut collections = self.collections.write().unwrap_or_else(|e| e.into_inner());
        collections
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Self::missing(name))
    }

    async fn add(&self, collection: &CollectionHandle, batch: &EntryBatch) -> Result<(), SyncError> {
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self
            .add_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
        {
            return Err(err);
        }

        let mut collections = self.collections.write().unwrap_or_else(|e| e.into_inner());
        let coll = collections
            .get_mut(&collection.name)
            .ok_or_else(|| Self::missing(&collection.name))?;

        for i in 0..batch.len() {
            let entry = StoredEntry {
                id: batch.ids[i].clone(),
                document: batch.documents[i].clone(),
                metadata: batch.metadatas[i].clone(),
                embedding: batch.embeddings[i].clone(),
            };
            match coll.entries.iter_mut().find(|e| e.id == entry.id) {
                Some(existing) => *existing = entry,
                None => coll.entries.push(entry),
            }
        }
        Ok(())
    }

    async fn delete(&self, collection: &CollectionHandle, ids: &[String]) -> Result<(), SyncError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let mut collections = self.collections.write().unwrap_or_else(|e| e.into_inner());
        let coll = collections
            .get_mut(&collection.name)
            .ok_or_else(|| Self::missing(&collection.name))?;
        coll.entries.retain(|e| !ids.contains(&e.id));
        Ok(())
    }

    async fn query(
        &self,
        collection: &CollectionHandle,
        embedding: &[f32],
        k: usize,
    ) -> Result<Vec<QueryMatch>, SyncError> {
        let collections = self.collections.read().unwrap_or_else(|e| e.into_inner());
        let coll = collections
            .get(&collection.name)
            .ok_or_else(|| Self::missing(&collection.name))?;

        let mut matches: Vec<QueryMatch> = coll
            .entries
            .iter()
            .map(|e| QueryMatch {
                id: e.id.clone(),
                document: e.document.clone(),
                metadata: e.metadata.clone(),
                distance: 1.0 - cosine_similarity(embedding, &e.embedding),
            })
            .collect();
        matches.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(k);
        Ok(matches)
    }

    async fn count(&self, collection: &CollectionHandle) -> Result<usize, SyncError> {
        let collections = self.collections.read().unwrap_or_else(|e| e.into_inner());
        collections
            .get(&collection.name)
            .map(|c| c.entries.len())
            .ok_or_else(|| Self::missing(&collection.name))
    }

    async fn get_all(
        &self,
        collection: &CollectionHandle,
        include_embeddings: bool,
    ) -> Result<CollectionDump, SyncError> {
        let collections = self.collections.read().unwrap_or_else(|e| e.into_inner());
        let coll = collections
            .get(&collection.name)
            .ok_or_else(|| Self::missing(&collection.name))?;
        Ok(CollectionDump {
            ids: coll.entries.iter().map(|e| e.id.clone()).collect(),
            documents: coll.entries.iter().map(|e| e.document.clone()).collect(),
            metadatas: coll.entries.iter().map(|e| e.metadata.clone()).collect(),
            embeddings: include_embeddings
                .then(|| coll.entries.iter().map(|e| e.embedding.clone()).collect()),
        })
    }
}
