//! Core data models used throughout the sync pipeline.
//!
//! These types represent the chunks, collection entries, and query results
//! that flow between the document pipeline, the embedding client, and the
//! vector store.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;

/// Metadata map stored alongside every collection entry.
pub type Metadata = serde_json::Map<String, Value>;

/// Embedding vector as produced by an [`EmbeddingProvider`](crate::embedding::EmbeddingProvider).
pub type Embedding = Vec<f32>;

/// A bounded slice of a source document's text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Path of the originating file, relative to the knowledge directory.
    pub source: String,
    /// Position of the chunk within its source document.
    pub index: usize,
    pub text: String,
}

impl Chunk {
    pub fn metadata(&self) -> Metadata {
        let mut meta = Metadata::new();
        meta.insert("source".to_string(), Value::String(self.source.clone()));
        meta.insert("chunk_index".to_string(), Value::from(self.index));
        meta
    }
}

/// A chunk with the id it is (or was meant to be) stored under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkEntry {
    pub id: String,
    pub chunk: Chunk,
}

/// Column-oriented batch ready for insertion. All four columns have equal length.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EntryBatch {
    pub ids: Vec<String>,
    pub documents: Vec<String>,
    pub metadatas: Vec<Metadata>,
    pub embeddings: Vec<Embedding>,
}

impl EntryBatch {
    pub fn new(
        ids: Vec<String>,
        documents: Vec<String>,
        metadatas: Vec<Metadata>,
        embeddings: Vec<Embedding>,
    ) -> Result<Self, SyncError> {
        let n = ids.len();
        if documents.len() != n || metadatas.len() != n || embeddings.len() != n {
            return Err(SyncError::Store(format!(
                "batch columns differ in length: {} ids, {} documents, {} metadatas, {} embeddings",
                n,
                documents.len(),
                metadatas.len(),
                embeddings.len()
            )));
        }
        Ok(Self {
            ids,
            documents,
            metadatas,
            embeddings,
        })
    }

    /// Pair chunk entries with their embeddings.
    pub fn from_entries(entries: &[ChunkEntry], embeddings: Vec<Embedding>) -> Result<Self, SyncError> {
        Self::new(
            entries.iter().map(|e| e.id.clone()).collect(),
            entries.iter().map(|e| e.chunk.text.clone()).collect(),
            entries.iter().map(|e| e.chunk.metadata()).collect(),
            embeddings,
        )
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Handle of a collection on the vector store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionHandle {
    pub id: String,
    pub name: String,
}

/// Everything stored in a collection, as returned by `get_all`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionDump {
    pub ids: Vec<String>,
    pub documents: Vec<String>,
    pub metadatas: Vec<Metadata>,
    /// Present only when embeddings were requested.
    pub embeddings: Option<Vec<Embedding>>,
}

/// One nearest-neighbour hit of a similarity query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryMatch {
    pub id: String,
    pub document: String,
    pub metadata: Metadata,
    /// Cosine distance (`1 - cosine similarity`).
    pub distance: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_batch_rejects_ragged_columns() {
        let err = EntryBatch::new(
            vec!["a".into(), "b".into()],
            vec!["x".into(), "y".into()],
            vec![Metadata::new()],
            vec![vec![0.0], vec![1.0]],
        )
        .unwrap_err();
        assert!(err.to_string().contains("1 metadatas"));
    }

    #[test]
    fn test_from_entries_carries_source_metadata() {
        let entries = vec![ChunkEntry {
            id: "doc_0".into(),
            chunk: Chunk {
                source: "grip.txt".into(),
                index: 0,
                text: "Crimp with care.".into(),
            },
        }];
        let batch = EntryBatch::from_entries(&entries, vec![vec![0.5; 4]]).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.metadatas[0]["source"], "grip.txt");
        assert_eq!(batch.documents[0], "Crimp with care.");
    }
}
