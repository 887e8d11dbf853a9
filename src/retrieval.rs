//! Similarity search over the synced collection.
//!
//! This is the read path the serving application depends on: embed the
//! query text with the same model used at ingestion, then return the `k`
//! nearest entries with a relevance score of `1 - distance`.

use serde::Serialize;

use crate::embedding::EmbeddingClient;
use crate::error::SyncError;
use crate::models::Metadata;
use crate::store::StoreClient;

#[derive(Debug, Clone, Serialize)]
pub struct RetrievedDocument {
    pub id: String,
    pub document: String,
    pub metadata: Metadata,
    pub distance: f32,
    pub relevance_score: f32,
}

/// Top-`k` documents for `text`, closest first.
///
/// Fails with a store error when the collection does not exist.
pub async fn similarity_query(
    store: &StoreClient,
    embedder: &EmbeddingClient,
    collection: &str,
    text: &str,
    k: usize,
) -> Result<Vec<RetrievedDocument>, SyncError> {
    let handle = store
        .get_collection(collection)
        .await?
        .ok_or_else(|| SyncError::Store(format!("collection {} does not exist", collection)))?;
    let embedding = embedder.embed_query(text).await?;
    let matches = store.query(&handle, &embedding, k).await?;

    Ok(matches
        .into_iter()
        .map(|m| RetrievedDocument {
            relevance_score: 1.0 - m.distance,
            id: m.id,
            document: m.document,
            metadata: m.metadata,
            distance: m.distance,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{AlertSink, ErrorAnalyzer, ErrorRecord};
    use crate::embedding::HashEmbedder;
    use crate::models::EntryBatch;
    use crate::store::memory::InMemoryStore;
    use std::sync::Arc;

    struct QuietSink;

    impl AlertSink for QuietSink {
        fn alert(&self, _record: &ErrorRecord, _recent_count: usize) {}
    }

    #[tokio::test]
    async fn test_exact_text_ranks_first() {
        let analyzer = Arc::new(ErrorAnalyzer::with_sink(Arc::new(QuietSink)));
        let hasher = HashEmbedder::new("m", 64);
        let store = StoreClient::new(Arc::new(InMemoryStore::new()), analyzer.clone());
        let embedder = EmbeddingClient::new(Arc::new(HashEmbedder::new("m", 64)), analyzer);

        let texts = ["Keep hips close to the wall.", "Drop knee on overhangs.", "Chalk up."];
        let coll = store.get_or_create_collection("c").await.unwrap();
        let batch = EntryBatch::new(
            (0..3).map(|i| format!("doc_{}", i)).collect(),
            texts.iter().map(|t| t.to_string()).collect(),
            (0..3).map(|_| Metadata::new()).collect(),
            texts.iter().map(|t| hasher.vector(t)).collect(),
        )
        .unwrap();
        store.add(&coll, &batch).await.unwrap();

        let hits = similarity_query(&store, &embedder, "c", "Drop knee on overhangs.", 2)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "doc_1");
        assert!((hits[0].relevance_score - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_missing_collection_errors() {
        let analyzer = Arc::new(ErrorAnalyzer::with_sink(Arc::new(QuietSink)));
        let store = StoreClient::new(Arc::new(InMemoryStore::new()), analyzer.clone());
        let embedder = EmbeddingClient::new(Arc::new(HashEmbedder::new("m", 8)), analyzer);
        let err = similarity_query(&store, &embedder, "ghost", "crimp", 3)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Store(_)));
    }
}
