//! Health check for `verify` runs.
//!
//! Probes the store, checks the collection and performs one embedding
//! self-test. Individual failures are folded into the report rather than
//! returned, so a single run reports every problem at once.

use serde::Serialize;

use crate::embedding::EmbeddingClient;
use crate::store::StoreClient;

#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub store_reachable: bool,
    pub collection_exists: bool,
    pub document_count: Option<usize>,
    pub embedding_ok: bool,
    pub embedding_dims: Option<usize>,
    /// One line per failed check.
    pub problems: Vec<String>,
}

pub async fn check(store: &StoreClient, embedder: &EmbeddingClient, collection: &str) -> HealthReport {
    let mut report = HealthReport::default();

    match store.heartbeat().await {
        Ok(()) => {
            report.store_reachable = true;
            tracing::info!("vector store connection: ok");
        }
        Err(e) => {
            tracing::error!("vector store connection failed: {}", e);
            report.problems.push(format!("store: {}", e));
        }
    }

    if report.store_reachable {
        match store.get_collection(collection).await {
            Ok(Some(handle)) => {
                report.collection_exists = true;
                match store.count(&handle).await {
                    Ok(n) => {
                        report.document_count = Some(n);
                        tracing::info!(collection, documents = n, "collection exists");
                    }
                    Err(e) => report.problems.push(format!("count: {}", e)),
                }
            }
            Ok(None) => {
                tracing::warn!(collection, "collection not found");
                report.problems.push(format!("collection {} not found", collection));
            }
            Err(e) => report.problems.push(format!("collection: {}", e)),
        }
    }

    match embedder.embed_query("test").await {
        Ok(vector) => {
            report.embedding_ok = !vector.is_empty();
            report.embedding_dims = Some(vector.len());
            tracing::info!(dims = vector.len(), "embedding self-test: ok");
        }
        Err(e) => {
            tracing::error!("embedding self-test failed: {}", e);
            report.problems.push(format!("embedding: {}", e));
        }
    }

    report.healthy = report.store_reachable && report.collection_exists && report.embedding_ok;
    if report.healthy {
        tracing::info!("health check result: healthy");
    } else {
        tracing::error!(problems = report.problems.len(), "health check result: unhealthy");
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{AlertSink, ErrorAnalyzer, ErrorRecord};
    use crate::embedding::HashEmbedder;
    use crate::retry::RetryPolicy;
    use crate::store::memory::InMemoryStore;
    use std::sync::Arc;

    struct QuietSink;

    impl AlertSink for QuietSink {
        fn alert(&self, _record: &ErrorRecord, _recent_count: usize) {}
    }

    fn services(memory: Arc<InMemoryStore>) -> (StoreClient, EmbeddingClient) {
        let analyzer = Arc::new(ErrorAnalyzer::with_sink(Arc::new(QuietSink)));
        let store = StoreClient::new(memory, analyzer.clone()).with_policies(
            RetryPolicy::store_connect().with_max_backoff(0.0),
            RetryPolicy::store_operations().with_max_backoff(0.0),
        );
        let embedder = EmbeddingClient::new(Arc::new(HashEmbedder::new("m", 768)), analyzer);
        (store, embedder)
    }

    #[tokio::test]
    async fn test_missing_collection_is_unhealthy() {
        let (store, embedder) = services(Arc::new(InMemoryStore::new()));
        let report = check(&store, &embedder, "bouldering_advice").await;
        assert!(report.store_reachable);
        assert!(!report.collection_exists);
        assert!(report.embedding_ok);
        assert!(!report.healthy);
        assert_eq!(report.problems.len(), 1);
    }

    #[tokio::test]
    async fn test_all_checks_pass() {
        let (store, embedder) = services(Arc::new(InMemoryStore::new()));
        store.get_or_create_collection("bouldering_advice").await.unwrap();
        let report = check(&store, &embedder, "bouldering_advice").await;
        assert!(report.healthy);
        assert_eq!(report.document_count, Some(0));
        assert_eq!(report.embedding_dims, Some(768));
    }

    #[tokio::test]
    async fn test_unreachable_store_is_unhealthy() {
        let memory = Arc::new(InMemoryStore::new());
        memory.fail_heartbeats(1);
        let (store, embedder) = services(memory);
        let report = check(&store, &embedder, "bouldering_advice").await;
        assert!(!report.store_reachable);
        assert!(!report.healthy);
    }
}
