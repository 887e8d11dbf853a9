//! Full-update pipeline for `replace` and `append` runs.
//!
//! Coordinates the sync flow: load documents → split into chunks →
//! (for replace) recreate the collection → embed and insert in batches.
//! A failed batch does not stop the run; its chunks are registered with the
//! [`RecoveryManager`] and retried after the main pass. Auth and
//! configuration failures abort immediately.

use chrono::Utc;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::analyzer::{context, ErrorAnalyzer};
use crate::chunk::TextSplitter;
use crate::config::Settings;
use crate::documents::{load_document, load_documents};
use crate::embedding::EmbeddingClient;
use crate::error::SyncError;
use crate::models::{Chunk, ChunkEntry, CollectionHandle, EntryBatch};
use crate::progress::{ProgressEvent, ProgressReporter, StageTimer};
use crate::recovery::{FailedItem, OperationType, RecoveryHandler, RecoveryManager};
use crate::store::StoreClient;

/// How the collection is treated before new chunks are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Drop and recreate the collection; ids are `doc_{n}`.
    Replace,
    /// Keep existing entries; ids are `append_{run}_{n}`.
    Append,
}

impl WriteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteMode::Replace => "replace",
            WriteMode::Append => "append",
        }
    }
}

/// Counters reported at the end of a full update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestStats {
    pub documents: usize,
    pub chunks: usize,
    pub batches: usize,
    pub failed_batches: usize,
    pub recovered_items: usize,
    pub permanently_failed: Vec<String>,
    /// Collection size after the run; `None` on dry runs.
    pub final_count: Option<usize>,
}

/// Borrowed services and settings for one full update.
pub struct Pipeline<'a> {
    pub settings: &'a Settings,
    pub store: &'a StoreClient,
    pub embedder: &'a EmbeddingClient,
    pub analyzer: &'a ErrorAnalyzer,
    pub progress: &'a dyn ProgressReporter,
}

/// Assigns entry ids for one run.
struct IdSequence {
    prefix: String,
    next: AtomicUsize,
}

impl IdSequence {
    fn new(mode: WriteMode) -> Self {
        let prefix = match mode {
            WriteMode::Replace => "doc_".to_string(),
            WriteMode::Append => format!("append_{}_", Utc::now().format("%Y%m%d%H%M%S")),
        };
        Self {
            prefix,
            next: AtomicUsize::new(0),
        }
    }

    fn assign(&self, chunks: Vec<Chunk>) -> Vec<ChunkEntry> {
        chunks
            .into_iter()
            .map(|chunk| ChunkEntry {
                id: format!("{}{}", self.prefix, self.next.fetch_add(1, Ordering::SeqCst)),
                chunk,
            })
            .collect()
    }
}

impl<'a> Pipeline<'a> {
    pub async fn run(
        &self,
        mode: WriteMode,
        dry_run: bool,
        recovery: &mut RecoveryManager,
        timer: &mut StageTimer,
    ) -> Result<IngestStats, SyncError> {
        let knowledge = &self.settings.knowledge;
        let mut stats = IngestStats::default();

        timer.start("document loading");
        let loaded = load_documents(&knowledge.dir, &knowledge.include_globs)?;
        timer.end("document loading");
        stats.documents = loaded.documents.len();

        if !loaded.unreadable.is_empty() {
            let reasons = loaded
                .unreadable
                .iter()
                .map(|(source, reason)| format!("{}: {}", source, reason))
                .collect::<Vec<_>>()
                .join("; ");
            recovery.record_failure(
                OperationType::DocumentProcessing,
                loaded
                    .unreadable
                    .iter()
                    .map(|(source, _)| FailedItem::Document(source.clone()))
                    .collect(),
                context([("error", reasons)]),
            );
        }

        if loaded.is_empty() {
            tracing::warn!("no documents found to process");
            return Ok(stats);
        }

        timer.start("document splitting");
        let splitter = TextSplitter::new(
            self.settings.chunking.chunk_size,
            self.settings.chunking.chunk_overlap,
        );
        let chunks = splitter.split_documents(&loaded.documents);
        timer.end("document splitting");
        stats.chunks = chunks.len();
        self.progress.report(ProgressEvent::Split {
            documents: stats.documents,
            chunks: stats.chunks,
        });

        let batch_size = self.settings.embedding.batch_size.max(1);
        let total_batches = chunks.len().div_ceil(batch_size);
        if dry_run {
            tracing::info!(
                mode = mode.as_str(),
                "dry run: would process {} chunks in {} batches",
                chunks.len(),
                total_batches
            );
            return Ok(stats);
        }

        let collection_name = &self.settings.vector_store.collection;
        timer.start("collection setup");
        let collection = match mode {
            WriteMode::Replace => {
                let handle = self.store.recreate_collection(collection_name).await?;
                tracing::info!(collection = %collection_name, "collection cleared for replace");
                handle
            }
            WriteMode::Append => self.store.get_or_create_collection(collection_name).await?,
        };
        timer.end("collection setup");

        let ids = IdSequence::new(mode);
        let entries = ids.assign(chunks);

        timer.start("document processing");
        for (i, batch) in entries.chunks(batch_size).enumerate() {
            stats.batches += 1;
            if let Err(err) = self.write_batch(&collection, batch, recovery).await {
                if err.kind().is_fatal() {
                    return Err(err);
                }
                stats.failed_batches += 1;
            }
            self.progress.report(ProgressEvent::Batch {
                n: i + 1,
                total: total_batches,
                chunks: batch.len(),
            });
        }
        timer.end("document processing");

        if recovery.has_pending() {
            timer.start("recovery");
            let handler = PipelineRecovery {
                store: self.store,
                embedder: self.embedder,
                collection: &collection,
                splitter: &splitter,
                root: &knowledge.dir,
                ids: &ids,
            };
            let max_attempts = knowledge.recovery_attempts;
            while recovery.has_retryable() {
                let report = recovery
                    .attempt_recovery(max_attempts, &handler, self.analyzer)
                    .await;
                stats.recovered_items += report.items_recovered;
                stats.permanently_failed.extend(report.permanently_failed);
            }
            timer.end("recovery");
        }

        if !stats.permanently_failed.is_empty() {
            let failed = stats.permanently_failed.clone();
            let succeeded: Vec<String> = entries
                .iter()
                .map(|e| e.id.clone())
                .filter(|id| !failed.contains(id))
                .collect();
            let err = SyncError::PartialFailure {
                message: format!("{} update finished with unrecovered items", mode.as_str()),
                succeeded,
                failed,
            };
            self.analyzer.record(
                &err,
                context([("operation", format!("ingest.{}", mode.as_str()))]),
            );
            tracing::warn!("{}", err);
        }

        let final_count = self.store.count(&collection).await?;
        stats.final_count = Some(final_count);
        tracing::info!(
            chunks = stats.chunks,
            failed_batches = stats.failed_batches,
            recovered = stats.recovered_items,
            "final collection count: {}",
            final_count
        );
        Ok(stats)
    }

    /// Embed and insert one batch, registering it for recovery on failure.
    async fn write_batch(
        &self,
        collection: &CollectionHandle,
        batch: &[ChunkEntry],
        recovery: &mut RecoveryManager,
    ) -> Result<(), SyncError> {
        let texts: Vec<String> = batch.iter().map(|e| e.chunk.text.clone()).collect();
        let items = || -> Vec<FailedItem> { batch.iter().cloned().map(FailedItem::Chunk).collect() };
        let first_id = batch.first().map(|e| e.id.clone()).unwrap_or_default();

        let embeddings = match self.embedder.embed_batch(&texts).await {
            Ok(v) => v,
            Err(err) => {
                tracing::error!(first_id = %first_id, "embedding batch failed: {}", err);
                if !err.kind().is_fatal() {
                    recovery.record_failure(
                        OperationType::EmbeddingGeneration,
                        items(),
                        context([("error", err.to_string()), ("first_id", first_id)]),
                    );
                }
                return Err(err);
            }
        };

        let entry_batch = EntryBatch::from_entries(batch, embeddings)?;
        if let Err(err) = self.store.add(collection, &entry_batch).await {
            tracing::error!(first_id = %first_id, "insertion batch failed: {}", err);
            if !err.kind().is_fatal() {
                recovery.record_failure(
                    OperationType::VectorStoreInsertion,
                    items(),
                    context([("error", err.to_string()), ("first_id", first_id)]),
                );
            }
            return Err(err);
        }
        Ok(())
    }
}

/// Re-runs failed work against the live collection of the current run.
struct PipelineRecovery<'a> {
    store: &'a StoreClient,
    embedder: &'a EmbeddingClient,
    collection: &'a CollectionHandle,
    splitter: &'a TextSplitter,
    root: &'a Path,
    ids: &'a IdSequence,
}

impl PipelineRecovery<'_> {
    async fn insert(&self, entries: &[ChunkEntry]) -> Result<(), SyncError> {
        let texts: Vec<String> = entries.iter().map(|e| e.chunk.text.clone()).collect();
        let embeddings = self.embedder.embed_batch(&texts).await?;
        let batch = EntryBatch::from_entries(entries, embeddings)?;
        self.store.add(self.collection, &batch).await
    }
}

#[async_trait]
impl RecoveryHandler for PipelineRecovery<'_> {
    async fn retry_document(&self, source: &str) -> Result<(), SyncError> {
        let document = load_document(self.root, source)?;
        let entries = self
            .ids
            .assign(self.splitter.split_documents(std::slice::from_ref(&document)));
        if entries.is_empty() {
            return Ok(());
        }
        self.insert(&entries).await
    }

    async fn retry_embedding(&self, entries: &[ChunkEntry]) -> Result<(), SyncError> {
        self.insert(entries).await
    }

    async fn retry_insertion(&self, entry: &ChunkEntry) -> Result<(), SyncError> {
        self.insert(std::slice::from_ref(entry)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{AlertSink, ErrorRecord};
    use crate::embedding::HashEmbedder;
    use crate::progress::NoProgress;
    use crate::retry::RetryPolicy;
    use crate::store::memory::InMemoryStore;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct QuietSink;

    impl AlertSink for QuietSink {
        fn alert(&self, _record: &ErrorRecord, _recent_count: usize) {}
    }

    struct Fixture {
        _tmp: TempDir,
        settings: Settings,
        memory: Arc<InMemoryStore>,
        store: StoreClient,
        embedder: EmbeddingClient,
        analyzer: Arc<ErrorAnalyzer>,
    }

    fn fixture(files: &[(&str, String)]) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("kb");
        std::fs::create_dir_all(&dir).unwrap();
        for (name, body) in files {
            std::fs::write(dir.join(name), body).unwrap();
        }
        let mut settings = Settings::default();
        settings.knowledge.dir = dir;

        let analyzer = Arc::new(ErrorAnalyzer::with_sink(Arc::new(QuietSink)));
        let memory = Arc::new(InMemoryStore::new());
        let store = StoreClient::new(memory.clone(), analyzer.clone()).with_policies(
            RetryPolicy::store_connect().with_max_backoff(0.0),
            RetryPolicy::store_operations().with_max_backoff(0.0),
        );
        let embedder = EmbeddingClient::new(
            Arc::new(HashEmbedder::new("models/embedding-001", 768)),
            analyzer.clone(),
        )
        .with_policy(RetryPolicy::embedding().with_max_backoff(0.0));
        Fixture {
            _tmp: tmp,
            settings,
            memory,
            store,
            embedder,
            analyzer,
        }
    }

    impl Fixture {
        fn pipeline(&self) -> Pipeline<'_> {
            Pipeline {
                settings: &self.settings,
                store: &self.store,
                embedder: &self.embedder,
                analyzer: &self.analyzer,
                progress: &NoProgress,
            }
        }
    }

    fn words(n: usize) -> String {
        (0..n).map(|i| format!("crimp{} ", i)).collect()
    }

    #[tokio::test]
    async fn test_replace_writes_all_chunks_with_positional_ids() {
        let fx = fixture(&[("grip.txt", "a".repeat(600)), ("feet.txt", "Smear on slab.".into())]);
        let mut recovery = RecoveryManager::new();
        let mut timer = StageTimer::new();

        let stats = fx
            .pipeline()
            .run(WriteMode::Replace, false, &mut recovery, &mut timer)
            .await
            .unwrap();

        assert_eq!(stats.documents, 2);
        assert_eq!(stats.chunks, 3);
        assert_eq!(stats.final_count, Some(3));
        let coll = fx.store.get_collection("bouldering_advice").await.unwrap().unwrap();
        let dump = fx.store.get_all(&coll, false).await.unwrap();
        assert_eq!(dump.ids, vec!["doc_0", "doc_1", "doc_2"]);
    }

    #[tokio::test]
    async fn test_replace_twice_does_not_accumulate() {
        let fx = fixture(&[("grip.txt", words(300))]);
        let mut timer = StageTimer::new();
        let first = fx
            .pipeline()
            .run(WriteMode::Replace, false, &mut RecoveryManager::new(), &mut timer)
            .await
            .unwrap();
        let second = fx
            .pipeline()
            .run(WriteMode::Replace, false, &mut RecoveryManager::new(), &mut timer)
            .await
            .unwrap();
        assert_eq!(first.final_count, second.final_count);
    }

    #[tokio::test]
    async fn test_append_keeps_existing_entries() {
        let fx = fixture(&[("feet.txt", "Heel hook the arete.".into())]);
        let mut timer = StageTimer::new();
        fx.pipeline()
            .run(WriteMode::Replace, false, &mut RecoveryManager::new(), &mut timer)
            .await
            .unwrap();
        let stats = fx
            .pipeline()
            .run(WriteMode::Append, false, &mut RecoveryManager::new(), &mut timer)
            .await
            .unwrap();
        assert_eq!(stats.final_count, Some(2));
        assert_eq!(fx.memory.delete_calls(), 0);
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let fx = fixture(&[("grip.txt", words(300))]);
        let stats = fx
            .pipeline()
            .run(WriteMode::Replace, true, &mut RecoveryManager::new(), &mut StageTimer::new())
            .await
            .unwrap();
        assert!(stats.chunks > 0);
        assert_eq!(stats.final_count, None);
        assert_eq!(fx.memory.add_calls(), 0);
        assert!(fx.store.get_collection("bouldering_advice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_batch_is_recovered() {
        let mut fx = fixture(&[("grip.txt", words(400))]);
        fx.settings.embedding.batch_size = 2;
        fx.memory.fail_next_add(SyncError::StoreCapacity("full".into()));
        let mut recovery = RecoveryManager::new();
        let stats = fx
            .pipeline()
            .run(WriteMode::Replace, false, &mut recovery, &mut StageTimer::new())
            .await
            .unwrap();

        assert_eq!(stats.failed_batches, 1);
        assert_eq!(stats.recovered_items, 2);
        assert!(stats.permanently_failed.is_empty());
        assert_eq!(stats.final_count, Some(stats.chunks));
        assert_eq!(recovery.summary().recovered, 1);
    }

    #[tokio::test]
    async fn test_zero_recovery_attempts_surfaces_failed_batch() {
        let mut fx = fixture(&[("grip.txt", words(400))]);
        fx.settings.embedding.batch_size = 2;
        fx.settings.knowledge.recovery_attempts = 0;
        fx.memory.fail_next_add(SyncError::StoreCapacity("full".into()));
        let mut recovery = RecoveryManager::new();
        let stats = fx
            .pipeline()
            .run(WriteMode::Replace, false, &mut recovery, &mut StageTimer::new())
            .await
            .unwrap();

        assert_eq!(stats.failed_batches, 1);
        assert_eq!(stats.recovered_items, 0);
        assert_eq!(stats.permanently_failed, vec!["doc_0", "doc_1"]);
        assert_eq!(stats.final_count, Some(stats.chunks - 2));
        assert_eq!(fx.analyzer.summary().error_types["partial_failure"], 1);
    }

    #[tokio::test]
    async fn test_empty_directory_succeeds_without_writes() {
        let fx = fixture(&[]);
        let stats = fx
            .pipeline()
            .run(WriteMode::Replace, false, &mut RecoveryManager::new(), &mut StageTimer::new())
            .await
            .unwrap();
        assert_eq!(stats.documents, 0);
        assert_eq!(fx.memory.add_calls(), 0);
    }
}
