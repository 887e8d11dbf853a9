//! End-to-end runs through the library against in-memory services.

use std::fs;
use std::sync::Arc;

use boulder_kb::analyzer::{AlertSink, ErrorAnalyzer, ErrorRecord};
use boulder_kb::backup::BackupManager;
use boulder_kb::chunk::TextSplitter;
use boulder_kb::config::Settings;
use boulder_kb::documents::load_documents;
use boulder_kb::embedding::{EmbeddingClient, HashEmbedder};
use boulder_kb::retry::RetryPolicy;
use boulder_kb::runner::{Mode, RunContext, RunOptions, Services};
use boulder_kb::store::memory::InMemoryStore;
use boulder_kb::store::StoreClient;
use tempfile::TempDir;

struct QuietSink;

impl AlertSink for QuietSink {
    fn alert(&self, _record: &ErrorRecord, _recent_count: usize) {}
}

struct Harness {
    tmp: TempDir,
    memory: Arc<InMemoryStore>,
    analyzer: Arc<ErrorAnalyzer>,
    services: Services,
}

impl Harness {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("kb")).unwrap();
        let analyzer = Arc::new(ErrorAnalyzer::with_sink(Arc::new(QuietSink)));
        let memory = Arc::new(InMemoryStore::new());
        let services = Services {
            store: StoreClient::new(memory.clone(), analyzer.clone()).with_policies(
                RetryPolicy::store_connect().with_max_backoff(0.0),
                RetryPolicy::store_operations().with_max_backoff(0.0),
            ),
            embedder: EmbeddingClient::new(
                Arc::new(HashEmbedder::new("models/embedding-001", 768)),
                analyzer.clone(),
            )
            .with_policy(RetryPolicy::embedding().with_max_backoff(0.0)),
        };
        Self {
            tmp,
            memory,
            analyzer,
            services,
        }
    }

    fn settings(&self) -> Settings {
        let mut settings = Settings::default();
        settings.knowledge.dir = self.tmp.path().join("kb");
        settings.knowledge.lock_path = self.tmp.path().join("kbsync.lock");
        settings.knowledge.metadata_path = self.tmp.path().join("metadata.json");
        settings.knowledge.backup_dir = self.tmp.path().join("backups");
        settings
    }

    fn write(&self, name: &str, body: &str) {
        fs::write(self.tmp.path().join("kb").join(name), body).unwrap();
    }

    fn context(&self, mode: Mode) -> RunContext {
        RunContext::new(
            self.settings(),
            RunOptions {
                mode,
                dry_run: false,
                mock_services: true,
            },
        )
        .with_analyzer(self.analyzer.clone())
    }
}

#[test]
fn test_600_char_file_splits_into_two_overlapping_chunks() {
    let h = Harness::new();
    let body: String = (0..600).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
    h.write("grip.txt", &body);

    let loaded = load_documents(&h.tmp.path().join("kb"), &["**/*.txt".to_string()]).unwrap();
    let chunks = TextSplitter::new(500, 50).split_documents(&loaded.documents);

    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].text, body[..500]);
    assert_eq!(chunks[1].text, body[450..]);
    assert!(chunks.iter().all(|c| c.source == "grip.txt"));
    assert_eq!(chunks[1].index, 1);
}

#[tokio::test]
async fn test_backup_of_large_collection_omits_embeddings() {
    let h = Harness::new();
    for i in 0..10 {
        h.write(&format!("note{:02}.txt", i), &format!("Problem {} beta: drop knee then match.", i));
    }
    let mut ctx = h.context(Mode::Replace);
    let report = ctx.run_with(&h.services).await.unwrap();
    assert_eq!(report.ingest.unwrap().final_count, Some(10));

    let mut settings = h.settings();
    settings.knowledge.backup_embedding_limit = 5;
    let mut ctx = RunContext::new(
        settings,
        RunOptions {
            mode: Mode::Backup,
            dry_run: false,
            mock_services: true,
        },
    )
    .with_analyzer(h.analyzer.clone());
    let report = ctx.run_with(&h.services).await.unwrap();
    assert!(report.success);

    let archive = BackupManager::load(&report.backup_path.unwrap()).unwrap();
    assert_eq!(archive.collection_name, "bouldering_advice");
    assert_eq!(archive.total_documents, 10);
    assert_eq!(archive.data.ids.len(), 10);
    assert_eq!(archive.data.documents.len(), 10);
    assert_eq!(archive.data.metadatas.len(), 10);
    assert!(archive.data.embeddings.is_empty());
}

#[tokio::test]
async fn test_incremental_without_changes_writes_nothing() {
    let h = Harness::new();
    h.write("grip.txt", "Thumb catch on pinches.");
    h.write("feet.txt", "Toe hook the roof lip.");

    let first = h.context(Mode::Incremental).run_with(&h.services).await.unwrap();
    assert_eq!(first.changes.len(), 2);
    let adds = h.memory.add_calls();
    let deletes = h.memory.delete_calls();
    assert!(adds > 0);

    let second = h.context(Mode::Incremental).run_with(&h.services).await.unwrap();
    assert!(second.success);
    assert!(second.changes.is_empty());
    assert!(second.ingest.is_none());
    assert_eq!(h.memory.add_calls(), adds);
    assert_eq!(h.memory.delete_calls(), deletes);
}

#[tokio::test]
async fn test_incremental_modified_file_triggers_replace() {
    let h = Harness::new();
    h.write("grip.txt", "Thumb catch on pinches.");
    h.context(Mode::Incremental).run_with(&h.services).await.unwrap();

    h.write("grip.txt", "Thumb catch on pinches, squeeze with the heel of the hand.");
    let report = h.context(Mode::Incremental).run_with(&h.services).await.unwrap();
    assert_eq!(report.changes.len(), 1);
    assert_eq!(report.ingest.unwrap().final_count, Some(1));
    assert_eq!(h.memory.delete_calls(), 1);
}

#[tokio::test]
async fn test_mock_test_then_query_through_retrieval() {
    let h = Harness::new();
    h.write("movement.txt", "Basic climbing movement starts from the hips.");
    let report = h.context(Mode::MockTest).run_with(&h.services).await.unwrap();
    assert_eq!(report.mock_count, Some(1));

    let hits = boulder_kb::retrieval::similarity_query(
        &h.services.store,
        &h.services.embedder,
        "bouldering_advice",
        "Basic climbing movement starts from the hips.",
        3,
    )
    .await
    .unwrap();
    assert_eq!(hits[0].id, "mock_doc_0");
    assert!(hits[0].relevance_score > 0.99);
}
