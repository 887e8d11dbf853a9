//! Run orchestration: one terminal mode per invocation.
//!
//! | Mode | Lock | Network | Effect |
//! |------|------|---------|--------|
//! | `config-test` | no | no | validate settings, count eligible files |
//! | `mock-test` | yes | no | first chunks through in-memory services, then a query |
//! | `verify` | yes | yes | health report |
//! | `backup` | yes | yes | JSON snapshot of the collection |
//! | `incremental` | yes | yes | change detection; any change runs `replace` |
//! | `replace` / `append` | yes | yes | full update |
//!
//! `--dry-run` keeps every mode away from store mutations. Errors flow
//! through the shared [`ErrorAnalyzer`]; its summary and the recovery
//! summary are logged when the run ends, whatever the outcome.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::analyzer::{context, ErrorAnalyzer};
use crate::backup::BackupManager;
use crate::changes::{ChangeDetector, ChangeRecord};
use crate::chunk::TextSplitter;
use crate::config::Settings;
use crate::documents::{eligible_files, load_documents};
use crate::embedding::{create_provider, EmbeddingClient};
use crate::error::SyncError;
use crate::health::{self, HealthReport};
use crate::ingest::{IngestStats, Pipeline, WriteMode};
use crate::lock::RunLock;
use crate::models::EntryBatch;
use crate::progress::{StageTimer, TracingProgress};
use crate::recovery::RecoveryManager;
use crate::retrieval::similarity_query;
use crate::store::{create_store, StoreClient};

/// Chunks pushed through the in-memory services by `mock-test`.
const MOCK_CHUNK_LIMIT: usize = 20;
const MOCK_BATCH_SIZE: usize = 10;
const MOCK_QUERY: &str = "basic climbing movement";

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    Replace,
    Append,
    Verify,
    Incremental,
    Backup,
    ConfigTest,
    MockTest,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Replace => "replace",
            Mode::Append => "append",
            Mode::Verify => "verify",
            Mode::Incremental => "incremental",
            Mode::Backup => "backup",
            Mode::ConfigTest => "config-test",
            Mode::MockTest => "mock-test",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub mode: Mode,
    pub dry_run: bool,
    /// Substitute in-memory stand-ins for the store and embedding API.
    pub mock_services: bool,
}

/// Store and embedding clients for one run, sharing the run's analyzer.
pub struct Services {
    pub store: StoreClient,
    pub embedder: EmbeddingClient,
}

impl Services {
    pub fn from_settings(
        settings: &Settings,
        analyzer: Arc<ErrorAnalyzer>,
        mock: bool,
    ) -> Result<Self, SyncError> {
        let store = StoreClient::new(create_store(&settings.vector_store, mock)?, analyzer.clone());
        let embedder = EmbeddingClient::new(create_provider(&settings.embedding, mock)?, analyzer);
        Ok(Self { store, embedder })
    }
}

/// What a run did. `success` drives the process exit code.
#[derive(Debug, Default)]
pub struct RunReport {
    pub success: bool,
    pub eligible_files: Option<usize>,
    pub changes: Vec<ChangeRecord>,
    pub ingest: Option<IngestStats>,
    pub health: Option<HealthReport>,
    pub backup_path: Option<PathBuf>,
    pub mock_count: Option<usize>,
}

impl RunReport {
    fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }
}

/// Per-run state: settings, options and the collaborators every step shares.
pub struct RunContext {
    pub settings: Settings,
    pub options: RunOptions,
    pub analyzer: Arc<ErrorAnalyzer>,
    pub recovery: RecoveryManager,
    pub timer: StageTimer,
}

impl RunContext {
    pub fn new(settings: Settings, options: RunOptions) -> Self {
        Self {
            settings,
            options,
            analyzer: Arc::new(ErrorAnalyzer::new()),
            recovery: RecoveryManager::new(),
            timer: StageTimer::new(),
        }
    }

    pub fn with_analyzer(mut self, analyzer: Arc<ErrorAnalyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    fn uses_mock(&self) -> bool {
        self.options.mock_services || self.options.mode == Mode::MockTest
    }

    /// Validate, build services from the settings, and run the selected mode.
    pub async fn run(&mut self) -> Result<RunReport, SyncError> {
        self.prepare()?;
        if self.options.mode == Mode::ConfigTest {
            return self.config_test();
        }
        let services = Services::from_settings(&self.settings, self.analyzer.clone(), self.uses_mock())?;
        let result = self.dispatch(&services).await;
        self.finish(result)
    }

    /// Like [`run`](Self::run) with caller-supplied services.
    pub async fn run_with(&mut self, services: &Services) -> Result<RunReport, SyncError> {
        self.prepare()?;
        if self.options.mode == Mode::ConfigTest {
            return self.config_test();
        }
        let result = self.dispatch(services).await;
        self.finish(result)
    }

    fn prepare(&self) -> Result<(), SyncError> {
        tracing::info!(
            mode = self.options.mode.as_str(),
            dry_run = self.options.dry_run,
            mock = self.uses_mock(),
            "starting run"
        );
        let remote = !self.uses_mock();
        if let Err(err) = self.settings.validate(remote) {
            self.analyzer
                .record(&err, context([("operation", "config.validate")]));
            return Err(err);
        }
        self.settings.log_summary();
        Ok(())
    }

    fn config_test(&self) -> Result<RunReport, SyncError> {
        let knowledge = &self.settings.knowledge;
        let files = eligible_files(&knowledge.dir, &knowledge.include_globs)?;
        tracing::info!(count = files.len(), "knowledge files found");
        for file in &files {
            tracing::info!("  - {}", file.relative);
        }
        tracing::info!("configuration test passed");
        Ok(RunReport {
            eligible_files: Some(files.len()),
            ..RunReport::ok()
        })
    }

    fn finish(&self, result: Result<RunReport, SyncError>) -> Result<RunReport, SyncError> {
        self.timer.log_summary();

        let errors = self.analyzer.summary();
        if errors.total_errors > 0 {
            tracing::info!(
                total = errors.total_errors,
                types = ?errors.error_types,
                severity = ?errors.severity_distribution,
                "error summary"
            );
        }
        let recovery = self.recovery.summary();
        if recovery.total_failures > 0 {
            tracing::info!(
                total = recovery.total_failures,
                recovered = recovery.recovered,
                pending = recovery.pending,
                rate = recovery.recovery_rate,
                "recovery summary"
            );
        }

        if let Err(err) = &result {
            tracing::error!(mode = self.options.mode.as_str(), "run failed: {}", err);
        }
        result
    }

    async fn dispatch(&mut self, services: &Services) -> Result<RunReport, SyncError> {
        let lock = RunLock::acquire(&self.settings.knowledge.lock_path).map_err(|err| {
            self.analyzer.record(&err, context([("operation", "lock.acquire")]));
            err
        })?;

        self.timer.start("connect");
        services.store.connect().await?;
        self.timer.end("connect");

        let report = match self.options.mode {
            Mode::ConfigTest => self.config_test(),
            Mode::MockTest => self.mock_test(services).await,
            Mode::Verify => self.verify(services).await,
            Mode::Backup => self.backup(services).await,
            Mode::Incremental => self.incremental(services).await,
            Mode::Replace => self.full_update(services, WriteMode::Replace).await,
            Mode::Append => self.full_update(services, WriteMode::Append).await,
        };

        lock.release();
        report
    }

    async fn verify(&mut self, services: &Services) -> Result<RunReport, SyncError> {
        let report = health::check(
            &services.store,
            &services.embedder,
            &self.settings.vector_store.collection,
        )
        .await;
        Ok(RunReport {
            success: report.healthy,
            health: Some(report),
            ..RunReport::default()
        })
    }

    async fn backup(&mut self, services: &Services) -> Result<RunReport, SyncError> {
        let knowledge = &self.settings.knowledge;
        let manager = BackupManager::new(&knowledge.backup_dir, knowledge.backup_embedding_limit);
        self.timer.start("backup");
        let path = manager
            .create(
                &services.store,
                &self.settings.vector_store.collection,
                services.embedder.model_name(),
            )
            .await?;
        self.timer.end("backup");
        Ok(RunReport {
            backup_path: Some(path),
            ..RunReport::ok()
        })
    }

    async fn incremental(&mut self, services: &Services) -> Result<RunReport, SyncError> {
        let knowledge = &self.settings.knowledge;
        let detector = ChangeDetector::new(
            &knowledge.dir,
            &knowledge.include_globs,
            &knowledge.metadata_path,
        );
        self.timer.start("change detection");
        let changes = if self.options.dry_run {
            detector.preview()?
        } else {
            detector.detect()?
        };
        self.timer.end("change detection");

        if changes.is_empty() {
            tracing::info!("no file changes detected, nothing to update");
            return Ok(RunReport::ok());
        }
        for change in &changes {
            tracing::info!(kind = ?change.kind, "changed: {}", change.filename);
        }

        // Any change rebuilds the whole collection.
        let mut report = self.full_update(services, WriteMode::Replace).await?;
        report.changes = changes;
        Ok(report)
    }

    async fn full_update(&mut self, services: &Services, mode: WriteMode) -> Result<RunReport, SyncError> {
        if !self.options.dry_run {
            self.timer.start("embedding self-test");
            services.embedder.initialize().await?;
            self.timer.end("embedding self-test");
        }
        let pipeline = Pipeline {
            settings: &self.settings,
            store: &services.store,
            embedder: &services.embedder,
            analyzer: &*self.analyzer,
            progress: &TracingProgress,
        };
        let stats = pipeline
            .run(mode, self.options.dry_run, &mut self.recovery, &mut self.timer)
            .await?;
        Ok(RunReport {
            ingest: Some(stats),
            ..RunReport::ok()
        })
    }

    async fn mock_test(&mut self, services: &Services) -> Result<RunReport, SyncError> {
        let collection_name = &self.settings.vector_store.collection;
        let knowledge = &self.settings.knowledge;

        let loaded = load_documents(&knowledge.dir, &knowledge.include_globs)?;
        if loaded.is_empty() {
            tracing::warn!("no documents found to process");
            return Ok(RunReport::ok());
        }
        let splitter = TextSplitter::new(
            self.settings.chunking.chunk_size,
            self.settings.chunking.chunk_overlap,
        );
        let chunks = splitter.split_documents(&loaded.documents);
        if self.options.dry_run {
            tracing::info!("dry run: would process {} chunks in mock mode", chunks.len());
            return Ok(RunReport::ok());
        }

        let collection = services.store.get_or_create_collection(collection_name).await?;
        let sample = &chunks[..chunks.len().min(MOCK_CHUNK_LIMIT)];
        for (i, batch) in sample.chunks(MOCK_BATCH_SIZE).enumerate() {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let embeddings = services.embedder.embed_batch(&texts).await?;
            let entries = EntryBatch::new(
                (0..batch.len())
                    .map(|j| format!("mock_doc_{}", i * MOCK_BATCH_SIZE + j))
                    .collect(),
                texts,
                batch.iter().map(|c| c.metadata()).collect(),
                embeddings,
            )?;
            services.store.add(&collection, &entries).await?;
            tracing::info!(batch = i + 1, "mock batch processed");
        }

        let hits = similarity_query(
            &services.store,
            &services.embedder,
            collection_name,
            MOCK_QUERY,
            self.settings.retrieval.k,
        )
        .await?;
        tracing::info!(results = hits.len(), "mock query completed");

        let count = services.store.count(&collection).await?;
        tracing::info!(count, "mock test completed");
        Ok(RunReport {
            mock_count: Some(count),
            ..RunReport::ok()
        })
    }
}
