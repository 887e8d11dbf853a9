//! Bounded re-processing of partially failed batches.
//!
//! When a batch operation gives up after its retries, the failed items are
//! registered with the [`RecoveryManager`] under an [`OperationType`]. A later
//! call to [`RecoveryManager::attempt_recovery`] re-runs them through a
//! [`RecoveryHandler`] with a strategy chosen by operation type:
//!
//! | Operation | Strategy |
//! |-----------|----------|
//! | document processing | each document individually |
//! | embedding generation | sub-batches of `max(1, len / 4)` |
//! | vector-store insertion | each entry individually |
//!
//! Records are never removed. Items that succeed leave their record even when
//! a later item in the same pass hits a fatal error. A record is marked
//! recovered once no items remain; otherwise the retry count grows until the
//! cap, and the record's items are reported as permanently failed exactly
//! once, in the call where it becomes exhausted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::analyzer::{context, ErrorAnalyzer, ErrorContext};
use crate::error::SyncError;
use crate::models::ChunkEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    DocumentProcessing,
    EmbeddingGeneration,
    VectorStoreInsertion,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::DocumentProcessing => "document_processing",
            OperationType::EmbeddingGeneration => "embedding_generation",
            OperationType::VectorStoreInsertion => "vector_store_insertion",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum FailedItem {
    /// A source file, relative to the knowledge directory.
    Document(String),
    Chunk(ChunkEntry),
}

impl FailedItem {
    pub fn label(&self) -> String {
        match self {
            FailedItem::Document(source) => source.clone(),
            FailedItem::Chunk(entry) => entry.id.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub operation: OperationType,
    /// Items still pending. Shrinks as partial recoveries succeed.
    pub items: Vec<FailedItem>,
    pub context: ErrorContext,
    pub retry_count: u32,
    pub recovered: bool,
    /// Out of attempts; already reported as permanently failed.
    pub exhausted: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Re-runs individual pieces of work against the live services.
#[async_trait]
pub trait RecoveryHandler: Send + Sync {
    /// Re-read, split, embed and insert one source document.
    async fn retry_document(&self, source: &str) -> Result<(), SyncError>;
    /// Embed and insert a sub-batch of chunks.
    async fn retry_embedding(&self, entries: &[ChunkEntry]) -> Result<(), SyncError>;
    /// Embed and insert a single chunk.
    async fn retry_insertion(&self, entry: &ChunkEntry) -> Result<(), SyncError>;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    /// Records a strategy ran for in this call.
    pub attempted: usize,
    pub records_recovered: usize,
    pub items_recovered: usize,
    /// Labels of items whose record ran out of attempts during this call.
    pub permanently_failed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoverySummary {
    pub total_failures: usize,
    pub recovered: usize,
    pub pending: usize,
    pub recovery_rate: f64,
}

#[derive(Debug, Default)]
pub struct RecoveryManager {
    records: Vec<FailureRecord>,
}

impl RecoveryManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_failure(
        &mut self,
        operation: OperationType,
        items: Vec<FailedItem>,
        context: ErrorContext,
    ) {
        tracing::warn!(
            operation = operation.as_str(),
            items = items.len(),
            "recorded partial failure for recovery"
        );
        self.records.push(FailureRecord {
            operation,
            items,
            context,
            retry_count: 0,
            recovered: false,
            exhausted: false,
            recorded_at: Utc::now(),
        });
    }

    pub fn records(&self) -> &[FailureRecord] {
        &self.records
    }

    pub fn has_pending(&self) -> bool {
        self.records.iter().any(|r| !r.recovered)
    }

    /// Whether another [`attempt_recovery`](Self::attempt_recovery) call has work to do.
    pub fn has_retryable(&self) -> bool {
        self.records.iter().any(|r| !r.recovered && !r.exhausted)
    }

    pub async fn attempt_recovery(
        &mut self,
        max_attempts: u32,
        handler: &dyn RecoveryHandler,
        analyzer: &ErrorAnalyzer,
    ) -> RecoveryReport {
        let mut report = RecoveryReport::default();

        for (idx, record) in self.records.iter_mut().enumerate() {
            if record.recovered || record.exhausted {
                continue;
            }
            if record.retry_count < max_attempts {
                report.attempted += 1;
                let outcome = match record.operation {
                    OperationType::DocumentProcessing => {
                        retry_documents(&record.items, handler).await
                    }
                    OperationType::EmbeddingGeneration => {
                        retry_embedding_batches(&record.items, handler).await
                    }
                    OperationType::VectorStoreInsertion => {
                        retry_insertions(&record.items, handler).await
                    }
                };

                report.items_recovered += outcome.recovered.len();
                let mut position = 0;
                record.items.retain(|_| {
                    let keep = !outcome.recovered.contains(&position);
                    position += 1;
                    keep
                });

                if let Some(err) = outcome.fatal {
                    record.retry_count += 1;
                    analyzer.record(
                        &err,
                        context([
                            ("recovery_operation", record.operation.as_str().to_string()),
                            ("retry_count", record.retry_count.to_string()),
                        ]),
                    );
                    tracing::error!(
                        record = idx,
                        operation = record.operation.as_str(),
                        recovered = outcome.recovered.len(),
                        still_failing = record.items.len(),
                        "recovery strategy failed: {}",
                        err
                    );
                } else if record.items.is_empty() {
                    report.records_recovered += 1;
                    record.recovered = true;
                    tracing::info!(
                        record = idx,
                        operation = record.operation.as_str(),
                        items = outcome.recovered.len(),
                        "failure record fully recovered"
                    );
                    continue;
                } else {
                    record.retry_count += 1;
                    tracing::warn!(
                        record = idx,
                        operation = record.operation.as_str(),
                        recovered = outcome.recovered.len(),
                        still_failing = record.items.len(),
                        retry_count = record.retry_count,
                        "partial recovery"
                    );
                }
            }

            if record.retry_count >= max_attempts {
                record.exhausted = true;
                report
                    .permanently_failed
                    .extend(record.items.iter().map(FailedItem::label));
            }
        }

        report
    }

    pub fn summary(&self) -> RecoverySummary {
        let total = self.records.len();
        let recovered = self.records.iter().filter(|r| r.recovered).count();
        RecoverySummary {
            total_failures: total,
            recovered,
            pending: total - recovered,
            recovery_rate: if total == 0 {
                0.0
            } else {
                recovered as f64 / total as f64
            },
        }
    }
}

/// Positions that succeeded in one strategy pass, plus the fatal error that
/// cut the pass short, if any.
#[derive(Debug, Default)]
struct StrategyOutcome {
    recovered: Vec<usize>,
    fatal: Option<SyncError>,
}

/// Per-item result: `Err` for fatal errors, which end the pass.
fn settle(result: Result<(), SyncError>, label: &str) -> Result<bool, SyncError> {
    match result {
        Ok(()) => Ok(true),
        Err(err) if err.kind().is_fatal() => Err(err),
        Err(err) => {
            tracing::warn!(item = label, "recovery attempt failed: {}", err);
            Ok(false)
        }
    }
}

async fn retry_documents(items: &[FailedItem], handler: &dyn RecoveryHandler) -> StrategyOutcome {
    let mut outcome = StrategyOutcome::default();
    for (i, item) in items.iter().enumerate() {
        if let FailedItem::Document(source) = item {
            match settle(handler.retry_document(source).await, source) {
                Ok(true) => outcome.recovered.push(i),
                Ok(false) => {}
                Err(err) => {
                    outcome.fatal = Some(err);
                    break;
                }
            }
        }
    }
    outcome
}

async fn retry_embedding_batches(
    items: &[FailedItem],
    handler: &dyn RecoveryHandler,
) -> StrategyOutcome {
    let size = (items.len() / 4).max(1);
    let mut outcome = StrategyOutcome::default();

    for (batch_no, window) in items.chunks(size).enumerate() {
        let start = batch_no * size;
        let entries: Vec<ChunkEntry> = window
            .iter()
            .filter_map(|item| match item {
                FailedItem::Chunk(entry) => Some(entry.clone()),
                FailedItem::Document(_) => None,
            })
            .collect();
        if entries.len() != window.len() {
            continue;
        }
        let label = format!("sub-batch {}", batch_no);
        match settle(handler.retry_embedding(&entries).await, &label) {
            Ok(true) => outcome.recovered.extend(start..start + window.len()),
            Ok(false) => {}
            Err(err) => {
                outcome.fatal = Some(err);
                break;
            }
        }
    }
    outcome
}

async fn retry_insertions(items: &[FailedItem], handler: &dyn RecoveryHandler) -> StrategyOutcome {
    let mut outcome = StrategyOutcome::default();
    for (i, item) in items.iter().enumerate() {
        if let FailedItem::Chunk(entry) = item {
            match settle(handler.retry_insertion(entry).await, &entry.id) {
                Ok(true) => outcome.recovered.push(i),
                Ok(false) => {}
                Err(err) => {
                    outcome.fatal = Some(err);
                    break;
                }
            }
        }
    }
    outcome
}
