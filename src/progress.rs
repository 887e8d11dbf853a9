//! Stage timing and batch progress reporting.
//!
//! Runs report progress through tracing events so they land in both the
//! console and the rotated log file. [`StageTimer`] measures the named stages
//! of a run (collection setup, loading, splitting, processing) and logs a
//! summary at the end.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A single progress event emitted by the ingestion pipeline.
#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    /// Documents loaded and split; total chunks known.
    Split { documents: usize, chunks: usize },
    /// Batch `n` of `total` written.
    Batch { n: usize, total: usize, chunks: usize },
}

/// Receives progress events. Called from the ingest pipeline.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Emits progress as `info` events.
pub struct TracingProgress;

impl ProgressReporter for TracingProgress {
    fn report(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Split { documents, chunks } => {
                tracing::info!(
                    "split {} documents into {} chunks",
                    format_number(documents as u64),
                    format_number(chunks as u64)
                );
            }
            ProgressEvent::Batch { n, total, chunks } => {
                tracing::info!(batch = n, total, chunks, "processed batch {}/{}", n, total);
            }
        }
    }
}

/// No-op reporter.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Wall-clock durations of named stages, in the order they were started.
#[derive(Debug, Default)]
pub struct StageTimer {
    running: HashMap<String, Instant>,
    finished: Vec<(String, Duration)>,
}

impl StageTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, stage: &str) {
        tracing::debug!(stage, "stage started");
        self.running.insert(stage.to_string(), Instant::now());
    }

    /// Stop `stage` and return its duration. `None` if it was never started.
    pub fn end(&mut self, stage: &str) -> Option<Duration> {
        let started = self.running.remove(stage)?;
        let elapsed = started.elapsed();
        tracing::debug!(stage, elapsed_ms = elapsed.as_millis() as u64, "stage finished");
        self.finished.push((stage.to_string(), elapsed));
        Some(elapsed)
    }

    pub fn summary(&self) -> &[(String, Duration)] {
        &self.finished
    }

    pub fn log_summary(&self) {
        if self.finished.is_empty() {
            return;
        }
        tracing::info!("stage timings:");
        for (stage, elapsed) in &self.finished {
            tracing::info!("  {}: {:.3}s", stage, elapsed.as_secs_f64());
        }
    }
}

/// Digits grouped by thousands: `12345` -> `12,345`.
fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let lead = digits.len() % 3;
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, d) in digits.char_indices() {
        if i > 0 && (i + 3 - lead) % 3 == 0 {
            out.push(',');
        }
        out.push(d);
    }
    out
}
