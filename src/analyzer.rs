//! Error trend analysis and alerting.
//!
//! The [`ErrorAnalyzer`] is constructed once per run and shared (behind an
//! `Arc`) with every component that can observe failures. It keeps the full
//! in-process error history, a per-kind [`ErrorPattern`] with a rolling
//! 24-hour occurrence window, and forwards alert-worthy records to an
//! [`AlertSink`].
//!
//! # Alert rules
//!
//! | Condition | Alert |
//! |-----------|-------|
//! | severity is CRITICAL | always |
//! | `store_connection` / `network`, ≥ 3 in 24h | yes |
//! | `embedding_quota`, ≥ 5 in 24h | yes |
//! | `store_timeout`, ≥ 10 in 24h | yes |
//! | anything else | never |

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::error::{ErrorKind, SyncError};

/// Free-form key/value context attached to a recorded error.
pub type ErrorContext = BTreeMap<String, String>;

/// Build an [`ErrorContext`] from string pairs.
pub fn context<K, V, I>(pairs: I) -> ErrorContext
where
    K: Into<String>,
    V: Into<String>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "CRITICAL",
            Severity::High => "HIGH",
            Severity::Medium => "MEDIUM",
            Severity::Low => "LOW",
        }
    }
}

pub fn classify_severity(kind: ErrorKind) -> Severity {
    match kind {
        ErrorKind::EmbeddingAuth | ErrorKind::Configuration => Severity::Critical,
        ErrorKind::StoreConnection | ErrorKind::EmbeddingQuota => Severity::High,
        ErrorKind::StoreTimeout | ErrorKind::EmbeddingRateLimit => Severity::Medium,
        _ => Severity::Low,
    }
}

/// 24-hour occurrence count at which a kind starts alerting.
pub fn alert_threshold(kind: ErrorKind) -> Option<usize> {
    match kind {
        ErrorKind::StoreConnection | ErrorKind::Network => Some(3),
        ErrorKind::EmbeddingQuota => Some(5),
        ErrorKind::StoreTimeout => Some(10),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: ErrorKind,
    pub message: String,
    pub context: ErrorContext,
    pub severity: Severity,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorPattern {
    pub count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Occurrence timestamps inside the trailing 24-hour window.
    pub recent: Vec<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorSummary {
    pub total_errors: usize,
    pub error_types: BTreeMap<String, usize>,
    pub severity_distribution: BTreeMap<String, usize>,
}

/// Receiver for alert-worthy error records.
///
/// The default [`LogAlertSink`] only emits a log event; a notification
/// channel (chat webhook, pager) plugs in here.
pub trait AlertSink: Send + Sync {
    fn alert(&self, record: &ErrorRecord, recent_count: usize);
}

pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn alert(&self, record: &ErrorRecord, recent_count: usize) {
        tracing::error!(
            severity = record.severity.as_str(),
            kind = %record.kind,
            recent_24h = recent_count,
            context = ?record.context,
            "ALERT: {}",
            record.message
        );
    }
}

#[derive(Default)]
struct AnalyzerState {
    history: Vec<ErrorRecord>,
    patterns: HashMap<ErrorKind, ErrorPattern>,
}

pub struct ErrorAnalyzer {
    state: Mutex<AnalyzerState>,
    sink: Arc<dyn AlertSink>,
}

impl Default for ErrorAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorAnalyzer {
    pub fn new() -> Self {
        Self::with_sink(Arc::new(LogAlertSink))
    }

    pub fn with_sink(sink: Arc<dyn AlertSink>) -> Self {
        Self {
            state: Mutex::new(AnalyzerState::default()),
            sink,
        }
    }

    /// Record a classified failure. Returns `true` when an alert fired.
    pub fn record(&self, error: &SyncError, context: ErrorContext) -> bool {
        self.record_at(error, context, Utc::now())
    }

    /// Like [`record`](Self::record) with an explicit observation time.
    pub fn record_at(&self, error: &SyncError, context: ErrorContext, now: DateTime<Utc>) -> bool {
        let kind = error.kind();
        let record = ErrorRecord {
            timestamp: now,
            kind,
            message: error.to_string(),
            context,
            severity: classify_severity(kind),
        };

        let (count, recent_count) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let pattern = state.patterns.entry(kind).or_insert_with(|| ErrorPattern {
                count: 0,
                first_seen: now,
                last_seen: now,
                recent: Vec::new(),
            });
            pattern.count += 1;
            pattern.last_seen = now;
            pattern.recent.push(now);
            let cutoff = now - Duration::hours(24);
            pattern.recent.retain(|ts| *ts > cutoff);
            let counts = (pattern.count, pattern.recent.len());
            state.history.push(record.clone());
            counts
        };

        tracing::info!(
            kind = %kind,
            total = count,
            recent_24h = recent_count,
            severity = record.severity.as_str(),
            "error recorded"
        );

        let alert = record.severity == Severity::Critical
            || alert_threshold(kind).is_some_and(|threshold| recent_count >= threshold);
        if alert {
            self.sink.alert(&record, recent_count);
        }
        alert
    }

    pub fn pattern(&self, kind: ErrorKind) -> Option<ErrorPattern> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.patterns.get(&kind).cloned()
    }

    pub fn history(&self) -> Vec<ErrorRecord> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.history.clone()
    }

    pub fn summary(&self) -> ErrorSummary {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut error_types = BTreeMap::new();
        let mut severity_distribution: BTreeMap<String, usize> = [
            Severity::Critical,
            Severity::High,
            Severity::Medium,
            Severity::Low,
        ]
        .iter()
        .map(|s| (s.as_str().to_string(), 0))
        .collect();

        for record in &state.history {
            *error_types.entry(record.kind.as_str().to_string()).or_insert(0) += 1;
            *severity_distribution
                .entry(record.severity.as_str().to_string())
                .or_insert(0) += 1;
        }

        ErrorSummary {
            total_errors: state.history.len(),
            error_types,
            severity_distribution,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        alerts: Mutex<Vec<(ErrorKind, usize)>>,
    }

    impl AlertSink for RecordingSink {
        fn alert(&self, record: &ErrorRecord, recent_count: usize) {
            self.alerts.lock().unwrap().push((record.kind, recent_count));
        }
    }

    #[test]
    fn severity_table() {
        assert_eq!(classify_severity(ErrorKind::EmbeddingAuth), Severity::Critical);
        assert_eq!(classify_severity(ErrorKind::Configuration), Severity::Critical);
        assert_eq!(classify_severity(ErrorKind::StoreConnection), Severity::High);
        assert_eq!(classify_severity(ErrorKind::EmbeddingQuota), Severity::High);
        assert_eq!(classify_severity(ErrorKind::StoreTimeout), Severity::Medium);
        assert_eq!(classify_severity(ErrorKind::EmbeddingRateLimit), Severity::Medium);
        assert_eq!(classify_severity(ErrorKind::Network), Severity::Low);
    }

    #[test]
    fn critical_always_alerts() {
        let sink = Arc::new(RecordingSink::default());
        let analyzer = ErrorAnalyzer::with_sink(sink.clone());
        assert!(analyzer.record(&SyncError::EmbeddingAuth("bad key".into()), ErrorContext::new()));
        assert_eq!(sink.alerts.lock().unwrap().len(), 1);
    }

    #[test]
    fn connection_alerts_from_third_occurrence() {
        let sink = Arc::new(RecordingSink::default());
        let analyzer = ErrorAnalyzer::with_sink(sink.clone());
        let err = SyncError::StoreConnection("refused".into());
        assert!(!analyzer.record(&err, ErrorContext::new()));
        assert!(!analyzer.record(&err, ErrorContext::new()));
        assert!(analyzer.record(&err, ErrorContext::new()));
        assert_eq!(
            *sink.alerts.lock().unwrap(),
            vec![(ErrorKind::StoreConnection, 3)]
        );
    }

    #[test]
    fn old_occurrences_leave_the_window() {
        let analyzer = ErrorAnalyzer::with_sink(Arc::new(RecordingSink::default()));
        let err = SyncError::Network("reset".into());
        let now = Utc::now();
        analyzer.record_at(&err, ErrorContext::new(), now - Duration::hours(30));
        analyzer.record_at(&err, ErrorContext::new(), now - Duration::hours(26));
        let alerted = analyzer.record_at(&err, ErrorContext::new(), now);
        assert!(!alerted);

        let pattern = analyzer.pattern(ErrorKind::Network).unwrap();
        assert_eq!(pattern.count, 3);
        assert_eq!(pattern.recent.len(), 1);
    }

    #[test]
    fn unthresholded_kinds_never_alert() {
        let analyzer = ErrorAnalyzer::with_sink(Arc::new(RecordingSink::default()));
        let err = SyncError::FileProcessing("unreadable".into());
        for _ in 0..20 {
            assert!(!analyzer.record(&err, ErrorContext::new()));
        }
    }

    #[test]
    fn summary_counts() {
        let analyzer = ErrorAnalyzer::with_sink(Arc::new(RecordingSink::default()));
        analyzer.record(&SyncError::StoreTimeout("t".into()), context([("op", "add")]));
        analyzer.record(&SyncError::StoreTimeout("t".into()), ErrorContext::new());
        analyzer.record(&SyncError::Configuration("c".into()), ErrorContext::new());

        let summary = analyzer.summary();
        assert_eq!(summary.total_errors, 3);
        assert_eq!(summary.error_types["store_timeout"], 2);
        assert_eq!(summary.severity_distribution["MEDIUM"], 2);
        assert_eq!(summary.severity_distribution["CRITICAL"], 1);
        assert_eq!(summary.severity_distribution["LOW"], 0);
        assert_eq!(analyzer.history()[0].context["op"], "add");
    }
}
