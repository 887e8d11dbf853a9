//! Error taxonomy for the sync pipeline.
//!
//! Every failure the pipeline can observe is a [`SyncError`]. Each variant
//! carries an [`ErrorKind`] tag which drives retry eligibility, backoff
//! shape, severity classification and alert thresholds, so nothing upstream
//! needs to inspect error messages.
//!
//! Remote failures are classified from HTTP status codes and transport error
//! kinds ([`classify_store_status`], [`classify_embedding_status`],
//! [`classify_transport`]). Only when neither is available does
//! [`classify_message`] look at the text, and the result of that fallback is
//! always the tagged [`SyncError::Unclassified`] variant.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Category tag of a [`SyncError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    StoreConnection,
    StoreTimeout,
    StoreCapacity,
    Store,
    EmbeddingQuota,
    EmbeddingRateLimit,
    EmbeddingAuth,
    Embedding,
    Configuration,
    FileProcessing,
    Network,
    PartialFailure,
    Lock,
    Unclassified,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::StoreConnection => "store_connection",
            ErrorKind::StoreTimeout => "store_timeout",
            ErrorKind::StoreCapacity => "store_capacity",
            ErrorKind::Store => "store",
            ErrorKind::EmbeddingQuota => "embedding_quota",
            ErrorKind::EmbeddingRateLimit => "embedding_rate_limit",
            ErrorKind::EmbeddingAuth => "embedding_auth",
            ErrorKind::Embedding => "embedding",
            ErrorKind::Configuration => "configuration",
            ErrorKind::FileProcessing => "file_processing",
            ErrorKind::Network => "network",
            ErrorKind::PartialFailure => "partial_failure",
            ErrorKind::Lock => "lock",
            ErrorKind::Unclassified => "unclassified",
        }
    }

    /// Auth and configuration failures never heal by waiting.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorKind::EmbeddingAuth | ErrorKind::Configuration)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone)]
pub enum SyncError {
    #[error("vector store unreachable: {0}")]
    StoreConnection(String),
    #[error("vector store timeout: {0}")]
    StoreTimeout(String),
    #[error("vector store capacity exceeded: {0}")]
    StoreCapacity(String),
    #[error("vector store error: {0}")]
    Store(String),
    #[error("embedding quota exhausted: {0}")]
    EmbeddingQuota(String),
    #[error("embedding rate limited: {0}")]
    EmbeddingRateLimit(String),
    #[error("embedding authentication failed: {0}")]
    EmbeddingAuth(String),
    #[error("embedding error: {0}")]
    Embedding(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("file processing error: {0}")]
    FileProcessing(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("{message} ({} succeeded, {} failed)", succeeded.len(), failed.len())]
    PartialFailure {
        message: String,
        succeeded: Vec<String>,
        failed: Vec<String>,
    },
    #[error("lock error: {0}")]
    Lock(String),
    #[error("unclassified error: {message}")]
    Unclassified {
        /// Category guessed from the message text, if any keyword matched.
        suspected: Option<ErrorKind>,
        message: String,
    },
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::StoreConnection(_) => ErrorKind::StoreConnection,
            SyncError::StoreTimeout(_) => ErrorKind::StoreTimeout,
            SyncError::StoreCapacity(_) => ErrorKind::StoreCapacity,
            SyncError::Store(_) => ErrorKind::Store,
            SyncError::EmbeddingQuota(_) => ErrorKind::EmbeddingQuota,
            SyncError::EmbeddingRateLimit(_) => ErrorKind::EmbeddingRateLimit,
            SyncError::EmbeddingAuth(_) => ErrorKind::EmbeddingAuth,
            SyncError::Embedding(_) => ErrorKind::Embedding,
            SyncError::Configuration(_) => ErrorKind::Configuration,
            SyncError::FileProcessing(_) => ErrorKind::FileProcessing,
            SyncError::Network(_) => ErrorKind::Network,
            SyncError::PartialFailure { .. } => ErrorKind::PartialFailure,
            SyncError::Lock(_) => ErrorKind::Lock,
            SyncError::Unclassified { .. } => ErrorKind::Unclassified,
        }
    }

    pub fn is_store_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::StoreConnection
                | ErrorKind::StoreTimeout
                | ErrorKind::StoreCapacity
                | ErrorKind::Store
        )
    }

    pub fn is_embedding_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::EmbeddingQuota
                | ErrorKind::EmbeddingRateLimit
                | ErrorKind::EmbeddingAuth
                | ErrorKind::Embedding
        )
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::FileProcessing(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::FileProcessing(format!("json: {}", e))
    }
}

/// Which remote service produced a failure. Decides the variant family
/// a status code maps into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    VectorStore,
    Embedding,
}

/// Classify a non-success HTTP status returned by the vector store.
pub fn classify_store_status(status: u16, body: &str) -> SyncError {
    let detail = format!("HTTP {}: {}", status, truncate(body, 300));
    match status {
        408 | 504 => SyncError::StoreTimeout(detail),
        413 | 507 => SyncError::StoreCapacity(detail),
        502 | 503 => SyncError::StoreConnection(detail),
        429 => SyncError::StoreCapacity(detail),
        _ => SyncError::Store(detail),
    }
}

/// Classify a non-success HTTP status returned by the embedding API.
///
/// Google APIs return a JSON envelope `{"error": {"status": "...", ...}}`;
/// its canonical status string is preferred over the numeric code.
pub fn classify_embedding_status(status: u16, body: &str) -> SyncError {
    let detail = format!("HTTP {}: {}", status, truncate(body, 300));
    let canonical = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/status")
                .and_then(|s| s.as_str())
                .map(str::to_string)
        });
    let lower = body.to_lowercase();

    match canonical.as_deref() {
        Some("UNAUTHENTICATED") | Some("PERMISSION_DENIED") => {
            return SyncError::EmbeddingAuth(detail)
        }
        Some("RESOURCE_EXHAUSTED") => {
            return if lower.contains("quota") {
                SyncError::EmbeddingQuota(detail)
            } else {
                SyncError::EmbeddingRateLimit(detail)
            };
        }
        Some("INVALID_ARGUMENT") if lower.contains("api_key_invalid") => {
            return SyncError::EmbeddingAuth(detail)
        }
        Some("DEADLINE_EXCEEDED") | Some("UNAVAILABLE") => return SyncError::Network(detail),
        _ => {}
    }

    match status {
        401 | 403 => SyncError::EmbeddingAuth(detail),
        429 if lower.contains("quota") => SyncError::EmbeddingQuota(detail),
        429 => SyncError::EmbeddingRateLimit(detail),
        502..=504 => SyncError::Network(detail),
        _ => SyncError::Embedding(detail),
    }
}

/// Classify a transport-level `reqwest` failure.
pub fn classify_transport(service: Service, err: &reqwest::Error) -> SyncError {
    let message = err.to_string();
    match service {
        Service::VectorStore if err.is_timeout() => SyncError::StoreTimeout(message),
        Service::VectorStore if err.is_connect() => SyncError::StoreConnection(message),
        Service::Embedding if err.is_timeout() || err.is_connect() => SyncError::Network(message),
        _ if err.is_request() || err.is_body() => SyncError::Network(message),
        Service::VectorStore if err.is_decode() => SyncError::Store(message),
        Service::Embedding if err.is_decode() => SyncError::Embedding(message),
        _ => classify_message(&message),
    }
}

/// Last-resort classification by message text.
///
/// Never returns a specific variant: the keyword match only fills the
/// `suspected` hint of [`SyncError::Unclassified`].
pub fn classify_message(message: &str) -> SyncError {
    let lower = message.to_lowercase();
    let suspected = if lower.contains("quota") {
        Some(ErrorKind::EmbeddingQuota)
    } else if lower.contains("rate") {
        Some(ErrorKind::EmbeddingRateLimit)
    } else if lower.contains("auth") || lower.contains("api key") {
        Some(ErrorKind::EmbeddingAuth)
    } else if lower.contains("timeout") || lower.contains("timed out") {
        Some(ErrorKind::StoreTimeout)
    } else if lower.contains("could not connect") || lower.contains("connection") {
        Some(ErrorKind::StoreConnection)
    } else if lower.contains("network") {
        Some(ErrorKind::Network)
    } else {
        None
    };
    SyncError::Unclassified {
        suspected,
        message: message.to_string(),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars).collect();
        format!("{}…", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        assert_eq!(
            SyncError::StoreTimeout("x".into()).kind(),
            ErrorKind::StoreTimeout
        );
        let partial = SyncError::PartialFailure {
            message: "batch 3".into(),
            succeeded: vec!["a".into()],
            failed: vec!["b".into(), "c".into()],
        };
        assert_eq!(partial.kind(), ErrorKind::PartialFailure);
        assert_eq!(partial.to_string(), "batch 3 (1 succeeded, 2 failed)");
    }

    #[test]
    fn store_status_mapping() {
        assert_eq!(classify_store_status(503, "").kind(), ErrorKind::StoreConnection);
        assert_eq!(classify_store_status(504, "").kind(), ErrorKind::StoreTimeout);
        assert_eq!(classify_store_status(507, "").kind(), ErrorKind::StoreCapacity);
        assert_eq!(classify_store_status(500, "boom").kind(), ErrorKind::Store);
    }

    #[test]
    fn embedding_status_prefers_canonical_status() {
        let body = r#"{"error":{"code":429,"message":"Quota exceeded for metric","status":"RESOURCE_EXHAUSTED"}}"#;
        assert_eq!(
            classify_embedding_status(429, body).kind(),
            ErrorKind::EmbeddingQuota
        );

        let body = r#"{"error":{"code":429,"message":"Too many requests","status":"RESOURCE_EXHAUSTED"}}"#;
        assert_eq!(
            classify_embedding_status(429, body).kind(),
            ErrorKind::EmbeddingRateLimit
        );

        let body = r#"{"error":{"code":400,"message":"API key not valid","status":"INVALID_ARGUMENT","details":[{"reason":"API_KEY_INVALID"}]}}"#;
        assert_eq!(
            classify_embedding_status(400, body).kind(),
            ErrorKind::EmbeddingAuth
        );
    }

    #[test]
    fn embedding_status_falls_back_to_code() {
        assert_eq!(
            classify_embedding_status(403, "forbidden").kind(),
            ErrorKind::EmbeddingAuth
        );
        assert_eq!(
            classify_embedding_status(500, "oops").kind(),
            ErrorKind::Embedding
        );
    }

    #[test]
    fn message_fallback_is_always_unclassified() {
        match classify_message("Request timed out after 30s") {
            SyncError::Unclassified { suspected, .. } => {
                assert_eq!(suspected, Some(ErrorKind::StoreTimeout))
            }
            other => panic!("expected unclassified, got {:?}", other),
        }
        match classify_message("something odd") {
            SyncError::Unclassified { suspected, .. } => assert_eq!(suspected, None),
            other => panic!("expected unclassified, got {:?}", other),
        }
    }

    #[test]
    fn fatal_kinds() {
        assert!(ErrorKind::EmbeddingAuth.is_fatal());
        assert!(ErrorKind::Configuration.is_fatal());
        assert!(!ErrorKind::StoreConnection.is_fatal());
    }
}
