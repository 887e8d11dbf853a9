//! Settings loading and validation.
//!
//! Settings come from an optional TOML file; every field has a serde default
//! so an absent or partial file is fine. Environment variables are applied on
//! top and win over file values:
//!
//! | Variable | Setting |
//! |----------|---------|
//! | `GEMINI_API_KEY` | `embedding.api_key` |
//! | `CHROMA_DB_URL` | `vector_store.url` |
//! | `KB_COLLECTION` | `vector_store.collection` |
//! | `KB_EMBEDDING_MODEL` | `embedding.model` |
//! | `KB_CHUNK_SIZE` | `chunking.chunk_size` |
//! | `KB_CHUNK_OVERLAP` | `chunking.chunk_overlap` |
//! | `KB_LOG_LEVEL` | `logging.level` |

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::SyncError;

#[derive(Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Deserialize, Clone)]
pub struct VectorStoreConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            collection: default_collection(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_collection() -> String {
    "bouldering_advice".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: default_model(),
            dims: default_dims(),
            batch_size: default_batch_size(),
            timeout_secs: default_timeout_secs(),
            base_url: default_base_url(),
        }
    }
}

fn default_model() -> String {
    "models/embedding-001".to_string()
}
fn default_dims() -> usize {
    768
}
fn default_batch_size() -> usize {
    50
}
fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

#[derive(Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    500
}
fn default_chunk_overlap() -> usize {
    50
}

#[derive(Deserialize, Clone)]
pub struct KnowledgeConfig {
    #[serde(default = "default_knowledge_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default = "default_metadata_path")]
    pub metadata_path: PathBuf,
    #[serde(default = "default_lock_path")]
    pub lock_path: PathBuf,
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
    /// Backups include embeddings only below this many entries.
    #[serde(default = "default_backup_embedding_limit")]
    pub backup_embedding_limit: usize,
    #[serde(default = "default_recovery_attempts")]
    pub recovery_attempts: u32,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            dir: default_knowledge_dir(),
            include_globs: default_include_globs(),
            metadata_path: default_metadata_path(),
            lock_path: default_lock_path(),
            backup_dir: default_backup_dir(),
            backup_embedding_limit: default_backup_embedding_limit(),
            recovery_attempts: default_recovery_attempts(),
        }
    }
}

fn default_knowledge_dir() -> PathBuf {
    PathBuf::from("knowledge_base")
}
fn default_include_globs() -> Vec<String> {
    vec!["**/*.txt".to_string()]
}
fn default_metadata_path() -> PathBuf {
    PathBuf::from("knowledge_base_metadata.json")
}
fn default_lock_path() -> PathBuf {
    std::env::temp_dir().join("kbsync.lock")
}
fn default_backup_dir() -> PathBuf {
    PathBuf::from("backups")
}
fn default_backup_embedding_limit() -> usize {
    1000
}
fn default_recovery_attempts() -> u32 {
    3
}

#[derive(Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self { k: default_k() }
    }
}

fn default_k() -> usize {
    3
}

#[derive(Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            dir: default_log_dir(),
            file_prefix: default_file_prefix(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}
fn default_file_prefix() -> String {
    "kbsync.log".to_string()
}

/// Read the settings file (if present) and apply environment overrides.
pub fn load_settings(path: &Path) -> Result<Settings, SyncError> {
    let mut settings = if path.exists() {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        toml::from_str(&content).map_err(|e| {
            SyncError::Configuration(format!("failed to parse {}: {}", path.display(), e))
        })?
    } else {
        Settings::default()
    };

    settings.apply_env(|key| std::env::var(key).ok())?;
    Ok(settings)
}

impl Settings {
    /// Overlay values from `lookup` (normally the process environment).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), SyncError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("GEMINI_API_KEY") {
            self.embedding.api_key = Some(v);
        }
        if let Some(v) = get("CHROMA_DB_URL") {
            self.vector_store.url = Some(v);
        }
        if let Some(v) = get("KB_COLLECTION") {
            self.vector_store.collection = v;
        }
        if let Some(v) = get("KB_EMBEDDING_MODEL") {
            self.embedding.model = v;
        }
        if let Some(v) = get("KB_CHUNK_SIZE") {
            self.chunking.chunk_size = parse_usize("KB_CHUNK_SIZE", &v)?;
        }
        if let Some(v) = get("KB_CHUNK_OVERLAP") {
            self.chunking.chunk_overlap = parse_usize("KB_CHUNK_OVERLAP", &v)?;
        }
        if let Some(v) = get("KB_LOG_LEVEL") {
            self.logging.level = v;
        }
        Ok(())
    }

    /// Check required values. `remote` is true when the real store and
    /// embedding API will be contacted. Returns non-fatal warnings.
    pub fn validate(&self, remote: bool) -> Result<Vec<String>, SyncError> {
        let mut warnings = Vec::new();

        if remote {
            let key = self
                .embedding
                .api_key
                .as_deref()
                .ok_or_else(|| SyncError::Configuration("GEMINI_API_KEY is not set".into()))?;
            if !key.starts_with("AI") {
                warnings.push("GEMINI_API_KEY does not look like a Google API key".to_string());
            }

            let url = self
                .vector_store
                .url
                .as_deref()
                .ok_or_else(|| SyncError::Configuration("CHROMA_DB_URL is not set".into()))?;
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                warnings.push(format!("CHROMA_DB_URL has no http(s) scheme: {}", url));
            }
        }

        if !self.knowledge.dir.is_dir() {
            return Err(SyncError::Configuration(format!(
                "knowledge directory does not exist: {}",
                self.knowledge.dir.display()
            )));
        }
        if self.chunking.chunk_size == 0 {
            return Err(SyncError::Configuration("chunking.chunk_size must be > 0".into()));
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            return Err(SyncError::Configuration(format!(
                "chunking.chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunking.chunk_overlap, self.chunking.chunk_size
            )));
        }
        if self.embedding.dims == 0 {
            return Err(SyncError::Configuration("embedding.dims must be > 0".into()));
        }
        if self.embedding.batch_size == 0 {
            return Err(SyncError::Configuration("embedding.batch_size must be > 0".into()));
        }
        if self.knowledge.recovery_attempts == 0 {
            return Err(SyncError::Configuration(
                "knowledge.recovery_attempts must be > 0".into(),
            ));
        }

        for w in &warnings {
            tracing::warn!("{}", w);
        }
        Ok(warnings)
    }

    /// Log the effective settings with secrets masked.
    pub fn log_summary(&self) {
        tracing::info!(
            api_key = %self.embedding.api_key.as_deref().map(mask_secret).unwrap_or_else(|| "<unset>".into()),
            url = %self.vector_store.url.as_deref().map(mask_secret).unwrap_or_else(|| "<unset>".into()),
            collection = %self.vector_store.collection,
            model = %self.embedding.model,
            chunk_size = self.chunking.chunk_size,
            chunk_overlap = self.chunking.chunk_overlap,
            knowledge_dir = %self.knowledge.dir.display(),
            "effective settings"
        );
    }
}

fn parse_usize(key: &str, value: &str) -> Result<usize, SyncError> {
    value
        .trim()
        .parse()
        .map_err(|_| SyncError::Configuration(format!("{} must be a non-negative integer, got '{}'", key, value)))
}

/// Keep the first four characters visible.
pub fn mask_secret(value: &str) -> String {
    let n = value.chars().count();
    if n <= 4 {
        return "*".repeat(n);
    }
    let head: String = value.chars().take(4).collect();
    format!("{}{}", head, "*".repeat(n - 4))
}
