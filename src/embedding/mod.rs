//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and two implementations:
//! - **[`GeminiProvider`]**: calls the Google Generative Language
//!   `batchEmbedContents` endpoint.
//! - **[`HashEmbedder`]**: deterministic SHA-256-derived vectors for runs
//!   without network access.
//!
//! [`EmbeddingClient`] wraps a provider with the adaptive retry policy,
//! the initialization self-test and output validation.
//!
//! # Provider Selection
//!
//! Use [`create_provider`] to pick the implementation once, at startup.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::analyzer::{context, ErrorAnalyzer};
use crate::config::EmbeddingConfig;
use crate::error::{classify_embedding_status, classify_transport, Service, SyncError};
use crate::models::Embedding;
use crate::retry::{retry, RetryPolicy};

/// What the embedded text will be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedTask {
    Document,
    Query,
}

impl EmbedTask {
    fn as_gemini(&self) -> &'static str {
        match self {
            EmbedTask::Document => "RETRIEVAL_DOCUMENT",
            EmbedTask::Query => "RETRIEVAL_QUERY",
        }
    }
}

/// Trait for embedding providers.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"models/embedding-001"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `768`).
    fn dims(&self) -> usize;
    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String], task: EmbedTask) -> Result<Vec<Embedding>, SyncError>;
}

// ============ Gemini Provider ============

/// Embedding provider using the Gemini API.
///
/// Calls `POST {base_url}/v1beta/{model}:batchEmbedContents`. The API key
/// travels as the `key` query parameter.
pub struct GeminiProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dims: usize,
    api_key: String,
}

impl GeminiProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, SyncError> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| SyncError::Configuration("GEMINI_API_KEY is not set".into()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SyncError::Configuration(format!("http client: {}", e)))?;

        let model = if config.model.starts_with("models/") {
            config.model.clone()
        } else {
            format!("models/{}", config.model)
        };

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model,
            dims: config.dims,
            api_key,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for GeminiProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String], task: EmbedTask) -> Result<Vec<Embedding>, SyncError> {
        let requests: Vec<serde_json::Value> = texts
            .iter()
            .map(|t| {
                serde_json::json!({
                    "model": self.model,
                    "content": { "parts": [{ "text": t }] },
                    "taskType": task.as_gemini(),
                })
            })
            .collect();
        let body = serde_json::json!({ "requests": requests });

        let response = self
            .client
            .post(format!("{}/v1beta/{}:batchEmbedContents", self.base_url, self.model))
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(Service::Embedding, &e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_embedding_status(status.as_u16(), &text));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| classify_transport(Service::Embedding, &e))?;
        parse_gemini_response(&json)
    }
}

/// Extract `embeddings[].values` in order.
fn parse_gemini_response(json: &serde_json::Value) -> Result<Vec<Embedding>, SyncError> {
    let items = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| SyncError::Embedding("invalid response: missing embeddings array".into()))?;

    items
        .iter()
        .map(|item| {
            item.get("values")
                .and_then(|v| v.as_array())
                .map(|values| {
                    values
                        .iter()
                        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                        .collect()
                })
                .ok_or_else(|| SyncError::Embedding("invalid response: missing values".into()))
        })
        .collect()
}

// ============ Hash Embedder ============

/// Deterministic stand-in: each vector is expanded from SHA-256 digests of
/// the text and L2-normalized, so equal texts embed identically.
pub struct HashEmbedder {
    model: String,
    dims: usize,
}

impl HashEmbedder {
    pub fn new(model: &str, dims: usize) -> Self {
        Self {
            model: model.to_string(),
            dims,
        }
    }

    pub fn vector(&self, text: &str) -> Embedding {
        let mut out = Vec::with_capacity(self.dims);
        let mut block: u32 = 0;
        while out.len() < self.dims {
            let mut hasher = Sha256::new();
            hasher.update(text.as_bytes());
            hasher.update(block.to_le_bytes());
            for byte in hasher.finalize() {
                if out.len() == self.dims {
                    break;
                }
                out.push(byte as f32 / 127.5 - 1.0);
            }
            block += 1;
        }
        let norm = out.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            out.iter_mut().for_each(|x| *x /= norm);
        }
        out
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String], _task: EmbedTask) -> Result<Vec<Embedding>, SyncError> {
        Ok(texts.iter().map(|t| self.vector(t)).collect())
    }
}

/// Create the provider for this run.
///
/// | `mock` | Provider |
/// |--------|----------|
/// | `false` | [`GeminiProvider`] |
/// | `true` | [`HashEmbedder`] |
pub fn create_provider(
    config: &EmbeddingConfig,
    mock: bool,
) -> Result<Arc<dyn EmbeddingProvider>, SyncError> {
    if mock {
        Ok(Arc::new(HashEmbedder::new(&config.model, config.dims)))
    } else {
        Ok(Arc::new(GeminiProvider::new(config)?))
    }
}

// ============ Client ============

/// Retrying, validating front of an [`EmbeddingProvider`].
pub struct EmbeddingClient {
    provider: Arc<dyn EmbeddingProvider>,
    analyzer: Arc<ErrorAnalyzer>,
    policy: RetryPolicy,
    initialized: AtomicBool,
}

impl EmbeddingClient {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, analyzer: Arc<ErrorAnalyzer>) -> Self {
        Self {
            provider,
            analyzer,
            policy: RetryPolicy::embedding(),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub fn dims(&self) -> usize {
        self.provider.dims()
    }

    /// Embed a sentinel string once. Idempotent after the first success.
    pub async fn initialize(&self) -> Result<(), SyncError> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let sentinel = vec!["test".to_string()];
        let sentinel = sentinel.as_slice();
        let result = retry(&self.policy, "embedding.self_test", &self.analyzer, move || {
            self.provider.embed(sentinel, EmbedTask::Document)
        })
        .await;

        match result {
            Ok(vectors) => {
                self.validate(&vectors, 1)?;
                self.initialized.store(true, Ordering::SeqCst);
                tracing::info!(model = self.provider.model_name(), dims = self.dims(), "embedding self-test passed");
                Ok(())
            }
            Err(err) => {
                let err = reclassify_self_test(err);
                self.analyzer.record(
                    &err,
                    context([("operation", "embedding.self_test".to_string())]),
                );
                tracing::error!(kind = %err.kind(), "embedding self-test failed: {}", err);
                Err(err)
            }
        }
    }

    /// Embed document texts, checking count and dimensionality.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, SyncError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = retry(&self.policy, "embedding.batch", &self.analyzer, move || {
            self.provider.embed(texts, EmbedTask::Document)
        })
        .await?;
        self.validate(&vectors, texts.len())?;
        Ok(vectors)
    }

    pub async fn embed_query(&self, text: &str) -> Result<Embedding, SyncError> {
        let texts = vec![text.to_string()];
        let texts = texts.as_slice();
        let vectors = retry(&self.policy, "embedding.query", &self.analyzer, move || {
            self.provider.embed(texts, EmbedTask::Query)
        })
        .await?;
        self.validate(&vectors, 1)?;
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::Embedding("empty embedding response".into()))
    }

    fn validate(&self, vectors: &[Embedding], expected: usize) -> Result<(), SyncError> {
        if vectors.len() != expected {
            return Err(SyncError::Embedding(format!(
                "expected {} embeddings, got {}",
                expected,
                vectors.len()
            )));
        }
        let dims = self.dims();
        if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
            return Err(SyncError::Embedding(format!(
                "embedding has {} dimensions, collection expects {}",
                bad.len(),
                dims
            )));
        }
        Ok(())
    }
}

/// Narrow a generic self-test failure by message keywords.
///
/// Errors already classified from a status code pass through untouched.
pub fn reclassify_self_test(err: SyncError) -> SyncError {
    let message = match &err {
        SyncError::Unclassified { message, .. } => message.clone(),
        SyncError::Embedding(message) => message.clone(),
        _ => return err,
    };
    let lower = message.to_lowercase();
    if lower.contains("quota") || lower.contains("limit") {
        SyncError::EmbeddingQuota(message)
    } else if lower.contains("rate") {
        SyncError::EmbeddingRateLimit(message)
    } else if lower.contains("auth") || lower.contains("key") {
        SyncError::EmbeddingAuth(message)
    } else {
        err
    }
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let (dot, aa, bb) = a
        .iter()
        .zip(b)
        .fold((0.0f32, 0.0f32, 0.0f32), |(dot, aa, bb), (x, y)| {
            (dot + x * y, aa + x * x, bb + y * y)
        });
    let norm = (aa * bb).sqrt();
    if norm < f32::EPSILON {
        0.0
    } else {
        dot / norm
    }
}
