//! Embedding client.
//!
//! Produces fixed-width float vectors from text. The HTTP implementation
//! talks to an OpenAI-compatible `/embeddings` endpoint; every embedder
//! can be wrapped in [`CachedEmbedder`] which keys vectors by model and
//! text hash with a long TTL. [`HashEmbedder`] is a deterministic
//! offline embedder used by tests and local development.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::cache::{CacheKey, QueryCache};
use crate::config::EmbeddingSettings;
use crate::error::{CoreError, CoreResult};

/// Text-to-vector contract.
///
/// `embed` must be deterministic for identical input within a model
/// version. Failures are transient; callers either retry or degrade.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> CoreResult<Vec<f32>>;

    /// Fixed vector width.
    fn dim(&self) -> usize;

    /// Model identifier, part of the cache key.
    fn model_id(&self) -> &str;
}

/// OpenAI-style HTTP embedder.
pub struct HttpEmbedder {
    client: reqwest::Client,
    settings: EmbeddingSettings,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    pub fn new(settings: &EmbeddingSettings) -> CoreResult<Self> {
        let api_key = settings
            .resolved_api_key()
            .map_err(|e| CoreError::Config(e.to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            settings: settings.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> CoreResult<Vec<f32>> {
        let body = json!({
            "model": self.settings.model,
            "input": text,
        });

        let resp = self
            .client
            .post(format!("{}/embeddings", self.settings.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let parsed: EmbeddingResponse = resp.json().await?;
        let vector = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| CoreError::Transient("empty embedding response".to_string()))?;

        if vector.len() != self.settings.dim {
            return Err(CoreError::Transient(format!(
                "embedding width {} does not match configured dim {}",
                vector.len(),
                self.settings.dim
            )));
        }

        Ok(vector)
    }

    fn dim(&self) -> usize {
        self.settings.dim
    }

    fn model_id(&self) -> &str {
        &self.settings.model
    }
}

/// Caching decorator for any embedder.
///
/// Vectors live under `embed:<model>:<text_hash>` with a 30-day TTL by
/// default. Cache failures are logged and ignored; the inner embedder
/// is the source of truth.
pub struct CachedEmbedder<E: Embedder> {
    inner: E,
    cache: Arc<QueryCache>,
    ttl_secs: u64,
}

impl<E: Embedder> CachedEmbedder<E> {
    pub fn new(inner: E, cache: Arc<QueryCache>, ttl_secs: u64) -> Self {
        Self {
            inner,
            cache,
            ttl_secs,
        }
    }
}

#[async_trait]
impl<E: Embedder> Embedder for CachedEmbedder<E> {
    async fn embed(&self, text: &str) -> CoreResult<Vec<f32>> {
        let key = CacheKey::embed(self.inner.model_id(), text);

        match self.cache.get::<Vec<f32>>(&key) {
            Ok(Some(vector)) => {
                debug!(key = %key, "embedding cache hit");
                return Ok(vector);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "embedding cache read failed"),
        }

        let vector = self.inner.embed(text).await?;

        if let Err(e) = self.cache.set(&key, &vector, self.ttl_secs) {
            warn!(error = %e, "embedding cache write failed");
        }

        Ok(vector)
    }

    fn dim(&self) -> usize {
        self.inner.dim()
    }

    fn model_id(&self) -> &str {
        self.inner.model_id()
    }
}

/// Deterministic offline embedder.
///
/// Hashes each lower-cased token into a bucket and L2-normalises the
/// result. Not semantically meaningful, but identical texts map to
/// identical vectors and token overlap increases cosine similarity,
/// which is what retrieval tests need.
pub struct HashEmbedder {
    dim: usize,
    pub calls: AtomicUsize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn bucket(&self, token: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        token.hash(&mut hasher);
        (hasher.finish() as usize) % self.dim
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> CoreResult<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut vector = vec![0.0f32; self.dim];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            vector[self.bucket(token)] += 1.0;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        Ok(vector)
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn model_id(&self) -> &str {
        "hash-embedder"
    }
}
