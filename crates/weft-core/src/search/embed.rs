//! Embedding backends for semantic search
//!
//! The engine talks to backends only through [`Embedder`]; which model sits
//! behind it is a deployment decision. Backends are expected to be slow and
//! fallible; the search engine degrades to lexical-only scoring when a
//! backend errors or times out.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::Result;

/// A text-embedding backend
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Identifier folded into embedding-cache keys, so switching models
    /// never serves stale vectors
    fn model_id(&self) -> &str;

    /// Embed a batch of texts; one vector per input, same order
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Cache key for one embedded text: SHA-256 over text and model id
pub fn embedding_cache_key(text: &str, model_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hasher.update([0]);
    hasher.update(model_id.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Cosine similarity shifted from [-1, 1] into [0, 1]
pub fn cosine_unit(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0_f64;
    let mut norm_a = 0.0_f64;
    let mut norm_b = 0.0_f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.5; // orthogonal-by-convention for degenerate vectors
    }
    let cosine = dot / (norm_a.sqrt() * norm_b.sqrt());
    (cosine + 1.0) / 2.0
}

/// Embedder backed by an OpenAI-compatible `/embeddings` endpoint
#[cfg(feature = "http-embedder")]
pub struct HttpEmbedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

#[cfg(feature = "http-embedder")]
impl HttpEmbedder {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

#[cfg(feature = "http-embedder")]
#[async_trait]
impl Embedder for HttpEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        use crate::error::Error;
        use serde::Deserialize;

        #[derive(Deserialize)]
        struct EmbeddingData {
            embedding: Vec<f32>,
        }

        #[derive(Deserialize)]
        struct EmbeddingResponse {
            data: Vec<EmbeddingData>,
        }

        let mut request = self.client.post(&self.endpoint).json(&serde_json::json!({
            "model": self.model,
            "input": texts,
        }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Transient(format!("embedding request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Transient(format!(
                "embedding backend returned {}",
                response.status()
            )));
        }
        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| Error::Transient(format!("embedding response malformed: {e}")))?;
        if parsed.data.len() != texts.len() {
            return Err(Error::Internal(format!(
                "embedding backend returned {} vectors for {} inputs",
                parsed.data.len(),
                texts.len()
            )));
        }
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}
