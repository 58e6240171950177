//! Hybrid semantic tool search
//!
//! Combines lexical BM25 with embedding cosine similarity so the planner
//! sees a small, relevant slice of the catalog instead of all of it. Small
//! catalogs bypass ranking entirely; a missing or failing embedding backend
//! degrades to lexical-only scoring, never to an error.

pub mod bm25;
pub mod embed;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::cache::TtlCache;
use crate::config::{SearchConfig, defaults};
use crate::error::{Error, Result};
use crate::registry::{DetailLevel, PlannerFormatOptions, ToolCatalog, ToolDefinition, render_definition};

use bm25::Bm25Index;
use embed::{Embedder, cosine_unit, embedding_cache_key};

/// One search hit: the definition plus its combined score in [0, 1]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredTool {
    pub definition: ToolDefinition,
    pub score: f64,
}

type EmbedderFactory = Box<dyn Fn() -> Result<Arc<dyn Embedder>> + Send + Sync>;

/// Hybrid lexical + semantic ranking over a catalog snapshot
pub struct SearchEngine {
    config: SearchConfig,
    embedder_factory: Option<EmbedderFactory>,
    embedder: OnceCell<Arc<dyn Embedder>>,
    embedding_cache: TtlCache<String, Vec<f32>>,
    result_cache: TtlCache<String, Vec<ScoredTool>>,
}

impl SearchEngine {
    pub fn new(config: SearchConfig) -> Self {
        Self {
            config,
            embedder_factory: None,
            embedder: OnceCell::new(),
            // Embeddings are content-addressed and never expire; query
            // results are keyed by catalog hash and aged out.
            embedding_cache: TtlCache::new(None),
            result_cache: TtlCache::new(Some(Duration::from_secs(
                defaults::RESULT_CACHE_TTL_SECS,
            ))),
        }
    }

    /// Install an embedding backend factory; the backend itself is built
    /// lazily on first use
    pub fn with_embedder_factory(
        mut self,
        factory: impl Fn() -> Result<Arc<dyn Embedder>> + Send + Sync + 'static,
    ) -> Self {
        self.embedder_factory = Some(Box::new(factory));
        self
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Top-k tools for `query`, never failing
    ///
    /// Catalogs smaller than the routing threshold are returned whole with
    /// score 1.0, keeping small deployments free of embedding overhead.
    pub async fn search(&self, query: &str, catalog: &ToolCatalog) -> Vec<ScoredTool> {
        if catalog.len() < self.config.routing_threshold {
            debug!(
                size = catalog.len(),
                threshold = self.config.routing_threshold,
                "catalog below routing threshold, returning all tools"
            );
            return catalog
                .iter()
                .map(|d| ScoredTool {
                    definition: d.clone(),
                    score: 1.0,
                })
                .collect();
        }

        let cache_key = format!(
            "{}\x1f{}\x1f{}",
            query_hash(query),
            catalog.content_hash(),
            self.config.top_k
        );
        self.result_cache
            .get_or_try_compute(cache_key, || async { Ok(self.rank(query, catalog).await) })
            .await
            .unwrap_or_default()
    }

    async fn rank(&self, query: &str, catalog: &ToolCatalog) -> Vec<ScoredTool> {
        let texts: Vec<String> = catalog.iter().map(|d| d.search_text()).collect();
        let index = Bm25Index::build(&texts);
        let lexical = index.normalized_scores(query);

        let semantic = match tokio::time::timeout(
            self.config.timeout(),
            self.semantic_scores(query, &texts),
        )
        .await
        {
            Ok(Ok(scores)) => Some(scores),
            Ok(Err(e)) => {
                warn!(error = %e, "embedding backend unavailable, falling back to lexical scoring");
                None
            }
            Err(_) => {
                warn!("embedding backend timed out, falling back to lexical scoring");
                None
            }
        };

        let mut hits: Vec<(usize, f64)> = catalog
            .iter()
            .enumerate()
            .map(|(i, _)| {
                let score = match &semantic {
                    Some(cosines) => {
                        self.config.bm25_weight * lexical[i]
                            + self.config.semantic_weight * cosines[i]
                    }
                    None => lexical[i],
                };
                (i, score)
            })
            .filter(|(_, score)| *score >= self.config.min_score)
            .collect();

        hits.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(self.config.top_k);

        let definitions: Vec<&ToolDefinition> = catalog.iter().collect();
        hits.into_iter()
            .map(|(i, score)| ScoredTool {
                definition: definitions[i].clone(),
                score,
            })
            .collect()
    }

    async fn semantic_scores(&self, query: &str, texts: &[String]) -> Result<Vec<f64>> {
        let embedder = self.embedder().await?;
        let query_vector = self.embed_cached(&embedder, query).await?;
        let mut scores = Vec::with_capacity(texts.len());
        for text in texts {
            let vector = self.embed_cached(&embedder, text).await?;
            scores.push(cosine_unit(&query_vector, &vector));
        }
        Ok(scores)
    }

    async fn embedder(&self) -> Result<Arc<dyn Embedder>> {
        let factory = self
            .embedder_factory
            .as_ref()
            .ok_or_else(|| Error::Internal("no embedding backend configured".into()))?;
        self.embedder
            .get_or_try_init(|| async { factory() })
            .await
            .cloned()
    }

    /// Embed one text through the persistent content-addressed cache
    pub async fn embed_cached(
        &self,
        embedder: &Arc<dyn Embedder>,
        text: &str,
    ) -> Result<Vec<f32>> {
        let key = embedding_cache_key(text, embedder.model_id());
        let owned = text.to_string();
        let embedder = embedder.clone();
        self.embedding_cache
            .get_or_try_compute(key, || async move {
                let mut vectors = embedder.embed(std::slice::from_ref(&owned)).await?;
                vectors
                    .pop()
                    .ok_or_else(|| Error::Internal("embedding backend returned no vector".into()))
            })
            .await
    }

    /// Page through the catalog without ranking, yielding lightweight
    /// projections
    pub fn browse(
        &self,
        catalog: &ToolCatalog,
        offset: usize,
        limit: usize,
        detail: DetailLevel,
    ) -> Vec<Value> {
        let opts = PlannerFormatOptions {
            detail_level: detail,
            include_examples: false,
        };
        catalog
            .iter()
            .skip(offset)
            .take(limit)
            .map(|d| render_definition(d, &opts))
            .collect()
    }
}

fn query_hash(query: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(query.as_bytes());
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}
