//! Configuration for Weft
//!
//! A [`SystemConfig`] is assembled once at startup, either from a TOML file
//! or from the closed set of environment variables, and threaded through the
//! system inside a `SystemContext`. There is no global configuration state.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default constants used throughout the system
pub mod defaults {
    /// Per-step execution timeout in seconds
    pub const STEP_TIMEOUT_SECS: u64 = 30;

    /// Per-sandbox wall-clock cap in seconds
    pub const SANDBOX_TIMEOUT_SECS: u64 = 30;

    /// Maximum tool calls per sandbox session
    pub const SANDBOX_MAX_TOOL_CALLS: usize = 100;

    /// Per-search timeout in seconds before BM25-only fallback
    pub const SEARCH_TIMEOUT_SECS: u64 = 5;

    /// Catalogs below this size skip semantic ranking entirely
    pub const ROUTING_THRESHOLD: usize = 20;

    /// Number of results returned by semantic search
    pub const TOP_K: usize = 5;

    /// Minimum combined score for a search hit to survive
    pub const MIN_SCORE: f64 = 0.3;

    /// Lexical weight in the hybrid score
    pub const BM25_WEIGHT: f64 = 0.3;

    /// Semantic weight in the hybrid score
    pub const SEMANTIC_WEIGHT: f64 = 0.7;

    /// Concurrent sub-agent requests per dispatch
    pub const MAX_CONCURRENCY: usize = 10;

    /// Nested dispatch depth before RecursionLimit
    pub const MAX_RECURSION_DEPTH: u32 = 5;

    /// Idempotency cache TTL in seconds
    pub const IDEMPOTENCY_TTL_SECS: u64 = 3600;

    /// Query result cache TTL in seconds
    pub const RESULT_CACHE_TTL_SECS: u64 = 3600;

    /// Synthetic cost charged per plan-step invocation attempt
    pub const ATTEMPT_COST: f64 = 1.0;

    /// Skill store quota: total bytes per workspace
    pub const SKILL_TOTAL_BYTES: u64 = 100 * 1024 * 1024;

    /// Skill store quota: bytes per skill
    pub const SKILL_MAX_BYTES: u64 = 1024 * 1024;

    /// Skill store quota: bytes per intermediate output
    pub const INTERMEDIATE_MAX_BYTES: u64 = 10 * 1024 * 1024;

    /// Skill store quota: files per workspace
    pub const SKILL_MAX_FILES: usize = 1000;

    /// Skill directory name under the platform data dir
    pub const SKILL_DIR_NAME: &str = "weft/skills";
}

/// System-wide configuration
///
/// The environment surface is deliberately closed: skill storage path, log
/// level, optional cache backend URL, optional analytics sink. Anything else
/// comes from the config file or stays at its default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Where the skill workspace lives; platform data dir when unset
    #[serde(default)]
    pub skill_dir: Option<PathBuf>,
    /// Log filter directive, e.g. "info" or "weft_core=debug"
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Optional external cache backend URL
    #[serde(default)]
    pub cache_url: Option<String>,
    /// Optional analytics sink selector
    #[serde(default)]
    pub analytics: Option<String>,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            skill_dir: None,
            log_level: default_log_level(),
            cache_url: None,
            analytics: None,
            search: SearchConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }
}

impl SystemConfig {
    /// Build a config from the closed environment variable set
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var("WEFT_SKILL_DIR") {
            config.skill_dir = Some(PathBuf::from(dir));
        }
        if let Ok(level) = std::env::var("WEFT_LOG") {
            config.log_level = level;
        }
        if let Ok(url) = std::env::var("WEFT_CACHE_URL") {
            config.cache_url = Some(url);
        }
        if let Ok(sink) = std::env::var("WEFT_ANALYTICS") {
            config.analytics = Some(sink);
        }
        config
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Internal(format!("failed to read config {}: {e}", path.display())))?;
        toml::from_str(&text).map_err(|e| Error::Validation(format!("invalid config: {e}")))
    }

    /// Resolve the skill workspace root
    pub fn skill_root(&self) -> PathBuf {
        self.skill_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|p| p.join(defaults::SKILL_DIR_NAME))
                .unwrap_or_else(|| PathBuf::from(".weft/skills"))
        })
    }
}

/// Tunables for hybrid semantic search
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "d_top_k")]
    pub top_k: usize,
    #[serde(default = "d_min_score")]
    pub min_score: f64,
    #[serde(default = "d_bm25_weight")]
    pub bm25_weight: f64,
    #[serde(default = "d_semantic_weight")]
    pub semantic_weight: f64,
    #[serde(default = "d_routing_threshold")]
    pub routing_threshold: usize,
    #[serde(default = "d_search_timeout")]
    pub timeout_secs: u64,
}

fn d_top_k() -> usize {
    defaults::TOP_K
}
fn d_min_score() -> f64 {
    defaults::MIN_SCORE
}
fn d_bm25_weight() -> f64 {
    defaults::BM25_WEIGHT
}
fn d_semantic_weight() -> f64 {
    defaults::SEMANTIC_WEIGHT
}
fn d_routing_threshold() -> usize {
    defaults::ROUTING_THRESHOLD
}
fn d_search_timeout() -> u64 {
    defaults::SEARCH_TIMEOUT_SECS
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            top_k: defaults::TOP_K,
            min_score: defaults::MIN_SCORE,
            bm25_weight: defaults::BM25_WEIGHT,
            semantic_weight: defaults::SEMANTIC_WEIGHT,
            routing_threshold: defaults::ROUTING_THRESHOLD,
            timeout_secs: defaults::SEARCH_TIMEOUT_SECS,
        }
    }
}

impl SearchConfig {
    /// Weights must describe a convex combination
    pub fn validate(&self) -> Result<()> {
        let sum = self.bm25_weight + self.semantic_weight;
        if (sum - 1.0).abs() > 1e-9 {
            return Err(Error::Validation(format!(
                "search weights must sum to 1.0, got {sum}"
            )));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Tunables for the plan executor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Default per-step timeout in milliseconds
    #[serde(default = "d_step_timeout_ms")]
    pub step_timeout_ms: u64,
    /// Cap on concurrently running steps within one level; unbounded when unset
    #[serde(default)]
    pub max_in_flight: Option<usize>,
    /// Plan-level wall budget in milliseconds; unbounded when unset
    #[serde(default)]
    pub plan_budget_ms: Option<u64>,
    /// Synthetic cost charged per invocation attempt
    #[serde(default = "d_attempt_cost")]
    pub attempt_cost: f64,
}

fn d_step_timeout_ms() -> u64 {
    defaults::STEP_TIMEOUT_SECS * 1000
}
fn d_attempt_cost() -> f64 {
    defaults::ATTEMPT_COST
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            step_timeout_ms: d_step_timeout_ms(),
            max_in_flight: None,
            plan_budget_ms: None,
            attempt_cost: defaults::ATTEMPT_COST,
        }
    }
}

impl ExecutorConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn plan_budget(&self) -> Option<Duration> {
        self.plan_budget_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SystemConfig::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.search.top_k, 5);
        assert_eq!(config.search.routing_threshold, 20);
        assert_eq!(config.executor.step_timeout(), Duration::from_secs(30));
        assert!(config.executor.max_in_flight.is_none());
    }

    #[test]
    fn test_search_weights_validated() {
        let mut search = SearchConfig::default();
        assert!(search.validate().is_ok());
        search.bm25_weight = 0.5;
        assert!(search.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = SystemConfig::default();
        let text = toml::to_string(&config).unwrap();
        let back: SystemConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.search.top_k, config.search.top_k);
        assert_eq!(back.executor.step_timeout_ms, config.executor.step_timeout_ms);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let back: SystemConfig = toml::from_str("log_level = \"debug\"").unwrap();
        assert_eq!(back.log_level, "debug");
        assert_eq!(back.search.min_score, defaults::MIN_SCORE);
    }
}
