//! Configuration types for the retrieval pipeline.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{RagError, Result};
use crate::types::{FusionMethod, Mode};

/// Main configuration for the retrieval pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RagConfig {
    /// Retrieval backend configuration.
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Query transformer configuration.
    #[serde(default)]
    pub transform: TransformConfig,

    /// Fusion configuration.
    #[serde(default)]
    pub fusion: FusionConfig,

    /// Strategy selector configuration.
    #[serde(default)]
    pub strategy: StrategyConfig,

    /// Self-refinement loop configuration.
    #[serde(default)]
    pub refine: RefineConfig,
}

/// Retrieval backend configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Default number of candidates per backend call.
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,

    /// Upper bound for any per-call fetch size.
    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,

    /// Per-backend call timeout in milliseconds.
    #[serde(default = "default_backend_timeout")]
    pub backend_timeout_ms: u64,

    /// Characters kept in candidate previews.
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,

    /// Let the keyword backend join hybrid-capable strategies.
    #[serde(default = "default_true")]
    pub hybrid: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_top_k: 5,
            max_top_k: 100,
            backend_timeout_ms: 2000,
            preview_chars: 240,
            hybrid: true,
        }
    }
}

impl RetrievalConfig {
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }
}

/// Query transformer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformConfig {
    /// Reformulations requested in rewrite mode.
    #[serde(default = "default_rewrite_count")]
    pub rewrite_count: usize,

    /// Hard cap on transformer output.
    #[serde(default = "default_max_rewrites")]
    pub max_rewrites: usize,

    /// Rewriting collaborator timeout in milliseconds.
    #[serde(default = "default_transform_timeout")]
    pub timeout_ms: u64,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            rewrite_count: 2,
            max_rewrites: 3,
            timeout_ms: 5000,
        }
    }
}

impl TransformConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Fusion configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionConfig {
    /// Fusion method.
    #[serde(default)]
    pub method: FusionMethod,

    /// Maximum number of fused results.
    #[serde(default = "default_max_results")]
    pub max_results: usize,

    /// Number of fused results handed to the reranker.
    #[serde(default = "default_rerank_candidates")]
    pub rerank_candidates: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            method: FusionMethod::NormalizeSum,
            max_results: 10,
            rerank_candidates: 20,
        }
    }
}

/// Strategy selector configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Queries with at most this many tokens go hybrid.
    #[serde(default = "default_short_query_tokens")]
    pub short_query_tokens: usize,

    /// Queries with at least this many tokens go to self-refinement.
    #[serde(default = "default_long_query_tokens")]
    pub long_query_tokens: usize,

    /// Words and phrases that mark a multi-part question.
    #[serde(default = "default_connectives")]
    pub connectives: Vec<String>,

    /// Minimum token count before decomposition is considered.
    #[serde(default = "default_min_decompose_tokens")]
    pub min_decompose_tokens: usize,

    /// A pass that asked to retrieve again escalates to self-refinement
    /// only when its confidence is below this.
    #[serde(default = "default_escalate_below")]
    pub escalate_below: f32,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            short_query_tokens: 3,
            long_query_tokens: 18,
            connectives: default_connectives(),
            min_decompose_tokens: 6,
            escalate_below: default_escalate_below(),
        }
    }
}

/// Self-refinement loop configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefineConfig {
    /// Maximum number of passes.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Confidence at which a pass is accepted.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,

    /// Confidence the final pass must exceed to be accepted below the threshold.
    #[serde(default = "default_confidence_floor")]
    pub confidence_floor: f32,

    /// Fraction of `top_k` added to the fetch size on each further pass.
    #[serde(default = "default_top_k_growth")]
    pub top_k_growth: f32,
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            confidence_threshold: 0.7,
            confidence_floor: 0.4,
            top_k_growth: 1.0,
        }
    }
}

/// Request-scoped options for one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    #[serde(default)]
    pub mode: Mode,

    /// Candidates requested per backend call.
    pub top_k: usize,

    pub max_iterations: u32,

    pub confidence_threshold: f32,

    /// Forward the debug event projection to the caller's sink.
    #[serde(default)]
    pub debug: bool,
}

impl RunOptions {
    /// Options seeded from configuration defaults.
    pub fn from_config(config: &RagConfig) -> Self {
        Self {
            mode: Mode::Auto,
            top_k: config.retrieval.default_top_k,
            max_iterations: config.refine.max_iterations,
            confidence_threshold: config.refine.confidence_threshold,
            debug: false,
        }
    }

    /// Check the options against configured limits.
    pub fn validate(&self, config: &RagConfig) -> Result<()> {
        if self.top_k == 0 {
            return Err(RagError::invalid_argument("top_k must be at least 1"));
        }
        if self.top_k > config.retrieval.max_top_k {
            return Err(RagError::invalid_argument(format!(
                "top_k {} exceeds maximum of {}",
                self.top_k, config.retrieval.max_top_k
            )));
        }
        if self.max_iterations == 0 {
            return Err(RagError::invalid_argument(
                "max_iterations must be at least 1",
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(RagError::invalid_argument(format!(
                "confidence_threshold {} outside [0, 1]",
                self.confidence_threshold
            )));
        }
        Ok(())
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::from_config(&RagConfig::default())
    }
}

// Default value functions

fn default_true() -> bool {
    true
}

fn default_top_k() -> usize {
    5
}

fn default_max_top_k() -> usize {
    100
}

fn default_backend_timeout() -> u64 {
    2000
}

fn default_preview_chars() -> usize {
    240
}

fn default_rewrite_count() -> usize {
    2
}

fn default_max_rewrites() -> usize {
    3
}

fn default_transform_timeout() -> u64 {
    5000
}

fn default_max_results() -> usize {
    10
}

fn default_rerank_candidates() -> usize {
    20
}

fn default_short_query_tokens() -> usize {
    3
}

fn default_long_query_tokens() -> usize {
    18
}

fn default_connectives() -> Vec<String> {
    [
        "and",
        "versus",
        "vs",
        "compare",
        "compared",
        "difference between",
        "as well as",
        "also",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_min_decompose_tokens() -> usize {
    6
}

fn default_escalate_below() -> f32 {
    0.6
}

fn default_max_iterations() -> u32 {
    3
}

fn default_confidence_threshold() -> f32 {
    0.7
}

fn default_confidence_floor() -> f32 {
    0.4
}

fn default_top_k_growth() -> f32 {
    1.0
}

impl RagConfig {
    /// Load configuration from file.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| RagError::config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from default paths.
    pub fn load_default() -> Result<Self> {
        // Try user config first
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("rag-engine").join("config.toml");
            if user_config.exists() {
                return Self::load(&user_config);
            }
        }

        // Try local config
        let local_config = PathBuf::from("rag-engine.toml");
        if local_config.exists() {
            return Self::load(&local_config);
        }

        // Return defaults
        Ok(Self::default())
    }

    /// Serialize to TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| RagError::config(format!("Failed to serialize config: {}", e)))
    }

    /// Reject internally inconsistent settings.
    pub fn validate(&self) -> Result<()> {
        if self.retrieval.default_top_k == 0 || self.retrieval.max_top_k == 0 {
            return Err(RagError::config("top_k limits must be at least 1"));
        }
        if self.retrieval.default_top_k > self.retrieval.max_top_k {
            return Err(RagError::config("default_top_k exceeds max_top_k"));
        }
        if self.fusion.max_results == 0 {
            return Err(RagError::config("fusion.max_results must be at least 1"));
        }
        if self.transform.max_rewrites == 0 {
            return Err(RagError::config("transform.max_rewrites must be at least 1"));
        }
        if self.refine.max_iterations == 0 {
            return Err(RagError::config("refine.max_iterations must be at least 1"));
        }
        let bounded = |v: f32| (0.0..=1.0).contains(&v);
        if !bounded(self.refine.confidence_threshold)
            || !bounded(self.refine.confidence_floor)
            || !bounded(self.strategy.escalate_below)
        {
            return Err(RagError::config("confidence values must lie in [0, 1]"));
        }
        if self.refine.top_k_growth < 0.0 {
            return Err(RagError::config("refine.top_k_growth must not be negative"));
        }
        Ok(())
    }
}
