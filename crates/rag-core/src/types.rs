//! Core domain types for the retrieval pipeline.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use ulid::Ulid;

/// Retrieval backend that produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Vector,
    Keyword,
}

impl Source {
    /// Stable lowercase name, used in stage names and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vector => "vector",
            Self::Keyword => "keyword",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a rewritten query relates to the user's query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewriteKind {
    /// The raw query text, passed through unchanged.
    Original,
    Rewrite,
    Expansion,
    DecompositionPart,
}

/// Retrieval strategy chosen for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    VectorOnly,
    Hybrid,
    Decomposed,
    SelfRefine,
}

impl Strategy {
    /// Whether the strategy can use the keyword backend.
    pub fn uses_keyword(&self) -> bool {
        !matches!(self, Self::VectorOnly)
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::VectorOnly => "vector_only",
            Self::Hybrid => "hybrid",
            Self::Decomposed => "decomposed",
            Self::SelfRefine => "self_refine",
        };
        write!(f, "{}", s)
    }
}

/// Requested retrieval mode. `Auto` defers to the strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Auto,
    VectorOnly,
    Hybrid,
    Decomposed,
    SelfRefine,
}

impl Mode {
    /// The fixed strategy for explicit modes, `None` for `Auto`.
    pub fn strategy(&self) -> Option<Strategy> {
        match self {
            Self::Auto => None,
            Self::VectorOnly => Some(Strategy::VectorOnly),
            Self::Hybrid => Some(Strategy::Hybrid),
            Self::Decomposed => Some(Strategy::Decomposed),
            Self::SelfRefine => Some(Strategy::SelfRefine),
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = crate::error::RagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "auto" => Ok(Self::Auto),
            "vector_only" | "vector" => Ok(Self::VectorOnly),
            "hybrid" => Ok(Self::Hybrid),
            "decomposed" | "decompose" => Ok(Self::Decomposed),
            "self_refine" | "refine" => Ok(Self::SelfRefine),
            other => Err(crate::error::RagError::invalid_argument(format!(
                "unknown mode: {}",
                other
            ))),
        }
    }
}

/// Fusion method used to merge candidate lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionMethod {
    /// Per-list min-max normalization, summed across lists.
    #[default]
    NormalizeSum,
    /// Normalize-sum fusion followed by an external reranking pass.
    Rerank,
}

/// Decision taken after assessing one self-refinement pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accept,
    RetrieveAgain,
    AbortBudget,
}

impl Decision {
    /// Whether this decision ends the loop.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::RetrieveAgain)
    }
}

/// A user query. Created once at pipeline entry and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Unique identifier (ULID).
    pub id: Ulid,

    /// Text as received from the caller.
    pub raw_text: String,

    /// Issue timestamp (Unix millis).
    pub issued_at: u64,
}

impl Query {
    /// Create a new query stamped with the current time.
    pub fn new(raw_text: &str) -> Self {
        Self {
            id: Ulid::new(),
            raw_text: raw_text.to_string(),
            issued_at: unix_millis(),
        }
    }

    /// Whitespace-separated token count.
    pub fn token_count(&self) -> usize {
        self.raw_text.split_whitespace().count()
    }
}

/// A retrieval query derived from a [`Query`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewrittenQuery {
    /// Unique identifier (ULID).
    pub id: Ulid,

    /// Query text sent to the backends.
    pub text: String,

    /// The query this was derived from.
    pub origin_query_id: Ulid,

    pub kind: RewriteKind,

    /// Position within the transformer output (0-based).
    pub sequence_index: u32,
}

impl RewrittenQuery {
    /// Create a rewritten query for `origin`.
    pub fn new(origin: &Query, text: &str, kind: RewriteKind, sequence_index: u32) -> Self {
        Self {
            id: Ulid::new(),
            text: text.to_string(),
            origin_query_id: origin.id,
            kind,
            sequence_index,
        }
    }

    /// The raw query passed through unchanged.
    pub fn passthrough(origin: &Query) -> Self {
        Self::new(origin, &origin.raw_text, RewriteKind::Original, 0)
    }
}

/// Deduplication key of a candidate: `(document_id, chunk_index)`.
pub type ChunkKey = (String, u32);

/// A scored chunk returned by one backend for one rewritten query.
///
/// `raw_score` is backend-specific and not comparable across backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub document_id: String,

    /// Index within the document (0-based).
    pub chunk_index: u32,

    /// Truncated chunk text for display.
    pub text_preview: String,

    /// Full chunk text, handed to the reranker and the generator.
    #[serde(skip)]
    pub text: String,

    pub source: Source,

    pub raw_score: f32,

    /// Id of the [`RewrittenQuery`] that retrieved this candidate.
    pub origin_query_id: Ulid,

    /// Sequence index of that rewritten query, used for tie-breaking.
    pub origin_sequence: u32,
}

impl Candidate {
    /// Deduplication key.
    pub fn key(&self) -> ChunkKey {
        (self.document_id.clone(), self.chunk_index)
    }
}

/// A fused and ranked candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedResult {
    /// Copy of the first-seen candidate for this chunk.
    pub candidate: Candidate,

    /// Backends whose lists contained this chunk, in first-seen order.
    pub sources: Vec<Source>,

    pub fused_score: f32,

    /// Reranker score, present only after a successful rerank pass.
    pub rerank_score: Option<f32>,

    /// 1-based rank.
    pub final_rank: u32,
}

impl RankedResult {
    /// Score used for ordering: the rerank score when present.
    pub fn ranking_score(&self) -> f32 {
        self.rerank_score.unwrap_or(self.fused_score)
    }
}

/// One pass of the self-refinement loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    /// Pass index, starting at 0.
    pub iteration_index: u32,

    pub ranked_results: Vec<RankedResult>,

    /// Confidence in `[0, 1]`.
    pub confidence: f32,

    pub decision: Decision,
}

/// A timed pipeline stage with its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEvent {
    pub stage_name: String,

    /// Offset from the trace start.
    #[serde(with = "serde_micros")]
    pub started_at: Duration,

    /// Offset from the trace start, never before `started_at`.
    #[serde(with = "serde_micros")]
    pub ended_at: Duration,

    pub payload: serde_json::Value,

    /// Degradations absorbed by this stage (fallbacks, failures, timeouts).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<String>,
}

impl StageEvent {
    /// Wall time spent in the stage.
    pub fn duration(&self) -> Duration {
        self.ended_at.saturating_sub(self.started_at)
    }
}

/// Full instrumentation record of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineTrace {
    pub query_id: Ulid,

    /// Wall-clock start of the trace (Unix millis).
    pub started_at_ms: u64,

    /// Stage events in start order.
    pub stage_events: Vec<StageEvent>,
}

impl PipelineTrace {
    /// First event with the given stage name.
    pub fn stage(&self, stage_name: &str) -> Option<&StageEvent> {
        self.stage_events.iter().find(|e| e.stage_name == stage_name)
    }

    /// All annotations, prefixed with the stage that recorded them.
    pub fn annotations(&self) -> Vec<String> {
        self.stage_events
            .iter()
            .flat_map(|e| {
                e.annotations
                    .iter()
                    .map(move |a| format!("{}: {}", e.stage_name, a))
            })
            .collect()
    }

    /// Whether any stage recorded a degradation.
    pub fn is_degraded(&self) -> bool {
        self.stage_events.iter().any(|e| !e.annotations.is_empty())
    }

    /// Per-stage durations in start order.
    pub fn timing_breakdown(&self) -> Vec<(String, Duration)> {
        self.stage_events
            .iter()
            .map(|e| (e.stage_name.clone(), e.duration()))
            .collect()
    }
}

/// Current time in Unix milliseconds.
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Helper module for serializing durations as integer microseconds.
mod serde_micros {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_micros() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let micros = u64::deserialize(deserializer)?;
        Ok(Duration::from_micros(micros))
    }
}
