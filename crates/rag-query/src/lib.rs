//! rag-query - Retrieval and ranking pipeline
//!
//! This crate turns a user query into a ranked context list by combining
//! query rewriting, concurrent vector and keyword retrieval, score fusion,
//! optional reranking, and a bounded self-refinement loop.
//!
//! # Features
//!
//! - Strategy selection (`vector_only`, `hybrid`, `decomposed`, `self_refine`)
//! - Concurrent fan-out with per-backend timeouts and graceful degradation
//! - Min-max normalized score fusion with cross-backend deduplication
//! - Confidence-driven refinement with a hard iteration budget
//! - Structured stage trace and an optional debug event stream
//!
//! # Example
//!
//! ```rust,ignore
//! use rag_query::Pipeline;
//! use rag_core::{RagConfig, RunOptions};
//! use std::sync::Arc;
//!
//! let pipeline = Pipeline::builder(RagConfig::default(), Arc::new(vector_index))
//!     .keyword_index(Arc::new(keyword_index))
//!     .build();
//! let output = pipeline.run("error handling", &RunOptions::default()).await?;
//! ```

mod engine;
mod fusion;
mod refine;
mod retrieve;
mod strategy;
mod trace;
mod transform;

#[cfg(test)]
mod testing;

pub use engine::{Pipeline, PipelineBuilder, PipelineOutput};
pub use fusion::{contributing_sources, fuse, rerank, truncate_fused};
pub use refine::{clamp_confidence, HeuristicConfidence, LoopState, RefineLoop};
pub use retrieve::{
    fan_out, BackendFailure, CandidateList, FanOut, KeywordRetriever, Retriever, VectorRetriever,
};
pub use strategy::HeuristicSelector;
pub use trace::{
    ChannelSink, ChunksSnapshot, CollectingSink, Emitter, EventSink, QuerySnapshot, StageId,
    StageTiming, TimingSnapshot, TraceEvent,
};
pub use transform::{QueryTransformer, TransformMode};

// Re-export for convenience
pub use rag_core::{RagConfig, RunOptions};
