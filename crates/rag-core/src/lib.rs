//! rag-core - Core types and traits for the retrieval pipeline
//!
//! This crate provides the data model, error taxonomy, configuration, and
//! the collaborator interfaces (indexes, reranker, rewriter, generator)
//! used throughout the workspace.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::*;
pub use error::{RagError, Result};
pub use traits::*;
pub use types::*;
