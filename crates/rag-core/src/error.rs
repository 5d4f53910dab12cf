//! Error types for the retrieval pipeline.

use thiserror::Error;

/// Result type alias using RagError.
pub type Result<T> = std::result::Result<T, RagError>;

/// Errors that can occur in the retrieval pipeline.
///
/// Only [`RagError::RetrievalFailed`], [`RagError::Cancelled`] and argument or
/// configuration errors reach the caller of a pipeline run. The remaining
/// collaborator failures are absorbed by the orchestrator and recorded as
/// trace annotations.
#[derive(Error, Debug)]
pub enum RagError {
    /// The query rewriting collaborator is unreachable.
    #[error("Query transform unavailable: {message}")]
    TransformUnavailable { message: String },

    /// A single retrieval backend failed or timed out.
    #[error("Backend {backend} unavailable: {message}")]
    BackendUnavailable { backend: String, message: String },

    /// Every active retrieval backend failed.
    #[error("Retrieval failed: all backends failed ({})", .failures.join("; "))]
    RetrievalFailed { failures: Vec<String> },

    /// The reranking collaborator is unreachable.
    #[error("Reranker unavailable: {message}")]
    RerankUnavailable { message: String },

    /// The generation collaborator failed.
    #[error("Generation failed: {message}")]
    GenerationFailed { message: String },

    /// The run was cancelled by the caller.
    #[error("Pipeline run cancelled")]
    Cancelled,

    /// Invalid argument provided.
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Internal error (unexpected).
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl RagError {
    /// Create a transform unavailable error.
    pub fn transform(message: impl Into<String>) -> Self {
        Self::TransformUnavailable {
            message: message.into(),
        }
    }

    /// Create a backend unavailable error.
    pub fn backend(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Create a rerank unavailable error.
    pub fn rerank(message: impl Into<String>) -> Self {
        Self::RerankUnavailable {
            message: message.into(),
        }
    }

    /// Create a generation error.
    pub fn generation(message: impl Into<String>) -> Self {
        Self::GenerationFailed {
            message: message.into(),
        }
    }

    /// Create an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the orchestrator can absorb this error with a local fallback.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::TransformUnavailable { .. }
                | Self::BackendUnavailable { .. }
                | Self::RerankUnavailable { .. }
                | Self::GenerationFailed { .. }
        )
    }

    /// Get the error code for API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::TransformUnavailable { .. } => "TRANSFORM_UNAVAILABLE",
            Self::BackendUnavailable { .. } => "BACKEND_UNAVAILABLE",
            Self::RetrievalFailed { .. } => "RETRIEVAL_FAILED",
            Self::RerankUnavailable { .. } => "RERANK_UNAVAILABLE",
            Self::GenerationFailed { .. } => "GENERATION_FAILED",
            Self::Cancelled => "CANCELLED",
            Self::InvalidArgument { .. } => "INVALID_ARGUMENT",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Config { .. } => "CONFIG_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}
