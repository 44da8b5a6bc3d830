use std::path::PathBuf;

use crate::model::ChunkId;

pub type Result<T, E = RagError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum RagError {
    #[error("no chunks matched the selection ({filters}) and collection has no manifest")]
    EmptySelection { filters: String },

    #[error("embedding model '{model_id}' could not be resolved: {reason}")]
    ModelLoad { model_id: String, reason: String },

    #[error("embedding width mismatch: expected {expected}, got {actual}")]
    Dimensionality { expected: usize, actual: usize },

    #[error(
        "collection '{collection}' was built with model '{recorded}' but caller expected '{expected}'"
    )]
    ModelCoherence {
        collection: String,
        recorded: String,
        expected: String,
    },

    #[error("{backend} backend rejected item {position}: {reason}")]
    BackendAcceptance {
        backend: &'static str,
        position: usize,
        reason: String,
    },

    #[error(
        "build aborted during {stage} (selected={selected}, scheduled={scheduled}, embedded={embedded})"
    )]
    PartialBuildFailure {
        stage: &'static str,
        selected: usize,
        scheduled: usize,
        embedded: usize,
        #[source]
        source: Box<RagError>,
    },

    #[error("chunk {chunk_id} could not be resolved against the chunk store")]
    EnrichmentLookupMiss { chunk_id: ChunkId },

    #[error("collection '{collection}' not found for store '{store}' at {}", path.display())]
    CollectionNotFound {
        store: String,
        collection: String,
        path: PathBuf,
    },

    #[error("another build holds the lock at {}", path.display())]
    CollectionLocked { path: PathBuf },

    #[error("collection payload at {} is inconsistent: {reason}", path.display())]
    CorruptCollection { path: PathBuf, reason: String },

    #[error("embedding provider '{model_id}' failed: {message}")]
    Provider { model_id: String, message: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Regex(#[from] regex::Error),
}

impl RagError {
    /// Query-time errors the caller caused by asserting the wrong collection state
    /// (the HTTP-equivalent of 409 Conflict).
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ModelCoherence { .. })
    }

    /// Outcomes reported as errors that do not mean the build broke.
    pub fn is_informational(&self) -> bool {
        matches!(self, Self::EmptySelection { .. })
    }

    pub fn stage(&self) -> Option<&'static str> {
        match self {
            Self::PartialBuildFailure { stage, .. } => Some(stage),
            _ => None,
        }
    }
}
