use std::time::Duration;

use thiserror::Error;

/// Failure taxonomy shared by every guidedb crate.
///
/// Variants carry rendered messages rather than source errors so the type stays
/// `Clone`: one failed embedding computation is handed to every caller that was
/// coalesced onto it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    #[error("Chunking failed: {0}")]
    Chunking(String),

    #[error("Embedding model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Embedding failed: {0}")]
    Embedding(String),

    #[error("Embedding cache corrupted: {0}")]
    CacheCorruption(String),

    #[error("Vector index inconsistent: {0}")]
    IndexInconsistency(String),

    #[error("Retrieval exceeded its {0:?} budget")]
    RetrievalTimeout(Duration),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    /// Background indexing retries these with backoff; everything else settles the job.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::ModelUnavailable(_) | Error::Embedding(_) | Error::Storage(_))
    }

    pub fn storage(err: impl std::fmt::Display) -> Self { Error::Storage(err.to_string()) }

    pub fn embedding(err: impl std::fmt::Display) -> Self { Error::Embedding(err.to_string()) }
}

pub type Result<T> = std::result::Result<T, Error>;
