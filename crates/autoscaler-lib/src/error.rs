//! Error types for the node-group engine and the recommender

use thiserror::Error;

/// Result type alias for provider adapter and engine operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors surfaced by provider adapters and the node-group engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Network failure or HTTP 5xx. The next tick retries.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// HTTP 4xx or invalid parameters.
    #[error("provider rejected request: {0}")]
    Rejected(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The provider-side object is in a status that does not accept updates.
    #[error("can not mutate: status is {status}")]
    StatusBlocked { status: String },

    #[error("{0}")]
    InvariantViolated(String),

    /// A node reference could not be mapped back to a minion index.
    #[error("could not resolve nodes: {0}")]
    Resolution(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
}

impl ProviderError {
    /// Returns true for failures that may succeed on the next tick without
    /// any change to the request.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Unavailable(_)
                | ProviderError::StatusBlocked { .. }
                | ProviderError::Timeout(_)
        )
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Unavailable(_) => "unavailable",
            ProviderError::Rejected(_) => "rejected",
            ProviderError::NotFound(_) => "not_found",
            ProviderError::StatusBlocked { .. } => "status_blocked",
            ProviderError::InvariantViolated(_) => "invariant_violated",
            ProviderError::Resolution(_) => "resolution",
            ProviderError::Timeout(_) => "timeout",
            ProviderError::NotImplemented(_) => "not_implemented",
        }
    }
}

/// Errors raised by the recommender cluster model.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ModelError {
    #[error("pod {0} is not present in the model")]
    PodNotFound(String),

    #[error("container {0} is not present in the model")]
    ContainerNotFound(String),

    #[error("vertical scaler {0} is not present in the model")]
    ScalerNotFound(String),

    #[error("sample discarded: {0}")]
    SampleDiscarded(String),

    #[error("OOM event discarded: {0}")]
    OomDiscarded(String),

    #[error("unsupported checkpoint version {0}")]
    CheckpointVersion(String),

    #[error("invalid checkpoint: {0}")]
    InvalidCheckpoint(String),
}

impl ModelError {
    /// Key errors are expected in memory-saver mode where not every pod is tracked.
    pub fn is_key_error(&self) -> bool {
        matches!(
            self,
            ModelError::PodNotFound(_) | ModelError::ContainerNotFound(_)
        )
    }
}

/// Errors raised by checkpoint storage.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("checkpoint not found: {0}")]
    NotFound(String),

    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),
}
