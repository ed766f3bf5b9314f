use thiserror::Error;

/// Main error type for artifact cache operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// A required argument was missing or malformed
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Capacity exceeded: requested {requested} bytes, {available} bytes available")]
    CapacityExceeded { requested: u64, available: u64 },

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// The loader produced an artifact that violates the artifact contract
    #[error("Malformed artifact {id}: {reason}")]
    MalformedArtifact { id: String, reason: String },

    #[error("Load failed for {id}: {reason}")]
    LoadFailed { id: String, reason: String },
}

impl CacheError {
    /// Stable short name of the error kind, used as a metrics label
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::Configuration(_) => "configuration",
            Self::MalformedArtifact { .. } => "malformed_artifact",
            Self::LoadFailed { .. } => "load_failed",
        }
    }

    /// Whether the caller can recover by evicting or reconfiguring
    pub fn is_capacity_related(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. } | Self::Configuration(_))
    }
}

/// Result type alias for artifact cache operations
pub type Result<T> = std::result::Result<T, CacheError>;
