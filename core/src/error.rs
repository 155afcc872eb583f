use thiserror::Error;

/// Pack error types
#[derive(Error, Debug)]
pub enum PackError {
    /// Image reference could not be parsed
    #[error("Invalid image reference: {0}")]
    InvalidReference(String),

    /// Invalid user input (paths, flags, buildpack specifiers)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Registry rejected our credentials
    #[error("Unauthorized: {registry} - {message}")]
    Unauthorized { registry: String, message: String },

    /// Image, blob or manifest does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Network or server failure talking to a registry
    #[error("Transport failure: {registry} - {message}")]
    TransportFailure { registry: String, message: String },

    /// No buildpack group passed detection
    #[error("No buildpack group satisfied detection")]
    NoSatisfyingGroup,

    /// A buildpack exited with an error
    #[error("Buildpack '{id}' failed with exit code {code}")]
    BuildpackFailed { id: String, code: i64 },

    /// Image assembly or publication failed after a successful build
    #[error("Export failed: {0}")]
    ExportFailed(String),

    /// Image belongs to a different stack than the run image
    #[error("Stack mismatch: image is built on '{image}', run image is for '{expected}'")]
    StackMismatch { image: String, expected: String },

    /// Run image could not be resolved
    #[error("Run image not found: {0}")]
    RunImageNotFound(String),

    /// Application layers referenced by the image are gone from the registry
    #[error("Application layers missing from {repository}: {}", digests.join(", "))]
    ApplicationLayersMissing {
        repository: String,
        digests: Vec<String>,
    },

    /// Another build holds the cache volume
    #[error("Cache volume '{0}' is in use by another build")]
    CacheBusy(String),

    /// No default stack configured
    #[error("No default stack configured")]
    NoDefaultStack,

    /// Persisted configuration violates its invariants
    #[error("Configuration is corrupt: {0}")]
    ConfigCorrupt(String),

    /// Stack id not present in the configuration
    #[error("Stack '{0}' does not exist")]
    UnknownStack(String),

    /// Stack id already present in the configuration
    #[error("Stack '{0}' already exists")]
    StackExists(String),

    /// Stack definition is malformed
    #[error("Invalid stack: {0}")]
    InvalidStack(String),

    /// Container engine failure
    #[error("Container engine error: {0}")]
    Daemon(String),

    /// The operation's cancellation token fired
    #[error("Operation cancelled")]
    Cancelled,

    /// The whole-operation deadline passed
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl PackError {
    /// Process exit code for this error.
    ///
    /// 1 user error, 2 build failure, 3 transport failure, 4 cache busy.
    pub fn exit_code(&self) -> i32 {
        match self {
            PackError::InvalidReference(_)
            | PackError::InvalidInput(_)
            | PackError::UnknownStack(_)
            | PackError::StackExists(_)
            | PackError::InvalidStack(_)
            | PackError::NoDefaultStack
            | PackError::ConfigCorrupt(_)
            | PackError::StackMismatch { .. } => 1,

            PackError::TransportFailure { .. }
            | PackError::Unauthorized { .. }
            | PackError::NotFound(_)
            | PackError::DeadlineExceeded(_) => 3,

            PackError::CacheBusy(_) => 4,

            PackError::Cancelled => 130,

            PackError::NoSatisfyingGroup
            | PackError::BuildpackFailed { .. }
            | PackError::ExportFailed(_)
            | PackError::RunImageNotFound(_)
            | PackError::ApplicationLayersMissing { .. }
            | PackError::Daemon(_)
            | PackError::IoError(_)
            | PackError::SerializationError(_)
            | PackError::Other(_) => 2,
        }
    }

    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PackError::TransportFailure { .. })
    }

    /// Whether the error means the operation was interrupted rather than failed.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, PackError::Cancelled | PackError::DeadlineExceeded(_))
    }
}

impl From<serde_json::Error> for PackError {
    fn from(err: serde_json::Error) -> Self {
        PackError::SerializationError(err.to_string())
    }
}

impl From<toml::de::Error> for PackError {
    fn from(err: toml::de::Error) -> Self {
        PackError::SerializationError(err.to_string())
    }
}

impl From<toml::ser::Error> for PackError {
    fn from(err: toml::ser::Error) -> Self {
        PackError::SerializationError(err.to_string())
    }
}

/// Result type alias for pack operations
pub type Result<T> = std::result::Result<T, PackError>;
