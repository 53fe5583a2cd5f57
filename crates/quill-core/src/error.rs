//! Error types for Quill Core.

use thiserror::Error;

/// Result type alias for Quill operations.
pub type Result<T> = std::result::Result<T, QuillError>;

/// Errors that can occur in Quill operations.
///
/// Every variant signals a programming or configuration mistake; none of
/// them is transient, so nothing in the crate retries on error.
#[derive(Error, Debug)]
pub enum QuillError {
    /// The configuration asks for an architectural combination that is not
    /// implemented.
    #[error("configuration unsupported: {0}")]
    ConfigurationUnsupported(String),

    /// A sequence or active length exceeds what the model can attend to.
    #[error("sequence of length {requested} exceeds the limit of {limit}")]
    SequenceTooLong {
        /// Requested length.
        requested: usize,
        /// Largest length allowed.
        limit: usize,
    },

    /// Incremental decoding was requested before the caches were built.
    #[error("cache not initialized: {0}")]
    CacheNotInitialized(String),

    /// A partial rotary span needs an explicit rotary cache length.
    #[error("rope cache length is required when only part of each head is rotated")]
    MissingRopeCacheLength,

    /// Shape mismatch error.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// I/O error.
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    /// Candle tensor error.
    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::Error),
}

impl QuillError {
    /// Shorthand for a [`QuillError::ConfigurationUnsupported`].
    pub(crate) fn unsupported(msg: impl Into<String>) -> Self {
        Self::ConfigurationUnsupported(msg.into())
    }
}
