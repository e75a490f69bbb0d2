/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No object is stored under the key.
    #[error("key not found: {0}")]
    NotFound(String),

    /// The key resolves to a path that cannot be stored safely.
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    /// I/O error from the underlying filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
