//! Plugin error types.

/// Plugin error type
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// Attaching to the host service failed
    #[error("Attach failed: {0}")]
    AttachFailed(String),

    /// A route name was rejected
    #[error("Invalid route: {0}")]
    InvalidRoute(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Custom error
    #[error("{0}")]
    Custom(String),
}

/// Plugin result type
pub type PluginResult<T> = Result<T, PluginError>;

impl From<serde_json::Error> for PluginError {
    fn from(err: serde_json::Error) -> Self {
        PluginError::SerializationError(err.to_string())
    }
}
