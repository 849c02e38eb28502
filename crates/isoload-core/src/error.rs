//! Error types for module loading and plugin instantiation.
//!
//! Unload is not an error channel: a context that could not be confirmed
//! released is reported as [`UnloadOutcome::Stuck`](crate::verifier::UnloadOutcome).

use std::path::PathBuf;

use crate::host::HostState;

/// Errors raised while loading a module into an isolated context.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Module binary not found: {}", .0.display())]
    PathNotFound(PathBuf),

    #[error("Invalid module binary {}: {reason}", path.display())]
    BinaryInvalid { path: PathBuf, reason: String },

    #[error("Unresolved dependency '{id}' (searched {searched:?})")]
    DependencyUnresolved { id: String, searched: Vec<PathBuf> },

    #[error("Invalid deployment manifest {}: {reason}", path.display())]
    ManifestInvalid { path: PathBuf, reason: String },

    #[error("Context '{0}' is unloading; no further dependency lookups are allowed")]
    ContextUnloading(String),
}

/// Errors raised while discovering or creating the plugin instance.
#[derive(Debug, thiserror::Error)]
pub enum InstantiationError {
    #[error("No plugin entry point found in module '{0}'")]
    NoPluginFound(String),

    #[error("Plugin ABI mismatch: expected {expected}, found {found}")]
    AbiMismatch { expected: u32, found: u32 },

    #[error("Plugin constructor failed in module '{0}'")]
    ConstructorFailed(String),

    #[error("Plugin failed to attach: {0}")]
    AttachFailed(String),
}

/// Errors surfaced by the host orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("Invalid host state: expected {expected:?}, found {found:?}")]
    InvalidState { expected: HostState, found: HostState },

    #[error("A service collaborator is already attached")]
    AlreadyAttached,

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Instantiation(#[from] InstantiationError),

    #[error("Service collaborator error: {0}")]
    Collaborator(#[from] std::io::Error),
}

/// Result type for host operations.
pub type Result<T> = std::result::Result<T, HostError>;
