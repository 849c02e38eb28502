//! Isolated plugin loading for isoload.
//!
//! This crate loads a plugin module into its own [`IsolatedContext`], resolves
//! the module's dependencies privately first and through the process-wide
//! [`SharedRegistry`] otherwise, creates the plugin instance, and verifies that
//! the context is really released on unload.

pub mod binary;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod discovery;
pub mod error;
pub mod host;
pub mod resolver;
pub mod shared;
pub mod verifier;

pub use binary::{BinaryLoader, ModuleBinary, NativeBinaryLoader, StaticModule, StaticModuleLoader};
pub use config::{HostConfig, UnloadConfig};
pub use context::{
    BoundDependency, ContextLease, ContextState, IsolatedContext, LoadEnvironment, StillReferenced,
};
pub use descriptor::{DeploymentManifest, ModuleDescriptor};
pub use discovery::{PluginFactory, PluginInstance, find_plugin_type, instantiate};
pub use error::{HostError, InstantiationError, LoadError, Result};
pub use host::{HostState, PluginHost, ServiceCollaborator};
pub use resolver::{DependencyResolver, NativeTarget, Resolution};
pub use shared::{SharedDependency, SharedRegistry};
pub use verifier::{Liveness, UnloadOutcome, UnloadTicket, UnloadVerifier};

/// Re-exports commonly used types.
pub mod prelude {
    // Configuration
    pub use crate::config::{HostConfig, defaults, env_vars};

    // Error handling
    pub use crate::error::{HostError, InstantiationError, LoadError, Result};

    // Loading
    pub use crate::context::{IsolatedContext, LoadEnvironment};
    pub use crate::descriptor::ModuleDescriptor;
    pub use crate::shared::SharedRegistry;

    // Host
    pub use crate::host::{HostState, PluginHost, ServiceCollaborator};
    pub use crate::verifier::{UnloadOutcome, UnloadVerifier};

    // Plugin contract
    pub use isoload_plugin_sdk::{
        Plugin, RouteHandler, RouteRequest, RouteResponse, ServiceRegistrar,
    };
}
