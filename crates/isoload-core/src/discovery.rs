//! Plugin discovery and instantiation.
//!
//! A module qualifies as a plugin by exporting the entry point symbol
//! generated by `export_plugin!`. There is exactly one candidate per module, so
//! discovery is a symbol lookup rather than a scan.

use std::fmt::{self, Display, Formatter};
use std::ptr::NonNull;

use isoload_plugin_sdk::{PLUGIN_ABI_VERSION, Plugin, PluginBox, PluginDestroyFn, PluginEntry};

use crate::context::{ContextLease, IsolatedContext};
use crate::error::InstantiationError;

/// The plugin entry point of a loaded module.
#[derive(Debug)]
pub struct PluginFactory {
    module: String,
    entry: PluginEntry,
    lease: ContextLease,
}

impl PluginFactory {
    /// Name of the module exporting this factory.
    pub fn module(&self) -> &str {
        &self.module
    }
}

/// Look up the plugin entry point of `context`'s module.
pub fn find_plugin_type(context: &IsolatedContext) -> Result<PluginFactory, InstantiationError> {
    let no_plugin = || InstantiationError::NoPluginFound(context.name().to_string());
    let module = context.module();

    // The version decides whether the rest of the entry can be read at all
    let abi_version = module.abi_version().ok_or_else(no_plugin)?;
    if abi_version != PLUGIN_ABI_VERSION {
        return Err(InstantiationError::AbiMismatch {
            expected: PLUGIN_ABI_VERSION,
            found: abi_version,
        });
    }
    let entry = module.plugin_entry().ok_or_else(no_plugin)?;

    Ok(PluginFactory {
        module: context.name().to_string(),
        entry,
        lease: context.lease(),
    })
}

/// Create the plugin instance.
pub fn instantiate(factory: PluginFactory) -> Result<PluginInstance, InstantiationError> {
    // SAFETY: the entry point comes from a module kept open by `factory.lease`.
    let raw = unsafe { (factory.entry.create)() };
    let raw = NonNull::new(raw)
        .ok_or_else(|| InstantiationError::ConstructorFailed(factory.module.clone()))?;

    let instance = PluginInstance {
        raw,
        destroy: factory.entry.destroy,
        module: factory.module,
        lease: factory.lease,
    };
    tracing::info!("Created plugin instance {}", instance);
    Ok(instance)
}

/// The single plugin object created from a loaded module.
///
/// Holds a lease on its context: while an instance exists, the module cannot be
/// released.
pub struct PluginInstance {
    raw: NonNull<PluginBox>,
    destroy: PluginDestroyFn,
    module: String,
    // Dropped after `raw` is destroyed.
    lease: ContextLease,
}

// SAFETY: `PluginBox` is `Box<dyn Plugin>` and `Plugin: Send + Sync`; the pointer
// is uniquely owned by this instance.
unsafe impl Send for PluginInstance {}
unsafe impl Sync for PluginInstance {}

impl PluginInstance {
    pub fn plugin(&self) -> &dyn Plugin {
        // SAFETY: `raw` stays valid until `drop`, and the lease keeps the module code loaded.
        unsafe { &**self.raw.as_ptr() }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    /// A further lease on the owning context.
    pub fn lease(&self) -> ContextLease {
        self.lease.clone()
    }
}

impl Display for PluginInstance {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let plugin = self.plugin();
        write!(f, "{} v{} ({})", plugin.name(), plugin.version(), self.module)
    }
}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginInstance")
            .field("name", &self.plugin().name())
            .field("module", &self.module)
            .finish()
    }
}

impl Drop for PluginInstance {
    fn drop(&mut self) {
        tracing::debug!("Destroying plugin instance from {}", self.module);
        // SAFETY: `raw` came from the module's create function and is destroyed exactly once.
        unsafe { (self.destroy)(self.raw.as_ptr()) };
    }
}
