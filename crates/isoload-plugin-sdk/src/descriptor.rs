//! Plugin entry point definition.
//!
//! Every plugin module exports one static named [`PLUGIN_ENTRY_SYMBOL`] of type
//! [`PluginEntry`]. The host looks the symbol up after opening the library; a
//! module without it is not a plugin.

use std::panic;
use std::ptr;

use crate::types::Plugin;

/// Plugin ABI version (must match the host)
pub const PLUGIN_ABI_VERSION: u32 = 1;

/// Name of the exported entry point symbol.
pub const PLUGIN_ENTRY_SYMBOL: &str = "isoload_plugin_entry";

/// The boxed trait object handed across the module boundary.
pub type PluginBox = Box<dyn Plugin>;

/// Function type for creating the plugin instance.
/// Returns null if construction failed.
#[allow(improper_ctypes_definitions)]
pub type PluginCreateFn = unsafe extern "C" fn() -> *mut PluginBox;

/// Function type for destroying a plugin instance inside the module that created it.
#[allow(improper_ctypes_definitions)]
pub type PluginDestroyFn = unsafe extern "C" fn(instance: *mut PluginBox);

/// Entry point exported by plugin modules.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PluginEntry {
    /// ABI version - must match PLUGIN_ABI_VERSION
    pub abi_version: u32,

    /// Pointer to the create function
    pub create: PluginCreateFn,

    /// Pointer to the destroy function
    pub destroy: PluginDestroyFn,
}

impl PluginEntry {
    /// Entry point constructing `P` through its `Default` impl.
    pub const fn of<P: Plugin + Default + 'static>() -> Self {
        Self {
            abi_version: PLUGIN_ABI_VERSION,
            create: create_plugin::<P>,
            destroy: destroy_plugin,
        }
    }

    /// Override the ABI version. Only useful for exercising host-side checks.
    pub const fn with_abi_version(mut self, abi_version: u32) -> Self {
        self.abi_version = abi_version;
        self
    }
}

/// Construct `P` and leak it as a raw [`PluginBox`] pointer.
///
/// Panics raised by `P::default()` are caught and reported as null, so they
/// never unwind across the module boundary.
///
/// # Safety
/// The returned pointer must be released with [`destroy_plugin`] from the same module.
#[allow(improper_ctypes_definitions)]
pub unsafe extern "C" fn create_plugin<P: Plugin + Default + 'static>() -> *mut PluginBox {
    match panic::catch_unwind(P::default) {
        Ok(plugin) => {
            let boxed: PluginBox = Box::new(plugin);
            Box::into_raw(Box::new(boxed))
        }
        Err(_) => ptr::null_mut(),
    }
}

/// Release an instance created by [`create_plugin`].
///
/// # Safety
/// `instance` must come from [`create_plugin`] of the same module and must not be used afterwards.
#[allow(improper_ctypes_definitions)]
pub unsafe extern "C" fn destroy_plugin(instance: *mut PluginBox) {
    if instance.is_null() {
        return;
    }
    // SAFETY: caller guarantees `instance` was produced by `Box::into_raw` in `create_plugin`.
    let boxed = unsafe { Box::from_raw(instance) };
    let _ = panic::catch_unwind(panic::AssertUnwindSafe(move || drop(boxed)));
}
