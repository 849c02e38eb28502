//! Opening module binaries.
//!
//! [`BinaryLoader`] is the seam between the isolated context and the platform
//! loader. [`NativeBinaryLoader`] opens real dynamic libraries through
//! `libloading`; [`StaticModuleLoader`] serves modules linked into the host
//! process, keyed by the path of a placeholder file on disk.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use isoload_plugin_sdk::{PLUGIN_ABI_VERSION, PLUGIN_ENTRY_SYMBOL, PluginEntry};
use libloading::{Library, Symbol};
use parking_lot::Mutex;

use crate::error::LoadError;

/// A module binary opened by a [`BinaryLoader`]. Dropping it releases the handle.
pub trait ModuleBinary: Send + Sync {
    /// Path the binary was opened from.
    fn path(&self) -> &Path;

    /// ABI version of the exported entry point, if any.
    ///
    /// Only the leading version field is read, so this is safe to call on
    /// entry points built against another ABI.
    fn abi_version(&self) -> Option<u32>;

    /// The exported plugin entry point, if any and if its ABI version matches
    /// [`PLUGIN_ABI_VERSION`].
    fn plugin_entry(&self) -> Option<PluginEntry>;
}

/// Opens module binaries and native libraries.
pub trait BinaryLoader: Send + Sync {
    /// Open a binary at an explicit path.
    fn open(&self, path: &Path) -> Result<Box<dyn ModuleBinary>, LoadError>;

    /// Open a native library by bare name, using the platform search path.
    fn open_system(&self, name: &str) -> Result<Box<dyn ModuleBinary>, LoadError>;
}

/// Platform file name for a library, e.g. `libcodec.so` or `codec.dll`.
pub fn library_file_name(name: &str) -> String {
    format!(
        "{}{}{}",
        std::env::consts::DLL_PREFIX,
        name,
        std::env::consts::DLL_SUFFIX
    )
}

/// Whether a path has the platform's dynamic library extension.
pub fn is_module_file(path: &Path) -> bool {
    path.extension() == Some(OsStr::new(std::env::consts::DLL_EXTENSION))
}

// ============================================================================
// Native libraries
// ============================================================================

/// Loader backed by the platform dynamic loader.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeBinaryLoader;

impl NativeBinaryLoader {
    pub fn new() -> Self {
        Self
    }
}

impl BinaryLoader for NativeBinaryLoader {
    fn open(&self, path: &Path) -> Result<Box<dyn ModuleBinary>, LoadError> {
        if !path.exists() {
            return Err(LoadError::PathNotFound(path.to_path_buf()));
        }

        // SAFETY: opening a library runs its initializers; modules are trusted by deployment.
        let library = unsafe { Library::new(path) }.map_err(|e| LoadError::BinaryInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        tracing::debug!("Opened library {}", path.display());
        Ok(Box::new(NativeBinary {
            path: path.to_path_buf(),
            library,
        }))
    }

    fn open_system(&self, name: &str) -> Result<Box<dyn ModuleBinary>, LoadError> {
        let file_name = libloading::library_filename(name);

        // SAFETY: see `open`.
        let library =
            unsafe { Library::new(&file_name) }.map_err(|e| LoadError::BinaryInvalid {
                path: PathBuf::from(&file_name),
                reason: e.to_string(),
            })?;

        tracing::debug!("Opened system library {}", name);
        Ok(Box::new(NativeBinary {
            path: PathBuf::from(file_name),
            library,
        }))
    }
}

struct NativeBinary {
    path: PathBuf,
    library: Library,
}

impl ModuleBinary for NativeBinary {
    fn path(&self) -> &Path {
        &self.path
    }

    fn abi_version(&self) -> Option<u32> {
        let entry = self.entry_symbol()?;
        // SAFETY: non-null and valid while the library stays open.
        Some(unsafe { entry_abi_version(entry) })
    }

    fn plugin_entry(&self) -> Option<PluginEntry> {
        let entry = self.entry_symbol()?;
        // SAFETY: non-null and valid while the library stays open.
        unsafe { read_entry(entry) }
    }
}

impl NativeBinary {
    fn entry_symbol(&self) -> Option<*const PluginEntry> {
        // SAFETY: the SDK exports this symbol as a `#[repr(C)]` static whose first
        // field is the `u32` ABI version.
        let symbol: Symbol<*const PluginEntry> =
            unsafe { self.library.get(PLUGIN_ENTRY_SYMBOL.as_bytes()) }.ok()?;
        let entry = *symbol;
        (!entry.is_null()).then_some(entry)
    }
}

/// Read the leading ABI version of an exported entry point.
///
/// # Safety
/// `entry` must point to readable memory starting with an aligned `u32`.
unsafe fn entry_abi_version(entry: *const PluginEntry) -> u32 {
    unsafe { entry.cast::<u32>().read() }
}

/// Copy an exported entry point out, once its ABI version is known to match.
///
/// The rest of the layout is only trusted for the host's own ABI version.
///
/// # Safety
/// Same as [`entry_abi_version`]; when the version matches, `entry` must point
/// to a whole `PluginEntry`.
unsafe fn read_entry(entry: *const PluginEntry) -> Option<PluginEntry> {
    if unsafe { entry_abi_version(entry) } != PLUGIN_ABI_VERSION {
        return None;
    }
    Some(unsafe { entry.read() })
}

impl Drop for NativeBinary {
    fn drop(&mut self) {
        tracing::debug!("Closing library {}", self.path.display());
    }
}

// ============================================================================
// Statically linked modules
// ============================================================================

/// A module compiled into the host process.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticModule {
    entry: Option<PluginEntry>,
}

impl StaticModule {
    /// A module without a plugin entry point (a plain dependency).
    pub fn library() -> Self {
        Self { entry: None }
    }

    /// A module exporting the given entry point.
    pub fn exporting(entry: PluginEntry) -> Self {
        Self { entry: Some(entry) }
    }
}

#[derive(Default)]
struct HandleCounts {
    open: HashMap<PathBuf, usize>,
    total: HashMap<PathBuf, usize>,
}

/// Loader for statically linked modules.
///
/// Each module is registered against a file path; the file must exist when it
/// is opened, but its contents are never read. Open handles are counted so
/// callers can observe when every handle to a module has been released.
#[derive(Default)]
pub struct StaticModuleLoader {
    modules: Mutex<HashMap<PathBuf, StaticModule>>,
    system: Mutex<HashMap<String, StaticModule>>,
    counts: Arc<Mutex<HandleCounts>>,
}

impl StaticModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module served when `path` is opened.
    pub fn register(&self, path: impl AsRef<Path>, module: StaticModule) -> &Self {
        self.modules.lock().insert(key(path.as_ref()), module);
        self
    }

    /// Register a module served when the bare system library `name` is opened.
    pub fn register_system(&self, name: impl Into<String>, module: StaticModule) -> &Self {
        self.system.lock().insert(name.into(), module);
        self
    }

    /// Number of handles to `path` currently open.
    pub fn open_handles(&self, path: impl AsRef<Path>) -> usize {
        let counts = self.counts.lock();
        counts.open.get(&key(path.as_ref())).copied().unwrap_or(0)
    }

    /// Number of times `path` has been opened.
    pub fn total_opens(&self, path: impl AsRef<Path>) -> usize {
        let counts = self.counts.lock();
        counts.total.get(&key(path.as_ref())).copied().unwrap_or(0)
    }

    /// Number of handles currently open across all modules.
    pub fn open_handle_count(&self) -> usize {
        self.counts.lock().open.values().sum()
    }

    fn handle(&self, path: PathBuf, module: StaticModule) -> Box<dyn ModuleBinary> {
        {
            let mut counts = self.counts.lock();
            *counts.open.entry(path.clone()).or_default() += 1;
            *counts.total.entry(path.clone()).or_default() += 1;
        }
        Box::new(StaticBinary {
            path,
            entry: module.entry,
            counts: self.counts.clone(),
        })
    }
}

impl BinaryLoader for StaticModuleLoader {
    fn open(&self, path: &Path) -> Result<Box<dyn ModuleBinary>, LoadError> {
        if !path.exists() {
            return Err(LoadError::PathNotFound(path.to_path_buf()));
        }

        let path = key(path);
        let module = self.modules.lock().get(&path).copied().ok_or_else(|| {
            LoadError::BinaryInvalid {
                path: path.clone(),
                reason: "not a registered static module".to_string(),
            }
        })?;
        Ok(self.handle(path, module))
    }

    fn open_system(&self, name: &str) -> Result<Box<dyn ModuleBinary>, LoadError> {
        let module = self.system.lock().get(name).copied().ok_or_else(|| {
            LoadError::BinaryInvalid {
                path: PathBuf::from(library_file_name(name)),
                reason: "no such system library".to_string(),
            }
        })?;
        Ok(self.handle(PathBuf::from(library_file_name(name)), module))
    }
}

struct StaticBinary {
    path: PathBuf,
    entry: Option<PluginEntry>,
    counts: Arc<Mutex<HandleCounts>>,
}

impl ModuleBinary for StaticBinary {
    fn path(&self) -> &Path {
        &self.path
    }

    fn abi_version(&self) -> Option<u32> {
        self.entry.map(|entry| entry.abi_version)
    }

    fn plugin_entry(&self) -> Option<PluginEntry> {
        self.entry.filter(|entry| entry.abi_version == PLUGIN_ABI_VERSION)
    }
}

impl Drop for StaticBinary {
    fn drop(&mut self) {
        let mut counts = self.counts.lock();
        if let Some(open) = counts.open.get_mut(&self.path) {
            *open = open.saturating_sub(1);
        }
    }
}

fn key(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}
