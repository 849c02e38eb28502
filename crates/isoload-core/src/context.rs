//! Isolated load contexts.
//!
//! An [`IsolatedContext`] owns everything loaded because of one module: the
//! module binary, the private dependencies resolved from its deployment
//! directory, and the native library handles it opened. Shared dependencies are
//! referenced, never owned.
//!
//! Code created from the module holds a [`ContextLease`]. The context's
//! bindings are released when the owner has called [`IsolatedContext::unload`]
//! and the last lease is gone; an [`UnloadTicket`] observes that moment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::binary::{BinaryLoader, ModuleBinary};
use crate::descriptor::ModuleDescriptor;
use crate::error::LoadError;
use crate::resolver::{DependencyResolver, NativeTarget, Resolution};
use crate::shared::{SharedDependency, SharedRegistry};
use crate::verifier::UnloadTicket;

/// Lifecycle of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Created,
    Loaded,
    Unloading,
    Unloaded,
    Stuck,
}

/// Collaborators a context loads through.
#[derive(Clone)]
pub struct LoadEnvironment {
    /// Opens module binaries
    pub loader: Arc<dyn BinaryLoader>,
    /// Shared dependency registry
    pub shared: Arc<SharedRegistry>,
    /// Directories searched for shared dependencies
    pub shared_search_paths: Vec<PathBuf>,
}

impl LoadEnvironment {
    pub fn new(loader: Arc<dyn BinaryLoader>, shared: Arc<SharedRegistry>) -> Self {
        Self {
            loader,
            shared,
            shared_search_paths: Vec::new(),
        }
    }

    pub fn with_search_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.shared_search_paths.push(path.into());
        self
    }

    pub fn with_search_paths(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        self.shared_search_paths.extend(paths);
        self
    }
}

/// A dependency bound into a context.
#[derive(Debug, Clone)]
pub enum BoundDependency {
    /// Opened from the module's own directory
    Private(PathBuf),
    /// Served by the shared registry
    Shared(Arc<SharedDependency>),
}

impl BoundDependency {
    pub fn origin(&self) -> &Path {
        match self {
            BoundDependency::Private(path) => path,
            BoundDependency::Shared(dep) => dep.origin(),
        }
    }
}

#[derive(Default)]
struct Bindings {
    private: BTreeMap<String, Box<dyn ModuleBinary>>,
    shared: BTreeMap<String, Arc<SharedDependency>>,
    native: BTreeMap<String, Box<dyn ModuleBinary>>,
}

pub(crate) struct ContextInner {
    name: String,
    directory: PathBuf,
    debug_symbols: Option<PathBuf>,
    loaded_at: chrono::DateTime<chrono::Utc>,
    state: Mutex<ContextState>,
    resolver: DependencyResolver,
    env: LoadEnvironment,
    // Declared before `bindings`: the module is closed before the libraries it depends on.
    module: Box<dyn ModuleBinary>,
    bindings: Mutex<Bindings>,
}

impl ContextInner {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn state(&self) -> ContextState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: ContextState) {
        let mut current = self.state.lock();
        tracing::debug!("[{}] context {:?} -> {:?}", self.name, *current, state);
        *current = state;
    }

    fn ensure_open(&self) -> Result<(), LoadError> {
        match self.state() {
            ContextState::Created | ContextState::Loaded => Ok(()),
            _ => Err(LoadError::ContextUnloading(self.name.clone())),
        }
    }

    fn bind_dependency(&self, id: &str) -> Result<BoundDependency, LoadError> {
        self.ensure_open()?;

        let mut bindings = self.bindings.lock();
        if let Some(binary) = bindings.private.get(id) {
            return Ok(BoundDependency::Private(binary.path().to_path_buf()));
        }
        if let Some(dep) = bindings.shared.get(id) {
            return Ok(BoundDependency::Shared(dep.clone()));
        }

        match self.resolver.resolve(id)? {
            Resolution::Private(path) => {
                let binary = self.env.loader.open(&path)?;
                let origin = binary.path().to_path_buf();
                bindings.private.insert(id.to_string(), binary);
                Ok(BoundDependency::Private(origin))
            }
            Resolution::Shared => {
                let dep = self.env.shared.get_or_load(
                    id,
                    &self.env.shared_search_paths,
                    self.env.loader.as_ref(),
                )?;
                bindings.shared.insert(id.to_string(), dep.clone());
                Ok(BoundDependency::Shared(dep))
            }
        }
    }

    fn bind_native(&self, name: &str) -> Result<PathBuf, LoadError> {
        self.ensure_open()?;

        let mut bindings = self.bindings.lock();
        if let Some(handle) = bindings.native.get(name) {
            return Ok(handle.path().to_path_buf());
        }

        let handle = match self.resolver.resolve_native(name)? {
            NativeTarget::Private(path) => self.env.loader.open(&path)?,
            NativeTarget::System(name) => self.env.loader.open_system(&name).map_err(|e| {
                tracing::debug!("[{}] system library '{}' unavailable: {}", self.name, name, e);
                LoadError::DependencyUnresolved {
                    id: name.clone(),
                    searched: Vec::new(),
                }
            })?,
        };

        let origin = handle.path().to_path_buf();
        bindings.native.insert(name.to_string(), handle);
        Ok(origin)
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        let bindings = self.bindings.get_mut();
        tracing::info!(
            "[{}] context released ({} private, {} native bindings closed)",
            self.name,
            bindings.private.len(),
            bindings.native.len()
        );
    }
}

/// The owning handle of a loaded module.
pub struct IsolatedContext {
    inner: Arc<ContextInner>,
}

impl IsolatedContext {
    /// Load a module as an isolated unit.
    ///
    /// Every reference declared by the module's manifest and every native
    /// library it lists is bound through the context's resolver. A failure
    /// releases everything opened so far.
    pub fn load(descriptor: &ModuleDescriptor, env: &LoadEnvironment) -> Result<Self, LoadError> {
        if !descriptor.binary.exists() {
            return Err(LoadError::PathNotFound(descriptor.binary.clone()));
        }

        match &descriptor.debug_symbols {
            Some(symbols) => tracing::debug!("Debug symbols found at {}", symbols.display()),
            None => tracing::debug!("No debug symbols for {}", descriptor.binary.display()),
        }

        let module = env.loader.open(&descriptor.binary)?;

        let context = Self {
            inner: Arc::new(ContextInner {
                name: descriptor.name.clone(),
                directory: descriptor.directory.clone(),
                debug_symbols: descriptor.debug_symbols.clone(),
                loaded_at: chrono::Utc::now(),
                state: Mutex::new(ContextState::Created),
                resolver: DependencyResolver::new(
                    descriptor.name.clone(),
                    descriptor.directory.clone(),
                    &descriptor.manifest,
                ),
                env: env.clone(),
                module,
                bindings: Mutex::new(Bindings::default()),
            }),
        };

        for id in &descriptor.manifest.references {
            if let Err(e) = context.bind_dependency(id) {
                tracing::warn!("[{}] failed to bind '{}': {}", descriptor.name, id, e);
                return Err(e);
            }
        }
        for name in descriptor.manifest.native.keys() {
            if let Err(e) = context.bind_native(name) {
                tracing::warn!("[{}] failed to open native '{}': {}", descriptor.name, name, e);
                return Err(e);
            }
        }

        context.inner.set_state(ContextState::Loaded);
        tracing::info!("Loaded module {}", descriptor);
        Ok(context)
    }

    /// Bind a module dependency on demand.
    pub fn bind_dependency(&self, id: &str) -> Result<BoundDependency, LoadError> {
        self.inner.bind_dependency(id)
    }

    /// Open a native library on demand. Returns the path it was opened from.
    pub fn bind_native(&self, name: &str) -> Result<PathBuf, LoadError> {
        self.inner.bind_native(name)
    }

    /// Resolve an identifier without binding it.
    pub fn resolve(&self, id: &str) -> Result<Resolution, LoadError> {
        self.inner.resolver.resolve(id)
    }

    /// A strong, countable handle into this context.
    pub fn lease(&self) -> ContextLease {
        ContextLease {
            inner: self.inner.clone(),
        }
    }

    /// Request unload.
    ///
    /// Marks the context `Unloading`, invalidates the resolver and gives up the
    /// owner's handle. Bindings are released once every lease is dropped; the
    /// returned ticket observes when that happens.
    pub fn unload(self) -> UnloadTicket {
        self.inner.set_state(ContextState::Unloading);
        self.inner.resolver.invalidate();

        let ticket = UnloadTicket::new(&self.inner);
        tracing::info!(
            "[{}] unload requested ({} outstanding leases)",
            self.inner.name,
            ticket.outstanding().saturating_sub(1)
        );
        ticket
    }

    /// Unload and require that nothing else holds the context.
    ///
    /// Fails immediately with the number of surviving handles otherwise; the
    /// context then stays resident in state `Stuck`.
    pub fn try_unload(self) -> Result<(), StillReferenced> {
        let ticket = self.unload();
        match ticket.outstanding() {
            0 => Ok(()),
            outstanding => {
                ticket.mark_stuck();
                Err(StillReferenced { outstanding })
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> ContextState {
        self.inner.state()
    }

    /// Deployment directory of the module.
    pub fn directory(&self) -> &Path {
        &self.inner.directory
    }

    pub fn debug_symbols(&self) -> Option<&Path> {
        self.inner.debug_symbols.as_deref()
    }

    pub fn loaded_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.inner.loaded_at
    }

    pub(crate) fn module(&self) -> &dyn ModuleBinary {
        self.inner.module.as_ref()
    }

    /// Identifiers bound privately into this context.
    pub fn local_bindings(&self) -> Vec<String> {
        self.inner.bindings.lock().private.keys().cloned().collect()
    }

    /// Identifiers deferred to the shared space.
    pub fn shared_bindings(&self) -> Vec<String> {
        self.inner.bindings.lock().shared.keys().cloned().collect()
    }

    /// Native libraries opened by this context.
    pub fn native_bindings(&self) -> Vec<String> {
        self.inner.bindings.lock().native.keys().cloned().collect()
    }

    /// Every resolution decision made so far.
    pub fn resolutions(&self) -> BTreeMap<String, Resolution> {
        self.inner.resolver.resolutions()
    }

    /// Strong handles into the context, the owner included.
    pub fn strong_handles(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl std::fmt::Debug for IsolatedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolatedContext")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("directory", &self.inner.directory)
            .finish()
    }
}

/// A strong handle keeping a context, and the module code it owns, alive.
#[derive(Clone)]
pub struct ContextLease {
    inner: Arc<ContextInner>,
}

impl ContextLease {
    pub fn context_name(&self) -> &str {
        self.inner.name()
    }

    pub fn state(&self) -> ContextState {
        self.inner.state()
    }

    /// Bind a dependency late, from code running inside the module.
    pub fn bind_dependency(&self, id: &str) -> Result<BoundDependency, LoadError> {
        self.inner.bind_dependency(id)
    }
}

impl std::fmt::Debug for ContextLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextLease")
            .field("context", &self.inner.name)
            .finish()
    }
}

/// A synchronous unload found surviving handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("context still referenced by {outstanding} handle(s)")]
pub struct StillReferenced {
    pub outstanding: usize,
}
