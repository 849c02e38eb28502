//! Shared fixtures for isoload-core integration tests.
//!
//! Modules are served by a [`StaticModuleLoader`]; the files written to disk are
//! placeholders that give the resolver real directory layouts to scan.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use isoload_core::binary::library_file_name;
use isoload_core::prelude::*;
use isoload_core::{StaticModule, StaticModuleLoader};
use isoload_plugin_sdk::{PluginEntry, PluginResult};
use parking_lot::Mutex;
use tempfile::TempDir;

/// A deployment directory under construction.
pub struct Layout {
    pub root: TempDir,
    pub loader: Arc<StaticModuleLoader>,
}

impl Layout {
    pub fn new() -> Self {
        Self {
            root: tempfile::tempdir().unwrap(),
            loader: Arc::new(StaticModuleLoader::new()),
        }
    }

    pub fn plugin_dir(&self) -> PathBuf {
        let dir = self.root.path().join("plugin");
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    pub fn shared_dir(&self) -> PathBuf {
        let dir = self.root.path().join("shared");
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    pub fn manifest(&self, content: &str) -> &Self {
        std::fs::write(self.plugin_dir().join("plugin.toml"), content).unwrap();
        self
    }

    /// Place the plugin module binary.
    pub fn module(&self, module: StaticModule) -> PathBuf {
        self.library(&self.plugin_dir(), "plugin", module)
    }

    /// Place a library file named `<prefix><file_stem><suffix>` in `dir`.
    pub fn library(&self, dir: &Path, file_stem: &str, module: StaticModule) -> PathBuf {
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(library_file_name(file_stem));
        std::fs::write(&path, b"").unwrap();
        self.loader.register(&path, module);
        path
    }

    pub fn env(&self, shared: Arc<SharedRegistry>) -> LoadEnvironment {
        LoadEnvironment::new(self.loader.clone(), shared).with_search_path(self.shared_dir())
    }

    pub fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor::from_directory(&self.plugin_dir(), None).unwrap()
    }

    pub fn host(&self, shared: Arc<SharedRegistry>) -> PluginHost {
        let mut config = HostConfig::for_plugin_dir(self.plugin_dir());
        config.shared_search_paths = vec![self.shared_dir()];
        PluginHost::with_loader(config, self.loader.clone(), shared)
            .with_verifier(UnloadVerifier::new(5, std::time::Duration::from_millis(2)))
    }
}

// ============================================================================
// Plugins
// ============================================================================

#[derive(Default)]
pub struct HelloPlugin;

impl Plugin for HelloPlugin {
    fn name(&self) -> &str {
        "hello"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn attach(&self, registrar: &mut dyn ServiceRegistrar) -> PluginResult<()> {
        registrar.register(
            "hello",
            Arc::new(|req: &RouteRequest| {
                RouteResponse::text(format!("hello {}", req.query_param("name").unwrap_or("world")))
            }),
        );
        Ok(())
    }
}

pub struct PanickingPlugin;

impl Default for PanickingPlugin {
    fn default() -> Self {
        panic!("constructor exploded");
    }
}

impl Plugin for PanickingPlugin {
    fn name(&self) -> &str {
        "panicking"
    }

    fn attach(&self, _registrar: &mut dyn ServiceRegistrar) -> PluginResult<()> {
        Ok(())
    }
}

pub fn hello_module() -> StaticModule {
    StaticModule::exporting(PluginEntry::of::<HelloPlugin>())
}

// ============================================================================
// Collaborators
// ============================================================================

/// Records lifecycle calls and serves registered routes from memory.
#[derive(Clone, Default)]
pub struct Recording {
    pub events: Arc<Mutex<Vec<&'static str>>>,
    pub routes: Arc<Mutex<Vec<(String, RouteHandler)>>>,
}

impl Recording {
    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().clone()
    }

    pub fn call(&self, route: &str, request: &RouteRequest) -> Option<RouteResponse> {
        let routes = self.routes.lock();
        routes
            .iter()
            .find(|(name, _)| name == route)
            .map(|(_, handler)| handler(request))
    }
}

/// Collaborator that drops every handler on dispose.
pub struct RecordingService {
    pub record: Recording,
}

impl ServiceRegistrar for RecordingService {
    fn register(&mut self, route: &str, handler: RouteHandler) {
        self.record.routes.lock().push((route.to_string(), handler));
    }
}

#[async_trait]
impl ServiceCollaborator for RecordingService {
    async fn start(&mut self) -> std::io::Result<()> {
        self.record.events.lock().push("start");
        Ok(())
    }

    async fn stop(&mut self) -> std::io::Result<()> {
        self.record.events.lock().push("stop");
        Ok(())
    }

    async fn dispose(self: Box<Self>) {
        self.record.events.lock().push("dispose");
        self.record.routes.lock().clear();
    }
}

/// Collaborator that leaks its handlers past dispose, as a misbehaving host
/// service would.
pub struct LeakyService {
    pub leaked: Arc<Mutex<Vec<RouteHandler>>>,
    pub disposed: Arc<AtomicBool>,
}

impl LeakyService {
    pub fn new() -> Self {
        Self {
            leaked: Arc::new(Mutex::new(Vec::new())),
            disposed: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl ServiceRegistrar for LeakyService {
    fn register(&mut self, _route: &str, handler: RouteHandler) {
        self.leaked.lock().push(handler);
    }
}

#[async_trait]
impl ServiceCollaborator for LeakyService {
    async fn start(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    async fn stop(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    async fn dispose(self: Box<Self>) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}
