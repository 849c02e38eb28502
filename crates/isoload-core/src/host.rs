//! Host orchestration.
//!
//! [`PluginHost`] drives one plugin through
//! `Unloaded → Loading → Loaded → Unloading → {Unloaded | Stuck}`.
//!
//! Unload runs in a fixed order: stop and dispose the service collaborator,
//! drop the host's plugin instance, request context unload, verify. Verifying
//! before the first two steps complete would always report the context alive.

use std::sync::Arc;

use async_trait::async_trait;
use isoload_plugin_sdk::{RouteHandler, RouteRequest, RouteResponse, ServiceRegistrar};

use crate::binary::{BinaryLoader, NativeBinaryLoader};
use crate::config::HostConfig;
use crate::context::{ContextLease, IsolatedContext, LoadEnvironment};
use crate::descriptor::ModuleDescriptor;
use crate::discovery::{PluginInstance, find_plugin_type, instantiate};
use crate::error::{HostError, InstantiationError, Result};
use crate::shared::SharedRegistry;
use crate::verifier::{UnloadOutcome, UnloadVerifier};

/// Host lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Unloaded,
    Loading,
    Loaded,
    Unloading,
    Stuck,
}

/// An external service the plugin attaches itself to.
///
/// The only contract with the host: it can be started, and it can be stopped
/// and disposed asynchronously before the plugin's context is unloaded.
#[async_trait]
pub trait ServiceCollaborator: ServiceRegistrar + Send {
    async fn start(&mut self) -> std::io::Result<()>;

    async fn stop(&mut self) -> std::io::Result<()>;

    async fn dispose(self: Box<Self>);
}

/// A plugin handler bundled with a lease on the context its code lives in.
struct LeasedHandler {
    handler: RouteHandler,
    // Dropped after `handler`.
    _lease: ContextLease,
}

impl LeasedHandler {
    fn call(&self, request: &RouteRequest) -> RouteResponse {
        (self.handler)(request)
    }
}

/// Registrar handed to the plugin: wraps every handler with a context lease
/// before passing it on to the collaborator.
struct LeasingRegistrar<'a> {
    target: &'a mut dyn ServiceCollaborator,
    lease: ContextLease,
    registered: usize,
}

impl ServiceRegistrar for LeasingRegistrar<'_> {
    fn register(&mut self, route: &str, handler: RouteHandler) {
        if !isoload_plugin_sdk::types::validate_route(route) {
            tracing::warn!("Ignoring invalid plugin route '{}'", route);
            return;
        }

        let leased = LeasedHandler {
            handler,
            _lease: self.lease.clone(),
        };
        self.target
            .register(route, Arc::new(move |request: &RouteRequest| leased.call(request)));
        self.registered += 1;
        tracing::debug!("Registered plugin route '{}'", route);
    }
}

/// Loads, serves and unloads one plugin.
pub struct PluginHost {
    config: HostConfig,
    env: LoadEnvironment,
    verifier: UnloadVerifier,
    state: HostState,
    // Dropped in this order: handlers, then the instance, then the context.
    collaborator: Option<Box<dyn ServiceCollaborator>>,
    plugin: Option<PluginInstance>,
    context: Option<IsolatedContext>,
}

impl PluginHost {
    /// Host loading real dynamic libraries into the process-wide shared space.
    pub fn new(config: HostConfig) -> Self {
        Self::with_loader(config, Arc::new(NativeBinaryLoader::new()), SharedRegistry::global())
    }

    /// Host with a custom binary loader and shared registry.
    pub fn with_loader(
        config: HostConfig,
        loader: Arc<dyn BinaryLoader>,
        shared: Arc<SharedRegistry>,
    ) -> Self {
        let env = LoadEnvironment::new(loader, shared)
            .with_search_paths(config.shared_search_paths.iter().cloned());
        let verifier = UnloadVerifier::from_config(&config.unload);
        Self {
            config,
            env,
            verifier,
            state: HostState::Unloaded,
            context: None,
            plugin: None,
            collaborator: None,
        }
    }

    /// Replace the unload verifier.
    pub fn with_verifier(mut self, verifier: UnloadVerifier) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// The loaded plugin instance.
    pub fn plugin(&self) -> Option<&PluginInstance> {
        self.plugin.as_ref()
    }

    /// The loaded context.
    pub fn context(&self) -> Option<&IsolatedContext> {
        self.context.as_ref()
    }

    /// Load the configured module and create its plugin instance.
    ///
    /// On failure no context is left behind and the host is `Unloaded` again.
    pub fn load_plugin(&mut self) -> Result<()> {
        self.expect_state(HostState::Unloaded)?;
        self.state = HostState::Loading;

        match self.load_inner() {
            Ok((context, plugin)) => {
                tracing::info!("Plugin {} loaded from {}", plugin, context.directory().display());
                self.context = Some(context);
                self.plugin = Some(plugin);
                self.state = HostState::Loaded;
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to load plugin: {}", e);
                self.state = HostState::Unloaded;
                Err(e)
            }
        }
    }

    fn load_inner(&self) -> Result<(IsolatedContext, PluginInstance)> {
        let binary = self.config.binary_path();
        let descriptor = ModuleDescriptor::from_directory(&self.config.plugin_dir, binary.as_deref())?;
        tracing::info!("Load plugin from '{}'", descriptor.binary.display());

        let context = IsolatedContext::load(&descriptor, &self.env)?;

        match find_plugin_type(&context).and_then(instantiate) {
            Ok(plugin) => Ok((context, plugin)),
            Err(e) => {
                if let Err(stuck) = context.try_unload() {
                    tracing::warn!("Partially loaded context not released: {}", stuck);
                }
                Err(e.into())
            }
        }
    }

    /// Attach the plugin to a service collaborator, then start the collaborator.
    ///
    /// Every handler the plugin registers keeps the plugin's context alive until
    /// the collaborator drops it. Only one collaborator can be attached; a second
    /// one is disposed and rejected.
    pub async fn attach(&mut self, mut collaborator: Box<dyn ServiceCollaborator>) -> Result<()> {
        self.expect_state(HostState::Loaded)?;
        if self.collaborator.is_some() {
            collaborator.dispose().await;
            return Err(HostError::AlreadyAttached);
        }
        let (Some(context), Some(plugin)) = (&self.context, &self.plugin) else {
            return Err(HostError::InvalidState {
                expected: HostState::Loaded,
                found: self.state,
            });
        };

        let registered = {
            let mut registrar = LeasingRegistrar {
                target: collaborator.as_mut(),
                lease: context.lease(),
                registered: 0,
            };
            if let Err(e) = plugin.plugin().attach(&mut registrar) {
                drop(registrar);
                collaborator.dispose().await;
                return Err(InstantiationError::AttachFailed(e.to_string()).into());
            }
            registrar.registered
        };

        if let Err(e) = collaborator.start().await {
            collaborator.dispose().await;
            return Err(e.into());
        }

        tracing::info!("Plugin attached with {} route(s)", registered);
        self.collaborator = Some(collaborator);
        Ok(())
    }

    /// Hand the attached collaborator back without stopping it.
    pub fn detach_collaborator(&mut self) -> Option<Box<dyn ServiceCollaborator>> {
        self.collaborator.take()
    }

    /// Unload the plugin and verify its context was released.
    pub async fn unload_plugin(&mut self) -> Result<UnloadOutcome> {
        self.expect_state(HostState::Loaded)?;
        self.state = HostState::Unloading;

        if let Some(mut collaborator) = self.collaborator.take() {
            if let Err(e) = collaborator.stop().await {
                tracing::warn!("Service collaborator failed to stop cleanly: {}", e);
            }
            collaborator.dispose().await;
        }

        drop(self.plugin.take());

        let outcome = match self.context.take() {
            Some(context) => {
                let ticket = self.verifier.begin_unload(context);
                self.verifier.verify(&ticket).await
            }
            None => UnloadOutcome::Unloaded { attempts: 0 },
        };

        self.state = match outcome {
            UnloadOutcome::Unloaded { attempts } => {
                tracing::info!("Plugin unloaded after {} attempts.", attempts);
                HostState::Unloaded
            }
            UnloadOutcome::Stuck { .. } => {
                tracing::error!("Failed to unload plugin context ({})", outcome);
                HostState::Stuck
            }
        };
        Ok(outcome)
    }

    fn expect_state(&self, expected: HostState) -> Result<()> {
        if self.state != expected {
            return Err(HostError::InvalidState {
                expected,
                found: self.state,
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHost")
            .field("state", &self.state)
            .field("plugin_dir", &self.config.plugin_dir)
            .field("context", &self.context)
            .field("attached", &self.collaborator.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use isoload_plugin_sdk::{Plugin, PluginEntry, PluginError, PluginResult};

    use super::*;
    use crate::binary::{StaticModule, StaticModuleLoader, library_file_name};
    use crate::config::defaults;

    #[derive(Default)]
    struct Counter;

    impl Plugin for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        fn attach(&self, registrar: &mut dyn ServiceRegistrar) -> PluginResult<()> {
            registrar.register("count", Arc::new(|_req: &RouteRequest| RouteResponse::text("1")));
            registrar.register("/bad route", Arc::new(|_req: &RouteRequest| RouteResponse::text("never")));
            Ok(())
        }
    }

    #[derive(Default)]
    struct Refusing;

    impl Plugin for Refusing {
        fn name(&self) -> &str {
            "refusing"
        }

        fn attach(&self, _registrar: &mut dyn ServiceRegistrar) -> PluginResult<()> {
            Err(PluginError::AttachFailed("no routes today".into()))
        }
    }

    #[derive(Default)]
    struct MapService {
        routes: HashMap<String, RouteHandler>,
        started: bool,
    }

    impl ServiceRegistrar for MapService {
        fn register(&mut self, route: &str, handler: RouteHandler) {
            self.routes.insert(route.to_string(), handler);
        }
    }

    #[async_trait]
    impl ServiceCollaborator for MapService {
        async fn start(&mut self) -> std::io::Result<()> {
            self.started = true;
            Ok(())
        }

        async fn stop(&mut self) -> std::io::Result<()> {
            self.started = false;
            Ok(())
        }

        async fn dispose(self: Box<Self>) {}
    }

    fn host_for(entry: PluginEntry) -> (tempfile::TempDir, Arc<StaticModuleLoader>, PluginHost) {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join(library_file_name(defaults::PLUGIN_NAME));
        std::fs::write(&binary, b"").unwrap();

        let loader = Arc::new(StaticModuleLoader::new());
        loader.register(&binary, StaticModule::exporting(entry));
        let config = HostConfig::for_plugin_dir(dir.path());
        let host = PluginHost::with_loader(config, loader.clone(), Arc::new(SharedRegistry::new()))
            .with_verifier(UnloadVerifier::new(3, std::time::Duration::from_millis(1)));
        (dir, loader, host)
    }

    #[tokio::test]
    async fn test_attach_wraps_handlers_with_lease() {
        let (_dir, _loader, mut host) = host_for(PluginEntry::of::<Counter>());
        host.load_plugin().unwrap();
        assert_eq!(host.state(), HostState::Loaded);

        let mut service = Box::new(MapService::default());
        let lease_baseline = host.context().unwrap().strong_handles();
        {
            let mut registrar = LeasingRegistrar {
                target: service.as_mut(),
                lease: host.context().unwrap().lease(),
                registered: 0,
            };
            host.plugin().unwrap().plugin().attach(&mut registrar).unwrap();
            assert_eq!(registrar.registered, 1);
        }

        // One extra lease per accepted route
        assert_eq!(host.context().unwrap().strong_handles(), lease_baseline + 1);
        let response = service.routes["count"](&RouteRequest::get("count"));
        assert_eq!(response.body, "1");

        drop(service);
        assert_eq!(host.context().unwrap().strong_handles(), lease_baseline);
    }

    #[tokio::test]
    async fn test_attach_failure_is_reported() {
        let (_dir, _loader, mut host) = host_for(PluginEntry::of::<Refusing>());
        host.load_plugin().unwrap();

        let err = host.attach(Box::new(MapService::default())).await.unwrap_err();
        assert!(matches!(
            err,
            HostError::Instantiation(InstantiationError::AttachFailed(_))
        ));
        // The plugin stays loaded and can still be unloaded cleanly
        assert_eq!(host.state(), HostState::Loaded);
        assert!(host.unload_plugin().await.unwrap().is_unloaded());
    }

    #[tokio::test]
    async fn test_state_guards() {
        let (_dir, _loader, mut host) = host_for(PluginEntry::of::<Counter>());

        let err = host.unload_plugin().await.unwrap_err();
        assert!(matches!(
            err,
            HostError::InvalidState {
                expected: HostState::Loaded,
                found: HostState::Unloaded
            }
        ));

        host.load_plugin().unwrap();
        let err = host.load_plugin().unwrap_err();
        assert!(matches!(err, HostError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_reload_after_unload() {
        let (_dir, loader, mut host) = host_for(PluginEntry::of::<Counter>());
        for _ in 0..2 {
            host.load_plugin().unwrap();
            host.attach(Box::new(MapService::default())).await.unwrap();
            let outcome = host.unload_plugin().await.unwrap();
            assert_eq!(outcome, UnloadOutcome::Unloaded { attempts: 0 });
            assert_eq!(loader.open_handle_count(), 0);
        }
    }
}
