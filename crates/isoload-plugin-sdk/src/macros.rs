//! Declarative macros for plugin development.

/// Export a plugin type as the module's entry point.
///
/// The type must implement [`Plugin`](crate::Plugin) and `Default`. A module
/// exports exactly one plugin; invoking the macro twice in the same crate is a
/// duplicate-symbol error.
///
/// # Example
///
/// ```rust
/// use isoload_plugin_sdk::prelude::*;
///
/// #[derive(Default)]
/// struct MyPlugin;
///
/// impl Plugin for MyPlugin {
///     fn name(&self) -> &str {
///         "my-plugin"
///     }
///
///     fn attach(&self, registrar: &mut dyn ServiceRegistrar) -> PluginResult<()> {
///         registrar.register("ping", std::sync::Arc::new(|_req: &RouteRequest| RouteResponse::text("pong")));
///         Ok(())
///     }
/// }
///
/// export_plugin!(MyPlugin);
/// ```
#[macro_export]
macro_rules! export_plugin {
    ($ty:ty) => {
        #[no_mangle]
        #[allow(non_upper_case_globals)]
        pub static isoload_plugin_entry: $crate::descriptor::PluginEntry =
            $crate::descriptor::PluginEntry::of::<$ty>();
    };
}
