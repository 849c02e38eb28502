//! isoload Plugin SDK
//!
//! This SDK provides the contract between the isoload host and the plugin
//! modules it loads at run time.
//!
//! # Quick Start
//!
//! ```rust
//! use isoload_plugin_sdk::prelude::*;
//!
//! #[derive(Default)]
//! struct Greeter;
//!
//! impl Plugin for Greeter {
//!     fn name(&self) -> &str {
//!         "greeter"
//!     }
//!
//!     fn attach(&self, registrar: &mut dyn ServiceRegistrar) -> PluginResult<()> {
//!         registrar.register("hello", std::sync::Arc::new(|_req: &RouteRequest| RouteResponse::text("hi")));
//!         Ok(())
//!     }
//! }
//!
//! export_plugin!(Greeter);
//! ```
//!
//! Build the crate as a `cdylib` and drop the library into the host's plugin
//! directory, next to an optional `plugin.toml` deployment manifest.

pub mod descriptor;
pub mod error;
#[macro_use]
pub mod macros;
pub mod types;

pub use descriptor::{
    PLUGIN_ABI_VERSION, PLUGIN_ENTRY_SYMBOL, PluginBox, PluginCreateFn, PluginDestroyFn,
    PluginEntry,
};
pub use error::{PluginError, PluginResult};
pub use types::{Plugin, RouteHandler, RouteRequest, RouteResponse, ServiceRegistrar};

/// Prelude module with common imports
pub mod prelude {
    pub use crate::descriptor::{PLUGIN_ABI_VERSION, PluginEntry};
    pub use crate::error::{PluginError, PluginResult};
    pub use crate::export_plugin;
    pub use crate::types::{Plugin, RouteHandler, RouteRequest, RouteResponse, ServiceRegistrar};
    pub use serde_json::{Value, json};
}
