//! Sample plugin module.
//!
//! Registers two routes with the host service:
//! - `hello?name=<who>` greets the caller
//! - `stats` reports how many greetings this instance served

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use isoload_plugin_sdk::prelude::*;

/// Greeter plugin.
#[derive(Default)]
pub struct GreeterPlugin {
    served: Arc<AtomicU64>,
}

impl Plugin for GreeterPlugin {
    fn name(&self) -> &str {
        "greeter"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn attach(&self, registrar: &mut dyn ServiceRegistrar) -> PluginResult<()> {
        let served = self.served.clone();
        registrar.register(
            "hello",
            Arc::new(move |req: &RouteRequest| {
                served.fetch_add(1, Ordering::Relaxed);
                let who = req.query_param("name").unwrap_or("world");
                RouteResponse::text(format!("Hello, {}!", who))
            }),
        );

        let served = self.served.clone();
        registrar.register(
            "stats",
            Arc::new(move |_req: &RouteRequest| {
                RouteResponse::json(&json!({ "served": served.load(Ordering::Relaxed) }))
            }),
        );

        Ok(())
    }
}

export_plugin!(GreeterPlugin);
