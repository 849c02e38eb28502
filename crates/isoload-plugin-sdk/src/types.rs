//! Types shared by the host and plugin modules.
//!
//! A plugin is handed a [`ServiceRegistrar`] when it is attached to the host's
//! embedded service and registers [`RouteHandler`]s on it. The registrar is
//! framework-neutral; the host decides how routes are exposed.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PluginResult;

/// A request routed to a plugin handler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRequest {
    /// HTTP method, upper case
    pub method: String,

    /// Route the request was dispatched to, without the host prefix
    pub route: String,

    /// Query parameters
    pub query: HashMap<String, String>,

    /// Request body
    pub body: String,
}

impl RouteRequest {
    /// Create a GET request for a route.
    pub fn get(route: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            route: route.into(),
            ..Default::default()
        }
    }

    /// Add a query parameter.
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    /// Get a query parameter.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }
}

/// A response produced by a plugin handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteResponse {
    /// HTTP status code
    pub status: u16,

    /// Content type of `body`
    pub content_type: String,

    /// Response body
    pub body: String,
}

impl RouteResponse {
    /// Plain text 200 response.
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            content_type: "text/plain; charset=utf-8".to_string(),
            body: body.into(),
        }
    }

    /// JSON 200 response.
    pub fn json(value: &Value) -> Self {
        Self {
            status: 200,
            content_type: "application/json".to_string(),
            body: value.to_string(),
        }
    }

    /// 404 response.
    pub fn not_found() -> Self {
        Self::text("not found").with_status(404)
    }

    /// Override the status code.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }
}

/// Handler registered by a plugin.
pub type RouteHandler = Arc<dyn Fn(&RouteRequest) -> RouteResponse + Send + Sync>;

/// Registration surface of the host's embedded service.
pub trait ServiceRegistrar {
    /// Register a handler for a route. Registering the same route twice replaces
    /// the earlier handler.
    fn register(&mut self, route: &str, handler: RouteHandler);
}

/// The capability every plugin module provides.
///
/// Implementors must also be `Default`; the host constructs the single instance
/// through the entry point generated by [`export_plugin!`](crate::export_plugin).
pub trait Plugin: Send + Sync {
    /// Display name of the plugin.
    fn name(&self) -> &str;

    /// Plugin version.
    fn version(&self) -> &str {
        "0.0.0"
    }

    /// Register the plugin's handlers with the host service.
    fn attach(&self, registrar: &mut dyn ServiceRegistrar) -> PluginResult<()>;
}

/// Check that a route name is usable: non-empty, no whitespace, no leading slash.
pub fn validate_route(route: &str) -> bool {
    !route.is_empty()
        && !route.starts_with('/')
        && !route.chars().any(char::is_whitespace)
}
