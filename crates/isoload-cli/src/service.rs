//! Embedded HTTP service the plugin attaches its routes to.
//!
//! Plugin routes are served under `/plugin/<route>`; `/health` reports the
//! routes currently registered. The server runs on its own task and shuts down
//! gracefully when the host stops the service before unload.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{Json, Router};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use isoload_core::ServiceCollaborator;
use isoload_plugin_sdk::{RouteHandler, RouteRequest, ServiceRegistrar};
use parking_lot::RwLock;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

type RouteTable = Arc<RwLock<HashMap<String, RouteHandler>>>;

struct Running {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<io::Result<()>>,
}

/// axum server exposing plugin-registered routes.
pub struct HttpService {
    bind: SocketAddr,
    routes: RouteTable,
    running: Option<Running>,
}

impl HttpService {
    pub fn new(bind: SocketAddr) -> Self {
        Self {
            bind,
            routes: Arc::new(RwLock::new(HashMap::new())),
            running: None,
        }
    }

    /// Address the server is listening on, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.local_addr)
    }

    /// Routes currently registered, sorted.
    pub fn routes(&self) -> Vec<String> {
        let mut routes = self.routes.read().keys().cloned().collect::<Vec<_>>();
        routes.sort();
        routes
    }
}

impl ServiceRegistrar for HttpService {
    fn register(&mut self, route: &str, handler: RouteHandler) {
        tracing::debug!("HTTP route /plugin/{} registered", route);
        self.routes.write().insert(route.to_string(), handler);
    }
}

#[async_trait]
impl ServiceCollaborator for HttpService {
    async fn start(&mut self) -> io::Result<()> {
        if self.running.is_some() {
            return Ok(());
        }

        let listener = TcpListener::bind(self.bind).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, signal) = oneshot::channel::<()>();
        let app = create_router(self.routes.clone());

        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = signal.await;
                })
                .await
        });

        tracing::info!("Plugin service listening on http://{}", local_addr);
        self.running = Some(Running {
            local_addr,
            shutdown,
            task,
        });
        Ok(())
    }

    async fn stop(&mut self) -> io::Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };

        let _ = running.shutdown.send(());
        running.task.await.map_err(io::Error::other)??;
        tracing::info!("Plugin service on {} stopped", running.local_addr);
        Ok(())
    }

    async fn dispose(self: Box<Self>) {
        let mut service = self;
        if let Err(e) = service.stop().await {
            tracing::warn!("Plugin service shutdown error: {}", e);
        }
        // Handlers hold leases on the plugin's context
        service.routes.write().clear();
    }
}

fn create_router(routes: RouteTable) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/plugin/*route", any(plugin_route))
        .with_state(routes)
}

async fn health(State(routes): State<RouteTable>) -> Json<serde_json::Value> {
    let mut names = routes.read().keys().cloned().collect::<Vec<_>>();
    names.sort();
    Json(json!({ "status": "ok", "routes": names }))
}

async fn plugin_route(
    State(routes): State<RouteTable>,
    Path(route): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    method: Method,
    body: Bytes,
) -> Response {
    let Some(handler) = routes.read().get(&route).cloned() else {
        return (StatusCode::NOT_FOUND, format!("No plugin route '{}'", route)).into_response();
    };

    let request = RouteRequest {
        method: method.to_string(),
        route,
        query,
        body: String::from_utf8_lossy(&body).into_owned(),
    };
    let response = handler(&request);
    drop(handler);

    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, [(header::CONTENT_TYPE, response.content_type)], response.body).into_response()
}
