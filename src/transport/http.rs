//! HTTP transport for the tenant gateway.
//!
//! Every collection route resolves the tenant from the configured header,
//! binds an accessor for the path's schema and runs one accessor operation
//! under the request timeout. The request context lives inside the handler
//! future, so its handle reference is given back on every exit path, including
//! a client disconnect that drops the future.

use crate::db::Accessor;
use crate::error::{TenantError, TenantResult};
use crate::gateway::TenantGateway;
use crate::models::{Document, Filter};
use crate::transport::Transport;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use serde_json::{Value as JsonValue, json};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

/// Header carrying the caller's correlation id; echoed on every response.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// HTTP transport implementation.
///
/// This transport provides:
/// - `GET /health` with multiplexer statistics
/// - CRUD routes under `/collections/{schema}` scoped to the caller's tenant
pub struct HttpTransport {
    gateway: Arc<TenantGateway>,
    /// Host to bind to
    host: String,
    /// Port to bind to
    port: u16,
    tenant_header: HeaderName,
    request_timeout: Duration,
}

#[derive(Clone)]
struct AppState {
    gateway: Arc<TenantGateway>,
    tenant_header: HeaderName,
    request_timeout: Duration,
}

impl HttpTransport {
    /// Create a new HTTP transport with the default tenant header and timeout.
    pub fn new(gateway: Arc<TenantGateway>, host: impl Into<String>, port: u16) -> Self {
        Self {
            gateway,
            host: host.into(),
            port,
            tenant_header: HeaderName::from_static(crate::config::DEFAULT_TENANT_HEADER),
            request_timeout: Duration::from_secs(crate::config::DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }

    pub fn with_tenant_header(mut self, name: &str) -> TenantResult<Self> {
        self.tenant_header = HeaderName::from_bytes(name.trim().to_ascii_lowercase().as_bytes())
            .map_err(|e| {
                TenantError::invalid_input(format!("Invalid tenant header '{}': {}", name, e))
            })?;
        Ok(self)
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Get the bind address.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn tenant_header(&self) -> &HeaderName {
        &self.tenant_header
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            gateway: Arc::clone(&self.gateway),
            tenant_header: self.tenant_header.clone(),
            request_timeout: self.request_timeout,
        };

        Router::new()
            .route("/health", get(health))
            .route(
                "/collections/{schema}",
                get(list_documents).post(create_document),
            )
            .route(
                "/collections/{schema}/{id}",
                get(get_document)
                    .patch(update_document)
                    .delete(delete_document),
            )
            .with_state(state)
    }
}

impl Transport for HttpTransport {
    async fn run(&self) -> TenantResult<()> {
        let bind_addr = self.bind_addr();
        info!("Starting tenant gateway on {}", bind_addr);

        let app = self.router();

        // Create TCP listener
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            TenantError::internal(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        info!(tenant_header = %self.tenant_header, "Listening for tenant requests");

        // Slow requests may keep the server alive past the signal, so force
        // exit after a timeout once shutdown has been requested
        const GRACEFUL_TIMEOUT: Duration = Duration::from_secs(30);

        // Use a notify to coordinate shutdown timing
        let shutdown_notify = Arc::new(tokio::sync::Notify::new());
        let shutdown_notify_clone = shutdown_notify.clone();

        // Create shutdown signal that triggers on SIGINT or SIGTERM
        let shutdown_signal = async move {
            wait_for_signal().await;
            // Notify that shutdown was triggered
            shutdown_notify_clone.notify_one();
        };

        // Start server with graceful shutdown
        let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal);

        // Race between: server completing normally vs forced timeout/second signal after shutdown
        tokio::select! {
            result = server => {
                match result {
                    Ok(()) => info!("HTTP server stopped"),
                    Err(e) => {
                        error!(error = %e, "HTTP server error");
                        self.gateway.shutdown().await;
                        return Err(TenantError::internal(format!("HTTP server error: {}", e)));
                    }
                }
            }
            _ = async {
                // Wait for shutdown signal, then wait for either timeout or second signal
                shutdown_notify.notified().await;
                info!(
                    timeout_secs = GRACEFUL_TIMEOUT.as_secs(),
                    "Waiting for requests to finish (send signal again to force exit)..."
                );

                tokio::select! {
                    _ = tokio::time::sleep(GRACEFUL_TIMEOUT) => {
                        warn!("Graceful shutdown timeout, forcing exit");
                    }
                    _ = wait_for_signal() => {
                        warn!("Received second signal, forcing immediate exit");
                    }
                }
            } => {
                // Timeout or second signal reached - server will be dropped
            }
        }

        info!("Closing tenant connections");
        self.gateway.shutdown().await;

        Ok(())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_signal() {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

impl AppState {
    /// Resolve the tenant, bind `schema` and run `op` under the request timeout.
    async fn with_accessor<F, Fut>(&self, headers: &HeaderMap, schema: &str, op: F) -> Response
    where
        F: FnOnce(Arc<dyn Accessor>) -> Fut,
        Fut: Future<Output = TenantResult<(StatusCode, JsonValue)>>,
    {
        let correlation_id = correlation_id(headers);
        let raw_tenant = headers
            .get(&self.tenant_header)
            .and_then(|value| value.to_str().ok());
        let span = info_span!(
            "request",
            correlation_id = %correlation_id,
            tenant_id = raw_tenant.unwrap_or_default(),
            schema = %schema
        );

        let work = async {
            // Unknown collections never cost a tenant connection
            self.gateway.registry().get(schema)?;
            let ctx = self
                .gateway
                .resolve(raw_tenant, Some(correlation_id.clone()))
                .await?;
            let accessor = self.gateway.with_tenant_context(&ctx, schema)?;
            let result = op(accessor).await;
            ctx.release();
            result
        };

        let result = match tokio::time::timeout(self.request_timeout, work)
            .instrument(span.clone())
            .await
        {
            Ok(result) => result,
            Err(_) => Err(TenantError::timeout("request", self.request_timeout.as_secs())),
        };

        let response = match result {
            Ok((status, body)) => (status, Json(body)).into_response(),
            Err(e) => {
                span.in_scope(|| {
                    if e.status_code().is_server_error() {
                        warn!(error = %e, "Request failed");
                    } else {
                        info!(error = %e, "Request rejected");
                    }
                });
                e.into_response()
            }
        };
        with_request_id(response, &correlation_id)
    }
}

fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn with_request_id(mut response: Response, correlation_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(correlation_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}

fn parse_document(body: &[u8]) -> TenantResult<Document> {
    match serde_json::from_slice::<JsonValue>(body) {
        Ok(JsonValue::Object(document)) => Ok(document),
        Ok(_) => Err(TenantError::invalid_input("Request body must be a JSON object")),
        Err(e) => Err(TenantError::invalid_input(format!("Invalid JSON body: {}", e))),
    }
}

fn found(schema: &str, id: &str, document: Option<Document>) -> TenantResult<(StatusCode, JsonValue)> {
    match document {
        Some(document) => Ok((StatusCode::OK, json!({ "data": document }))),
        None => Err(TenantError::record_not_found(schema, id)),
    }
}

async fn health(State(state): State<AppState>) -> Response {
    let stats = state.gateway.stats();
    let status = if stats.shutting_down {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    let body = json!({
        "status": if stats.shutting_down { "shutting_down" } else { "ok" },
        "version": env!("CARGO_PKG_VERSION"),
        "multiplexer": stats,
        "handles": state.gateway.snapshot(),
    });
    (status, Json(body)).into_response()
}

async fn list_documents(
    State(state): State<AppState>,
    Path(schema): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> Response {
    state
        .with_accessor(&headers, &schema, |accessor| async move {
            let filter = Filter::from_pairs(
                accessor.schema(),
                params.iter().map(|(k, v)| (k.as_str(), v.as_str())),
            )?;
            let documents = accessor.find_many(&filter).await?;
            Ok((
                StatusCode::OK,
                json!({ "data": documents, "count": documents.len() }),
            ))
        })
        .await
}

async fn create_document(
    State(state): State<AppState>,
    Path(schema): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state
        .with_accessor(&headers, &schema, |accessor| async move {
            let document = parse_document(&body)?;
            let created = accessor.insert(document).await?;
            Ok((StatusCode::CREATED, json!({ "data": created })))
        })
        .await
}

async fn get_document(
    State(state): State<AppState>,
    Path((schema, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    state
        .with_accessor(&headers, &schema, |accessor| async move {
            let document = accessor.find_by_id(&id).await?;
            found(&accessor.schema().name, &id, document)
        })
        .await
}

async fn update_document(
    State(state): State<AppState>,
    Path((schema, id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state
        .with_accessor(&headers, &schema, |accessor| async move {
            let changes = parse_document(&body)?;
            let document = accessor.update_by_id(&id, changes).await?;
            found(&accessor.schema().name, &id, document)
        })
        .await
}

async fn delete_document(
    State(state): State<AppState>,
    Path((schema, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    state
        .with_accessor(&headers, &schema, |accessor| async move {
            let document = accessor.delete_by_id(&id).await?;
            found(&accessor.schema().name, &id, document)
        })
        .await
}
