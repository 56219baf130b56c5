//! HTTP API for the execbox code execution service
//!
//! Exposes the submission gateway over JSON: a blocking `/execute` for the
//! editor's run button, `/submit` + `/status` + `/result` for callers that poll,
//! `/cancel` for jobs still waiting in the queue, and `/ai-complete` for inline
//! suggestions. Every error body has the same shape
//! (`{error, error_type, details, timestamp}`).

pub mod error;

pub use error::{Result, ServerError};

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::{middleware, Router};
use execbox_core::config::ServerSettings;
use execbox_core::jobs::{JobId, StateCounts};
use execbox_core::{ExecError, ExecutionService, Gateway, JobState, Language, SuggestionProvider};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Language used when a request does not name one.
pub const DEFAULT_LANGUAGE: &str = "python";

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub version: String,
    pub backend: String,
    pub workers: usize,
    pub queue_depth: usize,
    pub jobs: StateCounts,
}

#[derive(Debug, Deserialize)]
pub struct CodeRequest {
    pub code: String,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRequest {
    pub code: String,
    #[serde(default)]
    pub cursor_offset: usize,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub enable_cors: bool,
    /// CORS allowed origins (if None, allows any origin)
    pub cors_origins: Option<Vec<String>>,
    /// Maximum request body size in bytes
    pub max_body_size: usize,
    pub enable_logging: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8000)),
            enable_cors: true,
            cors_origins: None,
            max_body_size: 1024 * 1024,
            enable_logging: true,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the `server` section of the YAML configuration.
    pub fn from_settings(settings: &ServerSettings) -> Result<Self> {
        let config = Self::new()
            .with_bind_addr_str(&settings.bind_addr)?
            .with_cors(settings.enable_cors)
            .with_max_body_size(settings.max_body_size)
            .with_logging(settings.enable_logging);
        Ok(if settings.cors_origins.is_empty() {
            config
        } else {
            config.with_cors_origins(settings.cors_origins.clone())
        })
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Parse and set the bind address from a string.
    pub fn with_bind_addr_str(mut self, addr: &str) -> Result<Self> {
        self.bind_addr = addr
            .parse()
            .map_err(|e| ServerError::config_error(format!("Invalid bind address '{}': {}", addr, e)))?;
        Ok(self)
    }

    pub fn with_cors(mut self, enable: bool) -> Self {
        self.enable_cors = enable;
        self
    }

    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = Some(origins);
        self
    }

    pub fn with_max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = size;
        self
    }

    pub fn with_logging(mut self, enable: bool) -> Self {
        self.enable_logging = enable;
        self
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub completion: Arc<dyn SuggestionProvider>,
    pub workers: usize,
    pub backend: &'static str,
}

fn json_body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    match payload {
        Ok(Json(value)) => Ok(value),
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            Err(ServerError::PayloadTooLarge(rejection.body_text()))
        }
        Err(rejection) => Err(ServerError::invalid_request(rejection.body_text())),
    }
}

fn parse_job_id(raw: &str) -> Result<JobId> {
    raw.parse()
        .map_err(|_| ServerError::invalid_request(format!("'{}' is not a valid job id", raw)))
}

fn request_language(state: &AppState, language: Option<&str>) -> Result<Language> {
    Ok(state
        .gateway
        .parse_language(language.unwrap_or(DEFAULT_LANGUAGE))?)
}

async fn root_handler() -> Json<Value> {
    Json(json!({ "message": "Code Execution API is running" }))
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        backend: state.backend.to_string(),
        workers: state.workers,
        queue_depth: state.gateway.queue_depth(),
        jobs: state.gateway.store().counts(),
    })
}

async fn languages_handler(State(state): State<AppState>) -> Json<Value> {
    let languages: Vec<Value> = state
        .gateway
        .languages()
        .iter()
        .map(|language| {
            let recipe = language.recipe();
            json!({
                "name": language.name(),
                "file_name": recipe.file_name,
                "image": recipe.image,
            })
        })
        .collect();
    Json(json!({ "languages": languages }))
}

/// Handler for the /execute POST endpoint: run and wait for the result.
async fn execute_handler(
    State(state): State<AppState>,
    payload: std::result::Result<Json<CodeRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>)> {
    let request = json_body(payload)?;
    let language = request_language(&state, request.language.as_deref())?;
    log::debug!("Execute request: {} bytes of {}", request.code.len(), language);

    match state.gateway.execute(request.code, language).await {
        Ok(result) => Ok((StatusCode::OK, Json(serde_json::to_value(result)?))),
        Err(ExecError::WaitTimeout { job_id }) => {
            let job_state = state.gateway.status(&job_id)?;
            Ok((
                StatusCode::ACCEPTED,
                Json(json!({
                    "job_id": job_id,
                    "state": job_state,
                    "pending": true,
                    "message": "Execution is still running; poll /result/{job_id} for the outcome",
                    "timestamp": chrono::Utc::now()
                })),
            ))
        }
        Err(e) => Err(e.into()),
    }
}

/// Handler for the /submit POST endpoint: enqueue and return immediately.
async fn submit_handler(
    State(state): State<AppState>,
    payload: std::result::Result<Json<CodeRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>)> {
    let request = json_body(payload)?;
    let language = request_language(&state, request.language.as_deref())?;
    let job_id = state.gateway.submit(request.code, language)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "job_id": job_id,
            "state": JobState::Queued,
            "timestamp": chrono::Utc::now()
        })),
    ))
}

async fn status_handler(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>> {
    let job_id = parse_job_id(&job_id)?;
    let job_state = state.gateway.status(&job_id)?;
    Ok(Json(json!({ "job_id": job_id, "state": job_state })))
}

async fn result_handler(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<(StatusCode, Json<Value>)> {
    let job_id = parse_job_id(&job_id)?;
    match state.gateway.result(&job_id) {
        Ok(result) => Ok((StatusCode::OK, Json(serde_json::to_value(result)?))),
        Err(ExecError::NotReady { job_id, state }) => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "job_id": job_id, "state": state, "pending": true })),
        )),
        Err(e) => Err(e.into()),
    }
}

async fn cancel_handler(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>> {
    let job_id = parse_job_id(&job_id)?;
    let job = state.gateway.cancel(&job_id)?;
    Ok(Json(json!({
        "job_id": job.id,
        "state": job.state,
        "timestamp": chrono::Utc::now()
    })))
}

async fn job_handler(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>> {
    let job_id = parse_job_id(&job_id)?;
    let job = state.gateway.job(&job_id)?;
    Ok(Json(serde_json::to_value(job)?))
}

/// Handler for the /ai-complete POST endpoint. Provider failures yield an empty suggestion.
async fn completion_handler(
    State(state): State<AppState>,
    payload: std::result::Result<Json<CompletionRequest>, JsonRejection>,
) -> Result<Json<Value>> {
    let request = json_body(payload)?;
    let suggestion = state
        .completion
        .suggest(&request.code, request.cursor_offset)
        .await;
    Ok(Json(json!({ "suggestion": suggestion })))
}

fn is_polling_request(path: &str) -> bool {
    path == "/health" || path.starts_with("/status/") || path.starts_with("/result/")
}

pub struct ExecServer {
    state: AppState,
    config: ServerConfig,
}

impl ExecServer {
    pub fn new(service: &ExecutionService, config: ServerConfig) -> Self {
        Self::with_state(
            AppState {
                gateway: service.gateway(),
                completion: service.completion(),
                workers: service.workers(),
                backend: service.backend(),
            },
            config,
        )
    }

    pub fn with_state(state: AppState, config: ServerConfig) -> Self {
        Self { state, config }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Build the Axum router with all routes and middleware.
    pub fn build_router(&self) -> Router {
        let mut router = Router::new()
            .route("/", get(root_handler))
            .route("/health", get(health_handler))
            .route("/languages", get(languages_handler))
            .route("/execute", post(execute_handler))
            .route("/submit", post(submit_handler))
            .route("/status/{job_id}", get(status_handler))
            .route("/result/{job_id}", get(result_handler))
            .route("/cancel/{job_id}", post(cancel_handler))
            .route("/jobs/{job_id}", get(job_handler))
            .route("/ai-complete", post(completion_handler))
            .layer(DefaultBodyLimit::max(self.config.max_body_size))
            .with_state(self.state.clone());

        if self.config.enable_logging {
            router = router.layer(middleware::from_fn(
                |request: axum::http::Request<axum::body::Body>, next: axum::middleware::Next| async {
                    let request_id = uuid::Uuid::new_v4().to_string();
                    let method = request.method().clone();
                    let uri = request.uri().clone();
                    let polling = is_polling_request(uri.path());

                    if polling {
                        log::debug!("Request {} {} {}", request_id, method, uri);
                    } else {
                        log::info!("Request {} {} {}", request_id, method, uri);
                    }

                    let start = std::time::Instant::now();
                    let response = next.run(request).await;
                    let duration = start.elapsed();

                    if polling {
                        log::debug!(
                            "Response {} {} in {:?}",
                            request_id,
                            response.status(),
                            duration
                        );
                    } else {
                        log::info!(
                            "Response {} {} in {:?}",
                            request_id,
                            response.status(),
                            duration
                        );
                    }

                    response
                },
            ));
        }

        router = router.layer(TraceLayer::new_for_http());

        if self.config.enable_cors {
            let cors_layer = match &self.config.cors_origins {
                Some(origins) => {
                    let origins: std::result::Result<Vec<_>, _> =
                        origins.iter().map(|s| s.parse()).collect();
                    match origins {
                        Ok(origins) => CorsLayer::new()
                            .allow_origin(origins)
                            .allow_methods(Any)
                            .allow_headers(Any),
                        Err(_) => {
                            log::warn!("Invalid CORS origin in configuration; allowing any origin");
                            CorsLayer::permissive()
                        }
                    }
                }
                None => CorsLayer::permissive(),
            };
            router = router.layer(cors_layer);
        }

        router
    }

    /// Serve until `shutdown_signal` resolves, then drain open connections.
    pub async fn serve_with_shutdown<F>(self, shutdown_signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let router = self.build_router();
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| {
                ServerError::config_error(format!(
                    "Failed to bind to {}: {}",
                    self.config.bind_addr, e
                ))
            })?;

        log::info!(
            "execbox server listening on {} ({} backend, {} workers)",
            self.config.bind_addr,
            self.state.backend,
            self.state.workers
        );
        log::info!("Health check: http://{}/health", self.config.bind_addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| ServerError::internal(format!("Server error: {}", e)))?;

        log::info!("execbox server stopped accepting requests");
        Ok(())
    }
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            log::info!("Received SIGTERM, shutting down...");
        },
    }
}
