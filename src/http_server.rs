//! HTTP server implementation using Axum.

use crate::error::SessionError;
use crate::pipeline::{ExecutionRequest, ExecutionResult};
use crate::reaper;
use crate::registry::SessionConfig;
use crate::session::SessionInfo;
use crate::state::AppState;
use crate::stream;
use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Response, Sse,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::{Future, IntoFuture};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_stream::{wrappers::UnboundedReceiverStream, StreamExt};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

// Request/Response types
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum SessionAction {
    Create {
        #[serde(default)]
        config: CreateConfig,
    },
    #[serde(rename_all = "camelCase")]
    Run {
        #[serde(default)]
        sandbox_id: String,
        #[serde(default)]
        prompt: String,
        #[serde(default)]
        options: RunOptionsBody,
    },
    #[serde(rename_all = "camelCase")]
    Playwright {
        #[serde(default)]
        sandbox_id: String,
        #[serde(default)]
        script: String,
    },
    #[serde(rename_all = "camelCase")]
    Terminate {
        #[serde(default)]
        sandbox_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Status {
        #[serde(default)]
        sandbox_id: Option<String>,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateConfig {
    template: Option<String>,
    base_url: Option<String>,
    #[serde(default)]
    envs: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunOptionsBody {
    working_directory: Option<String>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamParams {
    sandbox_id: Option<String>,
    prompt: Option<String>,
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

#[derive(Serialize)]
struct SuccessBody {
    success: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateResponse {
    success: bool,
    sandbox_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RunResponse {
    success: bool,
    stdout: String,
    stderr: String,
    exit_code: i32,
    files: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PlaywrightResponse {
    success: bool,
    stdout: String,
    stderr: String,
    exit_code: i32,
    screenshots: Vec<String>,
}

/// Session snapshot as reported by `status`.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionView {
    #[serde(flatten)]
    info: SessionInfo,
    /// Milliseconds since creation.
    age: i64,
}

impl From<SessionInfo> for SessionView {
    fn from(info: SessionInfo) -> Self {
        let age = (Utc::now() - info.created_at).num_milliseconds().max(0);
        Self { info, age }
    }
}

#[derive(Serialize)]
struct SessionStatusResponse {
    success: bool,
    #[serde(flatten)]
    session: SessionView,
}

#[derive(Serialize)]
struct SessionListResponse {
    success: bool,
    count: usize,
    sessions: Vec<SessionView>,
}

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    provider: &'static str,
    sessions: usize,
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!(error = %self, "Request failed");
        }
        let body = ErrorBody {
            success: false,
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Build the router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/agent-sessions", post(agent_sessions))
        .route("/agent-sessions/stream", get(agent_stream))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind the configured address and [`serve`] until `shutdown` resolves.
pub async fn run_server(
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = TcpListener::bind((state.config.host.as_str(), state.config.port)).await?;
    serve(listener, state, shutdown).await
}

/// Serve on `listener` until `shutdown` resolves. Every session is then
/// drained, and open connections get at most the configured shutdown
/// deadline to finish.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let deadline = state.config.shutdown_deadline;
    let registry = state.registry.clone();
    info!(addr = %listener.local_addr()?, "Starting server");

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let mut server = tokio::spawn(
        axum::serve(listener, build_router(state))
            .with_graceful_shutdown(async move {
                let _ = stop_rx.await;
            })
            .into_future(),
    );

    let finished = tokio::select! {
        joined = &mut server => Some(joined),
        () = shutdown => None,
    };
    let _ = stop_tx.send(());

    // Killing the sandboxes first ends in-flight streams with an error event.
    let drained = reaper::drain(&registry, deadline).await;
    info!(drained, "Sessions drained");

    let joined = match finished {
        Some(joined) => joined,
        None => match tokio::time::timeout(deadline, &mut server).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!(?deadline, "Connections still open after shutdown deadline");
                server.abort();
                return Ok(());
            }
        },
    };
    joined.map_err(std::io::Error::other)?
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        provider: state.registry.provider_name(),
        sessions: state.registry.len().await,
    })
}

async fn agent_sessions(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Response, SessionError> {
    let Json(payload) = payload.map_err(|rejection| SessionError::invalid(rejection.body_text()))?;
    let action: SessionAction = serde_json::from_value(payload)
        .map_err(|e| SessionError::invalid(format!("Invalid request: {e}")))?;

    match action {
        SessionAction::Create { config } => create_session(&state, config).await,
        SessionAction::Run {
            sandbox_id,
            prompt,
            options,
        } => {
            let request = ExecutionRequest {
                sandbox_id,
                body: prompt,
                working_dir: options.working_directory,
                timeout: options.timeout_ms.map(Duration::from_millis),
            };
            let result = state.pipeline.run_agent(request, None).await?;
            Ok(Json(run_response(result)).into_response())
        }
        SessionAction::Playwright { sandbox_id, script } => {
            let result = state
                .pipeline
                .run_playwright(ExecutionRequest::new(sandbox_id, script), None)
                .await?;
            Ok(Json(PlaywrightResponse {
                success: true,
                stdout: result.stdout,
                stderr: result.stderr,
                exit_code: result.exit_code,
                screenshots: result.artifacts,
            })
            .into_response())
        }
        SessionAction::Terminate { sandbox_id } => {
            if sandbox_id.trim().is_empty() {
                return Err(SessionError::invalid("sandboxId is required"));
            }
            state.registry.terminate(&sandbox_id).await?;
            Ok(Json(SuccessBody { success: true }).into_response())
        }
        SessionAction::Status { sandbox_id } => match sandbox_id.filter(|id| !id.is_empty()) {
            Some(id) => {
                let info = state.registry.touch(&id).await?;
                Ok(Json(SessionStatusResponse {
                    success: true,
                    session: info.into(),
                })
                .into_response())
            }
            None => {
                let sessions: Vec<SessionView> = state
                    .registry
                    .list()
                    .await
                    .into_iter()
                    .map(SessionView::from)
                    .collect();
                Ok(Json(SessionListResponse {
                    success: true,
                    count: sessions.len(),
                    sessions,
                })
                .into_response())
            }
        },
    }
}

async fn create_session(state: &AppState, config: CreateConfig) -> Result<Response, SessionError> {
    let template = config
        .template
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| state.config.template.clone());
    let envs = state
        .config
        .session_envs(config.base_url.as_deref(), config.envs);

    let info = state
        .registry
        .create(SessionConfig { template, envs })
        .await?;
    Ok(Json(CreateResponse {
        success: true,
        sandbox_id: info.sandbox_id,
    })
    .into_response())
}

fn run_response(result: ExecutionResult) -> RunResponse {
    RunResponse {
        success: true,
        stdout: result.stdout,
        stderr: result.stderr,
        exit_code: result.exit_code,
        files: result.artifacts,
    }
}

async fn agent_stream(
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
) -> Result<Response, SessionError> {
    let sandbox_id = params
        .sandbox_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| SessionError::invalid("sandboxId is required"))?;
    let prompt = params
        .prompt
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| SessionError::invalid("prompt is required"))?;

    let events = stream::spawn_execution(
        state.pipeline.clone(),
        ExecutionRequest::new(sandbox_id, prompt),
    );
    let frames = UnboundedReceiverStream::new(events).map(|event| Event::default().json_data(event));

    Ok(Sse::new(frames)
        .keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE))
        .into_response())
}
