use crate::catalog::{CatalogError, ToolCatalog};
use crate::category::ToolCategory;
use crate::config::ServeConfig;
use crate::error::{DispatchError, JobError};
use crate::events::JobEvent;
use crate::history;
use crate::job::JobHandle;
use crate::metrics::MetricsReport;
use crate::registry::ActiveJob;
use crate::runtime::JobRuntime;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_stream::{Stream, StreamExt};
use tower_http::cors::CorsLayer;

type ApiError = (StatusCode, Json<serde_json::Value>);

/// How long open panel connections get to finish once jobs are stopped.
const CONNECTION_DRAIN: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct AppState {
    runtime: Arc<JobRuntime>,
    catalog: Arc<ToolCatalog>,
    history_db: Option<PathBuf>,
}

impl AppState {
    pub fn new(runtime: Arc<JobRuntime>, catalog: Arc<ToolCatalog>) -> Self {
        Self {
            runtime,
            catalog,
            history_db: None,
        }
    }

    /// Record every job started through the panel in this history database.
    pub fn with_history(mut self, db: PathBuf) -> Self {
        self.history_db = Some(db);
        self
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/{name}/cancel", post(cancel_job))
        .route("/api/categories/{category}/cancel", post(cancel_category))
        .route("/api/challenges/{challenge}/cancel", post(cancel_challenge))
        .route("/api/metrics", get(metrics))
        .route("/api/tools", get(list_tools))
        .route("/api/tools/{tool}/run", post(run_tool))
        .route("/api/events", get(events))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the job panel until `shutdown` resolves.
pub async fn run(
    state: AppState,
    config: &ServeConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!("serve listening on {local_addr}");

    serve_on(listener, state, shutdown).await
}

/// Serve on an already bound listener. When `shutdown` resolves the runtime
/// is shut down first, which also ends every event stream; connections that
/// are still open after [`CONNECTION_DRAIN`] are dropped.
pub async fn serve_on(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let runtime = Arc::clone(&state.runtime);
    let mut closing = runtime.closing();
    let app = router(state);

    let graceful = async move {
        shutdown.await;
        let stopped = runtime.shutdown().await;
        tracing::info!(stopped, "jobs stopped, closing panel connections");
    };
    let server = std::future::IntoFuture::into_future(
        axum::serve(listener, app).with_graceful_shutdown(graceful),
    );

    tokio::select! {
        result = server => result?,
        _ = async {
            let _ = closing.wait_for(|closing| *closing).await;
            tokio::time::sleep(CONNECTION_DRAIN).await;
        } => {
            tracing::warn!("panel connections still open after shutdown, dropping them");
        }
    }
    Ok(())
}

fn api_error(status: StatusCode, message: impl std::fmt::Display) -> ApiError {
    (
        status,
        Json(serde_json::json!({"error": message.to_string()})),
    )
}

fn dispatch_error(err: DispatchError) -> ApiError {
    let status = match &err {
        DispatchError::Catalog(CatalogError::UnknownTool { .. }) => StatusCode::NOT_FOUND,
        DispatchError::Catalog(CatalogError::MissingParam { .. }) => StatusCode::BAD_REQUEST,
        DispatchError::Job(JobError::DuplicateName { .. }) => StatusCode::CONFLICT,
        DispatchError::Job(JobError::Spawn { .. }) => StatusCode::UNPROCESSABLE_ENTITY,
        DispatchError::Job(JobError::ShuttingDown { .. }) => StatusCode::SERVICE_UNAVAILABLE,
        DispatchError::Job(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, err)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true}))
}

async fn list_jobs(State(state): State<AppState>) -> Json<Vec<ActiveJob>> {
    Json(state.runtime.list_active())
}

async fn metrics(State(state): State<AppState>) -> Json<MetricsReport> {
    Json(state.runtime.metrics())
}

#[derive(Deserialize, Default)]
struct CancelOptions {
    /// SIGKILL right away instead of SIGTERM and a grace period.
    #[serde(default)]
    force: bool,
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(opts): Query<CancelOptions>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.runtime.stop(&name, opts.force) {
        Ok(requested) => Ok(Json(serde_json::json!({"name": name, "requested": requested}))),
        Err(e @ JobError::NotFound { .. }) => Err(api_error(StatusCode::NOT_FOUND, e)),
        Err(e) => Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e)),
    }
}

async fn cancel_category(
    State(state): State<AppState>,
    Path(category): Path<String>,
) -> Json<serde_json::Value> {
    let category = ToolCategory::from(category.as_str());
    let requested = state.runtime.cancel_category(&category);
    Json(serde_json::json!({"category": category.to_string(), "requested": requested}))
}

async fn cancel_challenge(
    State(state): State<AppState>,
    Path(challenge): Path<String>,
) -> Json<serde_json::Value> {
    let requested = state.runtime.cancel_challenge(&challenge);
    Json(serde_json::json!({"challenge": challenge, "requested": requested}))
}

#[derive(Serialize)]
struct ToolInfo {
    name: String,
    description: String,
    category: String,
    program: String,
    params: Vec<String>,
    available: bool,
}

async fn list_tools(State(state): State<AppState>) -> Json<Vec<ToolInfo>> {
    let tools = state
        .catalog
        .tools()
        .iter()
        .map(|t| ToolInfo {
            name: t.name.clone(),
            description: t.description.clone(),
            category: t.category.to_string(),
            program: t.program.clone(),
            params: t.placeholders(),
            available: t.is_available(),
        })
        .collect();
    Json(tools)
}

#[derive(Deserialize, Default)]
struct RunRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    params: HashMap<String, String>,
    #[serde(default)]
    timeout_secs: Option<u64>,
    #[serde(default)]
    challenge_id: Option<String>,
}

async fn run_tool(
    State(state): State<AppState>,
    Path(tool): Path<String>,
    Json(req): Json<RunRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let name = req
        .name
        .unwrap_or_else(|| format!("{}-{}", tool, chrono::Utc::now().timestamp_millis()));
    let timeout = req.timeout_secs.filter(|s| *s > 0).map(Duration::from_secs);

    let handle = state
        .runtime
        .run_tool(
            &state.catalog,
            &tool,
            &name,
            &req.params,
            timeout,
            req.challenge_id.as_deref(),
        )
        .map_err(dispatch_error)?;
    if let Some(db) = &state.history_db {
        record_when_done(handle.clone(), db.clone());
    }

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "name": handle.name(),
            "pid": handle.pid(),
            "command": handle.command().to_string(),
            "timeout_secs": handle.timeout().map(|t| t.as_secs()),
            "challenge_id": handle.challenge(),
        })),
    ))
}

fn record_when_done(handle: JobHandle, db: PathBuf) {
    tokio::spawn(async move {
        let outcome = handle.wait().await;
        let result =
            history::open_or_create(&db).and_then(|conn| history::record(&conn, &outcome));
        if let Err(e) = result {
            tracing::warn!(job = %outcome.name, db = %db.display(), error = %e, "failed to record job history");
        }
    });
}

enum Feed {
    Job(Result<JobEvent, BroadcastStreamRecvError>),
    Closing(bool),
}

/// Job events as SSE until the runtime starts shutting down.
async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let jobs = BroadcastStream::new(state.runtime.subscribe()).map(Feed::Job);
    let closing = WatchStream::new(state.runtime.closing()).map(Feed::Closing);
    let stream = jobs
        .merge(closing)
        .take_while(|feed| !matches!(feed, Feed::Closing(true)))
        .filter_map(|feed| match feed {
            Feed::Job(Ok(event)) => Some(Event::default().json_data(&event)),
            Feed::Job(Err(e)) => {
                // Slow client; it misses some output but keeps the stream.
                tracing::debug!("event stream lagged: {e}");
                None
            }
            Feed::Closing(_) => None,
        });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
