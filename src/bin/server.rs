use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use pruefwerk::{
    eval::{
        compare_to_baseline, save_baseline, CancelFlag, ContainsExpected, Dataset, EvalRunner,
        EvalStore, HttpExecutor, JsonDirStore, MetadataPolicy, RunOptions, RunSnapshot,
        SetEquality,
    },
    EvalConfig, EvalError, StoreError,
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,pruefwerk=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let store_dir = std::env::var("PRUEFWERK_STORE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(".pruefwerk"));
    let store: Arc<dyn EvalStore> = Arc::new(JsonDirStore::open(&store_dir).await?);
    let runner = EvalRunner::new(store.clone(), EvalConfig::from_env())?;
    tracing::info!(store = %store_dir.display(), judge = ?runner.judge_kind(), "store opened");

    let app_state = Arc::new(AppState {
        store,
        runner,
        active: Mutex::new(HashMap::new()),
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health))
        .route("/api/datasets", get(list_datasets).post(put_dataset))
        .route("/api/runs", get(list_runs).post(start_run))
        .route("/api/runs/{id}", get(get_run).delete(delete_run))
        .route("/api/runs/{id}/cancel", post(cancel_run))
        .route("/api/baselines", get(list_baselines))
        .route(
            "/api/baselines/{dataset_id}",
            get(get_baseline).post(save_dataset_baseline),
        )
        .route(
            "/api/baselines/{dataset_id}/compare/{run_id}",
            get(compare_run),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let port = std::env::var("PORT")
        .ok()
        .and_then(|port| port.parse().ok())
        .unwrap_or(3002);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

struct AppState {
    store: Arc<dyn EvalStore>,
    runner: EvalRunner,
    /// Cancel flags of runs started by this process that are still executing.
    active: Mutex<HashMap<Uuid, CancelFlag>>,
}

#[derive(Serialize)]
struct ApiResponse<T> {
    data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    success: bool,
}

fn ok<T: Serialize>(data: T) -> Response {
    Json(ApiResponse {
        data,
        message: None,
        success: true,
    })
    .into_response()
}

fn fail(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ApiResponse {
            data: (),
            message: Some(message.into()),
            success: false,
        }),
    )
        .into_response()
}

fn eval_failure(err: EvalError) -> Response {
    let status = match &err {
        EvalError::Setup { .. } | EvalError::Baseline(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EvalError::Store(StoreError::RunNotFound(_)) => StatusCode::NOT_FOUND,
        EvalError::Store(_) | EvalError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    fail(status, err.to_string())
}

fn store_failure(err: StoreError) -> Response {
    eval_failure(err.into())
}

async fn health() -> impl IntoResponse {
    ok(serde_json::json!({ "status": "ok" }))
}

async fn list_datasets(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list_datasets().await {
        Ok(datasets) => ok(datasets),
        Err(e) => store_failure(e),
    }
}

async fn put_dataset(State(state): State<Arc<AppState>>, Json(dataset): Json<Dataset>) -> Response {
    let id = dataset.id.clone();
    match state.store.put_dataset(dataset).await {
        Ok(()) => ok(serde_json::json!({ "id": id })),
        Err(e) => fail(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

#[derive(Deserialize)]
struct RunFilter {
    dataset_id: Option<String>,
}

async fn list_runs(State(state): State<Arc<AppState>>, Query(filter): Query<RunFilter>) -> Response {
    match state.store.list_runs(filter.dataset_id.as_deref()).await {
        Ok(runs) => ok(runs),
        Err(e) => store_failure(e),
    }
}

#[derive(Deserialize, Clone, Copy)]
#[serde(rename_all = "lowercase")]
enum MetadataCheck {
    Set,
    Contains,
}

#[derive(Deserialize)]
struct StartRunRequest {
    dataset_id: String,
    agent_url: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    case_ids: Option<Vec<String>>,
    #[serde(default)]
    max_workers: Option<usize>,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    metadata_check: Option<MetadataCheck>,
    #[serde(default)]
    metadata_policy: Option<MetadataPolicy>,
}

impl StartRunRequest {
    fn options(&self) -> RunOptions {
        let mut options = RunOptions::new();
        if let Some(name) = &self.name {
            options = options.with_eval_name(name.clone());
        }
        if let Some(ids) = &self.case_ids {
            options = options.with_case_ids(ids.iter().cloned());
        }
        if let Some(workers) = self.max_workers {
            options = options.with_concurrency(workers);
        }
        if let Some(ms) = self.timeout_ms {
            options = options.with_case_timeout(Duration::from_millis(ms));
        }
        if let Some(policy) = self.metadata_policy {
            options = options.with_metadata_policy(policy);
        }
        match self.metadata_check {
            Some(MetadataCheck::Set) => options.with_metadata_checker(SetEquality::all_keys()),
            Some(MetadataCheck::Contains) => options.with_metadata_checker(ContainsExpected),
            None => options,
        }
    }
}

/// Starts a run in the background and answers with the freshly persisted
/// run; clients poll `GET /api/runs/{id}` until it is terminal.
async fn start_run(State(state): State<Arc<AppState>>, Json(req): Json<StartRunRequest>) -> Response {
    let executor = match HttpExecutor::new(req.agent_url.clone()) {
        Ok(executor) => Arc::new(executor),
        Err(e) => return fail(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let handle = match state
        .runner
        .start_run(&req.dataset_id, executor, req.options())
        .await
    {
        Ok(handle) => handle,
        Err(e) => return eval_failure(e),
    };

    let run = handle.started().clone();
    state.active.lock().await.insert(run.id, handle.cancel_flag());

    let watcher = state.clone();
    tokio::spawn(async move {
        let run_id = handle.run_id();
        if let Err(err) = handle.wait().await {
            tracing::error!(%run_id, error = %err, "run ended with an error");
        }
        watcher.active.lock().await.remove(&run_id);
    });

    (
        StatusCode::ACCEPTED,
        Json(ApiResponse {
            data: run,
            message: Some("Run started".into()),
            success: true,
        }),
    )
        .into_response()
}

async fn get_run(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match RunSnapshot::load(state.store.as_ref(), id).await {
        Ok(Some(snapshot)) => ok(snapshot),
        Ok(None) => fail(StatusCode::NOT_FOUND, "Run not found"),
        Err(e) => store_failure(e),
    }
}

async fn cancel_run(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match state.active.lock().await.get(&id) {
        Some(flag) => {
            flag.cancel();
            ok(serde_json::json!({ "id": id, "cancelled": true }))
        }
        None => fail(StatusCode::CONFLICT, "Run is not executing"),
    }
}

async fn delete_run(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    if state.active.lock().await.contains_key(&id) {
        return fail(StatusCode::CONFLICT, "Run is still executing");
    }
    match state.store.delete_run(id).await {
        Ok(true) => ok(serde_json::json!({ "id": id })),
        Ok(false) => fail(StatusCode::NOT_FOUND, "Run not found"),
        Err(e) => store_failure(e),
    }
}

async fn list_baselines(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list_baselines().await {
        Ok(baselines) => ok(baselines),
        Err(e) => store_failure(e),
    }
}

async fn get_baseline(State(state): State<Arc<AppState>>, Path(dataset_id): Path<String>) -> Response {
    match state.store.get_baseline(&dataset_id).await {
        Ok(Some(baseline)) => ok(baseline),
        Ok(None) => fail(StatusCode::NOT_FOUND, "No baseline for dataset"),
        Err(e) => store_failure(e),
    }
}

#[derive(Deserialize)]
struct SaveBaselineRequest {
    run_id: Uuid,
}

async fn save_dataset_baseline(
    State(state): State<Arc<AppState>>,
    Path(dataset_id): Path<String>,
    Json(req): Json<SaveBaselineRequest>,
) -> Response {
    match save_baseline(state.store.as_ref(), &dataset_id, req.run_id).await {
        Ok(baseline) => ok(baseline),
        Err(e) => eval_failure(e),
    }
}

async fn compare_run(
    State(state): State<Arc<AppState>>,
    Path((dataset_id, run_id)): Path<(String, Uuid)>,
) -> Response {
    match compare_to_baseline(state.store.as_ref(), &dataset_id, run_id).await {
        Ok(report) => ok(report),
        Err(e) => eval_failure(e),
    }
}
