use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use replaykit::{EvalRunRequest, EvalRunResult, ReplayConfig, RunEvent, RunOrchestrator};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,replay_server=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::var("REPLAY_CONFIG").ok().map(std::path::PathBuf::from);
    let config = ReplayConfig::load(config_path.as_deref())?;
    let orchestrator = RunOrchestrator::from_env(&config)?;

    let app_state = Arc::new(AppState {
        orchestrator: Arc::new(orchestrator),
        runs: Mutex::new(RunRegistry::new(RETAINED_RUNS)),
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health))
        .route("/api/runs", post(start_run))
        .route("/api/runs/{id}", get(get_run))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let addr: SocketAddr = std::env::var("REPLAY_SERVER_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:3002".into())
        .parse()?;
    tracing::info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Finished runs kept for polling; older ones are evicted first.
const RETAINED_RUNS: usize = 500;

struct AppState {
    orchestrator: Arc<RunOrchestrator>,
    runs: Mutex<RunRegistry>,
}

struct RunRegistry {
    statuses: HashMap<String, RunStatus>,
    finished: VecDeque<String>,
    capacity: usize,
}

impl RunRegistry {
    fn new(capacity: usize) -> Self {
        Self {
            statuses: HashMap::new(),
            finished: VecDeque::new(),
            capacity,
        }
    }

    fn start(&mut self, run_id: String) {
        self.finished.retain(|id| id != &run_id);
        self.statuses.insert(run_id, RunStatus::Pending);
    }

    fn finish(&mut self, run_id: String, status: RunStatus) {
        self.finished.retain(|id| id != &run_id);
        self.finished.push_back(run_id.clone());
        self.statuses.insert(run_id, status);

        while self.finished.len() > self.capacity {
            if let Some(evicted) = self.finished.pop_front() {
                self.statuses.remove(&evicted);
            }
        }
    }

    fn get(&self, run_id: &str) -> Option<RunStatus> {
        self.statuses.get(run_id).cloned()
    }
}

#[derive(Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum RunStatus {
    Pending,
    Finished { run: EvalRunResult },
    Failed { error: String },
}

#[derive(Serialize)]
struct ApiResponse<T> {
    data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    success: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartedRun {
    run_id: String,
    event_id: String,
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn start_run(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EvalRunRequest>,
) -> impl IntoResponse {
    if let Err(e) = request.validate() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse {
                data: None::<StartedRun>,
                message: Some(format!("Invalid run request: {}", e)),
                success: false,
            }),
        )
            .into_response();
    }

    let event = RunEvent::new(request);
    let run_id = event.run_id();
    let event_id = event.id.clone();
    state.runs.lock().unwrap().start(run_id.clone());

    let task_state = state.clone();
    let task_run_id = run_id.clone();
    tokio::spawn(async move {
        let status = match task_state.orchestrator.run(&event).await {
            Ok(run) => RunStatus::Finished { run },
            Err(e) => {
                tracing::error!(run_id = %task_run_id, error = %e, "run failed");
                RunStatus::Failed {
                    error: e.to_string(),
                }
            }
        };
        task_state.runs.lock().unwrap().finish(task_run_id, status);
    });

    (
        StatusCode::ACCEPTED,
        Json(ApiResponse {
            data: Some(StartedRun {
                run_id,
                event_id,
            }),
            message: Some("Run started".into()),
            success: true,
        }),
    )
        .into_response()
}

async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let status = state.runs.lock().unwrap().get(&id);
    match status {
        Some(status) => Json(ApiResponse {
            data: Some(status),
            message: None,
            success: true,
        })
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse {
                data: None::<RunStatus>,
                message: Some("Run not found".into()),
                success: false,
            }),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(message: &str) -> RunStatus {
        RunStatus::Failed {
            error: message.into(),
        }
    }

    #[test]
    fn registry_evicts_oldest_finished_runs() {
        let mut runs = RunRegistry::new(2);
        for id in ["a", "b", "c"] {
            runs.start(id.into());
        }
        runs.start("pending".into());
        runs.finish("a".into(), failed("a"));
        runs.finish("b".into(), failed("b"));
        runs.finish("c".into(), failed("c"));

        assert!(runs.get("a").is_none());
        assert!(matches!(runs.get("b"), Some(RunStatus::Failed { .. })));
        assert!(matches!(runs.get("c"), Some(RunStatus::Failed { .. })));
        assert!(matches!(runs.get("pending"), Some(RunStatus::Pending)));
    }

    #[test]
    fn restarted_run_is_not_evicted_by_its_old_entry() {
        let mut runs = RunRegistry::new(1);
        runs.finish("a".into(), failed("first"));
        runs.start("a".into());
        runs.finish("b".into(), failed("b"));

        assert!(matches!(runs.get("a"), Some(RunStatus::Pending)));
        assert!(runs.get("b").is_some());
    }
}
