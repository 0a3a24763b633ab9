//! Control endpoints served while the daemon runs.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use rhythm_health::HealthStatus;
use rhythm_scheduler::{HealthSnapshot, RhythmOrchestrator, SchedulerError};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Shared state passed as `Arc<AppState>` to every handler.
pub struct AppState {
    pub orchestrator: Arc<RhythmOrchestrator>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/dlq/replay", post(replay_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health: aggregate health.  503 while degraded so supervisors can
/// act on the status code alone.
pub async fn health_handler(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<HealthSnapshot>) {
    let snapshot = state.orchestrator.health_check();
    let code = match snapshot.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(snapshot))
}

#[derive(Debug, Default, Deserialize)]
pub struct ReplayRequest {
    /// Replay exactly this entry.
    pub id: Option<String>,
    #[serde(default = "default_replay_limit")]
    pub limit: usize,
    #[serde(default)]
    pub include_abandoned: bool,
}

fn default_replay_limit() -> usize {
    20
}

/// POST /dlq/replay: operator-triggered replay.
pub async fn replay_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReplayRequest>,
) -> (StatusCode, Json<Value>) {
    let orchestrator = &state.orchestrator;
    let result = match &req.id {
        Some(id) => orchestrator
            .replay_entry(id)
            .await
            .map(|r| json!({ "id": id, "result": r })),
        None => orchestrator
            .replay(req.limit, req.include_abandoned)
            .await
            .map(|r| {
                json!({
                    "resolved": r.resolved(),
                    "failed": r.failed(),
                    "skipped": r.skipped(),
                    "results": r.results,
                })
            }),
    };

    match result {
        Ok(body) => (StatusCode::OK, Json(body)),
        Err(e) => {
            warn!(error = %e, "replay request failed");
            let code = match &e {
                SchedulerError::Dlq(rhythm_dlq::DlqError::EntryNotFound { .. }) => {
                    StatusCode::NOT_FOUND
                }
                SchedulerError::NotAccepting(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (code, Json(json!({ "error": e.to_string() })))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rhythm_core::{ErrorKind, JobClass, JobSpec, RhythmConfig};
    use rhythm_dlq::{DeadLetterEntry, DeadLetterQueue, DlqStatus};
    use rhythm_executor::JobExecutor;
    use rhythm_health::SqliteProbe;
    use rusqlite::Connection;
    use std::time::Duration;

    fn state() -> Arc<AppState> {
        let mut cfg = RhythmConfig::default();
        // `true` succeeds for any class, so replays resolve.
        for class in JobClass::ALL {
            cfg.jobs.get_mut(class).command = Some(vec!["true".into()]);
        }
        let dlq = Arc::new(
            DeadLetterQueue::new(Connection::open_in_memory().unwrap(), 10, 3).unwrap(),
        );
        let orchestrator = RhythmOrchestrator::new(
            &cfg,
            dlq,
            Arc::new(SqliteProbe::new("/nonexistent/warehouse.db")),
            Arc::new(JobExecutor::new(&cfg.executor)),
        )
        .unwrap();
        Arc::new(AppState {
            orchestrator: Arc::new(orchestrator),
        })
    }

    #[tokio::test]
    async fn health_is_unavailable_before_start() {
        let (code, Json(snapshot)) = health_handler(State(state())).await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(snapshot.breaker_states.len(), 5);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn replay_by_id_resolves_entry() {
        let state = state();
        let spec = JobSpec {
            class: JobClass::Rem,
            command: vec!["true".into()],
            timeout: Duration::from_secs(5),
            priority: 0,
        };
        let entry = DeadLetterEntry::new(&spec, ErrorKind::JobFailure, "exit code 1", 0, chrono::Utc::now());
        state.orchestrator.dlq().enqueue(&entry).unwrap();

        let req = ReplayRequest {
            id: Some(entry.id.clone()),
            ..ReplayRequest::default()
        };
        let (code, Json(body)) = replay_handler(State(Arc::clone(&state)), Json(req)).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["result"]["result"], "resolved");
        assert_eq!(
            state.orchestrator.dlq().get(&entry.id).unwrap().status,
            DlqStatus::Resolved
        );
    }

    #[tokio::test]
    async fn replay_unknown_id_is_not_found() {
        let req = ReplayRequest {
            id: Some("missing".into()),
            ..ReplayRequest::default()
        };
        let (code, _) = replay_handler(State(state()), Json(req)).await;
        assert_eq!(code, StatusCode::NOT_FOUND);
    }
}
