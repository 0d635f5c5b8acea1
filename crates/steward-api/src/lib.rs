//! HTTP control surface over a shared steward runtime, plus the live pump
//! that sleeps until the next scheduled wake and dispatches it.
//!
//! This is the popup panel's backend: manager toggles land here as the
//! "managers changed" notification, queue edits are plain list edits (no
//! lock involved), and planned one-off actions are registered for the
//! orchestrator to pause colliding loops around.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use contracts::{
    BuildOrder, ManagerFlags, PlannedAction, RecruitOrder, RuntimeStatus, Settlement,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use steward_core::error::StructuralError;
use steward_core::runtime::AgentRuntime;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::info;

/// Upper bound on a pump sleep, so freshly registered work is noticed
/// promptly even when no timer is near.
const PUMP_IDLE_TICK_MS: u64 = 1000;
const PUMP_MIN_SLEEP_MS: u64 = 25;

pub fn wall_now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug)]
pub enum ServerError {
    Io(std::io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<std::io::Error> for ServerError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

// ---------------------------------------------------------------------------
// Error envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    #[serde(skip)]
    status: StatusCode,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            status,
        }
    }
}

impl From<StructuralError> for ApiError {
    fn from(value: StructuralError) -> Self {
        let (status, code) = match &value {
            StructuralError::UnknownSettlement { .. } => {
                (StatusCode::NOT_FOUND, "unknown_settlement")
            }
            StructuralError::UnknownStructure { .. } => (StatusCode::BAD_REQUEST, "unknown_structure"),
            StructuralError::UnknownUnit { .. } => (StatusCode::BAD_REQUEST, "unknown_unit"),
            StructuralError::DuplicateActionId { .. } => {
                (StatusCode::CONFLICT, "duplicate_action_id")
            }
        };
        Self::new(status, code, value.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(json!({ "error": self }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    runtime: Arc<Mutex<AgentRuntime>>,
}

impl AppState {
    pub fn new(runtime: AgentRuntime) -> Self {
        Self {
            runtime: Arc::new(Mutex::new(runtime)),
        }
    }
}

/// Background task driving the runtime: dispatch due wakes, then sleep until
/// the next deadline (bounded by the idle tick).
pub fn spawn_pump(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let sleep_ms = {
                let mut runtime = state.runtime.lock().await;
                let now = wall_now_ms();
                runtime.run_due(now);
                runtime
                    .next_due()
                    .map(|due| due.saturating_sub(now))
                    .unwrap_or(PUMP_IDLE_TICK_MS)
                    .clamp(PUMP_MIN_SLEEP_MS, PUMP_IDLE_TICK_MS)
            };
            tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
        }
    })
}

pub async fn serve(addr: SocketAddr, state: AppState) -> Result<(), ServerError> {
    let pump = spawn_pump(state.clone());
    let app = router(state);

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "steward control api listening");
    let result = axum::serve(listener, app).await;
    pump.abort();
    result?;

    Ok(())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/status", get(get_status))
        .route("/api/v1/settlements", get(get_settlements))
        .route("/api/v1/catalog", get(get_catalog))
        .route("/api/v1/managers", get(get_managers).post(set_managers))
        .route("/api/v1/queues/{settlement}", get(get_queues))
        .route("/api/v1/queues/{settlement}/build", post(queue_build))
        .route(
            "/api/v1/queues/{settlement}/build/{index}",
            axum::routing::delete(remove_build),
        )
        .route("/api/v1/queues/{settlement}/recruit", post(queue_recruit))
        .route(
            "/api/v1/queues/{settlement}/recruit/{index}",
            axum::routing::delete(remove_recruit),
        )
        .route("/api/v1/actions", get(list_actions).post(register_action))
        .route(
            "/api/v1/actions/{action_id}",
            axum::routing::delete(cancel_action),
        )
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueuesResponse {
    pub build: Vec<BuildOrder>,
    pub recruit: Vec<RecruitOrder>,
}

async fn get_status(State(state): State<AppState>) -> Json<RuntimeStatus> {
    let runtime = state.runtime.lock().await;
    Json(runtime.status(wall_now_ms()))
}

async fn get_settlements(State(state): State<AppState>) -> Json<Vec<Settlement>> {
    let runtime = state.runtime.lock().await;
    Json(runtime.settlements().to_vec())
}

/// Structure/unit identity tables, for the popup panel's pickers.
async fn get_catalog(State(state): State<AppState>) -> Json<contracts::GameCatalog> {
    let runtime = state.runtime.lock().await;
    Json(runtime.catalog().clone())
}

async fn get_managers(State(state): State<AppState>) -> Json<ManagerFlags> {
    let runtime = state.runtime.lock().await;
    Json(runtime.config().managers)
}

/// The popup panel's single "managers changed" notification.
async fn set_managers(
    State(state): State<AppState>,
    Json(flags): Json<ManagerFlags>,
) -> Json<ManagerFlags> {
    let mut runtime = state.runtime.lock().await;
    runtime.set_manager_flags(flags, wall_now_ms());
    Json(runtime.config().managers)
}

async fn get_queues(
    State(state): State<AppState>,
    Path(settlement): Path<String>,
) -> Result<Json<QueuesResponse>, ApiError> {
    let runtime = state.runtime.lock().await;
    let build = runtime
        .build_queue(&settlement)
        .ok_or_else(|| unknown_settlement(&settlement))?
        .orders()
        .to_vec();
    let recruit = runtime
        .recruit_queue(&settlement)
        .ok_or_else(|| unknown_settlement(&settlement))?
        .orders()
        .to_vec();
    Ok(Json(QueuesResponse { build, recruit }))
}

async fn queue_build(
    State(state): State<AppState>,
    Path(settlement): Path<String>,
    Json(order): Json<BuildOrder>,
) -> Result<StatusCode, ApiError> {
    let mut runtime = state.runtime.lock().await;
    runtime.queue_build(&settlement, order, wall_now_ms())?;
    Ok(StatusCode::CREATED)
}

async fn remove_build(
    State(state): State<AppState>,
    Path((settlement, index)): Path<(String, usize)>,
) -> Result<Json<Option<BuildOrder>>, ApiError> {
    let mut runtime = state.runtime.lock().await;
    Ok(Json(runtime.remove_build(&settlement, index)?))
}

async fn queue_recruit(
    State(state): State<AppState>,
    Path(settlement): Path<String>,
    Json(order): Json<RecruitOrder>,
) -> Result<StatusCode, ApiError> {
    let mut runtime = state.runtime.lock().await;
    runtime.queue_recruit(&settlement, order, wall_now_ms())?;
    Ok(StatusCode::CREATED)
}

async fn remove_recruit(
    State(state): State<AppState>,
    Path((settlement, index)): Path<(String, usize)>,
) -> Result<Json<Option<RecruitOrder>>, ApiError> {
    let mut runtime = state.runtime.lock().await;
    Ok(Json(runtime.remove_recruit(&settlement, index)?))
}

async fn list_actions(State(state): State<AppState>) -> Json<Vec<PlannedAction>> {
    let runtime = state.runtime.lock().await;
    Json(runtime.planned_actions())
}

async fn register_action(
    State(state): State<AppState>,
    Json(action): Json<PlannedAction>,
) -> Result<StatusCode, ApiError> {
    let mut runtime = state.runtime.lock().await;
    runtime.register_action(action, wall_now_ms())?;
    Ok(StatusCode::CREATED)
}

async fn cancel_action(
    State(state): State<AppState>,
    Path(action_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let mut runtime = state.runtime.lock().await;
    if runtime.cancel_action(&action_id, wall_now_ms()) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "unknown_action",
            format!("no planned action {action_id}"),
        ))
    }
}

fn unknown_settlement(settlement: &str) -> ApiError {
    ApiError::from(StructuralError::UnknownSettlement {
        name: settlement.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{AgentConfig, GameCatalog, ManagerFlags};
    use steward_core::sim::{SimSettlement, SimWorld, SimulatedDriver};
    use steward_core::stacking::NoopStacker;
    use steward_core::store::MemoryStore;

    fn test_state() -> AppState {
        let (driver, _handle) = SimulatedDriver::new(SimWorld::new(vec![
            SimSettlement::new("north"),
            SimSettlement::new("south"),
        ]));
        let config = AgentConfig {
            humanize: false,
            managers: ManagerFlags {
                farming: false,
                building: false,
                recruiting: false,
            },
            ..AgentConfig::default()
        };
        let retry = config.build_retry_interval_ms;
        let runtime = AgentRuntime::new(
            config,
            GameCatalog::default_catalog(),
            Box::new(driver),
            Box::new(MemoryStore::new()),
            Box::new(NoopStacker::new(retry)),
            0,
        )
        .expect("runtime");
        AppState::new(runtime)
    }

    #[tokio::test]
    async fn status_lists_every_loop() {
        let state = test_state();
        let Json(status) = get_status(State(state)).await;
        // Two settlements: farming + building + recruiting each.
        assert_eq!(status.loops.len(), 6);
    }

    #[tokio::test]
    async fn queue_build_round_trips_through_the_handlers() {
        let state = test_state();
        let created = queue_build(
            State(state.clone()),
            Path("north".to_string()),
            Json(BuildOrder::new("farm", 3)),
        )
        .await
        .expect("create");
        assert_eq!(created, StatusCode::CREATED);

        let Json(queues) = get_queues(State(state.clone()), Path("north".to_string()))
            .await
            .expect("queues");
        assert_eq!(queues.build, vec![BuildOrder::new("farm", 3)]);

        let Json(removed) = remove_build(State(state), Path(("north".to_string(), 0)))
            .await
            .expect("remove");
        assert_eq!(removed, Some(BuildOrder::new("farm", 3)));
    }

    #[tokio::test]
    async fn unknown_settlement_is_a_structured_error() {
        let state = test_state();
        let err = get_queues(State(state), Path("atlantis".to_string()))
            .await
            .expect_err("should fail");
        assert_eq!(err.code, "unknown_settlement");
    }

    #[tokio::test]
    async fn manager_toggle_applies_to_the_runtime() {
        let state = test_state();
        let flags = ManagerFlags {
            farming: true,
            building: false,
            recruiting: false,
        };
        let Json(applied) = set_managers(State(state.clone()), Json(flags)).await;
        assert_eq!(applied, flags);

        let Json(status) = get_status(State(state)).await;
        let farming_enabled = status
            .loops
            .iter()
            .filter(|entry| matches!(entry.task, contracts::TaskRef::Farming { .. }))
            .all(|entry| entry.enabled);
        assert!(farming_enabled);
    }

    #[tokio::test]
    async fn cancelling_a_missing_action_is_not_found() {
        let state = test_state();
        let err = cancel_action(State(state), Path("nope".to_string()))
            .await
            .expect_err("should fail");
        assert_eq!(err.code, "unknown_action");
    }
}
