use std::str::FromStr;
use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use serde::{Deserialize, Serialize};

use crate::engine::planner::FilterRequest;
use crate::engine::types::*;
use crate::engine::{USAGE_STATES, error::MonitorError};
use crate::storage::sql::render;

use super::AppState;
use super::errors::AppError;

// --- Request/Response types ---

/// Listing filters. List-valued parameters are comma separated.
#[derive(Deserialize, Default)]
pub struct FilterQuery {
    pub states: Option<String>,
    pub statuses: Option<String>,
    pub definitions: Option<String>,
    pub ids: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub cap: Option<usize>,
    /// Scan without a cap.
    #[serde(default)]
    pub all: bool,
}

impl FilterQuery {
    fn into_request(self, default_cap: usize) -> Result<FilterRequest, MonitorError> {
        Ok(FilterRequest {
            states: split_parse(self.states.as_deref())?,
            statuses: split_parse(self.statuses.as_deref())?,
            definition_ids: split_ids(self.definitions.as_deref())?,
            workflow_ids: split_ids(self.ids.as_deref())?,
            window: TimeWindow {
                from: self.from.as_deref().map(parse_timestamp).transpose()?,
                to: self.to.as_deref().map(parse_timestamp).transpose()?,
            },
            cap: if self.all {
                None
            } else {
                Some(self.cap.unwrap_or(default_cap))
            },
        })
    }
}

#[derive(Serialize)]
pub struct InstancesResponse {
    pub ids: Vec<WorkflowId>,
    pub total: usize,
}

#[derive(Serialize)]
pub struct StateResponse {
    pub workflow_id: WorkflowId,
    pub state: LifecycleState,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub workflow_id: WorkflowId,
    pub status: Status,
}

#[derive(Serialize)]
pub struct TransitionResponse {
    pub workflow_id: WorkflowId,
    pub success: bool,
}

#[derive(Deserialize, Default)]
pub struct TerminateRequest {
    #[serde(default)]
    pub user: Option<String>,
}

#[derive(Deserialize)]
pub struct InterruptRequest {
    pub kind: InterruptKind,
}

#[derive(Deserialize)]
pub struct BatchStatusRequest {
    pub ids: Vec<WorkflowId>,
}

#[derive(Deserialize, Default)]
pub struct UsageQuery {
    pub cap: Option<usize>,
}

#[derive(Deserialize, Default)]
pub struct MovableQuery {
    pub selection: Option<String>,
    pub max_rows: Option<usize>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

// --- Handlers ---

/// GET /instances
pub async fn list_instances(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FilterQuery>,
) -> Result<Json<InstancesResponse>, AppError> {
    let request = query.into_request(state.max_to_display)?;
    let ids = state.monitor.list_ids(&request).await?;
    let total = ids.len();
    Ok(Json(InstancesResponse { ids, total }))
}

/// GET /plan
pub async fn explain(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FilterQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let request = query.into_request(state.max_to_display)?;
    let plan = state.monitor.explain(&request)?;
    let dialect = state.monitor.config().dialect;

    Ok(Json(serde_json::json!({
        "plan": plan,
        "dialect": dialect,
        "sql": render(&plan, dialect),
    })))
}

/// GET /instances/:id/state
pub async fn get_state(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<StateResponse>, AppError> {
    let workflow_id = parse_workflow_id(&id)?;
    let lifecycle = state.monitor.instance_state(workflow_id).await;
    Ok(Json(StateResponse {
        workflow_id,
        state: lifecycle,
    }))
}

/// GET /instances/:id/status
pub async fn get_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, AppError> {
    let workflow_id = parse_workflow_id(&id)?;
    let status = state.monitor.instance_status(workflow_id).await;
    Ok(Json(StatusResponse {
        workflow_id,
        status,
    }))
}

/// POST /statuses
pub async fn batch_status(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BatchStatusRequest>,
) -> Json<serde_json::Value> {
    let statuses = state.monitor.instance_statuses(&req.ids).await;
    let entries: Vec<StatusResponse> = req
        .ids
        .iter()
        .filter_map(|id| {
            statuses.get(id).map(|status| StatusResponse {
                workflow_id: *id,
                status: *status,
            })
        })
        .collect();

    let total = entries.len();
    Json(serde_json::json!({
        "statuses": entries,
        "total": total,
    }))
}

/// GET /instances/:id/branches/:branch/history
pub async fn get_history(
    State(state): State<Arc<AppState>>,
    Path((id, branch)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, AppError> {
    let workflow_id = parse_workflow_id(&id)?;
    let records = state.monitor.branch_history(workflow_id, &branch).await?;

    Ok(Json(serde_json::json!({
        "workflow_id": workflow_id,
        "branch_id": branch,
        "records": records,
    })))
}

/// POST /instances/:id/terminate
pub async fn terminate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<TransitionResponse>, AppError> {
    let workflow_id = parse_workflow_id(&id)?;
    let req: TerminateRequest = if body.is_empty() {
        TerminateRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::BadRequest(format!("Invalid request body: {}", e)))?
    };
    let requester = req.user.map(Requester::user).unwrap_or_default();
    let success = state.monitor.terminate_as(workflow_id, &requester).await;
    Ok(Json(TransitionResponse {
        workflow_id,
        success,
    }))
}

/// POST /instances/:id/interrupt
pub async fn interrupt(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<InterruptRequest>,
) -> Result<Json<TransitionResponse>, AppError> {
    let workflow_id = parse_workflow_id(&id)?;
    let success = state.monitor.interrupt(workflow_id, req.kind).await;
    Ok(Json(TransitionResponse {
        workflow_id,
        success,
    }))
}

/// POST /instances/:id/force-terminate
pub async fn force_terminate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let workflow_id = parse_workflow_id(&id)?;
    let report = state.monitor.force_terminate_report(workflow_id).await;

    Ok(Json(serde_json::json!({
        "workflow_id": workflow_id,
        "success": report.succeeded(),
        "branches": report.rows,
    })))
}

/// POST /instances/:id/stop
pub async fn stop(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TransitionResponse>, AppError> {
    let workflow_id = parse_workflow_id(&id)?;
    let success = state.monitor.stop(workflow_id).await;
    Ok(Json(TransitionResponse {
        workflow_id,
        success,
    }))
}

/// GET /shutdown
pub async fn shutdown_list(
    State(state): State<Arc<AppState>>,
) -> Result<Json<InstancesResponse>, AppError> {
    let ids = state.monitor.system_shutdown_list().await?;
    let total = ids.len();
    Ok(Json(InstancesResponse { ids, total }))
}

/// GET /usage
pub async fn usage(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UsageQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let summary = state.monitor.usage_by_state(query.cap).await?;

    let mut counts = serde_json::Map::new();
    for lifecycle in USAGE_STATES {
        counts.insert(lifecycle.to_string(), summary.count(lifecycle).into());
    }

    Ok(Json(serde_json::json!({
        "counts": counts,
        "instances": summary.by_state,
    })))
}

/// GET /movable
pub async fn movable(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MovableQuery>,
) -> Result<Json<InstancesResponse>, AppError> {
    let selection = query
        .selection
        .as_deref()
        .map(MovableSelection::from_str)
        .transpose()?
        .unwrap_or(MovableSelection::CompleteOrTerminated);
    let ids = state.monitor.movable_ids(selection, query.max_rows).await?;
    let total = ids.len();
    Ok(Json(InstancesResponse { ids, total }))
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// --- Helpers ---

fn split_parts(raw: Option<&str>) -> impl Iterator<Item = &str> {
    raw.unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
}

fn split_parse<T>(raw: Option<&str>) -> Result<Vec<T>, MonitorError>
where
    T: FromStr<Err = MonitorError>,
{
    split_parts(raw).map(T::from_str).collect()
}

fn split_ids(raw: Option<&str>) -> Result<Vec<i64>, MonitorError> {
    split_parts(raw).map(parse_workflow_id).collect()
}
