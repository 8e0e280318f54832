use crate::error::RegistryError;
use crate::task::{NewTask, Task, TaskPatch, TaskStatus};
use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskResponse {
    pub task: Task,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskListResponse {
    pub tasks: Vec<Task>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CountResponse {
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub owner_id: String,
    pub status: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerQuery {
    pub owner_id: String,
}

/// Not-found is a client error and is not logged.
pub(crate) fn status_for(err: RegistryError, action: &str) -> StatusCode {
    match err {
        RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
        RegistryError::Store(e) => {
            tracing::error!("Failed to {}: {}", action, e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

pub async fn create_task(
    State(state): State<AppState>,
    Json(req): Json<NewTask>,
) -> Result<Json<TaskResponse>, StatusCode> {
    match state.registry.create(req).await {
        Ok(task) => Ok(Json(TaskResponse { task })),
        Err(e) => Err(status_for(e, "create task")),
    }
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<TaskListResponse>, StatusCode> {
    let status = match query.status.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => Some(TaskStatus::parse(raw).ok_or(StatusCode::BAD_REQUEST)?),
        None => None,
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);

    match state.registry.list(&query.owner_id, status, limit).await {
        Ok(tasks) => Ok(Json(TaskListResponse { tasks })),
        Err(e) => Err(status_for(e, "list tasks")),
    }
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskResponse>, StatusCode> {
    match state.registry.get(&id).await {
        Ok(task) => Ok(Json(TaskResponse { task })),
        Err(e) => Err(status_for(e, "get task")),
    }
}

pub async fn update_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<TaskPatch>,
) -> Result<Json<TaskResponse>, StatusCode> {
    match state.registry.update(&id, patch).await {
        Ok(task) => Ok(Json(TaskResponse { task })),
        Err(e) => Err(status_for(e, "update task")),
    }
}

pub async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OkResponse>, StatusCode> {
    match state.registry.cancel(&id).await {
        Ok(_) => Ok(Json(OkResponse { ok: true })),
        Err(e) => Err(status_for(e, "cancel task")),
    }
}

pub async fn running_count(
    State(state): State<AppState>,
    Query(query): Query<OwnerQuery>,
) -> Json<CountResponse> {
    let count = state.registry.count_running(&query.owner_id).await;
    Json(CountResponse { count })
}
