use axum::Json;
use axum::extract::{Path, Query};
use axum::routing::{patch, post};
use axum::{Router, extract::State, http::StatusCode, routing::get};
use serde::Deserialize;

use crate::db::repository;
use crate::error::AppError;
use crate::models::*;
use crate::services::SyncStats;
use crate::state::AppState;

#[derive(Deserialize)]
struct TaskQueryParams {
    user_id: String,
    #[serde(default)]
    include_deleted: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/tasks", get(list_tasks).post(create_task))
        .route("/tasks/{id}", patch(update_task).delete(delete_task))
        .route("/sync", post(sync_now))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Result<StatusCode, AppError> {
    sqlx::query("select 1").execute(&state.db).await?;
    Ok(StatusCode::OK)
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(params): Query<TaskQueryParams>,
) -> Result<Json<Vec<Task>>, AppError> {
    let tasks = if params.include_deleted {
        repository::list_tasks_by_user(&state.db, &params.user_id).await?
    } else {
        repository::fetch_visible_tasks(&state.db, &params.user_id).await?
    };
    Ok(Json(tasks))
}

async fn create_task(
    State(state): State<AppState>,
    Json(req): Json<NewTaskRequest>,
) -> Result<(StatusCode, Json<Task>), AppError> {
    req.validate().map_err(AppError::BadRequest)?;
    let _guard = state.write_guard().await;
    let task = repository::insert_task(&state.db, req).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn update_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateTaskRequest>,
) -> Result<Json<Task>, AppError> {
    req.validate().map_err(AppError::BadRequest)?;
    let _guard = state.write_guard().await;
    let task = repository::update_task(&state.db, &id, req)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(Json(task))
}

async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let _guard = state.write_guard().await;
    let ok = repository::soft_delete_task(&state.db, &id).await?;
    if ok {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound)
    }
}

async fn sync_now(State(state): State<AppState>) -> Result<Json<SyncStats>, AppError> {
    let session = state
        .session
        .as_ref()
        .ok_or_else(|| AppError::Conflict("no user is logged in for sync".to_string()))?;
    let stats = state.sync.run(session).await?;
    Ok(Json(stats))
}
