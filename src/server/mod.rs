//! Reference implementation of the remote half of the sync protocol.

pub mod repository;

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router, http::StatusCode};
use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::Deserialize;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::AppError;
use crate::sync::dto::{PushRequest, PullResponse, PushResponse};
use crate::sync::TaskRecord;
use crate::timestamp::{EPOCH_CURSOR, format_stamp, parse_timestamp};

pub async fn connect(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;

    sqlx::migrate!("./migrations/server").run(&pool).await?;
    Ok(pool)
}

pub async fn connect_in_memory() -> Result<SqlitePool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;

    sqlx::migrate!("./migrations/server").run(&pool).await?;
    Ok(pool)
}

/// Hands out strictly increasing stamps at microsecond precision.
///
/// Pushes hold the lock until their writes commit and pulls hold it while
/// reading, so every record stamped at or before a reported `server_time`
/// is visible to the pull that reported it.
pub struct ServerClock {
    last: Mutex<DateTime<Utc>>,
}

impl ServerClock {
    pub fn starting_after(last: DateTime<Utc>) -> Self {
        Self {
            last: Mutex::new(last),
        }
    }

    fn tick(last: &mut DateTime<Utc>) -> DateTime<Utc> {
        let now = Utc::now().trunc_subsecs(6);
        let next = if now > *last {
            now
        } else {
            *last + Duration::microseconds(1)
        };
        *last = next;
        next
    }
}

#[derive(Clone)]
pub struct ServerState {
    pub db: SqlitePool,
    pub clock: Arc<ServerClock>,
}

impl ServerState {
    /// Resumes the clock after the newest stamp already stored.
    pub async fn new(db: SqlitePool) -> Result<Self, sqlx::Error> {
        let last = repository::latest_stamp(&db)
            .await?
            .and_then(|s| parse_timestamp(&s))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        Ok(Self {
            db,
            clock: Arc::new(ServerClock::starting_after(last)),
        })
    }
}

#[derive(Debug, Deserialize)]
struct PullParams {
    #[serde(rename = "userID")]
    user_id: Option<String>,
    last_sync: Option<String>,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sync/push", post(push))
        .route("/sync/pull", get(pull))
        .with_state(state)
}

async fn health(State(state): State<ServerState>) -> Result<StatusCode, AppError> {
    sqlx::query("select 1").execute(&state.db).await?;
    Ok(StatusCode::OK)
}

async fn push(
    State(state): State<ServerState>,
    Json(req): Json<PushRequest<'static>>,
) -> Result<Json<PushResponse>, AppError> {
    for record in req.records.iter() {
        validate_pushed(record)?;
    }

    let mut last = state.clock.last.lock().await;
    let stamp = format_stamp(ServerClock::tick(&mut last));

    let mut tx = state.db.begin().await?;
    let mut accepted = 0usize;
    for record in req.records.iter() {
        if repository::apply_record(&mut tx, record, &stamp).await? {
            accepted += 1;
        }
    }
    tx.commit().await?;
    drop(last);

    info!(
        received = req.records.len(),
        accepted,
        %stamp,
        "push applied"
    );
    Ok(Json(PushResponse {
        status: "ok".to_string(),
    }))
}

async fn pull(
    State(state): State<ServerState>,
    Query(params): Query<PullParams>,
) -> Result<Json<PullResponse>, AppError> {
    let user_id = params
        .user_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| AppError::BadRequest("userID is required".to_string()))?;
    let last_sync = params.last_sync.unwrap_or_else(|| EPOCH_CURSOR.to_string());
    let since = parse_timestamp(&last_sync)
        .map(format_stamp)
        .ok_or_else(|| AppError::BadRequest(format!("last_sync {last_sync:?} is not ISO-8601")))?;

    let mut last = state.clock.last.lock().await;
    let server_time = format_stamp(ServerClock::tick(&mut last));
    let rows = repository::fetch_changed_since(&state.db, &user_id, &since).await?;
    drop(last);

    debug!(%user_id, %since, %server_time, records = rows.len(), "pull served");
    Ok(Json(PullResponse {
        records: rows.into_iter().map(TaskRecord::from).collect(),
        server_time,
    }))
}

fn validate_pushed(record: &TaskRecord) -> Result<(), AppError> {
    if record.task_id.trim().is_empty() {
        return Err(AppError::BadRequest("taskID is required".to_string()));
    }
    if record.user_id.trim().is_empty() {
        return Err(AppError::BadRequest(format!(
            "userID is required for task {}",
            record.task_id
        )));
    }
    if parse_timestamp(&record.updated_at).is_none() {
        return Err(AppError::BadRequest(format!(
            "updated_at {:?} of task {} is not ISO-8601",
            record.updated_at, record.task_id
        )));
    }
    Ok(())
}
