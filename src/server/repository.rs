use sqlx::{FromRow, SqliteConnection, SqlitePool};

use crate::sync::TaskRecord;
use crate::timestamp::parse_timestamp;

/// Server copy of a task plus the server's own modification stamp.
#[derive(Debug, Clone, FromRow)]
pub struct ServerTaskRow {
    pub task_id: String,
    pub user_id: String,
    pub title: String,
    pub description: Option<String>,
    pub status: String,
    pub progress_percentage: i32,
    pub created_at: i64,
    pub priority: Option<String>,
    pub due_date: Option<i64>,
    pub updated_at: String,
    pub is_deleted: bool,
    pub server_updated_at: String,
}

impl From<ServerTaskRow> for TaskRecord {
    fn from(row: ServerTaskRow) -> Self {
        Self {
            task_id: row.task_id,
            user_id: row.user_id,
            title: row.title,
            description: row.description,
            status: row.status,
            progress_percentage: row.progress_percentage,
            created_at: row.created_at,
            priority: row.priority,
            due_date: row.due_date,
            updated_at: row.updated_at,
            is_deleted: row.is_deleted,
        }
    }
}

/// Stores `record` if the server has no copy or the incoming `updated_at`
/// is strictly newer. Returns whether it was stored.
pub async fn apply_record(
    conn: &mut SqliteConnection,
    record: &TaskRecord,
    server_stamp: &str,
) -> Result<bool, sqlx::Error> {
    let existing: Option<String> =
        sqlx::query_scalar("SELECT updated_at FROM server_tasks WHERE task_id = ?")
            .bind(&record.task_id)
            .fetch_optional(&mut *conn)
            .await?;

    if let Some(existing) = existing {
        let incoming = parse_timestamp(&record.updated_at);
        let stored = parse_timestamp(&existing);
        let newer = match (incoming, stored) {
            (Some(incoming), Some(stored)) => incoming > stored,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !newer {
            return Ok(false);
        }
    }

    sqlx::query(
        r#"
        INSERT INTO server_tasks
            (task_id, user_id, title, description, status, progress_percentage,
            created_at, priority, due_date, updated_at, is_deleted, server_updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(task_id) DO UPDATE SET
            user_id = excluded.user_id,
            title = excluded.title,
            description = excluded.description,
            status = excluded.status,
            progress_percentage = excluded.progress_percentage,
            created_at = excluded.created_at,
            priority = excluded.priority,
            due_date = excluded.due_date,
            updated_at = excluded.updated_at,
            is_deleted = excluded.is_deleted,
            server_updated_at = excluded.server_updated_at
        "#,
    )
    .bind(&record.task_id)
    .bind(&record.user_id)
    .bind(&record.title)
    .bind(&record.description)
    .bind(&record.status)
    .bind(record.progress_percentage)
    .bind(record.created_at)
    .bind(&record.priority)
    .bind(record.due_date)
    .bind(&record.updated_at)
    .bind(record.is_deleted)
    .bind(server_stamp)
    .execute(&mut *conn)
    .await?;

    Ok(true)
}

/// Records of `user_id` stamped strictly after `since`. Both sides use the
/// fixed-width stamp format, so text comparison matches time order.
pub async fn fetch_changed_since(
    db: &SqlitePool,
    user_id: &str,
    since: &str,
) -> Result<Vec<ServerTaskRow>, sqlx::Error> {
    sqlx::query_as::<_, ServerTaskRow>(
        r#"
        SELECT task_id, user_id, title, description, status, progress_percentage,
            created_at, priority, due_date, updated_at, is_deleted, server_updated_at
        FROM server_tasks
        WHERE user_id = ? AND server_updated_at > ?
        ORDER BY server_updated_at, task_id
        "#,
    )
    .bind(user_id)
    .bind(since)
    .fetch_all(db)
    .await
}

pub async fn find_by_id(
    db: &SqlitePool,
    task_id: &str,
) -> Result<Option<ServerTaskRow>, sqlx::Error> {
    sqlx::query_as::<_, ServerTaskRow>(
        r#"
        SELECT task_id, user_id, title, description, status, progress_percentage,
            created_at, priority, due_date, updated_at, is_deleted, server_updated_at
        FROM server_tasks
        WHERE task_id = ?
        "#,
    )
    .bind(task_id)
    .fetch_optional(db)
    .await
}

pub async fn latest_stamp(db: &SqlitePool) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar("SELECT MAX(server_updated_at) FROM server_tasks")
        .fetch_one(db)
        .await
}
