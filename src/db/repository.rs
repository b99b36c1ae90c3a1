use async_trait::async_trait;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::{NewTaskRequest, Task, UpdateTaskRequest};
use crate::timestamp::{next_updated_at, now_iso, now_millis};

const TASK_COLUMNS: &str = "task_id, user_id, title, description, status, progress_percentage, created_at, priority, due_date, updated_at, is_deleted";

/// The slice of local task storage the sync orchestrator relies on.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Every task of the user, tombstones included.
    async fn list_by_user(&self, user_id: &str) -> Result<Vec<Task>, sqlx::Error>;
    /// Insert, or overwrite every field of the task with the same id.
    async fn upsert(&self, task: &Task) -> Result<(), sqlx::Error>;
    /// Hard delete. Deleting a missing id is not an error.
    async fn delete_by_id(&self, task_id: &str) -> Result<(), sqlx::Error>;
}

#[derive(Clone)]
pub struct SqliteTaskStore {
    db: SqlitePool,
}

impl SqliteTaskStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn list_by_user(&self, user_id: &str) -> Result<Vec<Task>, sqlx::Error> {
        list_tasks_by_user(&self.db, user_id).await
    }

    async fn upsert(&self, task: &Task) -> Result<(), sqlx::Error> {
        upsert_task(&self.db, task).await
    }

    async fn delete_by_id(&self, task_id: &str) -> Result<(), sqlx::Error> {
        delete_task(&self.db, task_id).await.map(|_| ())
    }
}

pub async fn fetch_visible_tasks(db: &SqlitePool, user_id: &str) -> Result<Vec<Task>, sqlx::Error> {
    sqlx::query_as::<_, Task>(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE user_id = ? AND is_deleted = 0 ORDER BY updated_at DESC"
    ))
    .bind(user_id)
    .fetch_all(db)
    .await
}

pub async fn list_tasks_by_user(db: &SqlitePool, user_id: &str) -> Result<Vec<Task>, sqlx::Error> {
    sqlx::query_as::<_, Task>(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE user_id = ? ORDER BY created_at, task_id"
    ))
    .bind(user_id)
    .fetch_all(db)
    .await
}

pub async fn find_task_by_id(db: &SqlitePool, task_id: &str) -> Result<Option<Task>, sqlx::Error> {
    sqlx::query_as::<_, Task>(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?"))
        .bind(task_id)
        .fetch_optional(db)
        .await
}

pub async fn insert_task(db: &SqlitePool, req: NewTaskRequest) -> Result<Task, sqlx::Error> {
    let task = Task {
        task_id: Uuid::new_v4().to_string(),
        user_id: req.user_id,
        title: req.title,
        description: req.description,
        status: req.status,
        progress_percentage: req.progress_percentage,
        created_at: now_millis(),
        priority: req.priority,
        due_date: req.due_date,
        updated_at: now_iso(),
        is_deleted: false,
    };

    upsert_task(db, &task).await?;
    Ok(task)
}

/// Applies the set fields of `req` to a live task and bumps `updated_at`.
/// Returns `None` for unknown or tombstoned ids.
pub async fn update_task(
    db: &SqlitePool,
    task_id: &str,
    req: UpdateTaskRequest,
) -> Result<Option<Task>, sqlx::Error> {
    let mut current = match find_task_by_id(db, task_id).await? {
        Some(t) if !t.is_deleted => t,
        _ => return Ok(None),
    };

    if let Some(title) = req.title {
        current.title = title;
    }
    if let Some(description) = req.description {
        current.description = Some(description);
    }
    if let Some(status) = req.status {
        current.status = status;
    }
    if let Some(progress) = req.progress_percentage {
        current.progress_percentage = progress;
    }
    if let Some(priority) = req.priority {
        current.priority = Some(priority);
    }
    if let Some(due_date) = req.due_date {
        current.due_date = Some(due_date);
    }
    current.updated_at = next_updated_at(&current.updated_at);

    upsert_task(db, &current).await?;
    Ok(Some(current))
}

/// Marks a task as a tombstone. It stays on the device until a pull reports
/// the deletion back.
pub async fn soft_delete_task(db: &SqlitePool, task_id: &str) -> Result<bool, sqlx::Error> {
    let Some(current) = find_task_by_id(db, task_id).await? else {
        return Ok(false);
    };
    if current.is_deleted {
        return Ok(false);
    }

    let updated_at = next_updated_at(&current.updated_at);
    let result = sqlx::query("UPDATE tasks SET is_deleted = 1, updated_at = ? WHERE task_id = ?")
        .bind(&updated_at)
        .bind(task_id)
        .execute(db)
        .await?
        .rows_affected();

    Ok(result > 0)
}

pub async fn upsert_task(db: &SqlitePool, task: &Task) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO tasks
            (task_id, user_id, title, description, status, progress_percentage,
            created_at, priority, due_date, updated_at, is_deleted)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
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
            is_deleted = excluded.is_deleted
        "#,
    )
    .bind(&task.task_id)
    .bind(&task.user_id)
    .bind(&task.title)
    .bind(&task.description)
    .bind(task.status)
    .bind(task.progress_percentage)
    .bind(task.created_at)
    .bind(&task.priority)
    .bind(task.due_date)
    .bind(&task.updated_at)
    .bind(task.is_deleted)
    .execute(db)
    .await?;

    Ok(())
}

pub async fn delete_task(db: &SqlitePool, task_id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM tasks WHERE task_id = ?")
        .bind(task_id)
        .execute(db)
        .await?
        .rows_affected();

    Ok(result > 0)
}
