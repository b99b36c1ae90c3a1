use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::models::{Task, TaskStatus};
use crate::timestamp::parse_timestamp;

/// Task as it travels over `/sync/push` and `/sync/pull`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    #[serde(rename = "taskID")]
    pub task_id: String,
    #[serde(rename = "userID", default)]
    pub user_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Kept as a plain string so unknown statuses still deserialize.
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(rename = "progressPercentage", default)]
    pub progress_percentage: i32,
    #[serde(rename = "createdAt", default)]
    pub created_at: i64,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(rename = "dueDate", default)]
    pub due_date: Option<i64>,
    pub updated_at: String,
    #[serde(default)]
    pub is_deleted: bool,
}

fn default_status() -> String {
    TaskStatus::Pending.as_str().to_string()
}

/// Body of `/sync/push`. Borrows the batch when sending, owns it when received.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest<'a> {
    pub records: Cow<'a, [TaskRecord]>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResponse {
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullResponse {
    #[serde(default)]
    pub records: Vec<TaskRecord>,
    pub server_time: String,
}

impl From<&Task> for TaskRecord {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.task_id.clone(),
            user_id: task.user_id.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
            status: task.status.as_str().to_string(),
            progress_percentage: task.progress_percentage,
            created_at: task.created_at,
            priority: task.priority.clone(),
            due_date: task.due_date,
            updated_at: task.updated_at.clone(),
            is_deleted: task.is_deleted,
        }
    }
}

impl TaskRecord {
    /// Checks the fields the local schema constrains, without consuming the
    /// record. Tombstones only need a usable id.
    pub fn validate(&self) -> Result<(), SyncError> {
        let fail = |reason: String| SyncError::Mapping {
            task_id: self.task_id.clone(),
            reason,
        };

        if self.task_id.trim().is_empty() {
            return Err(fail("taskID is empty".to_string()));
        }
        if self.is_deleted {
            return Ok(());
        }
        if self.title.trim().is_empty() {
            return Err(fail("title is empty".to_string()));
        }
        if !(0..=100).contains(&self.progress_percentage) {
            return Err(fail(format!(
                "progressPercentage {} is outside 0-100",
                self.progress_percentage
            )));
        }
        if parse_timestamp(&self.updated_at).is_none() {
            return Err(fail(format!("updated_at {:?} is not ISO-8601", self.updated_at)));
        }
        self.status
            .parse::<TaskStatus>()
            .map_err(|e| fail(e.to_string()))?;
        Ok(())
    }

    /// Converts a pulled record into the local row. Records that arrive
    /// without an owner belong to the user who pulled them.
    pub fn into_task(self, pulling_user: &str) -> Result<Task, SyncError> {
        self.validate()?;
        let status = self
            .status
            .parse::<TaskStatus>()
            .map_err(|e| SyncError::Mapping {
                task_id: self.task_id.clone(),
                reason: e.to_string(),
            })?;
        let user_id = if self.user_id.is_empty() {
            pulling_user.to_string()
        } else {
            self.user_id
        };

        Ok(Task {
            task_id: self.task_id,
            user_id,
            title: self.title,
            description: self.description,
            status,
            progress_percentage: self.progress_percentage,
            created_at: self.created_at,
            priority: self.priority,
            due_date: self.due_date,
            updated_at: self.updated_at,
            is_deleted: self.is_deleted,
        })
    }
}
