use std::fmt;

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize};

use crate::cursor::Cursor;

pub type TaskKey = i64;

/// Lifecycle of a backend job. Unknown values are normalized to `Pending`,
/// which keeps the task visible as active until the backend reports a
/// terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    /// pending -> running -> {completed | failed | cancelled}; pending may
    /// also end directly in failed or cancelled.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (a, b) if a == b => true,
            (Pending, Running | Failed | Cancelled) => true,
            (Running, Completed | Failed | Cancelled) => true,
            _ => false,
        }
    }
}

impl From<String> for TaskStatus {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "running" => TaskStatus::Running,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            "cancelled" | "canceled" => TaskStatus::Cancelled,
            "pending" => TaskStatus::Pending,
            other => {
                tracing::debug!(status = other, "unknown task status, treating as pending");
                TaskStatus::Pending
            }
        }
    }
}

impl From<TaskStatus> for String {
    fn from(value: TaskStatus) -> Self {
        value.as_str().to_owned()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskType {
    Scan,
    Rename,
    Backup,
    Duplicates,
    MissingCleanup,
    Integrity,
    TagScan,
    Merge,
    Split,
    Delete,
    BulkTags,
    Other(String),
    #[default]
    Unknown,
}

impl TaskType {
    pub fn as_str(&self) -> &str {
        match self {
            TaskType::Scan => "scan",
            TaskType::Rename => "rename",
            TaskType::Backup => "backup",
            TaskType::Duplicates => "duplicates",
            TaskType::MissingCleanup => "missing_cleanup",
            TaskType::Integrity => "integrity",
            TaskType::TagScan => "tag_scan",
            TaskType::Merge => "merge",
            TaskType::Split => "split",
            TaskType::Delete => "delete",
            TaskType::BulkTags => "bulk_tags",
            TaskType::Other(name) => name,
            TaskType::Unknown => "unknown",
        }
    }
}

impl From<String> for TaskType {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "scan" => TaskType::Scan,
            "rename" => TaskType::Rename,
            "backup" => TaskType::Backup,
            "duplicates" => TaskType::Duplicates,
            "missing_cleanup" => TaskType::MissingCleanup,
            "integrity" => TaskType::Integrity,
            "tag_scan" => TaskType::TagScan,
            "merge" => TaskType::Merge,
            "split" => TaskType::Split,
            "delete" => TaskType::Delete,
            "bulk_tags" => TaskType::BulkTags,
            "" | "unknown" => TaskType::Unknown,
            other => TaskType::Other(other.to_owned()),
        }
    }
}

impl From<TaskType> for String {
    fn from(value: TaskType) -> Self {
        match value {
            TaskType::Other(name) => name,
            other => other.as_str().to_owned(),
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Snapshot of one backend job as reported by the task directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskKey,
    #[serde(default, alias = "taskId", deserialize_with = "opaque_handle")]
    pub task_id: Option<String>,
    #[serde(default, alias = "taskType")]
    pub task_type: TaskType,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default, alias = "currentFile")]
    pub current_file: Option<String>,
    #[serde(default, alias = "totalFiles")]
    pub total_files: Option<u64>,
    #[serde(default, alias = "processedFiles")]
    pub processed_files: Option<u64>,
    #[serde(default, alias = "createdAt")]
    pub created_at: Option<String>,
    #[serde(default, alias = "startedAt")]
    pub started_at: Option<String>,
    #[serde(default, alias = "finishedAt")]
    pub finished_at: Option<String>,
    #[serde(default, alias = "errorMessage")]
    pub error_message: Option<String>,
    #[serde(default, alias = "targetPath")]
    pub target_path: Option<String>,
}

impl Task {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn is_scan(&self) -> bool {
        self.task_type == TaskType::Scan
    }

    /// Position of this task on the seen/unseen watermark. Timestamps that
    /// are missing or unparseable sort at the epoch.
    pub fn cursor(&self) -> Cursor {
        let timestamp = self
            .finished_at
            .as_deref()
            .or(self.created_at.as_deref())
            .and_then(parse_timestamp_ms)
            .unwrap_or(0);
        Cursor::new(timestamp, self.id)
    }
}

pub(crate) fn parse_timestamp_ms(value: &str) -> Option<i64> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.timestamp_millis());
    }
    // Naive timestamps come from the backend in UTC.
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc().timestamp_millis())
}

pub(crate) fn opaque_handle<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(handle)) => Some(handle),
        Some(serde_json::Value::Number(number)) => Some(number.to_string()),
        _ => None,
    })
}
