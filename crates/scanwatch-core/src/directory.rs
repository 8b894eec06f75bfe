use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{MAX_HISTORY_LIMIT, MIN_HISTORY_LIMIT};
use crate::error::Result;
use crate::task::{Task, TaskKey};

mod http;
pub use http::HttpTaskDirectory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanTarget {
    LibraryPath(i64),
    All,
}

impl fmt::Display for ScanTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanTarget::LibraryPath(id) => write!(f, "library path {id}"),
            ScanTarget::All => f.write_str("all library paths"),
        }
    }
}

/// Task record created by a scan submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedTask {
    pub id: TaskKey,
    #[serde(
        default,
        alias = "taskId",
        deserialize_with = "crate::task::opaque_handle"
    )]
    pub task_id: Option<String>,
}

/// The coordinator's only I/O boundary: the backend task system.
#[async_trait]
pub trait TaskDirectory: Send + Sync + 'static {
    /// Most recent tasks, newest first. `limit` is clamped to [10, 500].
    async fn list_tasks(&self, limit: u32) -> Result<Vec<Task>>;
    async fn get_task(&self, id: TaskKey) -> Result<Task>;
    /// Acknowledged only; the effect shows up on a later listing.
    async fn cancel_task(&self, id: TaskKey) -> Result<()>;
    async fn submit_scan(&self, target: ScanTarget) -> Result<Vec<SubmittedTask>>;
}

pub fn clamp_limit(limit: u32) -> u32 {
    limit.clamp(MIN_HISTORY_LIMIT, MAX_HISTORY_LIMIT)
}
