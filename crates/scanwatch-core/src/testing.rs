//! Builders and a scripted task directory shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::directory::{ScanTarget, SubmittedTask, TaskDirectory};
use crate::error::{Result, ScanwatchError};
use crate::task::{Task, TaskKey, TaskStatus, TaskType};

pub(crate) fn task(id: TaskKey, task_type: TaskType, status: TaskStatus) -> Task {
    Task {
        id,
        task_id: Some(format!("job-{id}")),
        task_type,
        status,
        progress: None,
        current_file: None,
        total_files: None,
        processed_files: None,
        created_at: Some("1970-01-01T00:00:00Z".into()),
        started_at: None,
        finished_at: None,
        error_message: (status == TaskStatus::Failed).then(|| format!("task {id} failed")),
        target_path: None,
    }
}

pub(crate) fn scan_task(id: TaskKey, status: TaskStatus) -> Task {
    task(id, TaskType::Scan, status)
}

/// A terminal task whose cursor position is `(finished_ms, id)`.
pub(crate) fn finished(id: TaskKey, finished_ms: i64, status: TaskStatus) -> Task {
    let mut finished = task(id, TaskType::Backup, status);
    let at = chrono::DateTime::from_timestamp_millis(finished_ms).expect("valid timestamp");
    finished.finished_at = Some(at.to_rfc3339());
    finished
}

pub(crate) fn submitted(ids: &[TaskKey]) -> Vec<SubmittedTask> {
    ids.iter()
        .map(|id| SubmittedTask {
            id: *id,
            task_id: Some(format!("job-{id}")),
        })
        .collect()
}

/// In-memory backend stand-in. Detail scripts are consumed front to back;
/// the last entry keeps being returned.
#[derive(Default)]
pub(crate) struct FakeDirectory {
    snapshot: Mutex<Vec<Task>>,
    details: Mutex<HashMap<TaskKey, VecDeque<Task>>>,
    submissions: Mutex<VecDeque<Result<Vec<SubmittedTask>>>>,
    detail_calls: Mutex<Vec<TaskKey>>,
    list_calls: AtomicUsize,
    cancel_calls: Mutex<Vec<TaskKey>>,
    fail_listing: AtomicBool,
    gate: Arc<Notify>,
    gate_details: bool,
    gate_submissions: bool,
    held_listings: AtomicUsize,
    details_in_flight: AtomicUsize,
    max_details_in_flight: AtomicUsize,
}

impl FakeDirectory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn gate_details(mut self) -> Self {
        self.gate_details = true;
        self
    }

    pub(crate) fn gate_submissions(mut self) -> Self {
        self.gate_submissions = true;
        self
    }

    /// The next listing captures the current snapshot, then waits on the
    /// gate before returning it.
    pub(crate) fn hold_next_listing(&self) {
        self.held_listings.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn gate(&self) -> Arc<Notify> {
        self.gate.clone()
    }

    pub(crate) fn set_snapshot(&self, tasks: Vec<Task>) {
        *self.snapshot.lock() = tasks;
    }

    pub(crate) fn script(&self, id: TaskKey, details: impl IntoIterator<Item = Task>) {
        self.details.lock().insert(id, details.into_iter().collect());
    }

    pub(crate) fn queue_submission(&self, result: Result<Vec<SubmittedTask>>) {
        self.submissions.lock().push_back(result);
    }

    pub(crate) fn fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn detail_calls(&self) -> Vec<TaskKey> {
        self.detail_calls.lock().clone()
    }

    pub(crate) fn cancel_calls(&self) -> Vec<TaskKey> {
        self.cancel_calls.lock().clone()
    }

    pub(crate) fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn max_details_in_flight(&self) -> usize {
        self.max_details_in_flight.load(Ordering::SeqCst)
    }

    fn next_detail(&self, id: TaskKey) -> Option<Task> {
        let mut details = self.details.lock();
        let script = details.get_mut(&id)?;
        if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        }
    }
}

#[async_trait]
impl TaskDirectory for FakeDirectory {
    async fn list_tasks(&self, _limit: u32) -> Result<Vec<Task>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(ScanwatchError::Api {
                status: 503,
                message: "unavailable".into(),
            });
        }
        let snapshot = self.snapshot.lock().clone();
        let held = self
            .held_listings
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |held| held.checked_sub(1))
            .is_ok();
        if held {
            self.gate.notified().await;
        }
        Ok(snapshot)
    }

    async fn get_task(&self, id: TaskKey) -> Result<Task> {
        self.detail_calls.lock().push(id);
        let in_flight = self.details_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_details_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);
        if self.gate_details {
            self.gate.notified().await;
        }
        tokio::task::yield_now().await;
        self.details_in_flight.fetch_sub(1, Ordering::SeqCst);

        self.next_detail(id).ok_or(ScanwatchError::Api {
            status: 404,
            message: format!("task {id} not found"),
        })
    }

    async fn cancel_task(&self, id: TaskKey) -> Result<()> {
        self.cancel_calls.lock().push(id);
        let cancelled = {
            let mut snapshot = self.snapshot.lock();
            let found = snapshot.iter_mut().find(|task| task.id == id);
            found.map(|task| {
                task.status = TaskStatus::Cancelled;
                task.clone()
            })
        };
        match cancelled {
            Some(task) => {
                self.script(id, [task]);
                Ok(())
            }
            None => Err(ScanwatchError::Api {
                status: 404,
                message: format!("task {id} not found"),
            }),
        }
    }

    async fn submit_scan(&self, _target: ScanTarget) -> Result<Vec<SubmittedTask>> {
        if self.gate_submissions {
            self.gate.notified().await;
        }
        self.submissions.lock().pop_front().unwrap_or_else(|| {
            Err(ScanwatchError::Api {
                status: 500,
                message: "no scripted submission".into(),
            })
        })
    }
}
