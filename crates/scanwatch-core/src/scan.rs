use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::directory::{ScanTarget, SubmittedTask, TaskDirectory};
use crate::error::{Result, ScanwatchError};
use crate::task::{Task, TaskKey, TaskStatus};

pub const MSG_INITIALIZING: &str = "scan.initializing";
pub const MSG_COMPLETED: &str = "scan.completed";
pub const MSG_TASK_FAILED: &str = "scan.error.task_failed";
pub const MSG_SUBMIT_FAILED: &str = "scan.error.submit_failed";
pub const MSG_NO_LIBRARY_PATHS: &str = "scan.error.no_library_paths";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    #[default]
    Idle,
    Pending,
    Scanning,
    Finished,
    Error,
}

impl ScanStatus {
    pub fn is_busy(self) -> bool {
        matches!(self, ScanStatus::Pending | ScanStatus::Scanning)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ScanStatus::Finished | ScanStatus::Error)
    }
}

/// What the UI shows for the scan in progress.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ScanSessionState {
    pub status: ScanStatus,
    pub progress: f64,
    pub current_file: Option<String>,
    pub message_key: Option<&'static str>,
    pub task_id: Option<TaskKey>,
    pub external_task_id: Option<String>,
    /// Queue members not yet terminal, head included.
    pub remaining: usize,
}

impl ScanSessionState {
    fn initializing() -> Self {
        Self {
            status: ScanStatus::Pending,
            message_key: Some(MSG_INITIALIZING),
            ..Self::default()
        }
    }

    fn mirror(&mut self, task: &Task) {
        match task.status {
            TaskStatus::Running => self.status = ScanStatus::Scanning,
            TaskStatus::Pending => self.status = ScanStatus::Pending,
            _ => {}
        }
        self.progress = task.progress.unwrap_or(0.0).clamp(0.0, 100.0);
        self.current_file = task.current_file.clone().filter(|file| !file.is_empty());
        self.message_key = match self.current_file {
            Some(_) => None,
            None => Some(MSG_INITIALIZING),
        };
        self.task_id = Some(task.id);
        self.external_task_id = task.task_id.clone();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanError {
    pub message: Option<String>,
    pub message_key: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ScanError {
    fn from_task(task: &Task) -> Self {
        Self {
            message: task.error_message.clone(),
            message_key: task
                .error_message
                .is_none()
                .then(|| MSG_TASK_FAILED.to_owned()),
            timestamp: Utc::now(),
        }
    }

    fn from_submission(err: &ScanwatchError) -> Self {
        let message_key = match err {
            ScanwatchError::NoLibraryPaths => MSG_NO_LIBRARY_PATHS,
            _ => MSG_SUBMIT_FAILED,
        };
        Self {
            message: Some(err.to_string()),
            message_key: Some(message_key.to_owned()),
            timestamp: Utc::now(),
        }
    }
}

/// Task ids of one scan action, consumed strictly front to back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanQueue {
    ids: VecDeque<TaskKey>,
    had_failure: bool,
}

impl ScanQueue {
    pub fn new(ids: impl IntoIterator<Item = TaskKey>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
            had_failure: false,
        }
    }

    pub fn head(&self) -> Option<TaskKey> {
        self.ids.front().copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn had_failure(&self) -> bool {
        self.had_failure
    }

    fn pop_head(&mut self) -> Option<TaskKey> {
        self.ids.pop_front()
    }

    fn clear(&mut self) {
        self.ids.clear();
        self.had_failure = false;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another tick was still awaiting the backend.
    Skipped,
    /// No queue to drive.
    Idle,
    /// Head detail unavailable; the same head is retried next tick.
    Waiting,
    Progressed,
    /// Head reached a terminal status and the next id is up.
    Advanced,
    Cancelled,
    Finished { failed: bool, generation: u64 },
}

/// Two-phase submission: state is shown optimistically before the backend
/// confirms the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    Optimistic,
    Confirmed,
}

#[derive(Debug)]
struct EngineState {
    session: ScanSessionState,
    queue: ScanQueue,
    stage: Stage,
    errors: Vec<ScanError>,
    generation: u64,
    observed: Option<(TaskKey, TaskStatus)>,
}

impl EngineState {
    fn new() -> Self {
        Self {
            session: ScanSessionState::default(),
            queue: ScanQueue::default(),
            stage: Stage::Idle,
            errors: Vec::new(),
            generation: 0,
            observed: None,
        }
    }

    fn begin_submission(&mut self) -> u64 {
        self.errors.clear();
        self.queue.clear();
        self.observed = None;
        self.generation += 1;
        self.stage = Stage::Optimistic;
        self.session = ScanSessionState::initializing();
        self.generation
    }

    fn confirm(&mut self, tasks: &[SubmittedTask]) {
        self.queue = ScanQueue::new(tasks.iter().map(|task| task.id));
        self.stage = Stage::Confirmed;
        if let Some(first) = tasks.first() {
            self.session.task_id = Some(first.id);
            self.session.external_task_id = first.task_id.clone();
        }
        self.session.remaining = self.queue.len();
    }

    fn fail_submission(&mut self, err: &ScanwatchError) {
        self.errors.push(ScanError::from_submission(err));
        self.stage = Stage::Idle;
        self.session = ScanSessionState {
            status: ScanStatus::Error,
            ..ScanSessionState::default()
        };
    }

    fn observe(&mut self, task: &Task) {
        if let Some((id, previous)) = self.observed {
            if id == task.id && !previous.can_transition_to(task.status) {
                warn!(
                    task = id,
                    from = %previous,
                    to = %task.status,
                    "unexpected task status transition"
                );
            }
        }
        self.observed = Some((task.id, task.status));
    }

    fn abort(&mut self) {
        self.queue.clear();
        self.stage = Stage::Idle;
        self.observed = None;
        self.session = ScanSessionState::default();
    }

    fn finalize(&mut self) -> TickOutcome {
        let failed = self.queue.had_failure();
        self.session.status = if failed {
            ScanStatus::Error
        } else {
            ScanStatus::Finished
        };
        self.session.progress = 100.0;
        self.session.current_file = None;
        self.session.message_key = (!failed).then_some(MSG_COMPLETED);
        self.session.remaining = 0;
        self.queue.clear();
        self.stage = Stage::Idle;
        self.observed = None;
        info!(failed, "scan queue drained");
        TickOutcome::Finished {
            failed,
            generation: self.generation,
        }
    }
}

struct TickGuard<'a>(&'a AtomicBool);

impl<'a> TickGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drives scan queues to completion. The only writer of
/// [`ScanSessionState`].
pub struct ScanEngine<D: TaskDirectory> {
    directory: Arc<D>,
    state: Mutex<EngineState>,
    tick_in_flight: AtomicBool,
}

impl<D: TaskDirectory> ScanEngine<D> {
    pub fn new(directory: Arc<D>) -> Self {
        Self {
            directory,
            state: Mutex::new(EngineState::new()),
            tick_in_flight: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ScanSessionState {
        self.state.lock().session.clone()
    }

    pub fn errors(&self) -> Vec<ScanError> {
        self.state.lock().errors.clone()
    }

    /// True from submission until the queue drains, fails to submit, or is
    /// cancelled.
    pub fn is_engaged(&self) -> bool {
        self.state.lock().stage != Stage::Idle
    }

    pub fn queued(&self) -> Vec<TaskKey> {
        self.state.lock().queue.ids.iter().copied().collect()
    }

    /// Submits a scan and seeds a new queue from the created tasks. Any
    /// previous queue and error list are discarded first.
    pub async fn submit(&self, target: ScanTarget) -> Result<Vec<SubmittedTask>> {
        let generation = self.state.lock().begin_submission();
        debug!(%target, generation, "scan submission started");

        let outcome = match self.directory.submit_scan(target).await {
            Ok(tasks) if tasks.is_empty() => Err(ScanwatchError::NoLibraryPaths),
            other => other,
        };

        let mut state = self.state.lock();
        if state.generation != generation {
            debug!(generation, "scan submission superseded");
            return outcome;
        }
        match outcome {
            Ok(tasks) => {
                state.confirm(&tasks);
                info!(%target, queued = tasks.len(), "scan queue started");
                Ok(tasks)
            }
            Err(err) => {
                warn!(%target, error = %err, "scan submission failed");
                state.fail_submission(&err);
                Err(err)
            }
        }
    }

    /// One progress-check-and-advance step. Overlapping calls are dropped.
    pub async fn tick(&self) -> TickOutcome {
        let Some(_guard) = TickGuard::acquire(&self.tick_in_flight) else {
            debug!("scan tick still in flight, skipping");
            return TickOutcome::Skipped;
        };

        let (generation, head) = {
            let mut state = self.state.lock();
            if state.stage != Stage::Confirmed {
                return TickOutcome::Idle;
            }
            match state.queue.head() {
                Some(head) => (state.generation, head),
                None => return state.finalize(),
            }
        };

        let task = match self.directory.get_task(head).await {
            Ok(task) => task,
            Err(err) => {
                warn!(task = head, error = %err, "scan task detail unavailable");
                return TickOutcome::Waiting;
            }
        };

        let mut state = self.state.lock();
        if state.generation != generation || state.queue.head() != Some(head) {
            debug!(task = head, "queue changed during tick, dropping result");
            return TickOutcome::Skipped;
        }

        state.observe(&task);
        state.session.mirror(&task);
        match task.status {
            TaskStatus::Cancelled => {
                info!(task = head, "scan task cancelled, aborting queue");
                state.abort();
                TickOutcome::Cancelled
            }
            TaskStatus::Completed | TaskStatus::Failed => {
                if task.status == TaskStatus::Failed {
                    warn!(task = head, error = ?task.error_message, "scan task failed");
                    state.errors.push(ScanError::from_task(&task));
                    state.queue.had_failure = true;
                }
                state.queue.pop_head();
                state.session.remaining = state.queue.len();
                if state.queue.is_empty() {
                    state.finalize()
                } else {
                    TickOutcome::Advanced
                }
            }
            TaskStatus::Pending | TaskStatus::Running => {
                state.session.remaining = state.queue.len();
                TickOutcome::Progressed
            }
        }
    }

    /// Returns a terminal banner to idle, unless a newer submission has
    /// started since `generation` finished.
    pub fn settle(&self, generation: u64) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation
            || state.stage != Stage::Idle
            || !state.session.status.is_terminal()
        {
            return false;
        }
        state.session = ScanSessionState::default();
        true
    }

    /// Rebuilds the banner from the directory when no queue is being
    /// driven, e.g. after a restart mid-scan.
    pub fn adopt(&self, active_scan: Option<&Task>) -> bool {
        let mut state = self.state.lock();
        if state.stage != Stage::Idle {
            return false;
        }
        match active_scan {
            Some(task) => {
                state.session.mirror(task);
                state.session.remaining = 0;
                true
            }
            None if state.session.status.is_busy() => {
                state.session = ScanSessionState::default();
                true
            }
            None => false,
        }
    }

    pub fn clear_errors(&self) {
        let mut state = self.state.lock();
        state.errors.clear();
        if state.stage == Stage::Idle && state.session.status == ScanStatus::Error {
            state.session = ScanSessionState::default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use mockall::predicate::eq;
    use mockall::{Sequence, mock};

    use crate::testing::{FakeDirectory, scan_task, submitted};

    mock! {
        pub Directory {}

        #[async_trait]
        impl TaskDirectory for Directory {
            async fn list_tasks(&self, limit: u32) -> Result<Vec<Task>>;
            async fn get_task(&self, id: TaskKey) -> Result<Task>;
            async fn cancel_task(&self, id: TaskKey) -> Result<()>;
            async fn submit_scan(&self, target: ScanTarget) -> Result<Vec<SubmittedTask>>;
        }
    }

    fn expect_detail(
        directory: &mut MockDirectory,
        seq: &mut Sequence,
        id: TaskKey,
        status: TaskStatus,
    ) {
        directory
            .expect_get_task()
            .with(eq(id))
            .times(1)
            .in_sequence(seq)
            .returning(move |id| Ok(scan_task(id, status)));
    }

    #[tokio::test]
    async fn queue_drains_in_order_and_aggregates_failures() {
        let mut directory = MockDirectory::new();
        let mut seq = Sequence::new();
        directory
            .expect_submit_scan()
            .with(eq(ScanTarget::All))
            .times(1)
            .returning(|_| Ok(submitted(&[1, 2, 3])));
        expect_detail(&mut directory, &mut seq, 1, TaskStatus::Running);
        expect_detail(&mut directory, &mut seq, 1, TaskStatus::Completed);
        expect_detail(&mut directory, &mut seq, 2, TaskStatus::Failed);
        expect_detail(&mut directory, &mut seq, 3, TaskStatus::Completed);

        let engine = ScanEngine::new(Arc::new(directory));
        engine.submit(ScanTarget::All).await.expect("submit");
        assert_eq!(engine.queued(), vec![1, 2, 3]);

        assert_eq!(engine.tick().await, TickOutcome::Progressed);
        assert_eq!(engine.state().status, ScanStatus::Scanning);
        assert_eq!(engine.tick().await, TickOutcome::Advanced);
        assert_eq!(engine.tick().await, TickOutcome::Advanced);
        assert_eq!(engine.state().remaining, 1);
        assert!(matches!(
            engine.tick().await,
            TickOutcome::Finished { failed: true, .. }
        ));

        let state = engine.state();
        assert_eq!(state.status, ScanStatus::Error);
        assert_eq!(state.progress, 100.0);
        assert_eq!(state.current_file, None);
        assert_eq!(state.message_key, None);

        let errors = engine.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message.as_deref(), Some("task 2 failed"));
        assert!(!engine.is_engaged());
    }

    #[tokio::test]
    async fn clean_queue_finishes_with_completion_message() {
        let mut directory = MockDirectory::new();
        let mut seq = Sequence::new();
        directory
            .expect_submit_scan()
            .returning(|_| Ok(submitted(&[4])));
        expect_detail(&mut directory, &mut seq, 4, TaskStatus::Completed);

        let engine = ScanEngine::new(Arc::new(directory));
        engine.submit(ScanTarget::LibraryPath(2)).await.unwrap();
        let outcome = engine.tick().await;
        assert_eq!(
            outcome,
            TickOutcome::Finished {
                failed: false,
                generation: 1
            }
        );
        assert_eq!(engine.state().status, ScanStatus::Finished);
        assert_eq!(engine.state().message_key, Some(MSG_COMPLETED));

        assert!(engine.settle(1));
        assert_eq!(engine.state(), ScanSessionState::default());
        assert_eq!(engine.tick().await, TickOutcome::Idle);
    }

    #[tokio::test]
    async fn cancelled_head_aborts_the_batch() {
        let mut directory = MockDirectory::new();
        let mut seq = Sequence::new();
        directory
            .expect_submit_scan()
            .returning(|_| Ok(submitted(&[1, 2])));
        expect_detail(&mut directory, &mut seq, 1, TaskStatus::Cancelled);
        directory.expect_get_task().with(eq(2)).never();

        let engine = ScanEngine::new(Arc::new(directory));
        engine.submit(ScanTarget::All).await.unwrap();

        assert_eq!(engine.tick().await, TickOutcome::Cancelled);
        assert_eq!(engine.state().status, ScanStatus::Idle);
        assert!(engine.errors().is_empty());
        assert!(engine.queued().is_empty());
        assert_eq!(engine.tick().await, TickOutcome::Idle);
    }

    #[tokio::test]
    async fn fetch_failure_retries_same_head() {
        let mut directory = MockDirectory::new();
        let mut seq = Sequence::new();
        directory
            .expect_submit_scan()
            .returning(|_| Ok(submitted(&[1, 2])));
        directory
            .expect_get_task()
            .with(eq(1))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Err(ScanwatchError::Api {
                    status: 502,
                    message: "bad gateway".into(),
                })
            });
        expect_detail(&mut directory, &mut seq, 1, TaskStatus::Running);

        let engine = ScanEngine::new(Arc::new(directory));
        engine.submit(ScanTarget::All).await.unwrap();
        let before = engine.state();

        assert_eq!(engine.tick().await, TickOutcome::Waiting);
        assert_eq!(engine.state(), before);
        assert_eq!(engine.tick().await, TickOutcome::Progressed);
        assert_eq!(engine.queued(), vec![1, 2]);
    }

    #[tokio::test]
    async fn overlapping_ticks_issue_one_fetch() {
        let directory = Arc::new(FakeDirectory::new().gate_details());
        directory.script(1, [scan_task(1, TaskStatus::Running)]);
        directory.queue_submission(Ok(submitted(&[1])));

        let engine = ScanEngine::new(directory.clone());
        engine.submit(ScanTarget::All).await.unwrap();

        let gate = directory.gate();
        let (first, second) = tokio::join!(engine.tick(), async {
            let outcome = engine.tick().await;
            gate.notify_one();
            outcome
        });

        assert_eq!(first, TickOutcome::Progressed);
        assert_eq!(second, TickOutcome::Skipped);
        assert_eq!(directory.detail_calls(), vec![1]);
    }

    #[tokio::test]
    async fn optimistic_state_is_visible_before_confirmation() {
        let directory = Arc::new(FakeDirectory::new().gate_submissions());
        directory.queue_submission(Ok(submitted(&[8])));

        let engine = ScanEngine::new(directory.clone());
        let gate = directory.gate();
        let (result, observed) = tokio::join!(engine.submit(ScanTarget::LibraryPath(1)), async {
            let observed = engine.state();
            let adopted = engine.adopt(None);
            gate.notify_one();
            (observed, adopted)
        });

        let (optimistic, adopted) = observed;
        assert_eq!(optimistic.status, ScanStatus::Pending);
        assert_eq!(optimistic.message_key, Some(MSG_INITIALIZING));
        assert!(!adopted);
        assert!(result.is_ok());
        assert_eq!(engine.state().task_id, Some(8));
        assert!(engine.is_engaged());
    }

    #[tokio::test]
    async fn submission_failure_records_one_error() {
        let mut directory = MockDirectory::new();
        directory
            .expect_submit_scan()
            .times(1)
            .returning(|_| Ok(Vec::new()));
        directory.expect_submit_scan().times(1).returning(|_| {
            Err(ScanwatchError::Api {
                status: 500,
                message: "boom".into(),
            })
        });
        directory.expect_get_task().never();

        let engine = ScanEngine::new(Arc::new(directory));
        let err = engine.submit(ScanTarget::All).await.expect_err("no paths");
        assert!(matches!(err, ScanwatchError::NoLibraryPaths));
        assert_eq!(engine.state().status, ScanStatus::Error);
        let errors = engine.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message_key.as_deref(), Some(MSG_NO_LIBRARY_PATHS));
        assert!(!engine.is_engaged());
        assert_eq!(engine.tick().await, TickOutcome::Idle);

        engine.submit(ScanTarget::All).await.expect_err("server error");
        let errors = engine.errors();
        assert_eq!(errors.len(), 1, "new submission clears earlier errors");
        assert_eq!(errors[0].message_key.as_deref(), Some(MSG_SUBMIT_FAILED));

        engine.clear_errors();
        assert!(engine.errors().is_empty());
        assert_eq!(engine.state().status, ScanStatus::Idle);
    }

    #[tokio::test]
    async fn stale_settle_is_ignored() {
        let mut directory = MockDirectory::new();
        let mut seq = Sequence::new();
        directory
            .expect_submit_scan()
            .returning(|_| Ok(submitted(&[1])));
        expect_detail(&mut directory, &mut seq, 1, TaskStatus::Completed);

        let engine = ScanEngine::new(Arc::new(directory));
        engine.submit(ScanTarget::All).await.unwrap();
        let TickOutcome::Finished { generation, .. } = engine.tick().await else {
            panic!("expected finished");
        };

        assert!(!engine.settle(generation + 1));
        assert_eq!(engine.state().status, ScanStatus::Finished);
        assert!(engine.settle(generation));
    }

    #[test]
    fn adopt_reconstructs_banner_from_active_scan() {
        let engine = ScanEngine::new(Arc::new(MockDirectory::new()));

        let mut running = scan_task(21, TaskStatus::Running);
        running.progress = Some(140.0);
        running.current_file = Some("vol-03.cbz".into());
        assert!(engine.adopt(Some(&running)));

        let state = engine.state();
        assert_eq!(state.status, ScanStatus::Scanning);
        assert_eq!(state.progress, 100.0);
        assert_eq!(state.current_file.as_deref(), Some("vol-03.cbz"));
        assert_eq!(state.message_key, None);
        assert_eq!(state.task_id, Some(21));

        assert!(engine.adopt(None));
        assert_eq!(engine.state().status, ScanStatus::Idle);
        assert!(!engine.adopt(None));
    }
}
