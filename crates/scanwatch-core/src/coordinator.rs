use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::PollingConfig;
use crate::cursor::{Cursor, CursorStore};
use crate::directory::{ScanTarget, SubmittedTask, TaskDirectory};
use crate::error::Result;
use crate::kv::KvBackend;
use crate::scan::{ScanEngine, ScanError, ScanSessionState};
use crate::scheduler::{Scheduler, TimerKind};
use crate::task::{Task, TaskKey, TaskStatus};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    TasksRefreshed { active: usize, history: usize },
    ScanProgress(ScanSessionState),
    /// A scan queue drained; file and library listings are stale.
    LibraryChanged,
    ScanFinished { failed: bool },
    ScanCancelled,
}

/// Latest directory snapshot split into active and history tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskBoard {
    pub(crate) sequence: u64,
    pub active: Vec<Task>,
    pub history: Vec<Task>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl TaskBoard {
    pub(crate) fn from_snapshot(sequence: u64, tasks: Vec<Task>) -> Self {
        let (active, history) = tasks.into_iter().partition(Task::is_active);
        Self {
            sequence,
            active,
            history,
            refreshed_at: Some(Utc::now()),
        }
    }

    pub fn has_active(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn active_scan(&self) -> Option<&Task> {
        self.active.iter().find(|task| task.is_scan())
    }

    fn unseen(&self, cursor: &Cursor) -> impl Iterator<Item = &Task> {
        self.history
            .iter()
            .filter(move |task| task.cursor().is_after(cursor))
    }
}

pub(crate) struct CoordinatorShared<D: TaskDirectory, B: KvBackend> {
    pub(crate) directory: Arc<D>,
    pub(crate) engine: ScanEngine<D>,
    pub(crate) cursor: CursorStore<B>,
    pub(crate) board: RwLock<TaskBoard>,
    pub(crate) refresh_sequence: AtomicU64,
    pub(crate) scheduler: Scheduler,
    pub(crate) polling: PollingConfig,
    pub(crate) events: broadcast::Sender<CoordinatorEvent>,
}

/// The single object the application talks to for background tasks and
/// scans. Timers run between [`Coordinator::start`] and
/// [`Coordinator::dispose`] (or drop).
pub struct Coordinator<D: TaskDirectory, B: KvBackend> {
    shared: Arc<CoordinatorShared<D, B>>,
}

impl<D: TaskDirectory, B: KvBackend> Coordinator<D, B> {
    pub fn new(directory: Arc<D>, cursor: CursorStore<B>, polling: PollingConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = CoordinatorShared {
            engine: ScanEngine::new(directory.clone()),
            directory,
            cursor,
            board: RwLock::new(TaskBoard::default()),
            refresh_sequence: AtomicU64::new(0),
            scheduler: Scheduler::new(),
            polling,
            events,
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Loads the first snapshot and starts the slow refresh timer.
    pub async fn start(&self) {
        info!(
            slow_ms = self.shared.polling.slow_interval_ms,
            fast_ms = self.shared.polling.fast_interval_ms,
            "task coordinator starting"
        );
        self.shared.refresh_and_sync().await;
        self.shared.start_slow_timer();
    }

    pub fn dispose(&self) {
        self.shared.scheduler.stop_all();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.shared.events.subscribe()
    }

    pub fn is_timer_running(&self, kind: TimerKind) -> bool {
        self.shared.scheduler.is_running(kind)
    }

    pub fn scan_state(&self) -> ScanSessionState {
        self.shared.engine.state()
    }

    pub fn scan_errors(&self) -> Vec<ScanError> {
        self.shared.engine.errors()
    }

    pub fn board(&self) -> TaskBoard {
        self.shared.board.read().clone()
    }

    pub fn active_tasks(&self) -> Vec<Task> {
        self.shared.board.read().active.clone()
    }

    pub fn history_tasks(&self) -> Vec<Task> {
        self.shared.board.read().history.clone()
    }

    pub fn cursor(&self) -> Cursor {
        self.shared.cursor.current()
    }

    pub fn unseen_history_tasks(&self) -> Vec<Task> {
        let cursor = self.cursor();
        self.shared.board.read().unseen(&cursor).cloned().collect()
    }

    pub fn unseen_history_count(&self) -> usize {
        let cursor = self.cursor();
        self.shared.board.read().unseen(&cursor).count()
    }

    pub fn unseen_failed_count(&self) -> usize {
        let cursor = self.cursor();
        self.shared
            .board
            .read()
            .unseen(&cursor)
            .filter(|task| task.status == TaskStatus::Failed)
            .count()
    }

    pub async fn start_scan(&self, library_path_id: i64) -> Result<Vec<SubmittedTask>> {
        self.start_scan_target(ScanTarget::LibraryPath(library_path_id))
            .await
    }

    pub async fn start_scan_all(&self) -> Result<Vec<SubmittedTask>> {
        self.start_scan_target(ScanTarget::All).await
    }

    /// Submits a scan and starts driving its queue. Errors are also kept in
    /// [`Coordinator::scan_errors`].
    pub async fn start_scan_target(&self, target: ScanTarget) -> Result<Vec<SubmittedTask>> {
        let result = self.shared.engine.submit(target).await;
        self.shared.refresh_and_sync().await;
        result
    }

    /// Requests cancellation without waiting for it to take effect; the
    /// outcome shows up in later refreshes.
    pub async fn cancel_task(&self, id: TaskKey) -> Result<()> {
        let result = self.shared.directory.cancel_task(id).await;
        if let Err(err) = &result {
            warn!(task = id, error = %err, "cancel request failed");
        }
        self.shared.refresh_and_sync().await;
        result
    }

    pub async fn check_active_tasks(&self) {
        self.shared.refresh_and_sync().await;
    }

    /// Advances the cursor past every history task currently known.
    pub async fn mark_history_tasks_seen(&self) -> Cursor {
        let latest = {
            let board = self.shared.board.read();
            Cursor::ZERO.max_over(&board.history)
        };
        self.shared.cursor.advance(latest).await
    }

    pub fn clear_errors(&self) {
        self.shared.engine.clear_errors();
    }
}

impl<D: TaskDirectory, B: KvBackend> Drop for Coordinator<D, B> {
    fn drop(&mut self) {
        self.dispose();
    }
}
