//! Polling controller: decides when the task directory is refreshed and
//! when the scan queue is ticked.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{debug, warn};

use crate::coordinator::{CoordinatorEvent, CoordinatorShared, TaskBoard};
use crate::directory::TaskDirectory;
use crate::kv::KvBackend;
use crate::scan::TickOutcome;
use crate::scheduler::TimerKind;

impl<D: TaskDirectory, B: KvBackend> CoordinatorShared<D, B> {
    /// Fetches a fresh snapshot. On failure the previous snapshot stays in
    /// place. Returns whether any task is active afterwards.
    pub(crate) async fn refresh(&self) -> bool {
        let sequence = self.refresh_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let limit = self.polling.clamped_history_limit();

        let tasks = match self.directory.list_tasks(limit).await {
            Ok(tasks) => tasks,
            Err(err) => {
                warn!(error = %err, "task directory refresh failed, keeping previous snapshot");
                return self.board.read().has_active();
            }
        };

        if self.board.read().sequence > sequence {
            debug!(sequence, "discarding out-of-order snapshot");
            return self.board.read().has_active();
        }

        let board = TaskBoard::from_snapshot(sequence, tasks);
        self.cursor.initialize(&board.history).await;

        let any_active = board.has_active();
        let (active, history) = (board.active.len(), board.history.len());
        {
            let mut current = self.board.write();
            if current.sequence > sequence {
                debug!(sequence, "discarding out-of-order snapshot");
                return current.has_active();
            }
            *current = board;
        }

        if !self.scheduler.is_running(TimerKind::ScanTick) {
            let adopted = {
                let current = self.board.read();
                current.sequence == sequence && self.engine.adopt(current.active_scan())
            };
            if adopted {
                debug!(state = ?self.engine.state(), "scan banner re-derived from directory");
            }
        }

        debug!(active, history, "task directory refreshed");
        let _ = self
            .events
            .send(CoordinatorEvent::TasksRefreshed { active, history });
        any_active
    }

    /// Refresh plus timer bookkeeping. Never called from the fast timer
    /// itself, which stops on its own.
    pub(crate) async fn refresh_and_sync(self: &Arc<Self>) {
        let any_active = self.refresh().await;
        self.sync_fast_timer(any_active);
        self.ensure_scan_ticker();
    }

    pub(crate) fn start_slow_timer(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.scheduler
            .start_interval(TimerKind::Slow, self.polling.slow_interval(), move || {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(shared) => {
                            shared.refresh_and_sync().await;
                            ControlFlow::Continue(())
                        }
                        None => ControlFlow::Break(()),
                    }
                }
            });
    }

    fn sync_fast_timer(self: &Arc<Self>, any_active: bool) {
        if !any_active {
            self.scheduler.stop(TimerKind::Fast);
            return;
        }

        let weak = Arc::downgrade(self);
        self.scheduler
            .start_interval(TimerKind::Fast, self.polling.fast_interval(), move || {
                let weak = weak.clone();
                async move {
                    let Some(shared) = weak.upgrade() else {
                        return ControlFlow::Break(());
                    };
                    if shared.refresh().await {
                        ControlFlow::Continue(())
                    } else {
                        debug!("no active tasks, fast polling stops");
                        ControlFlow::Break(())
                    }
                }
            });
    }

    /// Starts the scan ticker whenever the engine has a queue to drive.
    pub(crate) fn ensure_scan_ticker(self: &Arc<Self>) {
        if !self.engine.is_engaged() {
            return;
        }

        let weak = Arc::downgrade(self);
        let rearm = weak.clone();
        self.scheduler.start_interval_then(
            TimerKind::ScanTick,
            self.polling.scan_tick(),
            move || {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(shared) => shared.on_scan_tick().await,
                        None => ControlFlow::Break(()),
                    }
                }
            },
            // A submission may have seen the slot still occupied after the
            // job broke out.
            move || {
                if let Some(shared) = rearm.upgrade() {
                    shared.ensure_scan_ticker();
                }
            },
        );
    }

    async fn on_scan_tick(self: &Arc<Self>) -> ControlFlow<()> {
        match self.engine.tick().await {
            TickOutcome::Finished { failed, generation } => {
                self.finish_scan(failed, generation).await;
            }
            TickOutcome::Cancelled => {
                let _ = self.events.send(CoordinatorEvent::ScanCancelled);
                self.refresh_and_sync().await;
            }
            TickOutcome::Progressed | TickOutcome::Advanced => {
                let _ = self
                    .events
                    .send(CoordinatorEvent::ScanProgress(self.engine.state()));
            }
            TickOutcome::Idle | TickOutcome::Waiting | TickOutcome::Skipped => {}
        }

        // A new submission may have landed while this tick ran.
        if self.engine.is_engaged() {
            ControlFlow::Continue(())
        } else {
            ControlFlow::Break(())
        }
    }

    async fn finish_scan(self: &Arc<Self>, failed: bool, generation: u64) {
        let _ = self.events.send(CoordinatorEvent::LibraryChanged);
        self.refresh_and_sync().await;
        let _ = self.events.send(CoordinatorEvent::ScanFinished { failed });

        let weak = Arc::downgrade(self);
        self.scheduler.start_after(
            TimerKind::ScanSettle,
            self.polling.settle_delay(),
            async move {
                if let Some(shared) = weak.upgrade() {
                    if shared.engine.settle(generation) {
                        debug!(generation, "scan banner returned to idle");
                    }
                }
            },
        );
    }
}
