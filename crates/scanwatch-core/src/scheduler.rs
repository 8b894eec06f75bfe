use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Unconditional directory refresh.
    Slow,
    /// Directory refresh while any task is active.
    Fast,
    /// Scan queue progress.
    ScanTick,
    /// One-shot return of a finished scan banner to idle.
    ScanSettle,
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            TimerKind::Slow => "slow",
            TimerKind::Fast => "fast",
            TimerKind::ScanTick => "scan-tick",
            TimerKind::ScanSettle => "scan-settle",
        };
        f.write_str(value)
    }
}

struct Slot {
    generation: u64,
    handle: JoinHandle<()>,
}

type Slots = Arc<Mutex<HashMap<TimerKind, Slot>>>;

/// Owns every background timer of a coordinator. A timer is running exactly
/// while its slot is occupied.
pub struct Scheduler {
    slots: Slots,
    generation: AtomicU64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    pub fn is_running(&self, kind: TimerKind) -> bool {
        self.slots
            .lock()
            .get(&kind)
            .is_some_and(|slot| !slot.handle.is_finished())
    }

    /// Runs `job` every `period`, first firing one period from now. The job
    /// stops its own timer by returning `Break`. Returns false if the timer
    /// was already running.
    pub fn start_interval<F, Fut>(&self, kind: TimerKind, period: Duration, job: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        self.start_interval_then(kind, period, job, || {})
    }

    /// Like [`Scheduler::start_interval`], running `on_exit` once the job has
    /// broken out and its slot is free again. Not run when the timer is
    /// stopped from outside.
    pub fn start_interval_then<F, Fut, E>(
        &self,
        kind: TimerKind,
        period: Duration,
        mut job: F,
        on_exit: E,
    ) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
        E: FnOnce() + Send + 'static,
    {
        let mut slots = self.slots.lock();
        if slots
            .get(&kind)
            .is_some_and(|slot| !slot.handle.is_finished())
        {
            return false;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let registry = Arc::clone(&self.slots);
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if job().await.is_break() {
                    break;
                }
            }
            release(&registry, kind, generation);
            on_exit();
        });

        debug!(timer = %kind, ?period, "timer started");
        slots.insert(kind, Slot { generation, handle });
        true
    }

    /// Runs `job` once after `delay`, replacing any pending run of `kind`.
    pub fn start_after<Fut>(&self, kind: TimerKind, delay: Duration, job: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slots = self.slots.lock();
        if let Some(previous) = slots.remove(&kind) {
            previous.handle.abort();
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let registry = Arc::clone(&self.slots);
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            job.await;
            release(&registry, kind, generation);
        });

        debug!(timer = %kind, ?delay, "one-shot timer armed");
        slots.insert(kind, Slot { generation, handle });
    }

    pub fn stop(&self, kind: TimerKind) -> bool {
        match self.slots.lock().remove(&kind) {
            Some(slot) => {
                slot.handle.abort();
                debug!(timer = %kind, "timer stopped");
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        let drained: Vec<_> = self.slots.lock().drain().collect();
        for (kind, slot) in drained {
            slot.handle.abort();
            debug!(timer = %kind, "timer stopped");
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn release(slots: &Mutex<HashMap<TimerKind, Slot>>, kind: TimerKind, generation: u64) {
    let mut slots = slots.lock();
    if slots
        .get(&kind)
        .is_some_and(|slot| slot.generation == generation)
    {
        slots.remove(&kind);
        debug!(timer = %kind, "timer finished");
    }
}
