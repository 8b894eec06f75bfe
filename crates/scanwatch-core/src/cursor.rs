use std::cmp::Ordering;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::kv::{KvBackend, KvKey, KvNamespace, KvStore};
use crate::task::{Task, TaskKey};

const CURSOR_KEY: &str = "history-seen";

/// Watermark over finished tasks, ordered by timestamp then id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Cursor {
    #[serde(rename = "ts")]
    pub timestamp: i64,
    pub id: TaskKey,
}

impl Cursor {
    pub const ZERO: Cursor = Cursor { timestamp: 0, id: 0 };

    pub fn new(timestamp: i64, id: TaskKey) -> Self {
        Self { timestamp, id }
    }

    pub fn is_after(&self, other: &Cursor) -> bool {
        self.cmp(other) == Ordering::Greater
    }

    pub fn max(self, other: Cursor) -> Cursor {
        if other.is_after(&self) { other } else { self }
    }

    /// Latest position over `tasks`, starting from `self`.
    pub fn max_over<'a>(self, tasks: impl IntoIterator<Item = &'a Task>) -> Cursor {
        tasks.into_iter().map(Task::cursor).fold(self, Cursor::max)
    }

    /// Decodes a persisted blob. Anything malformed, including non-finite
    /// numbers, yields `None`.
    fn decode(bytes: &[u8]) -> Option<Cursor> {
        let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
        let number = |field: &str| {
            value
                .get(field)
                .and_then(serde_json::Value::as_f64)
                .filter(|n| n.is_finite())
                .map(|n| n as i64)
        };
        Some(Cursor::new(number("ts")?, number("id")?))
    }
}

impl Ord for Cursor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then(self.id.cmp(&other.id))
    }
}

impl PartialOrd for Cursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorState {
    pub cursor: Cursor,
    pub initialized: bool,
}

impl CursorState {
    const UNINITIALIZED: CursorState = CursorState {
        cursor: Cursor::ZERO,
        initialized: false,
    };
}

/// Durable, monotonic "seen" watermark. Persistence is best-effort: a failed
/// write is logged and the in-memory cursor still advances.
pub struct CursorStore<B: KvBackend> {
    store: KvStore<B>,
    state: Mutex<CursorState>,
    write_lock: tokio::sync::Mutex<()>,
}

impl<B: KvBackend> CursorStore<B> {
    pub async fn open(store: KvStore<B>) -> Self {
        let cursors = Self {
            store,
            state: Mutex::new(CursorState::UNINITIALIZED),
            write_lock: tokio::sync::Mutex::new(()),
        };
        cursors.load().await;
        cursors
    }

    fn key() -> KvKey {
        KvKey::new(KvNamespace::Cursor, CURSOR_KEY)
    }

    pub fn state(&self) -> CursorState {
        *self.state.lock()
    }

    pub fn current(&self) -> Cursor {
        self.state.lock().cursor
    }

    /// Re-reads the persisted cursor. Absence and corruption both read as
    /// uninitialized.
    pub async fn load(&self) -> CursorState {
        let loaded = match self.store.backend().get(&Self::key()).await {
            Ok(Some(bytes)) => match Cursor::decode(&bytes) {
                Some(cursor) => CursorState {
                    cursor,
                    initialized: true,
                },
                None => {
                    debug!("persisted cursor is malformed, ignoring it");
                    CursorState::UNINITIALIZED
                }
            },
            Ok(None) => CursorState::UNINITIALIZED,
            Err(err) => {
                warn!(error = %err, "unable to read persisted cursor");
                CursorState::UNINITIALIZED
            }
        };

        let mut state = self.state.lock();
        state.cursor = state.cursor.max(loaded.cursor);
        state.initialized |= loaded.initialized;
        *state
    }

    /// Persists the current in-memory cursor. Returns whether the write
    /// landed.
    pub async fn save(&self) -> bool {
        let _guard = self.write_lock.lock().await;
        let cursor = self.current();
        match self.store.store(&Self::key(), &cursor).await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, ?cursor, "unable to persist cursor");
                false
            }
        }
    }

    /// First-snapshot baseline: an uninitialized cursor jumps to the latest
    /// known finished task so existing history is not reported as new.
    /// Later calls are no-ops.
    pub async fn initialize<'a>(&self, history: impl IntoIterator<Item = &'a Task>) -> Cursor {
        let cursor = {
            let mut state = self.state.lock();
            if state.initialized {
                return state.cursor;
            }
            state.cursor = state.cursor.max_over(history);
            state.initialized = true;
            state.cursor
        };
        debug!(?cursor, "initialized history cursor");
        self.save().await;
        cursor
    }

    /// Merges `candidate` into the cursor; the cursor never moves backwards.
    /// A candidate that does not move the cursor leaves an uninitialized
    /// store uninitialized, so the first snapshot still sets the baseline.
    pub async fn advance(&self, candidate: Cursor) -> Cursor {
        let cursor = {
            let mut state = self.state.lock();
            if !candidate.is_after(&state.cursor) {
                return state.cursor;
            }
            state.cursor = candidate;
            state.initialized = true;
            state.cursor
        };
        self.save().await;
        cursor
    }

    pub async fn reset(&self) {
        let _guard = self.write_lock.lock().await;
        *self.state.lock() = CursorState::UNINITIALIZED;
        if let Err(err) = self.store.remove(&Self::key()).await {
            warn!(error = %err, "unable to remove persisted cursor");
        }
    }
}
