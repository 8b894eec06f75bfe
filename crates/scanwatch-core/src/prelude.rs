pub use crate::config::{
    CoordinatorConfig, CursorConfig, KvBackendKind, PollingConfig, ServerConfig,
};
pub use crate::coordinator::{Coordinator, CoordinatorEvent, TaskBoard};
pub use crate::cursor::{Cursor, CursorStore};
pub use crate::directory::{HttpTaskDirectory, ScanTarget, SubmittedTask, TaskDirectory};
pub use crate::error::{Result, ScanwatchError};
pub use crate::kv::{AnyBackend, KvBackend, KvStore};
pub use crate::scan::{ScanError, ScanSessionState, ScanStatus};
pub use crate::scheduler::TimerKind;
pub use crate::task::{Task, TaskKey, TaskStatus, TaskType};
