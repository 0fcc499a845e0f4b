use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Lifecycle state of a run. The discriminants are the result codes stored
/// in the builds table, so they must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Unknown = 0,
    Queued = 1,
    Running = 2,
    Aborted = 3,
    Failed = 4,
    Success = 5,
}

impl RunState {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            1 => RunState::Queued,
            2 => RunState::Running,
            3 => RunState::Aborted,
            4 => RunState::Failed,
            5 => RunState::Success,
            _ => RunState::Unknown,
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Unknown => write!(f, "unknown"),
            RunState::Queued => write!(f, "queued"),
            RunState::Running => write!(f, "running"),
            RunState::Aborted => write!(f, "aborted"),
            RunState::Failed => write!(f, "failed"),
            RunState::Success => write!(f, "success"),
        }
    }
}

/// A run waiting in the queue for an executor.
///
/// Parameters whose key starts with `=` carry run metadata rather than
/// environment for the job script: `=reason` is the human-readable trigger
/// description, `=parentJob`/`=parentBuild` link to the upstream run. They
/// are lifted out of the parameter map on construction.
#[derive(Debug, Clone)]
pub struct QueuedRun {
    pub name: String,
    pub number: i64,
    pub queued_at: i64,
    pub reason: String,
    pub parent_name: Option<String>,
    pub parent_number: Option<i64>,
    pub params: HashMap<String, String>,
    /// Seconds after which the run is aborted. 0 disables the timeout.
    pub timeout: u64,
}

impl QueuedRun {
    pub fn new(
        name: String,
        number: i64,
        queued_at: i64,
        mut params: HashMap<String, String>,
        timeout: u64,
    ) -> Self {
        let reason = params.remove("=reason").unwrap_or_default();
        let parent_name = params.remove("=parentJob");
        let parent_number = params.remove("=parentBuild").and_then(|v| v.parse().ok());
        Self {
            name,
            number,
            queued_at,
            reason,
            parent_name,
            parent_number,
            params,
            timeout,
        }
    }
}

/// A dispatched run, shared between the scheduler state and its supervisor
/// task. The log buffer and parameter map have their own locks because the
/// supervisor appends output and the control endpoint may update parameters
/// without going through the scheduler lock.
#[derive(Debug)]
pub struct ActiveRun {
    pub name: String,
    pub number: i64,
    pub queued_at: i64,
    pub started_at: i64,
    pub reason: String,
    pub parent_name: Option<String>,
    pub parent_number: Option<i64>,
    /// Name of the context whose executor this run occupies.
    pub context: String,
    pub pid: Option<u32>,
    pub timeout: u64,
    log: Mutex<Vec<u8>>,
    params: Mutex<HashMap<String, String>>,
    abort: CancellationToken,
}

impl ActiveRun {
    pub fn start(queued: QueuedRun, context: String, started_at: i64, pid: Option<u32>) -> Self {
        Self {
            name: queued.name,
            number: queued.number,
            queued_at: queued.queued_at,
            started_at,
            reason: queued.reason,
            parent_name: queued.parent_name,
            parent_number: queued.parent_number,
            context,
            pid,
            timeout: queued.timeout,
            log: Mutex::new(Vec::new()),
            params: Mutex::new(queued.params),
            abort: CancellationToken::new(),
        }
    }

    pub fn append_log(&self, chunk: &[u8]) {
        self.log.lock().unwrap().extend_from_slice(chunk);
    }

    pub fn log_snapshot(&self) -> Vec<u8> {
        self.log.lock().unwrap().clone()
    }

    pub fn set_param(&self, key: String, value: String) {
        self.params.lock().unwrap().insert(key, value);
    }

    pub fn params_snapshot(&self) -> HashMap<String, String> {
        self.params.lock().unwrap().clone()
    }

    /// Request cancellation. The supervisor kills the child in response and
    /// the run completes through the normal path with result `Aborted`.
    pub fn abort(&self) {
        self.abort.cancel();
    }

    pub fn abort_requested(&self) -> bool {
        self.abort.is_cancelled()
    }

    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }
}
