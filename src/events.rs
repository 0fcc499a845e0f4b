use tokio::sync::broadcast;

/// Ring capacity per channel. Subscribers that fall further behind than this
/// lag and miss intermediate messages, which is acceptable for both event
/// notification and live log tailing: the final `complete` chunk ends every
/// well-behaved log stream, and a lagged subscriber is torn down by its
/// serving task.
const CHANNEL_CAPACITY: usize = 256;

/// One of the three lifecycle notifications: `job_queued`, `job_started` or
/// `job_completed`. The payload is the full client-facing JSON document
/// including its `type` tag.
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub job: String,
    pub payload: serde_json::Value,
}

/// A slice of live log output for one run. An empty chunk with
/// `complete = true` marks end-of-stream.
#[derive(Debug, Clone)]
pub struct LogChunk {
    pub job: String,
    pub number: i64,
    pub chunk: String,
    pub complete: bool,
}

/// Best-effort fan-out of run lifecycle events and live log output.
/// Publishing never blocks and never fails; with no subscribers the message
/// is simply dropped.
#[derive(Debug)]
pub struct EventBus {
    events: broadcast::Sender<JobEvent>,
    logs: broadcast::Sender<LogChunk>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (logs, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { events, logs }
    }

    pub fn notify_event(&self, job: &str, payload: serde_json::Value) {
        let _ = self.events.send(JobEvent {
            job: job.to_string(),
            payload,
        });
    }

    pub fn notify_log(&self, job: &str, number: i64, chunk: String, complete: bool) {
        let _ = self.logs.send(LogChunk {
            job: job.to_string(),
            number,
            chunk,
            complete,
        });
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_logs(&self) -> broadcast::Receiver<LogChunk> {
        self.logs.subscribe()
    }
}
