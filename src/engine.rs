use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, RwLock};

use crate::config;
use crate::db::{ArtifactRow, Database};
use crate::error::{Result, SlipstreamError};
use crate::events::EventBus;
use crate::retention;
use crate::scheduler::{ActiveRun, QueuedRun, RunState, SchedulerState};
use crate::settings::Settings;

/// The job lifecycle engine: queueing, dispatch, child supervision,
/// completion handling and retention.
///
/// All scheduler tables live behind one async lock; every lifecycle
/// transition runs under the write guard, so transitions are serialised and
/// each one observes a stable snapshot of queue, active set and executor
/// counts. Supervisor tasks run concurrently but only re-enter the engine
/// through [`Engine::handle_run_finished`].
pub struct Engine {
    pub(crate) settings: Settings,
    pub(crate) db: Database,
    pub(crate) events: EventBus,
    pub(crate) state: RwLock<SchedulerState>,
}

impl Engine {
    pub async fn new(settings: Settings) -> Result<Arc<Self>> {
        if !settings.home.is_absolute() {
            return Err(SlipstreamError::RelativeHome(
                settings.home.display().to_string(),
            ));
        }
        if settings.home.join("cfg").join("nodes").is_dir() {
            return Err(SlipstreamError::LegacyNodeConfig);
        }
        for dir in ["cfg/contexts", "cfg/jobs", "run", "archive"] {
            std::fs::create_dir_all(settings.home.join(dir))?;
        }

        let db = Database::connect(&settings.connection_string).await?;
        db.bootstrap().await?;
        let build_nums = db.load_build_nums().await?;

        let engine = Arc::new(Self {
            settings,
            db,
            events: EventBus::new(),
            state: RwLock::new(SchedulerState {
                build_nums,
                ..Default::default()
            }),
        });
        engine.load_configuration().await;
        Ok(engine)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// (Re)read contexts, jobs and groups from disk, then run the dispatcher:
    /// a configuration change can unblock queued work. Called at startup and
    /// on every configuration file-watch notification.
    pub async fn load_configuration(self: &Arc<Self>) {
        let contexts = config::load_contexts(&self.settings.home);
        let jobs = config::load_jobs(&self.settings.home);
        let groups = config::load_groups(&self.settings.home);

        let mut state = self.state.write().await;
        state.reconcile_contexts(contexts);
        state.apply_job_confs(jobs, groups);
        self.assign_new_jobs(&mut state).await;
    }

    /// Queue a run of `job`. Fails if cfg/jobs/<job>.run does not exist.
    /// Returns the allocated build number.
    pub async fn queue_job(
        self: &Arc<Self>,
        job: &str,
        params: HashMap<String, String>,
        front_of_queue: bool,
    ) -> Result<i64> {
        let script = self.settings.jobs_dir().join(format!("{job}.run"));
        if !script.is_file() {
            tracing::error!(job, "Non-existent job");
            return Err(SlipstreamError::JobNotFound(job.to_string()));
        }

        let mut state = self.state.write().await;
        state.ensure_job_contexts(job);
        let number = state.next_build_num(job);
        let timeout = state.job_timeouts.get(job).copied().unwrap_or(0);
        let run = QueuedRun::new(
            job.to_string(),
            number,
            Utc::now().timestamp(),
            params,
            timeout,
        );

        self.db
            .insert_build(
                job,
                number,
                run.queued_at,
                run.parent_name.as_deref(),
                run.parent_number,
                &run.reason,
            )
            .await?;

        let queue_index = if front_of_queue {
            state.queued.push_front(run.clone());
            0
        } else {
            state.queued.push_back(run.clone());
            state.queued.len() - 1
        };
        tracing::info!(job, number, "Queued run");

        self.events.notify_event(
            job,
            json!({
                "type": "job_queued",
                "data": {
                    "name": job,
                    "number": number,
                    "result": RunState::Queued.to_string(),
                    "queueIndex": queue_index,
                    "reason": run.reason,
                }
            }),
        );

        self.assign_new_jobs(&mut state).await;
        Ok(number)
    }

    /// Walk the queue head-to-tail and start every run a context can take.
    /// A blocked entry does not starve later entries that match different
    /// contexts.
    fn assign_new_jobs<'a>(
        self: &'a Arc<Self>,
        state: &'a mut SchedulerState,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let mut index = 0;
            while index < state.queued.len() {
                match state.eligible_context(&state.queued[index]) {
                    Some(ctx) => {
                        if !self.try_start_run(state, index, ctx).await {
                            index += 1;
                        }
                    }
                    None => index += 1,
                }
            }
        })
    }

    /// Transition the queued run at `queue_index` to Running on `ctx_name`.
    /// On failure the run stays queued and will be retried on the next
    /// dispatcher pass.
    async fn try_start_run(
        self: &Arc<Self>,
        state: &mut SchedulerState,
        queue_index: usize,
        ctx_name: String,
    ) -> bool {
        let (job, number, params, queued_at, reason) = {
            let run = &state.queued[queue_index];
            (
                run.name.clone(),
                run.number,
                run.params.clone(),
                run.queued_at,
                run.reason.clone(),
            )
        };

        let last_result = match self.db.last_result(&job).await {
            Ok(code) => RunState::from_code(code.unwrap_or(0)),
            Err(e) => {
                tracing::warn!(job = %job, error = %e, "Could not read last result");
                RunState::Unknown
            }
        };

        let run_dir = self.settings.run_dir(&job, number);
        let archive_dir = self.settings.archive_dir(&job, number);
        for dir in [&run_dir, &archive_dir] {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                tracing::error!(path = %dir.display(), error = %e, "Could not create run directory");
                return false;
            }
        }

        let script = self.settings.jobs_dir().join(format!("{job}.run"));
        let mut child = match Command::new(&script)
            .current_dir(&run_dir)
            .env("JOB", &job)
            .env("RUN", number.to_string())
            .env("LAST_RESULT", last_result.to_string())
            .env("ARCHIVE", &archive_dir)
            .envs(&params)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(job = %job, number, error = %e, "Could not start run");
                return false;
            }
        };

        let started_at = Utc::now().timestamp();
        if let Err(e) = self.db.mark_started(&job, number, &ctx_name, started_at).await {
            tracing::warn!(job = %job, number, error = %e, "Could not persist run start");
        }

        let Some(queued_run) = state.queued.remove(queue_index) else {
            return false;
        };
        if let Some(ctx) = state.contexts.get_mut(&ctx_name) {
            ctx.busy_executors += 1;
        }
        let run = Arc::new(ActiveRun::start(
            queued_run,
            ctx_name.clone(),
            started_at,
            child.id(),
        ));
        state.active.push(run.clone());
        tracing::info!(job = %job, number, context = %ctx_name, "Started run");

        let mut data = json!({
            "queueIndex": queue_index,
            "name": job,
            "queued": queued_at,
            "started": started_at,
            "number": number,
            "reason": reason,
        });
        if let Ok(Some(last_runtime)) = self.db.last_runtime(&job).await {
            data["etc"] = json!(Utc::now().timestamp() + last_runtime);
        }
        self.events
            .notify_event(&job, json!({ "type": "job_started", "data": data }));

        tokio::spawn(Self::supervise(self.clone(), run, child));
        true
    }

    /// Pump the child's output into the run log and the log stream, honour
    /// abort and timeout, await the reap and hand over to completion.
    async fn supervise(self: Arc<Self>, run: Arc<ActiveRun>, mut child: Child) {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(16);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, tx.clone()));
        }
        drop(tx);

        let timeout_guard = (run.timeout > 0).then(|| {
            let run = run.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(run.timeout)).await;
                tracing::warn!(job = %run.name, number = run.number, "Run exceeded its timeout");
                run.abort();
            })
        });

        let abort = run.abort_token();
        let mut killed = false;
        loop {
            tokio::select! {
                chunk = rx.recv() => match chunk {
                    Some(bytes) => {
                        run.append_log(&bytes);
                        self.events.notify_log(
                            &run.name,
                            run.number,
                            String::from_utf8_lossy(&bytes).into_owned(),
                            false,
                        );
                    }
                    // both pipes reached EOF
                    None => break,
                },
                _ = abort.cancelled(), if !killed => {
                    killed = true;
                    tracing::info!(job = %run.name, number = run.number, "Signalling run");
                    if let Err(e) = child.start_kill() {
                        tracing::warn!(job = %run.name, number = run.number, error = %e, "Could not signal child");
                    }
                }
            }
        }

        let status = child.wait().await;
        if let Some(guard) = timeout_guard {
            guard.abort();
        }

        let result = match &status {
            Ok(status) if status.success() => RunState::Success,
            _ if run.abort_requested() => RunState::Aborted,
            _ => RunState::Failed,
        };
        if let Err(e) = status {
            tracing::error!(job = %run.name, number = run.number, error = %e, "Could not reap child");
        }

        self.handle_run_finished(&run, result).await;
    }

    /// Persist the outcome, notify subscribers, release the executor, prune
    /// old run directories, refresh the `latest` symlink and re-run the
    /// dispatcher for the freed slot.
    async fn handle_run_finished(self: &Arc<Self>, run: &Arc<ActiveRun>, result: RunState) {
        let completed_at = Utc::now().timestamp();
        tracing::info!(job = %run.name, number = run.number, result = %result, "Run completed");

        let mut state = self.state.write().await;
        if let Some(ctx) = state.contexts.get_mut(&run.context) {
            ctx.busy_executors -= 1;
        }

        let raw_log = run.log_snapshot();
        let output = gzip_compress(&raw_log);
        let archive_dir = self.settings.archive_dir(&run.name, run.number);
        let artifacts = collect_artifacts(&archive_dir).await;

        if let Err(e) = self
            .db
            .finish_build(
                &run.name,
                run.number,
                completed_at,
                result.code(),
                &output,
                raw_log.len() as i64,
                &artifacts,
            )
            .await
        {
            tracing::error!(job = %run.name, number = run.number, error = %e, "Could not persist run outcome");
        }

        let artifacts_json: Vec<serde_json::Value> = artifacts
            .iter()
            .map(|a| {
                json!({
                    "url": format!(
                        "{}{}/{}/{}",
                        self.settings.archive_url, run.name, run.number, a.filename
                    ),
                    "filename": a.filename,
                    "size": a.filesize,
                })
            })
            .collect();
        self.events.notify_event(
            &run.name,
            json!({
                "type": "job_completed",
                "data": {
                    "name": run.name,
                    "number": run.number,
                    "queued": run.queued_at,
                    "started": run.started_at,
                    "completed": completed_at,
                    "result": result.to_string(),
                    "reason": run.reason,
                    "artifacts": artifacts_json,
                }
            }),
        );
        self.events
            .notify_log(&run.name, run.number, String::new(), true);

        state.remove_active(&run.name, run.number);
        state.reap_defunct_contexts();

        // oldest_active must be computed after the finished run has left the
        // active set, or the sweep base would be off by one run.
        let oldest_active = state.oldest_active(&run.name);
        retention::prune_run_dirs(
            &self.settings.home,
            &run.name,
            oldest_active,
            retention::keep_run_dirs(),
        )
        .await;
        retention::refresh_latest_symlink(&self.settings.home, &run.name, run.number).await;

        self.assign_new_jobs(&mut state).await;
    }

    /// Signal an active run's child. The run completes through the normal
    /// path with result Aborted. Returns false if no such active run.
    pub async fn abort(&self, job: &str, number: i64) -> bool {
        let state = self.state.read().await;
        match state.active_run(job, number) {
            Some(run) => {
                run.abort();
                true
            }
            None => false,
        }
    }

    /// Abort every active run. Used on daemon shutdown so children are
    /// reaped before exit.
    pub async fn abort_all(&self) {
        let state = self.state.read().await;
        for run in &state.active {
            run.abort();
        }
    }

    pub async fn set_param(&self, job: &str, number: i64, key: String, value: String) -> bool {
        let state = self.state.read().await;
        match state.active_run(job, number) {
            Some(run) => {
                run.set_param(key, value);
                true
            }
            None => false,
        }
    }

    /// Live log buffer for an active run (`complete = false`), or the
    /// persisted output blob for a finished one (`complete = true`).
    pub async fn handle_log_request(&self, job: &str, number: i64) -> Result<Option<(String, bool)>> {
        {
            let state = self.state.read().await;
            if let Some(run) = state.active_run(job, number) {
                let text = String::from_utf8_lossy(&run.log_snapshot()).into_owned();
                return Ok(Some((text, false)));
            }
        }
        match self.db.fetch_output(job, number).await? {
            Some(blob) => {
                let text = String::from_utf8_lossy(&gunzip(blob)).into_owned();
                Ok(Some((text, true)))
            }
            None => Ok(None),
        }
    }

    /// Open an archived artifact. `path` is relative to the archive root;
    /// anything trying to escape it is treated as missing.
    pub async fn get_artifact(&self, path: &str) -> Option<tokio::fs::File> {
        let rel = Path::new(path);
        if rel
            .components()
            .any(|c| !matches!(c, std::path::Component::Normal(_)))
        {
            return None;
        }
        let full = self.settings.home.join("archive").join(rel);
        tokio::fs::File::open(&full).await.ok()
    }
}

async fn pump(mut reader: impl AsyncReadExt + Unpin, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Collect every file under the run's archive directory, with paths
/// relative to it. One walk feeds both the completion event and the
/// artifacts bulk insert.
pub(crate) async fn collect_artifacts(dir: &Path) -> Vec<ArtifactRow> {
    let mut out = Vec::new();
    let mut stack = vec![PathBuf::new()];
    while let Some(rel) = stack.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(dir.join(&rel)).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            let rel_path = rel.join(entry.file_name());
            if meta.is_dir() {
                stack.push(rel_path);
            } else if meta.is_file() {
                out.push(ArtifactRow {
                    filename: rel_path.to_string_lossy().into_owned(),
                    filesize: meta.len() as i64,
                });
            }
        }
    }
    out.sort_by(|a, b| a.filename.cmp(&b.filename));
    out
}

pub(crate) fn gzip_compress(data: &[u8]) -> Vec<u8> {
    let mut encoder =
        flate2::write::GzEncoder::new(Vec::with_capacity(data.len() / 2), flate2::Compression::default());
    if encoder.write_all(data).is_ok() {
        if let Ok(out) = encoder.finish() {
            return out;
        }
    }
    data.to_vec()
}

/// Inverse of [`gzip_compress`]. Rows written before compression was
/// introduced hold raw bytes, so sniff the gzip magic instead of assuming.
pub(crate) fn gunzip(data: Vec<u8>) -> Vec<u8> {
    if data.starts_with(&[0x1f, 0x8b]) {
        let mut out = Vec::new();
        if flate2::read::GzDecoder::new(data.as_slice())
            .read_to_end(&mut out)
            .is_ok()
        {
            return out;
        }
    }
    data
}
