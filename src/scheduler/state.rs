use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use crate::config::{ContextConf, JobConf};
use crate::scheduler::context::{glob_matches, Context};
use crate::scheduler::run::{ActiveRun, QueuedRun};

/// In-memory scheduler tables.
///
/// All of these are read and written only under the engine's single lock, so
/// every lifecycle transition observes a stable snapshot. A run is in exactly
/// one of `queued` and `active` until completion, then in neither.
#[derive(Debug, Default)]
pub struct SchedulerState {
    /// Ordered by name so dispatch tries contexts in a deterministic order.
    pub contexts: BTreeMap<String, Context>,
    /// Highest build number ever allocated per job.
    pub build_nums: HashMap<String, i64>,
    pub queued: VecDeque<QueuedRun>,
    pub active: Vec<Arc<ActiveRun>>,
    /// CONTEXTS patterns per job, from cfg/jobs/<name>.conf.
    pub job_contexts: HashMap<String, Vec<String>>,
    pub job_descriptions: HashMap<String, String>,
    /// Per-job timeout in seconds, 0 = none.
    pub job_timeouts: HashMap<String, u64>,
    /// Group label to job-name regex, for the status aggregator.
    pub job_groups: BTreeMap<String, String>,
}

impl SchedulerState {
    pub fn next_build_num(&mut self, job: &str) -> i64 {
        let n = self.build_nums.entry(job.to_string()).or_insert(0);
        *n += 1;
        *n
    }

    pub fn latest_build_num(&self, job: &str) -> i64 {
        self.build_nums.get(job).copied().unwrap_or(0)
    }

    /// Make sure the job has at least the default context pattern. Jobs with
    /// no .conf file at all get their entry created here, at queue time.
    pub fn ensure_job_contexts(&mut self, job: &str) {
        let entry = self.job_contexts.entry(job.to_string()).or_default();
        if entry.is_empty() {
            entry.push("default".to_string());
        }
    }

    /// Whether `ctx` can take `run` right now: a free executor, and either a
    /// context JOBS pattern matching the job name or a job CONTEXTS pattern
    /// matching the context name.
    pub fn can_queue(&self, ctx: &Context, run: &QueuedRun) -> bool {
        if ctx.defunct || !ctx.has_capacity() {
            return false;
        }

        if ctx.matches_job(&run.name) {
            return true;
        }

        match self.job_contexts.get(&run.name) {
            Some(patterns) => patterns.iter().any(|p| glob_matches(p, &ctx.name)),
            // No .conf and not yet queued through ensure_job_contexts.
            None => ctx.name == "default",
        }
    }

    /// First context able to take the run, in configuration order.
    pub fn eligible_context(&self, run: &QueuedRun) -> Option<String> {
        self.contexts
            .values()
            .find(|ctx| self.can_queue(ctx, run))
            .map(|ctx| ctx.name.clone())
    }

    pub fn active_run(&self, job: &str, number: i64) -> Option<&Arc<ActiveRun>> {
        self.active
            .iter()
            .find(|r| r.name == job && r.number == number)
    }

    pub fn remove_active(&mut self, job: &str, number: i64) -> Option<Arc<ActiveRun>> {
        let idx = self
            .active
            .iter()
            .position(|r| r.name == job && r.number == number)?;
        Some(self.active.remove(idx))
    }

    /// Highest build number whose run directory is safe to consider for
    /// removal. Counting back from the finishing run would risk deleting the
    /// directories of older, still-running builds of the same job, so count
    /// back from just below the oldest active sibling, or from the latest
    /// known build when no sibling is active.
    pub fn oldest_active(&self, job: &str) -> i64 {
        self.active
            .iter()
            .filter(|r| r.name == job)
            .map(|r| r.number)
            .min()
            .map(|n| n - 1)
            .unwrap_or_else(|| self.latest_build_num(job))
    }

    /// (total, busy) executor counts across all contexts.
    pub fn executor_totals(&self) -> (i64, i64) {
        self.contexts.values().fold((0, 0), |(total, busy), ctx| {
            (total + ctx.num_executors, busy + ctx.busy_executors)
        })
    }

    /// Reconcile the context table against freshly loaded configuration.
    ///
    /// Existing records are mutated in place so active runs keep a valid
    /// reference. Contexts whose files disappeared are removed, unless runs
    /// still occupy their executors, in which case they are marked defunct
    /// and reaped on run completion. The implicit default context is never
    /// dropped when doing so would leave the registry empty.
    pub fn reconcile_contexts(&mut self, loaded: Vec<ContextConf>) {
        let known: Vec<String> = loaded.iter().map(|c| c.name.clone()).collect();

        for conf in loaded {
            match self.contexts.get_mut(&conf.name) {
                Some(ctx) => ctx.update(conf.executors, conf.job_patterns),
                None => {
                    self.contexts.insert(
                        conf.name.clone(),
                        Context::new(conf.name, conf.executors, conf.job_patterns),
                    );
                }
            }
        }

        let mut defunct = Vec::new();
        self.contexts.retain(|name, ctx| {
            if known.contains(name) || (name == "default" && known.is_empty()) {
                return true;
            }
            if ctx.busy_executors > 0 {
                defunct.push(name.clone());
                return true;
            }
            false
        });
        for name in defunct {
            if let Some(ctx) = self.contexts.get_mut(&name) {
                ctx.defunct = true;
            }
        }

        if !self.contexts.values().any(|ctx| !ctx.defunct) {
            tracing::info!("Creating a default context with 6 executors");
            match self.contexts.get_mut("default") {
                Some(ctx) => ctx.defunct = false,
                None => {
                    self.contexts
                        .insert("default".to_string(), Context::default_context());
                }
            }
        }
    }

    /// Drop defunct contexts whose last occupied executor was just released.
    pub fn reap_defunct_contexts(&mut self) {
        self.contexts
            .retain(|_, ctx| !ctx.defunct || ctx.busy_executors > 0);
    }

    /// Replace the per-job tables from freshly loaded configuration.
    pub fn apply_job_confs(&mut self, jobs: Vec<JobConf>, groups: BTreeMap<String, String>) {
        self.job_contexts.clear();
        self.job_descriptions.clear();
        self.job_timeouts.clear();
        for job in jobs {
            let contexts = if job.contexts.is_empty() {
                vec!["default".to_string()]
            } else {
                job.contexts
            };
            self.job_contexts.insert(job.name.clone(), contexts);
            if let Some(desc) = job.description {
                self.job_descriptions.insert(job.name.clone(), desc);
            }
            if job.timeout > 0 {
                self.job_timeouts.insert(job.name, job.timeout);
            }
        }

        self.job_groups = if groups.is_empty() {
            BTreeMap::from([("All Jobs".to_string(), ".*".to_string())])
        } else {
            groups
        };
    }
}
