use globset::{Glob, GlobSet, GlobSetBuilder};

pub const DEFAULT_EXECUTORS: i64 = 6;

/// A named pool of executor slots with glob filters restricting which jobs
/// it accepts.
///
/// Contexts are mutated in place on configuration reload so that active runs
/// referencing them by name keep observing a live record. A context whose
/// configuration file disappeared while runs still occupy its executors is
/// marked defunct; it stops matching new runs and is dropped once
/// `busy_executors` returns to zero.
#[derive(Debug)]
pub struct Context {
    pub name: String,
    pub num_executors: i64,
    pub busy_executors: i64,
    pub job_patterns: Vec<String>,
    pub defunct: bool,
    matcher: GlobSet,
}

impl Context {
    pub fn new(name: String, num_executors: i64, job_patterns: Vec<String>) -> Self {
        let matcher = compile_patterns(&job_patterns);
        Self {
            name,
            num_executors,
            busy_executors: 0,
            job_patterns,
            defunct: false,
            matcher,
        }
    }

    /// The implicit context used when no context configuration exists.
    pub fn default_context() -> Self {
        Self::new("default".to_string(), DEFAULT_EXECUTORS, Vec::new())
    }

    /// Apply a reloaded configuration, preserving the busy count.
    pub fn update(&mut self, num_executors: i64, job_patterns: Vec<String>) {
        self.num_executors = num_executors;
        self.matcher = compile_patterns(&job_patterns);
        self.job_patterns = job_patterns;
        self.defunct = false;
    }

    pub fn has_capacity(&self) -> bool {
        self.busy_executors < self.num_executors
    }

    /// Whether any of this context's JOBS patterns matches the job name.
    pub fn matches_job(&self, job: &str) -> bool {
        self.matcher.is_match(job)
    }
}

fn compile_patterns(patterns: &[String]) -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for p in patterns {
        match Glob::new(p) {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(e) => {
                tracing::warn!(pattern = %p, error = %e, "Ignoring unparseable job pattern");
            }
        }
    }
    builder.build().unwrap_or_else(|_| GlobSet::empty())
}

/// One-shot glob match, used for a job's CONTEXTS patterns against a
/// context name.
pub fn glob_matches(pattern: &str, text: &str) -> bool {
    Glob::new(pattern)
        .map(|g| g.compile_matcher().is_match(text))
        .unwrap_or(false)
}
