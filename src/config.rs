use std::collections::BTreeMap;
use std::path::Path;

use crate::conf::ConfFile;
use crate::scheduler::context::DEFAULT_EXECUTORS;

/// Parsed cfg/contexts/<name>.conf.
#[derive(Debug, Clone)]
pub struct ContextConf {
    pub name: String,
    pub executors: i64,
    pub job_patterns: Vec<String>,
}

/// Parsed cfg/jobs/<name>.conf.
#[derive(Debug, Clone)]
pub struct JobConf {
    pub name: String,
    pub contexts: Vec<String>,
    pub description: Option<String>,
    pub timeout: u64,
}

fn conf_stems(dir: &Path) -> Vec<(String, std::path::PathBuf)> {
    let mut entries = Vec::new();
    let Ok(read) = std::fs::read_dir(dir) else {
        return entries;
    };
    for entry in read.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("conf") {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            entries.push((stem.to_string(), path));
        }
    }
    entries.sort();
    entries
}

pub fn load_contexts(home: &Path) -> Vec<ContextConf> {
    let mut contexts = Vec::new();
    for (name, path) in conf_stems(&home.join("cfg").join("contexts")) {
        let conf = match ConfFile::load(&path) {
            Ok(conf) => conf,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable context configuration");
                continue;
            }
        };
        contexts.push(ContextConf {
            name,
            executors: conf.get_or("EXECUTORS", DEFAULT_EXECUTORS),
            job_patterns: conf.get_list("JOBS"),
        });
    }
    contexts
}

pub fn load_jobs(home: &Path) -> Vec<JobConf> {
    let mut jobs = Vec::new();
    for (name, path) in conf_stems(&home.join("cfg").join("jobs")) {
        let conf = match ConfFile::load(&path) {
            Ok(conf) => conf,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable job configuration");
                continue;
            }
        };
        jobs.push(JobConf {
            name,
            contexts: conf.get_list("CONTEXTS"),
            description: conf.get_str("DESCRIPTION").map(str::to_string),
            timeout: conf.get_or("TIMEOUT", 0u64),
        });
    }
    jobs
}

/// cfg/groups.conf maps a group label to a job-name regex. Labels with an
/// unparseable regex are dropped so the dashboard never receives a pattern
/// it cannot evaluate.
pub fn load_groups(home: &Path) -> BTreeMap<String, String> {
    let mut groups = BTreeMap::new();
    let path = home.join("cfg").join("groups.conf");
    let conf = match ConfFile::load(&path) {
        Ok(conf) => conf,
        Err(_) => return groups,
    };
    for (label, pattern) in conf.iter() {
        if let Err(e) = regex::Regex::new(pattern) {
            tracing::warn!(group = %label, pattern = %pattern, error = %e, "Ignoring group with invalid regex");
            continue;
        }
        groups.insert(label.clone(), pattern.clone());
    }
    groups
}

/// Jobs that can be queued: every cfg/jobs/<name>.run on disk.
pub fn known_jobs(home: &Path) -> Vec<String> {
    let mut names = Vec::new();
    let Ok(read) = std::fs::read_dir(home.join("cfg").join("jobs")) else {
        return names;
    };
    for entry in read.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("run") {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
    }
    names.sort();
    names
}
