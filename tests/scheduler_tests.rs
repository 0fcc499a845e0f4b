use std::collections::HashMap;
use std::sync::Arc;

use slipstream::config::ContextConf;
use slipstream::scheduler::{ActiveRun, Context, QueuedRun, RunState, SchedulerState};

fn queued_run(name: &str, number: i64) -> QueuedRun {
    QueuedRun::new(name.to_string(), number, 1_700_000_000, HashMap::new(), 0)
}

fn context_conf(name: &str, executors: i64, patterns: &[&str]) -> ContextConf {
    ContextConf {
        name: name.to_string(),
        executors,
        job_patterns: patterns.iter().map(|p| p.to_string()).collect(),
    }
}

#[test]
fn test_build_numbers_are_strictly_increasing_per_job() {
    let mut state = SchedulerState::default();
    assert_eq!(state.next_build_num("alpha"), 1);
    assert_eq!(state.next_build_num("alpha"), 2);
    assert_eq!(state.next_build_num("beta"), 1);
    assert_eq!(state.next_build_num("alpha"), 3);
    assert_eq!(state.latest_build_num("alpha"), 3);
    assert_eq!(state.latest_build_num("unknown"), 0);
}

#[test]
fn test_jobs_without_conf_default_to_the_default_context() {
    let mut state = SchedulerState::default();
    state.reconcile_contexts(Vec::new());
    state.ensure_job_contexts("alpha");
    assert_eq!(
        state.job_contexts.get("alpha"),
        Some(&vec!["default".to_string()])
    );

    let run = queued_run("alpha", 1);
    assert_eq!(state.eligible_context(&run).as_deref(), Some("default"));
}

#[test]
fn test_default_context_has_six_executors() {
    let mut state = SchedulerState::default();
    state.reconcile_contexts(Vec::new());
    let ctx = state.contexts.get("default").unwrap();
    assert_eq!(ctx.num_executors, 6);
    assert_eq!(ctx.busy_executors, 0);
}

#[test]
fn test_capacity_blocks_dispatch() {
    let mut state = SchedulerState::default();
    state.reconcile_contexts(vec![context_conf("default", 1, &[])]);
    state.ensure_job_contexts("alpha");

    state.contexts.get_mut("default").unwrap().busy_executors = 1;
    assert_eq!(state.eligible_context(&queued_run("alpha", 1)), None);

    state.contexts.get_mut("default").unwrap().busy_executors = 0;
    assert!(state.eligible_context(&queued_run("alpha", 1)).is_some());
}

#[test]
fn test_context_job_patterns_match_job_name() {
    let mut state = SchedulerState::default();
    state.reconcile_contexts(vec![context_conf("deployers", 2, &["deploy-*"])]);
    // the job's own CONTEXTS say "default", but the context claims it by name
    state.ensure_job_contexts("deploy-web");

    let run = queued_run("deploy-web", 1);
    assert_eq!(state.eligible_context(&run).as_deref(), Some("deployers"));
}

#[test]
fn test_job_context_patterns_match_context_name() {
    let mut state = SchedulerState::default();
    state.reconcile_contexts(vec![context_conf("fast", 2, &[])]);
    state
        .job_contexts
        .insert("alpha".to_string(), vec!["fa*".to_string()]);

    assert_eq!(
        state.eligible_context(&queued_run("alpha", 1)).as_deref(),
        Some("fast")
    );

    state
        .job_contexts
        .insert("alpha".to_string(), vec!["gpu".to_string()]);
    assert_eq!(state.eligible_context(&queued_run("alpha", 1)), None);
}

#[test]
fn test_contexts_are_tried_in_name_order() {
    let mut state = SchedulerState::default();
    state.reconcile_contexts(vec![
        context_conf("b-pool", 1, &["alpha"]),
        context_conf("a-pool", 1, &["alpha"]),
    ]);
    assert_eq!(
        state.eligible_context(&queued_run("alpha", 1)).as_deref(),
        Some("a-pool")
    );
}

#[test]
fn test_blocked_head_does_not_block_later_matches() {
    let mut state = SchedulerState::default();
    state.reconcile_contexts(vec![
        context_conf("ctx1", 1, &["alpha"]),
        context_conf("ctx2", 1, &["beta"]),
    ]);
    // ctx1 is fully occupied by an unrelated pre-existing run
    state.contexts.get_mut("ctx1").unwrap().busy_executors = 1;

    state.queued.push_back(queued_run("alpha", 1));
    state.queued.push_back(queued_run("beta", 1));

    assert_eq!(state.eligible_context(&state.queued[0]), None);
    assert_eq!(
        state.eligible_context(&state.queued[1]).as_deref(),
        Some("ctx2")
    );
}

#[test]
fn test_reconcile_updates_contexts_in_place() {
    let mut state = SchedulerState::default();
    state.reconcile_contexts(vec![context_conf("ci", 4, &["alpha"])]);
    state.contexts.get_mut("ci").unwrap().busy_executors = 2;

    // identical reload must preserve the accounting of live runs
    state.reconcile_contexts(vec![context_conf("ci", 4, &["alpha"])]);
    let ctx = state.contexts.get("ci").unwrap();
    assert_eq!(ctx.busy_executors, 2);
    assert_eq!(ctx.num_executors, 4);

    // a capacity change lands without resetting the busy count
    state.reconcile_contexts(vec![context_conf("ci", 8, &["alpha", "beta"])]);
    let ctx = state.contexts.get("ci").unwrap();
    assert_eq!(ctx.busy_executors, 2);
    assert_eq!(ctx.num_executors, 8);
}

#[test]
fn test_removed_context_with_busy_executors_is_deferred() {
    let mut state = SchedulerState::default();
    state.reconcile_contexts(vec![context_conf("ci", 2, &[]), context_conf("gpu", 1, &[])]);
    state.contexts.get_mut("gpu").unwrap().busy_executors = 1;

    state.reconcile_contexts(vec![context_conf("ci", 2, &[])]);

    // still present while occupied, but matches nothing new
    let gpu = state.contexts.get("gpu").unwrap();
    assert!(gpu.defunct);
    state
        .job_contexts
        .insert("alpha".to_string(), vec!["gpu".to_string()]);
    assert_eq!(state.eligible_context(&queued_run("alpha", 1)), None);

    state.contexts.get_mut("gpu").unwrap().busy_executors = 0;
    state.reap_defunct_contexts();
    assert!(!state.contexts.contains_key("gpu"));
}

#[test]
fn test_removed_idle_context_disappears_immediately() {
    let mut state = SchedulerState::default();
    state.reconcile_contexts(vec![context_conf("ci", 2, &[]), context_conf("gpu", 1, &[])]);
    state.reconcile_contexts(vec![context_conf("ci", 2, &[])]);
    assert!(!state.contexts.contains_key("gpu"));
}

#[test]
fn test_default_context_survives_empty_configuration() {
    let mut state = SchedulerState::default();
    state.reconcile_contexts(Vec::new());
    assert!(state.contexts.contains_key("default"));
    // a second empty reload must not remove and re-add it
    state.contexts.get_mut("default").unwrap().busy_executors = 3;
    state.reconcile_contexts(Vec::new());
    assert_eq!(state.contexts.get("default").unwrap().busy_executors, 3);
}

#[test]
fn test_default_context_yields_to_configured_contexts() {
    let mut state = SchedulerState::default();
    state.reconcile_contexts(Vec::new());
    assert!(state.contexts.contains_key("default"));
    state.reconcile_contexts(vec![context_conf("ci", 2, &[])]);
    assert!(!state.contexts.contains_key("default"));
    assert!(state.contexts.contains_key("ci"));
}

#[test]
fn test_reload_with_identical_files_is_a_noop() {
    let mut state = SchedulerState::default();
    let confs = vec![context_conf("ci", 4, &["alpha-*"])];
    state.reconcile_contexts(confs.clone());
    let before: Vec<(String, i64, i64)> = state
        .contexts
        .values()
        .map(|c| (c.name.clone(), c.num_executors, c.busy_executors))
        .collect();
    state.reconcile_contexts(confs);
    let after: Vec<(String, i64, i64)> = state
        .contexts
        .values()
        .map(|c| (c.name.clone(), c.num_executors, c.busy_executors))
        .collect();
    assert_eq!(before, after);
}

#[test]
fn test_executor_totals() {
    let mut state = SchedulerState::default();
    state.reconcile_contexts(vec![context_conf("a", 2, &[]), context_conf("b", 4, &[])]);
    state.contexts.get_mut("b").unwrap().busy_executors = 3;
    assert_eq!(state.executor_totals(), (6, 3));
}

#[test]
fn test_oldest_active_counts_from_latest_build_without_siblings() {
    let mut state = SchedulerState::default();
    for _ in 0..5 {
        state.next_build_num("alpha");
    }
    assert_eq!(state.oldest_active("alpha"), 5);
}

#[test]
fn test_oldest_active_counts_from_oldest_running_sibling() {
    let mut state = SchedulerState::default();
    for _ in 0..5 {
        state.next_build_num("alpha");
    }
    state.active.push(Arc::new(ActiveRun::start(
        queued_run("alpha", 3),
        "default".to_string(),
        1_700_000_100,
        Some(4321),
    )));
    assert_eq!(state.oldest_active("alpha"), 2);
}

#[test]
fn test_active_run_lookup_and_removal() {
    let mut state = SchedulerState::default();
    state.active.push(Arc::new(ActiveRun::start(
        queued_run("alpha", 1),
        "default".to_string(),
        1_700_000_100,
        None,
    )));

    assert!(state.active_run("alpha", 1).is_some());
    assert!(state.active_run("alpha", 2).is_none());
    assert!(state.active_run("beta", 1).is_none());

    let removed = state.remove_active("alpha", 1).unwrap();
    assert_eq!(removed.number, 1);
    assert!(state.active.is_empty());
    assert!(state.remove_active("alpha", 1).is_none());
}

#[test]
fn test_meta_params_become_run_metadata() {
    let params = HashMap::from([
        ("=reason".to_string(), "webhook push".to_string()),
        ("=parentJob".to_string(), "pipeline".to_string()),
        ("=parentBuild".to_string(), "17".to_string()),
        ("TARGET".to_string(), "prod".to_string()),
    ]);
    let run = QueuedRun::new("alpha".to_string(), 1, 1_700_000_000, params, 0);
    assert_eq!(run.reason, "webhook push");
    assert_eq!(run.parent_name.as_deref(), Some("pipeline"));
    assert_eq!(run.parent_number, Some(17));
    assert_eq!(run.params.len(), 1);
    assert_eq!(run.params.get("TARGET").map(String::as_str), Some("prod"));
}

#[test]
fn test_run_state_codes_round_trip() {
    for state in [
        RunState::Unknown,
        RunState::Queued,
        RunState::Running,
        RunState::Aborted,
        RunState::Failed,
        RunState::Success,
    ] {
        assert_eq!(RunState::from_code(state.code()), state);
    }
    assert_eq!(RunState::from_code(42), RunState::Unknown);
    assert_eq!(RunState::Success.to_string(), "success");
    assert_eq!(RunState::Aborted.to_string(), "aborted");
}

#[test]
fn test_active_run_log_buffer_and_params() {
    let run = ActiveRun::start(
        queued_run("alpha", 1),
        "default".to_string(),
        1_700_000_100,
        Some(99),
    );
    run.append_log(b"line one\n");
    run.append_log(b"line two\n");
    assert_eq!(run.log_snapshot(), b"line one\nline two\n");

    run.set_param("RETRIES".to_string(), "3".to_string());
    assert_eq!(
        run.params_snapshot().get("RETRIES").map(String::as_str),
        Some("3")
    );

    assert!(!run.abort_requested());
    run.abort();
    assert!(run.abort_requested());
}
