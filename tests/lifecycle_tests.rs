//! End-to-end lifecycle tests against a real PostgreSQL instance.
//!
//! These are ignored by default; point DATABASE_URL at a scratch database
//! and run `cargo test -- --ignored` to exercise them. Each test uses its
//! own job name so the shared builds table does not cause interference.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use slipstream::engine::Engine;
use slipstream::events::JobEvent;
use slipstream::settings::Settings;
use tokio::sync::broadcast::Receiver;

fn test_settings(home: &Path) -> Settings {
    Settings::new(
        home.to_path_buf(),
        "/archive/".to_string(),
        "127.0.0.1:0".parse().unwrap(),
        "127.0.0.1:0".parse().unwrap(),
        std::env::var("DATABASE_URL").expect("DATABASE_URL must point at a scratch database"),
    )
}

fn write_script(home: &Path, job: &str, body: &str) {
    let dir = home.join("cfg").join("jobs");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{job}.run"));
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// Wait for the next lifecycle event of the given kind for (job, number).
async fn wait_for(
    rx: &mut Receiver<JobEvent>,
    job: &str,
    number: i64,
    kind: &str,
) -> serde_json::Value {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event bus closed");
        if event.job == job
            && event.payload["type"] == kind
            && event.payload["data"]["number"] == number
        {
            return event.payload;
        }
    }
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL (set DATABASE_URL)"]
async fn test_basic_run_lifecycle() {
    let home = tempfile::tempdir().unwrap();
    write_script(home.path(), "e2e-basic", "echo building; echo done > $ARCHIVE/result.txt");

    let engine = Engine::new(test_settings(home.path())).await.unwrap();
    let mut events = engine.events().subscribe_events();

    let number = engine
        .queue_job("e2e-basic", HashMap::new(), false)
        .await
        .unwrap();

    let queued = wait_for(&mut events, "e2e-basic", number, "job_queued").await;
    assert_eq!(queued["data"]["queueIndex"], 0);

    wait_for(&mut events, "e2e-basic", number, "job_started").await;
    let completed = wait_for(&mut events, "e2e-basic", number, "job_completed").await;
    assert_eq!(completed["data"]["result"], "success");

    let artifacts = completed["data"]["artifacts"].as_array().unwrap();
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0]["filename"], "result.txt");

    let (log, complete) = engine
        .handle_log_request("e2e-basic", number)
        .await
        .unwrap()
        .unwrap();
    assert!(complete);
    assert!(log.contains("building"));

    let latest = home.path().join("archive").join("e2e-basic").join("latest");
    assert_eq!(
        std::fs::read_link(latest).unwrap().to_str().unwrap(),
        number.to_string()
    );
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL (set DATABASE_URL)"]
async fn test_capacity_saturation_serialises_runs() {
    let home = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(home.path().join("cfg").join("contexts")).unwrap();
    std::fs::write(
        home.path().join("cfg").join("contexts").join("default.conf"),
        "EXECUTORS=1\n",
    )
    .unwrap();
    write_script(home.path(), "e2e-serial", "sleep 1");

    let engine = Engine::new(test_settings(home.path())).await.unwrap();
    let mut events = engine.events().subscribe_events();

    let first = engine
        .queue_job("e2e-serial", HashMap::new(), false)
        .await
        .unwrap();
    let second = engine
        .queue_job("e2e-serial", HashMap::new(), false)
        .await
        .unwrap();

    // with a single executor the second run must not start before the
    // first one completes
    wait_for(&mut events, "e2e-serial", first, "job_started").await;
    let mut started_second_early = false;
    loop {
        let event = tokio::time::timeout(Duration::from_secs(30), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event bus closed");
        if event.payload["type"] == "job_started" && event.payload["data"]["number"] == second {
            started_second_early = true;
        }
        if event.payload["type"] == "job_completed" && event.payload["data"]["number"] == first {
            break;
        }
    }
    assert!(!started_second_early);

    wait_for(&mut events, "e2e-serial", second, "job_completed").await;
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL (set DATABASE_URL)"]
async fn test_abort_produces_aborted_result() {
    let home = tempfile::tempdir().unwrap();
    write_script(home.path(), "e2e-abort", "sleep 60");

    let engine = Engine::new(test_settings(home.path())).await.unwrap();
    let mut events = engine.events().subscribe_events();

    let number = engine
        .queue_job("e2e-abort", HashMap::new(), false)
        .await
        .unwrap();
    wait_for(&mut events, "e2e-abort", number, "job_started").await;

    assert!(engine.abort("e2e-abort", number).await);
    let completed = wait_for(&mut events, "e2e-abort", number, "job_completed").await;
    assert_eq!(completed["data"]["result"], "aborted");

    assert!(!engine.abort("e2e-abort", number).await);
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL (set DATABASE_URL)"]
async fn test_timeout_aborts_the_run() {
    let home = tempfile::tempdir().unwrap();
    write_script(home.path(), "e2e-timeout", "sleep 60");
    std::fs::write(
        home.path().join("cfg").join("jobs").join("e2e-timeout.conf"),
        "TIMEOUT=1\n",
    )
    .unwrap();

    let engine = Engine::new(test_settings(home.path())).await.unwrap();
    let mut events = engine.events().subscribe_events();

    let number = engine
        .queue_job("e2e-timeout", HashMap::new(), false)
        .await
        .unwrap();
    wait_for(&mut events, "e2e-timeout", number, "job_started").await;
    let completed = wait_for(&mut events, "e2e-timeout", number, "job_completed").await;
    assert_eq!(completed["data"]["result"], "aborted");
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL (set DATABASE_URL)"]
async fn test_queueing_a_nonexistent_job_fails_without_side_effects() {
    let home = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(home.path().join("cfg").join("jobs")).unwrap();

    let engine = Engine::new(test_settings(home.path())).await.unwrap();
    let mut events = engine.events().subscribe_events();

    let result = engine.queue_job("no-such-job", HashMap::new(), false).await;
    assert!(result.is_err());
    assert!(matches!(
        tokio::time::timeout(Duration::from_millis(200), events.recv()).await,
        Err(_)
    ));
}

/// Legacy cfg/nodes directories must abort startup with a diagnostic.
#[tokio::test]
#[ignore = "requires a running PostgreSQL (set DATABASE_URL)"]
async fn test_legacy_node_configuration_is_fatal() {
    let home = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(home.path().join("cfg").join("nodes")).unwrap();

    let err = Engine::new(test_settings(home.path())).await.err().unwrap();
    assert!(err.to_string().contains("cfg/nodes"));
}
