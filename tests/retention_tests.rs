use std::fs;
use std::path::Path;

use slipstream::retention::{prune_run_dirs, refresh_latest_symlink};

fn make_run_dirs(home: &Path, job: &str, numbers: &[i64]) {
    for n in numbers {
        fs::create_dir_all(home.join("run").join(job).join(n.to_string())).unwrap();
    }
}

fn existing_run_dirs(home: &Path, job: &str) -> Vec<i64> {
    let mut dirs: Vec<i64> = fs::read_dir(home.join("run").join(job))
        .unwrap()
        .flatten()
        .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse().ok()))
        .collect();
    dirs.sort();
    dirs
}

#[tokio::test]
async fn test_prune_keeps_the_retention_window() {
    let home = tempfile::tempdir().unwrap();
    make_run_dirs(home.path(), "alpha", &[1, 2, 3, 4, 5]);

    prune_run_dirs(home.path(), "alpha", 5, 2).await;

    assert_eq!(existing_run_dirs(home.path(), "alpha"), vec![4, 5]);
}

#[tokio::test]
async fn test_prune_with_zero_window_removes_everything() {
    let home = tempfile::tempdir().unwrap();
    make_run_dirs(home.path(), "alpha", &[1, 2, 3]);

    prune_run_dirs(home.path(), "alpha", 3, 0).await;

    assert_eq!(existing_run_dirs(home.path(), "alpha"), Vec::<i64>::new());
}

#[tokio::test]
async fn test_prune_stops_at_the_first_missing_directory() {
    let home = tempfile::tempdir().unwrap();
    make_run_dirs(home.path(), "alpha", &[1, 2, 4, 5]);

    prune_run_dirs(home.path(), "alpha", 5, 0).await;

    // 5 and 4 go, the gap at 3 ends the sweep, 1 and 2 survive
    assert_eq!(existing_run_dirs(home.path(), "alpha"), vec![1, 2]);
}

#[tokio::test]
async fn test_prune_respects_an_active_older_sibling() {
    let home = tempfile::tempdir().unwrap();
    make_run_dirs(home.path(), "alpha", &[1, 2, 3, 4, 5]);

    // oldest active sibling is build 4, so the sweep base is 3
    prune_run_dirs(home.path(), "alpha", 3, 0).await;

    assert_eq!(existing_run_dirs(home.path(), "alpha"), vec![4, 5]);
}

#[tokio::test]
async fn test_prune_of_unknown_job_is_harmless() {
    let home = tempfile::tempdir().unwrap();
    prune_run_dirs(home.path(), "ghost", 10, 0).await;
}

#[tokio::test]
async fn test_latest_symlink_is_replaced() {
    let home = tempfile::tempdir().unwrap();
    fs::create_dir_all(home.path().join("archive").join("alpha")).unwrap();

    refresh_latest_symlink(home.path(), "alpha", 3).await;
    let link = home.path().join("archive").join("alpha").join("latest");
    assert_eq!(fs::read_link(&link).unwrap().to_str(), Some("3"));

    refresh_latest_symlink(home.path(), "alpha", 4).await;
    assert_eq!(fs::read_link(&link).unwrap().to_str(), Some("4"));
}
