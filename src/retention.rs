use std::path::Path;

/// Retention window for per-run working directories, re-read from the
/// environment on every completion so changes apply without a restart.
pub fn keep_run_dirs() -> i64 {
    std::env::var("LAMINAR_KEEP_RUNDIRS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Remove run directories older than the retention window.
///
/// Counts down from `oldest_active - keep` and stops at the first directory
/// that no longer exists; in steady state the sweep removes exactly one
/// directory per completion. Failures to remove a directory are logged and
/// the sweep continues with the next older build.
pub async fn prune_run_dirs(home: &Path, job: &str, oldest_active: i64, keep: i64) {
    let mut number = oldest_active - keep;
    while number > 0 {
        let dir = home.join("run").join(job).join(number.to_string());
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
            Err(e) => {
                tracing::warn!(path = %dir.display(), error = %e, "Could not remove run directory");
            }
        }
        number -= 1;
    }
}

/// Point archive/<job>/latest at the given build.
pub async fn refresh_latest_symlink(home: &Path, job: &str, number: i64) {
    let link = home.join("archive").join(job).join("latest");
    let _ = tokio::fs::remove_file(&link).await;
    if let Err(e) = tokio::fs::symlink(number.to_string(), &link).await {
        tracing::warn!(path = %link.display(), error = %e, "Could not update latest symlink");
    }
}
