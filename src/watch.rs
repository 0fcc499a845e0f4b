use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};

use crate::engine::Engine;

/// Watch the configuration tree and re-enter the loader on changes. The
/// returned watcher must be kept alive for the lifetime of the daemon.
pub fn watch_configuration(engine: Arc<Engine>) -> notify::Result<RecommendedWatcher> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if let Ok(event) = res {
            let _ = tx.send(event);
        }
    })?;
    watcher.watch(&engine.settings().home.join("cfg"), RecursiveMode::Recursive)?;

    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            // Editors fire bursts of events for a single save; let the burst
            // settle and drain the backlog so the tree is loaded once.
            tokio::time::sleep(Duration::from_millis(250)).await;
            while rx.try_recv().is_ok() {}
            tracing::info!("Reloading configuration");
            engine.load_configuration().await;
        }
    });

    Ok(watcher)
}
