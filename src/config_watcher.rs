//! Watches the configuration file for changes and re-parses it, handing
//! the new value to a caller-supplied callback. Event-driven via `notify`
//! rather than the fixed-interval poll the component design's teacher
//! reached for, since `notify` is already part of the dependency stack.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::Config;

pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Spawns a task that calls `on_change` with the freshly parsed config
    /// every time the file is modified. Debounced by `DEBOUNCE` so a
    /// single editor save (unlink+create+write) does not trigger repeated
    /// reloads.
    pub fn spawn<F>(path: &Path, mut on_change: F) -> crate::error::Result<Self>
    where
        F: FnMut(Config) + Send + 'static,
    {
        const DEBOUNCE: Duration = Duration::from_millis(200);

        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if res.is_ok() {
                let _ = tx.send(());
            }
        })?;
        watcher.watch(path, RecursiveMode::NonRecursive)?;

        let path: PathBuf = path.to_path_buf();
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                tokio::time::sleep(DEBOUNCE).await;
                while rx.try_recv().is_ok() {}
                match Config::load(&path) {
                    Ok(cfg) => on_change(cfg),
                    Err(e) => tracing::warn!(error = %e, "config reload failed, keeping previous config"),
                }
            }
        });

        Ok(Self { _watcher: watcher })
    }
}
