//! Filesystem watcher: turns `notify` events on the configured
//! directories into a stream of upsert/remove events for recognized
//! certificate file extensions.

use std::path::{Path, PathBuf};

use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub enum WatchEvent {
    Upserted(PathBuf),
    Removed(PathBuf),
}

/// Owns the live `notify` watchers; dropping it stops watching.
pub struct Watcher {
    _watchers: Vec<RecommendedWatcher>,
}

impl Watcher {
    /// Starts watching `watch_paths` non-recursively, filtering to
    /// files whose extension (without the leading dot) is in
    /// `extensions`. Unlike the channel-fed watcher it's grounded on,
    /// this one also turns `EventKind::Remove` into `WatchEvent::Removed`
    /// so a deleted certificate cancels its pending work instead of
    /// being silently forgotten.
    pub fn spawn(watch_paths: &[PathBuf], extensions: &[String]) -> notify::Result<(Self, mpsc::Receiver<WatchEvent>)> {
        let (tx, rx) = mpsc::channel(1024);
        let extensions: Vec<String> = extensions.iter().map(|e| e.trim_start_matches('.').to_lowercase()).collect();

        let mut watchers = Vec::with_capacity(watch_paths.len());
        for dir in watch_paths {
            let tx = tx.clone();
            let extensions = extensions.clone();
            let mut watcher = RecommendedWatcher::new(
                move |res: notify::Result<Event>| {
                    let Ok(event) = res else { return };
                    let mapped = match event.kind {
                        EventKind::Create(_) | EventKind::Modify(_) => WatchEvent::Upserted as fn(PathBuf) -> WatchEvent,
                        EventKind::Remove(_) => WatchEvent::Removed as fn(PathBuf) -> WatchEvent,
                        _ => return,
                    };
                    for path in event.paths {
                        if !has_recognized_extension(&path, &extensions) {
                            continue;
                        }
                        let _ = tx.blocking_send(mapped(path));
                    }
                },
                NotifyConfig::default(),
            )?;
            watcher.watch(dir, RecursiveMode::NonRecursive)?;
            info!(dir = %dir.display(), "watching directory for certificate changes");
            watchers.push(watcher);
        }

        Ok((Self { _watchers: watchers }, rx))
    }

    /// A non-watching initial pass over `watch_paths`, so files already
    /// present at startup are picked up without waiting on a write.
    pub fn initial_scan(watch_paths: &[PathBuf], extensions: &[String]) -> Vec<PathBuf> {
        let extensions: Vec<String> = extensions.iter().map(|e| e.trim_start_matches('.').to_lowercase()).collect();
        let mut found = Vec::new();
        for dir in watch_paths {
            let entries = match std::fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "failed to scan watch directory");
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_file() && has_recognized_extension(&path, &extensions) {
                    found.push(path);
                }
            }
        }
        found
    }
}

fn has_recognized_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| extensions.iter().any(|want| want.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}
