//! Polling directory watcher
//!
//! Watch directories are scanned on an interval; files whose modification
//! time changed since the last scan produce one event each. Files that
//! already exist when the watcher starts are treated as seen.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::WatchConfig;
use crate::util::is_hidden;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileEventKind {
    Created,
    Modified,
}

impl std::fmt::Display for FileEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileEventKind::Created => write!(f, "created"),
            FileEventKind::Modified => write!(f, "modified"),
        }
    }
}

/// A change to a watched file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub path: PathBuf,
    pub kind: FileEventKind,
}

pub struct DirectoryWatcher {
    dirs: Vec<PathBuf>,
    recursive: bool,
    extensions: Vec<String>,
    interval: Duration,
    /// Subtrees never reported (the memory root, when it sits inside a watch dir)
    excluded: Vec<PathBuf>,
    seen: HashMap<PathBuf, SystemTime>,
}

impl DirectoryWatcher {
    pub fn new(
        dirs: Vec<PathBuf>,
        recursive: bool,
        extensions: Vec<String>,
        interval: Duration,
    ) -> Self {
        Self {
            dirs,
            recursive,
            extensions: extensions
                .into_iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
            interval,
            excluded: Vec::new(),
            seen: HashMap::new(),
        }
    }

    pub fn from_config(config: &WatchConfig) -> Self {
        Self::new(
            config.dirs.clone(),
            config.recursive,
            config.extensions.clone(),
            Duration::from_millis(config.poll_interval_ms.max(10)),
        )
    }

    /// Builder: never report files under `dir`
    pub fn exclude(mut self, dir: impl Into<PathBuf>) -> Self {
        self.excluded.push(dir.into());
        self
    }

    /// Whether `path` has a watched extension
    pub fn matches(&self, path: &Path) -> bool {
        if is_hidden(path) || self.excluded.iter().any(|d| path.starts_with(d)) {
            return false;
        }
        path.extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .map_or(false, |ext| self.extensions.iter().any(|e| *e == ext))
    }

    /// Record the current state without emitting events
    pub fn prime(&mut self) {
        self.seen = self.snapshot();
        debug!(files = self.seen.len(), "watcher primed");
    }

    /// Scan once and return the changes since the previous scan
    pub fn poll(&mut self) -> Vec<FileEvent> {
        let current = self.snapshot();
        let mut events: Vec<FileEvent> = current
            .iter()
            .filter_map(|(path, mtime)| {
                let kind = match self.seen.get(path) {
                    None => FileEventKind::Created,
                    Some(prev) if prev != mtime => FileEventKind::Modified,
                    Some(_) => return None,
                };
                Some(FileEvent {
                    path: path.clone(),
                    kind,
                })
            })
            .collect();

        // oldest change first so ingestion follows write order
        events.sort_by_key(|e| (current.get(&e.path).copied(), e.path.clone()));
        self.seen = current;
        events
    }

    fn snapshot(&self) -> HashMap<PathBuf, SystemTime> {
        let mut files = HashMap::new();
        for dir in &self.dirs {
            self.scan_dir(dir, &mut files);
        }
        files
    }

    fn scan_dir(&self, dir: &Path, files: &mut HashMap<PathBuf, SystemTime>) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "cannot scan directory");
                return;
            }
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if meta.is_dir() {
                let skip = is_hidden(&path) || self.excluded.iter().any(|d| path.starts_with(d));
                if self.recursive && !skip {
                    self.scan_dir(&path, files);
                }
            } else if meta.is_file() && self.matches(&path) {
                if let Ok(mtime) = meta.modified() {
                    files.insert(path, mtime);
                }
            }
        }
    }

    /// Run the watcher until shutdown, sending events to `tx`
    ///
    /// The sender is dropped when the task ends, which closes the channel.
    pub fn spawn(
        mut self,
        tx: mpsc::Sender<FileEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            for dir in &self.dirs {
                if dir.is_dir() {
                    info!(dir = %dir.display(), recursive = self.recursive, "watching");
                } else {
                    warn!(dir = %dir.display(), "watch directory does not exist");
                }
            }
            self.prime();

            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.interval) => {
                        for event in self.poll() {
                            debug!(path = %event.path.display(), kind = %event.kind, "file event");
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("watcher stopped");
                            return;
                        }
                    }
                }
            }
        })
    }
}
