//! Directory watcher for fixture hot reload.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

/// What happened to a watched file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadKind {
    Changed,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadEvent {
    pub path: PathBuf,
    pub kind: ReloadKind,
}

/// Keeps a watch alive; dropping it stops the watch.
pub struct WatchHandle {
    _watcher: RecommendedWatcher,
    dirs: Vec<PathBuf>,
}

impl WatchHandle {
    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle").field("dirs", &self.dirs).finish()
    }
}

/// Watches fixture directories for files with one extension.
pub struct DirectoryWatcher {
    dirs: Vec<PathBuf>,
    extension: &'static str,
    update_tx: mpsc::UnboundedSender<ReloadEvent>,
}

impl DirectoryWatcher {
    /// Create a new DirectoryWatcher.
    ///
    /// Returns the watcher and a receiver for reload events.
    pub fn new(
        dirs: &[PathBuf],
        extension: &'static str,
    ) -> (Self, mpsc::UnboundedReceiver<ReloadEvent>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();

        (
            Self {
                dirs: dirs.to_vec(),
                extension,
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching. Directories that do not exist are skipped.
    pub fn run(self) -> Result<WatchHandle, notify::Error> {
        let tx = self.update_tx.clone();
        let extension = self.extension;

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let kind = match event.kind {
                        EventKind::Create(_) | EventKind::Modify(_) => ReloadKind::Changed,
                        EventKind::Remove(_) => ReloadKind::Removed,
                        _ => return,
                    };
                    for path in event.paths {
                        if !has_extension(&path, extension) {
                            continue;
                        }
                        // A rename reports the old name as a modify; treat missing files as removed.
                        let kind = if kind == ReloadKind::Changed && !path.exists() {
                            ReloadKind::Removed
                        } else {
                            kind
                        };
                        let _ = tx.send(ReloadEvent { path, kind });
                    }
                }
                Err(e) => tracing::error!("Watch error: {:?}", e),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        let mut watched = Vec::new();
        for dir in &self.dirs {
            if !dir.is_dir() {
                tracing::warn!(dir = ?dir, "Fixture directory does not exist, not watching");
                continue;
            }
            watcher.watch(dir, RecursiveMode::Recursive)?;
            watched.push(dir.clone());
        }

        tracing::debug!(dirs = ?watched, extension, "Fixture watcher started");
        Ok(WatchHandle {
            _watcher: watcher,
            dirs: watched,
        })
    }
}

pub fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case(extension))
        .unwrap_or(false)
}

/// Files below `dirs` with the given extension, sorted per directory.
pub fn scan(dirs: &[PathBuf], extension: &str) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for dir in dirs {
        let mut found = Vec::new();
        collect(dir, extension, &mut found);
        found.sort();
        files.extend(found);
    }
    files
}

fn collect(dir: &Path, extension: &str, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect(&path, extension, out);
        } else if has_extension(&path, extension) {
            out.push(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_finds_nested_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("b.json"), "{}").unwrap();
        std::fs::write(dir.path().join("a.json"), "{}").unwrap();
        std::fs::write(dir.path().join("nested/c.JSON"), "{}").unwrap();
        std::fs::write(dir.path().join("ignored.har"), "{}").unwrap();

        let files = scan(&[dir.path().to_path_buf()], "json");
        let names: Vec<_> = files
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["a.json", "b.json", "nested/c.JSON"]);
    }

    #[tokio::test]
    async fn reports_changes() {
        let dir = tempfile::tempdir().unwrap();
        let (watcher, mut rx) = DirectoryWatcher::new(&[dir.path().to_path_buf()], "json");
        let handle = watcher.run().unwrap();
        assert_eq!(handle.dirs().len(), 1);

        let file = dir.path().join("new.json");
        std::fs::write(&file, "[]").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("no reload event")
            .unwrap();
        assert_eq!(event.kind, ReloadKind::Changed);
        assert_eq!(event.path.file_name(), file.file_name());
    }

    #[test]
    fn missing_directories_are_skipped() {
        let (watcher, _rx) = DirectoryWatcher::new(&[PathBuf::from("/no/such/dir")], "json");
        let handle = watcher.run().unwrap();
        assert!(handle.dirs().is_empty());
    }
}
