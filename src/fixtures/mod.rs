//! Fixture files and hot reload.
//!
//! # Data Flow
//! ```text
//! fixture directories
//!     → watcher.rs (scan on open, notify events afterwards)
//!     → FixtureLoader::load (per file, owned by the injector)
//!     → table.rs (ArcSwap copy-on-write swap of that one file)
//!     → injectors read snapshots while serving
//! ```
//!
//! # Design Decisions
//! - A reload replaces one file's entries atomically; readers never see half a file
//! - Files that fail to load stay in the table with their error and no entries
//! - Missing directories are reported and skipped
//! - Without a tokio runtime the initial scan still happens, only the watch is skipped

pub mod matching;
pub mod table;
pub mod watcher;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::events::EventBus;

pub use matching::{find_fixture, Fixture, FixtureHit, FixtureRequest};
pub use table::{FixtureTable, LoadedFile, Snapshot};
pub use watcher::{DirectoryWatcher, ReloadEvent, ReloadKind, WatchHandle};

#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid fixture: {0}")]
    Invalid(String),

    #[error("Script error: {0}")]
    Script(String),
}

/// Turns one file into entries. Implemented by each file-backed injector.
pub trait FixtureLoader: Send + Sync + 'static {
    type Entry: Send + Sync + 'static;

    /// File extension this loader handles, without the dot.
    fn extension(&self) -> &'static str;

    fn load(&self, path: &Path) -> Result<Vec<Self::Entry>, FixtureError>;

    /// Called once a file leaves the table (replaced, removed, or disposed).
    fn unload(&self, _file: &LoadedFile<Self::Entry>) {}
}

struct ActiveWatch {
    _handle: WatchHandle,
    task: JoinHandle<()>,
}

impl Drop for ActiveWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A watched set of fixture directories feeding one table.
pub struct FixtureSet<L: FixtureLoader> {
    source: &'static str,
    loader: Arc<L>,
    table: Arc<FixtureTable<L::Entry>>,
    dirs: Mutex<Vec<PathBuf>>,
    watch: Mutex<Option<ActiveWatch>>,
    bus: EventBus,
}

impl<L: FixtureLoader> FixtureSet<L> {
    /// Scan `dirs`, load every matching file, then start watching.
    pub fn open(source: &'static str, loader: L, dirs: Vec<PathBuf>, bus: EventBus) -> Self {
        let set = Self {
            source,
            loader: Arc::new(loader),
            table: Arc::new(FixtureTable::new()),
            dirs: Mutex::new(Vec::new()),
            watch: Mutex::new(None),
            bus,
        };
        set.set_dirs(dirs);
        set
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    pub fn snapshot(&self) -> Snapshot<L::Entry> {
        self.table.snapshot()
    }

    pub fn dirs(&self) -> Vec<PathBuf> {
        self.dirs.lock().expect("fixture dirs mutex poisoned").clone()
    }

    /// Replace the watched directories and reload everything below them.
    pub fn set_dirs(&self, dirs: Vec<PathBuf>) {
        self.stop_watch();

        for dir in &dirs {
            if !dir.is_dir() {
                self.bus.error(
                    self.source,
                    format!("Fixture directory {} does not exist", dir.display()),
                );
            }
        }

        let files = watcher::scan(&dirs, self.loader.extension())
            .iter()
            .map(|path| load_file(self.loader.as_ref(), self.source, &self.bus, path))
            .collect();
        let previous = self.table.replace_all(files);
        for file in previous.iter() {
            self.loader.unload(file);
        }

        tracing::info!(
            source = self.source,
            files = self.table.len(),
            "Fixtures loaded"
        );

        *self.dirs.lock().expect("fixture dirs mutex poisoned") = dirs.clone();
        self.start_watch(&dirs);
    }

    /// Reload a single file as if the watcher had reported it.
    pub fn apply(&self, event: ReloadEvent) {
        apply_event(self.loader.as_ref(), &self.table, self.source, &self.bus, event);
    }

    /// Stop watching and unload every file.
    pub fn dispose(&self) {
        self.stop_watch();
        let previous = self.table.replace_all(Vec::new());
        for file in previous.iter() {
            self.loader.unload(file);
        }
    }

    fn stop_watch(&self) {
        self.watch.lock().expect("fixture watch mutex poisoned").take();
    }

    fn start_watch(&self, dirs: &[PathBuf]) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(source = self.source, "No runtime, fixture watch disabled");
            return;
        };

        let (watcher, rx) = DirectoryWatcher::new(dirs, self.loader.extension());
        let handle = match watcher.run() {
            Ok(handle) => handle,
            Err(e) => {
                self.bus
                    .error(self.source, format!("Failed to watch fixtures: {e}"));
                return;
            }
        };

        let task = runtime.spawn(reload_loop(
            Arc::clone(&self.loader),
            Arc::clone(&self.table),
            self.source,
            self.bus.clone(),
            rx,
        ));

        *self.watch.lock().expect("fixture watch mutex poisoned") = Some(ActiveWatch {
            _handle: handle,
            task,
        });
    }
}

async fn reload_loop<L: FixtureLoader>(
    loader: Arc<L>,
    table: Arc<FixtureTable<L::Entry>>,
    source: &'static str,
    bus: EventBus,
    mut rx: mpsc::UnboundedReceiver<ReloadEvent>,
) {
    while let Some(event) = rx.recv().await {
        apply_event(loader.as_ref(), &table, source, &bus, event);
    }
}

fn apply_event<L: FixtureLoader>(
    loader: &L,
    table: &FixtureTable<L::Entry>,
    source: &'static str,
    bus: &EventBus,
    event: ReloadEvent,
) {
    match event.kind {
        ReloadKind::Changed => {
            let file = load_file(loader, source, bus, &event.path);
            if let Some(old) = table.upsert(file) {
                loader.unload(&old);
            }
            bus.info(source, format!("Reloaded {}", event.path.display()));
        }
        ReloadKind::Removed => {
            if let Some(old) = table.remove(&event.path) {
                loader.unload(&old);
                bus.info(source, format!("Removed {}", event.path.display()));
            }
        }
    }
}

fn load_file<L: FixtureLoader>(
    loader: &L,
    source: &str,
    bus: &EventBus,
    path: &Path,
) -> LoadedFile<L::Entry> {
    match loader.load(path) {
        Ok(entries) => LoadedFile::ok(path, entries),
        Err(e) => {
            let message = format!("{}: {e}", path.display());
            tracing::warn!(source, path = %path.display(), error = %e, "Failed to load fixture");
            bus.error(source, message);
            LoadedFile::failed(path, e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Lines {
        unloaded: Arc<AtomicUsize>,
    }

    impl FixtureLoader for Lines {
        type Entry = String;

        fn extension(&self) -> &'static str {
            "txt"
        }

        fn load(&self, path: &Path) -> Result<Vec<String>, FixtureError> {
            let text = std::fs::read_to_string(path)?;
            if text.starts_with('!') {
                return Err(FixtureError::Invalid("bang".into()));
            }
            Ok(text.lines().map(str::to_string).collect())
        }

        fn unload(&self, _file: &LoadedFile<String>) {
            self.unloaded.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn open(dir: &Path) -> (FixtureSet<Lines>, Arc<AtomicUsize>) {
        let unloaded = Arc::new(AtomicUsize::new(0));
        let set = FixtureSet::open(
            "lines",
            Lines {
                unloaded: Arc::clone(&unloaded),
            },
            vec![dir.to_path_buf()],
            EventBus::new(16),
        );
        (set, unloaded)
    }

    #[test]
    fn broken_files_are_kept_with_their_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one\ntwo").unwrap();
        std::fs::write(dir.path().join("b.txt"), "!broken").unwrap();

        let (set, _) = open(dir.path());
        let files = set.snapshot();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].entries, ["one", "two"]);
        assert!(files[1].entries.is_empty());
        assert!(files[1].error.as_deref().unwrap().contains("bang"));
    }

    #[test]
    fn apply_swaps_one_file_and_unloads_the_old_one() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        std::fs::write(&a, "old").unwrap();
        std::fs::write(dir.path().join("b.txt"), "other").unwrap();

        let (set, unloaded) = open(dir.path());
        std::fs::write(&a, "new").unwrap();
        set.apply(ReloadEvent {
            path: a.clone(),
            kind: ReloadKind::Changed,
        });

        let files = set.snapshot();
        assert_eq!(files[0].entries, ["new"]);
        assert_eq!(files[1].entries, ["other"]);
        assert_eq!(unloaded.load(Ordering::SeqCst), 1);

        set.apply(ReloadEvent {
            path: a,
            kind: ReloadKind::Removed,
        });
        assert_eq!(set.snapshot().len(), 1);

        set.dispose();
        assert!(set.snapshot().is_empty());
        assert_eq!(unloaded.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn missing_directory_is_reported() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let set = FixtureSet::open(
            "lines",
            Lines {
                unloaded: Arc::new(AtomicUsize::new(0)),
            },
            vec![PathBuf::from("/no/such/fixtures")],
            bus,
        );
        assert!(set.snapshot().is_empty());
        match rx.try_recv().unwrap() {
            crate::events::Event::Error { source, .. } => assert_eq!(source, "lines"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn watch_picks_up_new_files() {
        let dir = tempfile::tempdir().unwrap();
        let (set, _) = open(dir.path());
        assert!(set.snapshot().is_empty());

        std::fs::write(dir.path().join("late.txt"), "hello").unwrap();
        for _ in 0..100 {
            if set.snapshot().first().map(|f| f.entries.len()) == Some(1) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert_eq!(set.snapshot()[0].entries, ["hello"]);
        set.dispose();
    }
}
