//! Copy-on-write table of loaded fixture files.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;

/// One parsed file. A file that failed to parse is kept with its error and no entries.
#[derive(Debug)]
pub struct LoadedFile<T> {
    pub path: PathBuf,
    pub name: String,
    pub error: Option<String>,
    pub entries: Vec<T>,
}

impl<T> LoadedFile<T> {
    pub fn ok(path: &Path, entries: Vec<T>) -> Self {
        Self {
            path: path.to_path_buf(),
            name: display_name(path),
            error: None,
            entries,
        }
    }

    pub fn failed(path: &Path, error: impl Into<String>) -> Self {
        Self {
            path: path.to_path_buf(),
            name: display_name(path),
            error: Some(error.into()),
            entries: Vec::new(),
        }
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

pub type Snapshot<T> = Arc<Vec<Arc<LoadedFile<T>>>>;

/// Files in load order. Readers get a snapshot; writers swap whole files.
pub struct FixtureTable<T> {
    files: ArcSwap<Vec<Arc<LoadedFile<T>>>>,
}

impl<T> FixtureTable<T> {
    pub fn new() -> Self {
        Self {
            files: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub fn snapshot(&self) -> Snapshot<T> {
        self.files.load_full()
    }

    /// Replace the file with the same path in place, or append it.
    /// Returns the replaced file.
    pub fn upsert(&self, file: LoadedFile<T>) -> Option<Arc<LoadedFile<T>>> {
        let file = Arc::new(file);
        let previous = self.files.rcu(|current| {
            let mut next = Vec::clone(current);
            match next.iter().position(|f| f.path == file.path) {
                Some(index) => next[index] = Arc::clone(&file),
                None => next.push(Arc::clone(&file)),
            }
            next
        });
        previous.iter().find(|f| f.path == file.path).cloned()
    }

    pub fn remove(&self, path: &Path) -> Option<Arc<LoadedFile<T>>> {
        let previous = self.files.rcu(|current| {
            current
                .iter()
                .filter(|f| f.path != path)
                .cloned()
                .collect::<Vec<_>>()
        });
        previous.iter().find(|f| f.path == path).cloned()
    }

    /// Swap in a complete new set, returning the old one.
    pub fn replace_all(&self, files: Vec<LoadedFile<T>>) -> Snapshot<T> {
        self.files
            .swap(Arc::new(files.into_iter().map(Arc::new).collect()))
    }

    pub fn len(&self) -> usize {
        self.files.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.load().is_empty()
    }
}

impl<T> Default for FixtureTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_keeps_position_and_appends_new() {
        let table = FixtureTable::new();
        table.upsert(LoadedFile::ok(Path::new("/f/a.json"), vec![1]));
        table.upsert(LoadedFile::ok(Path::new("/f/b.json"), vec![2]));

        let before = table.snapshot();
        let replaced = table.upsert(LoadedFile::ok(Path::new("/f/a.json"), vec![3, 4]));
        assert_eq!(replaced.unwrap().entries, vec![1]);

        let after = table.snapshot();
        assert_eq!(after[0].entries, vec![3, 4]);
        assert_eq!(after[1].name, "b.json");
        // Earlier snapshots are untouched.
        assert_eq!(before[0].entries, vec![1]);
    }

    #[test]
    fn remove_and_replace_all() {
        let table = FixtureTable::new();
        table.upsert(LoadedFile::ok(Path::new("/a.har"), vec!["x"]));
        table.upsert(LoadedFile::<&str>::failed(Path::new("/b.har"), "bad json"));
        assert_eq!(table.len(), 2);

        let removed = table.remove(Path::new("/b.har")).unwrap();
        assert_eq!(removed.error.as_deref(), Some("bad json"));
        assert_eq!(table.len(), 1);

        let old = table.replace_all(Vec::new());
        assert_eq!(old.len(), 1);
        assert!(table.is_empty());
    }
}
