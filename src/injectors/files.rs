//! Settings and lookup shared by the fixture-replay injectors.

use serde_json::{json, Map, Value};

use crate::events::EventBus;
use crate::fixtures::{find_fixture, Fixture, FixtureHit, FixtureLoader, FixtureSet, Snapshot};
use crate::injectors::options::{self, OptionField, OptionKind, OptionSet};
use crate::injectors::InjectorError;
use crate::model::NormalizedRequest;

pub const DIRECTORIES: &str = "directories";
pub const ENTRIES: &str = "entries";

/// Watched fixture files plus the `directories` / `entries` options.
pub struct FixtureFiles<L: FixtureLoader<Entry = Fixture>> {
    set: FixtureSet<L>,
}

impl<L: FixtureLoader<Entry = Fixture>> FixtureFiles<L> {
    pub fn open(
        source: &'static str,
        loader: L,
        dirs: Vec<std::path::PathBuf>,
        bus: EventBus,
    ) -> Self {
        Self {
            set: FixtureSet::open(source, loader, dirs, bus),
        }
    }

    pub fn find(&self, request: &NormalizedRequest) -> Option<FixtureHit> {
        find_fixture(&self.set.snapshot(), request)
    }

    pub fn snapshot(&self) -> Snapshot<Fixture> {
        self.set.snapshot()
    }

    pub fn set(&self) -> &FixtureSet<L> {
        &self.set
    }

    pub fn describe(&self, options: &mut OptionSet) {
        options.insert(
            DIRECTORIES.to_string(),
            OptionField::new(
                OptionKind::Directory,
                "Directories",
                "Directories watched for fixture files",
                options::dirs_value(&self.set.dirs()),
            ),
        );
        options.insert(
            ENTRIES.to_string(),
            OptionField::new(
                OptionKind::Entry,
                "Entries",
                "Loaded fixtures and their activation flags",
                self.entries_value(),
            ),
        );
    }

    /// Apply `directories` and `entries`; other keys are left to the caller.
    pub fn apply(&self, options: &Map<String, Value>) -> Result<(), InjectorError> {
        let dirs = options
            .get(DIRECTORIES)
            .map(|value| options::as_dirs(DIRECTORIES, value))
            .transpose()?;
        let flags = options
            .get(ENTRIES)
            .map(parse_entry_flags)
            .transpose()?;

        if let Some(dirs) = dirs {
            self.set.set_dirs(dirs);
        }
        if let Some(flags) = flags {
            let files = self.set.snapshot();
            for (name, index, active) in flags {
                if let Some(fixture) = files
                    .iter()
                    .find(|file| file.name == name)
                    .and_then(|file| file.entries.get(index))
                {
                    fixture.set_active(active);
                }
            }
        }
        Ok(())
    }

    pub fn dispose(&self) {
        self.set.dispose();
    }

    fn entries_value(&self) -> Value {
        let files: Vec<Value> = self
            .set
            .snapshot()
            .iter()
            .map(|file| {
                let entries: Vec<Value> = file
                    .entries
                    .iter()
                    .map(|fixture| {
                        json!({
                            "label": fixture.request.label(),
                            "active": fixture.is_active(),
                        })
                    })
                    .collect();
                json!({
                    "file": file.name,
                    "error": file.error,
                    "entries": entries,
                })
            })
            .collect();
        Value::Array(files)
    }
}

/// `[{file, entries: [{active}, ...]}, ...]` into `(file, index, active)` triples.
pub(crate) fn parse_entry_flags(value: &Value) -> Result<Vec<(String, usize, bool)>, InjectorError> {
    let invalid = || InjectorError::InvalidOption {
        key: ENTRIES.to_string(),
        reason: "expected a list of {file, entries: [{active}]}".to_string(),
    };

    let mut flags = Vec::new();
    for file in value.as_array().ok_or_else(invalid)? {
        let name = file.get("file").and_then(Value::as_str).ok_or_else(invalid)?;
        let entries = file
            .get("entries")
            .and_then(Value::as_array)
            .ok_or_else(invalid)?;
        for (index, entry) in entries.iter().enumerate() {
            match entry.get("active") {
                Some(Value::Bool(active)) => flags.push((name.to_string(), index, *active)),
                Some(_) => return Err(invalid()),
                None => {}
            }
        }
    }
    Ok(flags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_flags_parse_listing_shape() {
        let value = json!([
            {"file": "a.har", "entries": [{"active": false}, {"label": "GET /"}, {"active": true}]},
            {"file": "b.har", "error": null, "entries": []},
        ]);
        let flags = parse_entry_flags(&value).unwrap();
        assert_eq!(
            flags,
            vec![("a.har".to_string(), 0, false), ("a.har".to_string(), 2, true)]
        );
    }

    #[test]
    fn entry_flags_reject_bad_shapes() {
        assert!(parse_entry_flags(&json!({"a.har": true})).is_err());
        assert!(parse_entry_flags(&json!([{"file": "a.har", "entries": [{"active": "no"}]}])).is_err());
        assert!(parse_entry_flags(&json!([{"entries": []}])).is_err());
    }
}
