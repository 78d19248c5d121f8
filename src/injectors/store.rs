//! Append-only log of the requests that reach it.
//!
//! Placed last in the chain it captures unanswered traffic: each request is
//! written as one JSON line to `<directory>/<pattern>`, the pattern being a
//! strftime string (`%Y-%m-%d.jsonl` by default, one file per day). It never
//! answers.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::format::{Item, StrftimeItems};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::io::AsyncWriteExt;

use crate::config::ServerContext;
use crate::events::Event;
use crate::injectors::options::{self, OptionField, OptionKind, OptionSet};
use crate::injectors::{Injector, InjectorError};
use crate::model::{now_millis, Answer, NormalizedRequest};

const NAME: &str = "store";
const DIRECTORY: &str = "directory";
const PATTERN: &str = "pattern";
pub const DEFAULT_PATTERN: &str = "%Y-%m-%d.jsonl";

#[derive(Debug, Clone)]
struct StoreSettings {
    directory: PathBuf,
    pattern: String,
}

#[derive(Serialize)]
struct StoredRequest<'a> {
    time: u64,
    request: &'a NormalizedRequest,
}

pub struct StoreInjector {
    active: AtomicBool,
    ctx: ServerContext,
    settings: ArcSwap<StoreSettings>,
    write_lock: tokio::sync::Mutex<()>,
}

impl StoreInjector {
    pub fn new(ctx: &ServerContext) -> Self {
        Self {
            active: AtomicBool::new(true),
            ctx: ctx.clone(),
            settings: ArcSwap::from_pointee(StoreSettings {
                directory: ctx.work_dir().join("store"),
                pattern: DEFAULT_PATTERN.to_string(),
            }),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Log file for the current moment.
    pub fn current_path(&self) -> Result<PathBuf, InjectorError> {
        let settings = self.settings.load();
        let mut name = String::new();
        write!(name, "{}", chrono::Local::now().format(&settings.pattern)).map_err(|_| {
            InjectorError::InvalidOption {
                key: PATTERN.to_string(),
                reason: format!("unusable strftime pattern {}", settings.pattern),
            }
        })?;
        Ok(settings.directory.join(name))
    }

    async fn append(&self, request: &NormalizedRequest) -> Result<PathBuf, InjectorError> {
        let path = self.current_path()?;
        let mut line = serde_json::to_string(&StoredRequest {
            time: now_millis(),
            request,
        })
        .map_err(|e| InjectorError::Io(e.into()))?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(path)
    }
}

fn validate_pattern(pattern: &str) -> Result<(), InjectorError> {
    if pattern.is_empty() || StrftimeItems::new(pattern).any(|item| matches!(item, Item::Error)) {
        return Err(InjectorError::InvalidOption {
            key: PATTERN.to_string(),
            reason: format!("invalid strftime pattern {pattern:?}"),
        });
    }
    Ok(())
}

#[async_trait]
impl Injector for StoreInjector {
    fn name(&self) -> &str {
        NAME
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    async fn handle(&self, request: &NormalizedRequest) -> Option<Answer> {
        match self.append(request).await {
            Ok(path) => {
                tracing::debug!(path = %path.display(), url = %request.url, "Request stored");
                self.ctx.bus().emit(Event::Logged {
                    source: NAME.to_string(),
                    path: path.to_string_lossy().into_owned(),
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to store request");
                self.ctx.error(NAME, format!("Failed to store {}: {e}", request.url));
            }
        }
        None
    }

    fn options(&self) -> OptionSet {
        let settings = self.settings.load();
        let mut set = OptionSet::new();
        set.insert(
            DIRECTORY.to_string(),
            OptionField::new(
                OptionKind::Directory,
                "Directory",
                "Directory the request log is written to",
                json!(settings.directory.to_string_lossy()),
            ),
        );
        set.insert(
            PATTERN.to_string(),
            OptionField::new(
                OptionKind::Text,
                "File pattern",
                "strftime pattern of the log file name",
                json!(settings.pattern),
            ),
        );
        set
    }

    fn set_options(&self, options: &Map<String, Value>) -> Result<(), InjectorError> {
        let mut next = StoreSettings::clone(&self.settings.load());
        if let Some(value) = options.get(DIRECTORY) {
            next.directory = PathBuf::from(options::as_string(DIRECTORY, value)?);
        }
        if let Some(value) = options.get(PATTERN) {
            let pattern = options::as_string(PATTERN, value)?;
            validate_pattern(&pattern)?;
            next.pattern = pattern;
        }
        self.settings.store(Arc::new(next));
        Ok(())
    }
}
