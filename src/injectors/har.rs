//! HAR archive replay.
//!
//! Every `log.entries[]` item of a `*.har` file becomes one fixture. Entry
//! URLs are absolute; the mount target comes from the archive's `_target`
//! field, or from the configured upstream whose address contains the URL.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::config::ServerContext;
use crate::fixtures::{Fixture, FixtureError, FixtureLoader, FixtureRequest};
use crate::injectors::files::FixtureFiles;
use crate::injectors::options::{self, OptionField, OptionKind, OptionSet};
use crate::injectors::{Injector, InjectorError};
use crate::model::{Answer, Content, NormalizedRequest, Status};

const NAME: &str = "har";
const DELAY: &str = "delay";

#[derive(Debug, Deserialize)]
struct HarFile {
    log: HarLog,
}

#[derive(Debug, Deserialize)]
struct HarLog {
    #[serde(rename = "_target")]
    target: Option<String>,
    #[serde(default)]
    entries: Vec<HarEntry>,
}

#[derive(Debug, Deserialize)]
struct HarEntry {
    request: HarRequest,
    response: HarResponse,
    #[serde(default)]
    time: f64,
}

#[derive(Debug, Deserialize)]
struct HarRequest {
    method: String,
    url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HarResponse {
    status: u16,
    #[serde(default)]
    status_text: String,
    #[serde(default)]
    headers: Vec<HarHeader>,
    #[serde(default)]
    content: HarContent,
    #[serde(rename = "redirectURL", default)]
    redirect_url: String,
}

#[derive(Debug, Deserialize)]
struct HarHeader {
    name: String,
    value: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HarContent {
    mime_type: Option<String>,
    text: Option<String>,
    encoding: Option<String>,
}

/// Headers that describe the recorded transfer, not the replayed body.
const SKIPPED_HEADERS: &[&str] = &["content-length", "content-encoding", "transfer-encoding"];

pub struct HarLoader {
    ctx: ServerContext,
}

impl HarLoader {
    fn fixture(&self, archive_target: Option<&str>, entry: HarEntry) -> Result<Fixture, FixtureError> {
        let (target, path) = self.locate(archive_target, &entry.request.url)?;
        let request = FixtureRequest::new(&entry.request.method, &path, target);

        let mut answer = Answer::new(entry.response.status);
        if !entry.response.status_text.is_empty() {
            answer.status = Status {
                code: entry.response.status,
                text: entry.response.status_text,
            };
        }
        for header in entry.response.headers {
            let name = header.name.to_ascii_lowercase();
            if SKIPPED_HEADERS.contains(&name.as_str()) {
                continue;
            }
            answer
                .headers
                .entry(name)
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(&header.value);
                })
                .or_insert(header.value);
        }
        if let Some(mime) = entry.response.content.mime_type.filter(|m| !m.is_empty()) {
            answer.headers.entry("content-type".to_string()).or_insert(mime);
        }
        answer.content = decode_content(entry.response.content.text, entry.response.content.encoding)?;
        if !entry.response.redirect_url.is_empty() {
            answer.redirect_url = Some(entry.response.redirect_url);
        }

        Ok(Fixture::new(
            request,
            vec![answer],
            entry.time.max(0.0).round() as u64,
        ))
    }

    /// Mount target and mount-relative path for an absolute entry URL.
    fn locate(&self, archive_target: Option<&str>, raw: &str) -> Result<(Option<String>, String), FixtureError> {
        let parsed = url::Url::parse(raw)
            .map_err(|e| FixtureError::Invalid(format!("entry url {raw}: {e}")))?;
        let plain_path = match parsed.query() {
            Some(query) => format!("{}?{}", parsed.path(), query),
            None => parsed.path().to_string(),
        };

        let by_address = self.ctx.mount_for_upstream_url(raw);
        let target = archive_target
            .map(str::to_string)
            .or_else(|| by_address.map(|(mount, _)| mount.to_string()));

        let address = match &target {
            Some(mount) => self.ctx.upstream(mount),
            None => None,
        };
        let path = match address.and_then(|addr| raw.strip_prefix(addr.trim_end_matches('/'))) {
            Some(rest) if rest.is_empty() => "/".to_string(),
            Some(rest) if rest.starts_with('/') => rest.to_string(),
            Some(rest) if rest.starts_with('?') => format!("/{rest}"),
            _ => plain_path,
        };
        Ok((target, path))
    }
}

fn decode_content(text: Option<String>, encoding: Option<String>) -> Result<Content, FixtureError> {
    let text = text.unwrap_or_default();
    match encoding.as_deref() {
        Some(enc) if enc.eq_ignore_ascii_case("base64") => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(text.trim())
                .map_err(|e| FixtureError::Invalid(format!("base64 content: {e}")))?;
            Ok(Content::from_bytes(bytes.into()))
        }
        _ => Ok(Content::Text(text)),
    }
}

impl FixtureLoader for HarLoader {
    type Entry = Fixture;

    fn extension(&self) -> &'static str {
        "har"
    }

    fn load(&self, path: &Path) -> Result<Vec<Fixture>, FixtureError> {
        let text = std::fs::read_to_string(path)?;
        let archive: HarFile = serde_json::from_str(&text)?;
        let target = archive.log.target;
        archive
            .log
            .entries
            .into_iter()
            .map(|entry| self.fixture(target.as_deref(), entry))
            .collect()
    }
}

/// Replays responses recorded in HAR archives.
pub struct HarInjector {
    active: AtomicBool,
    delay: AtomicBool,
    files: FixtureFiles<HarLoader>,
}

impl HarInjector {
    pub fn new(ctx: &ServerContext, dirs: Vec<PathBuf>) -> Self {
        Self {
            active: AtomicBool::new(true),
            delay: AtomicBool::new(false),
            files: FixtureFiles::open(
                NAME,
                HarLoader { ctx: ctx.clone() },
                dirs,
                ctx.bus().clone(),
            ),
        }
    }

    pub fn files(&self) -> &FixtureFiles<HarLoader> {
        &self.files
    }
}

#[async_trait]
impl Injector for HarInjector {
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
        let hit = self.files.find(request)?;
        let fixture = hit.fixture();
        let answer = fixture
            .responses
            .first()?
            .clone()
            .with_url(&request.url)
            .with_file(NAME, &hit.file.name, Some(hit.index));

        if self.delay.load(Ordering::Relaxed) && fixture.time > 0 {
            tokio::time::sleep(Duration::from_millis(fixture.time)).await;
        }
        Some(answer)
    }

    fn options(&self) -> OptionSet {
        let mut set = OptionSet::new();
        self.files.describe(&mut set);
        set.insert(
            DELAY.to_string(),
            OptionField::new(
                OptionKind::Checkbox,
                "Delay",
                "Wait for the recorded duration before answering",
                Value::Bool(self.delay.load(Ordering::Relaxed)),
            ),
        );
        set
    }

    fn set_options(&self, options: &Map<String, Value>) -> Result<(), InjectorError> {
        let delay = options
            .get(DELAY)
            .map(|value| options::as_bool(DELAY, value))
            .transpose()?;
        self.files.apply(options)?;
        if let Some(delay) = delay {
            self.delay.store(delay, Ordering::Relaxed);
        }
        Ok(())
    }

    fn dispose(&self) {
        self.files.dispose();
    }
}
