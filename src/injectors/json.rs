//! JSON fixture replay.
//!
//! A `*.json` file holds one `{request, response}` object or an array of
//! them. `response` may be a list; with `randomize` on, a random element is
//! returned instead of the first.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::config::ServerContext;
use crate::fixtures::{Fixture, FixtureError, FixtureLoader, FixtureRequest};
use crate::injectors::files::FixtureFiles;
use crate::injectors::options::{self, OptionField, OptionKind, OptionSet};
use crate::injectors::{Injector, InjectorError};
use crate::model::{Answer, Content, NormalizedRequest};

const NAME: &str = "json";
const RANDOMIZE: &str = "randomize";

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::Many(items) => items,
            OneOrMany::One(item) => vec![item],
        }
    }
}

#[derive(Debug, Deserialize)]
struct JsonFixture {
    request: JsonRequest,
    response: OneOrMany<JsonResponse>,
}

#[derive(Debug, Deserialize)]
struct JsonRequest {
    #[serde(default = "default_method")]
    method: String,
    url: String,
    #[serde(default)]
    target: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonResponse {
    #[serde(default = "default_status")]
    status: u16,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    content: Value,
    #[serde(default, alias = "redirect_url")]
    redirect_url: Option<String>,
}

fn default_status() -> u16 {
    200
}

impl JsonResponse {
    fn into_answer(self) -> Result<Answer, FixtureError> {
        let mut answer = Answer::new(self.status);
        for (name, value) in self.headers {
            answer = answer.with_header(&name, value);
        }
        answer.content = match self.content {
            Value::Null => Content::default(),
            Value::String(text) => Content::Text(text),
            other => {
                answer
                    .headers
                    .entry("content-type".to_string())
                    .or_insert_with(|| "application/json".to_string());
                Content::Text(serde_json::to_string(&other)?)
            }
        };
        answer.redirect_url = self.redirect_url;
        Ok(answer)
    }
}

pub struct JsonLoader;

impl FixtureLoader for JsonLoader {
    type Entry = Fixture;

    fn extension(&self) -> &'static str {
        "json"
    }

    fn load(&self, path: &Path) -> Result<Vec<Fixture>, FixtureError> {
        let text = std::fs::read_to_string(path)?;
        let parsed: OneOrMany<JsonFixture> = serde_json::from_str(&text)?;
        parsed
            .into_vec()
            .into_iter()
            .map(|item| {
                let responses = item
                    .response
                    .into_vec()
                    .into_iter()
                    .map(JsonResponse::into_answer)
                    .collect::<Result<Vec<_>, _>>()?;
                if responses.is_empty() {
                    return Err(FixtureError::Invalid(format!(
                        "{} {} has no response",
                        item.request.method, item.request.url
                    )));
                }
                let request =
                    FixtureRequest::new(&item.request.method, &item.request.url, item.request.target);
                Ok(Fixture::new(request, responses, 0))
            })
            .collect()
    }
}

/// Replays hand-written JSON fixtures.
pub struct JsonInjector {
    active: AtomicBool,
    randomize: AtomicBool,
    files: FixtureFiles<JsonLoader>,
}

impl JsonInjector {
    pub fn new(ctx: &ServerContext, dirs: Vec<PathBuf>) -> Self {
        Self {
            active: AtomicBool::new(true),
            randomize: AtomicBool::new(false),
            files: FixtureFiles::open(NAME, JsonLoader, dirs, ctx.bus().clone()),
        }
    }
}

#[async_trait]
impl Injector for JsonInjector {
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
        let responses = &hit.fixture().responses;
        let index = if self.randomize.load(Ordering::Relaxed) && responses.len() > 1 {
            rand::thread_rng().gen_range(0..responses.len())
        } else {
            0
        };
        let answer = responses.get(index)?.clone();
        Some(
            answer
                .with_url(&request.url)
                .with_file(NAME, &hit.file.name, Some(hit.index)),
        )
    }

    fn options(&self) -> OptionSet {
        let mut set = OptionSet::new();
        self.files.describe(&mut set);
        set.insert(
            RANDOMIZE.to_string(),
            OptionField::new(
                OptionKind::Checkbox,
                "Randomize",
                "Pick a random response when a fixture lists several",
                Value::Bool(self.randomize.load(Ordering::Relaxed)),
            ),
        );
        set
    }

    fn set_options(&self, options: &Map<String, Value>) -> Result<(), InjectorError> {
        let randomize = options
            .get(RANDOMIZE)
            .map(|value| options::as_bool(RANDOMIZE, value))
            .transpose()?;
        self.files.apply(options)?;
        if let Some(randomize) = randomize {
            self.randomize.store(randomize, Ordering::Relaxed);
        }
        Ok(())
    }

    fn dispose(&self) {
        self.files.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn incoming(method: &str, url: &str) -> NormalizedRequest {
        let query = url
            .split_once('?')
            .map(|(_, q)| {
                url::form_urlencoded::parse(q.as_bytes())
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect()
            })
            .unwrap_or_default();
        NormalizedRequest {
            url: url.into(),
            target: "/".into(),
            query,
            method: method.into(),
            headers: BTreeMap::new(),
            content: Content::default(),
        }
    }

    fn injector_with(files: &[(&str, Value)]) -> (tempfile::TempDir, JsonInjector) {
        let dir = tempfile::tempdir().unwrap();
        for (name, value) in files {
            std::fs::write(dir.path().join(name), value.to_string()).unwrap();
        }
        let injector = JsonInjector::new(&ServerContext::default(), vec![dir.path().to_path_buf()]);
        (dir, injector)
    }

    #[tokio::test]
    async fn single_object_and_structured_content() {
        let (_dir, injector) = injector_with(&[(
            "user.json",
            json!({
                "request": {"method": "get", "url": "/a?x=1"},
                "response": {"status": 201, "content": {"id": 7}}
            }),
        )]);

        let answer = injector.handle(&incoming("GET", "/a?x=1&y=2")).await.unwrap();
        assert_eq!(answer.status.code, 201);
        assert_eq!(answer.headers["content-type"], "application/json");
        assert_eq!(answer.content, Content::from(r#"{"id":7}"#));
        assert_eq!(answer.injector_name(), "json");

        assert!(injector.handle(&incoming("GET", "/a?x=2")).await.is_none());
        injector.dispose();
    }

    #[tokio::test]
    async fn arrays_and_randomize() {
        let (_dir, injector) = injector_with(&[(
            "list.json",
            json!([
                {"request": {"url": "/one"}, "response": {"content": "one"}},
                {"request": {"url": "/many"}, "response": [
                    {"content": "a"}, {"content": "b"}, {"content": "c"}
                ]}
            ]),
        )]);

        let first = injector.handle(&incoming("GET", "/one")).await.unwrap();
        assert_eq!(first.content, Content::from("one"));
        assert_eq!(first.headers.get("content-type"), None);

        for _ in 0..5 {
            let answer = injector.handle(&incoming("GET", "/many")).await.unwrap();
            assert_eq!(answer.content, Content::from("a"));
        }

        let mut settings = Map::new();
        settings.insert("randomize".into(), json!(true));
        injector.set_options(&settings).unwrap();

        let mut seen = HashSet::new();
        for _ in 0..200 {
            let answer = injector.handle(&incoming("GET", "/many")).await.unwrap();
            seen.insert(answer.content.to_text_lossy());
        }
        assert_eq!(seen.len(), 3);
        injector.dispose();
    }

    #[tokio::test]
    async fn broken_file_does_not_hide_others() {
        let (_dir, injector) = injector_with(&[
            ("a.json", json!({"request": {"url": "/a"}, "response": {"content": "a"}})),
            ("b.json", json!({"nothing": true})),
        ]);
        assert!(injector.handle(&incoming("GET", "/a")).await.is_some());
        let entries = &injector.options()["entries"].value;
        assert!(entries[0]["error"].is_null());
        assert!(entries[1]["error"].is_string());
        injector.dispose();
    }

    #[test]
    fn unknown_option_keys_are_ignored() {
        let (_dir, injector) = injector_with(&[]);
        let before = injector.options();
        let mut settings = Map::new();
        settings.insert("colour".into(), json!("blue"));
        injector.set_options(&settings).unwrap();
        assert_eq!(injector.options(), before);
    }
}
