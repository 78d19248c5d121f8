//! Rhai script handlers.
//!
//! # Responsibilities
//! - Load `*.rhai` files and run their top-level statements once
//! - Call `fn handle(request, answer)` for every request; a returned map is
//!   the answer, `()` declines
//! - Keep one `this` map per script across calls
//! - Run the optional `setup()` / `teardown()` hooks on load and unload
//! - Offer WebSocket sessions to `connected(session)`; a script returning
//!   `true` receives that session's `message(session, content)` calls
//!
//! # Design Decisions
//! - A script that fails to compile stays listed with its error and never answers
//! - Runtime errors are reported as `error` events and count as "no answer"
//! - Each script runs under an operation limit so a runaway loop cannot pin a worker

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use rhai::{CallFnOptions, Dynamic, Engine, FuncArgs, Scope, AST};
use serde_json::{json, Map, Value};

use crate::config::ServerContext;
use crate::events::EventBus;
use crate::fixtures::{FixtureError, FixtureLoader, FixtureSet, LoadedFile};
use crate::injectors::files::{parse_entry_flags, DIRECTORIES, ENTRIES};
use crate::injectors::options::{self, OptionField, OptionKind, OptionSet};
use crate::injectors::{Injector, InjectorError};
use crate::model::{now_millis, Answer, Content, NormalizedRequest, Status};
use crate::websocket::SessionInfo;

const NAME: &str = "script";
const MAX_OPERATIONS: u64 = 5_000_000;

pub fn create_engine() -> Engine {
    let mut engine = Engine::new();
    engine.set_max_operations(MAX_OPERATIONS);
    engine.on_print(|text| tracing::info!(target: "script", "{text}"));
    engine.on_debug(|text, source, pos| {
        tracing::debug!(target: "script", source = source.unwrap_or(""), position = %pos, "{text}")
    });
    engine.register_fn("now", || now_millis() as i64);
    engine
}

struct ScriptState {
    scope: Scope<'static>,
    this: Dynamic,
}

/// One compiled script with its persistent state.
pub struct Script {
    ast: AST,
    functions: HashSet<String>,
    state: Mutex<ScriptState>,
    active: AtomicBool,
}

impl Script {
    fn new(engine: &Engine, ast: AST) -> Result<Self, FixtureError> {
        let functions = ast.iter_functions().map(|f| f.name.to_string()).collect();
        let mut scope = Scope::new();
        engine
            .run_ast_with_scope(&mut scope, &ast)
            .map_err(|e| FixtureError::Script(e.to_string()))?;
        Ok(Self {
            ast,
            functions,
            state: Mutex::new(ScriptState {
                scope,
                this: Dynamic::from(rhai::Map::new()),
            }),
            active: AtomicBool::new(true),
        })
    }

    pub fn defines(&self, function: &str) -> bool {
        self.functions.contains(function)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Call a script function with `this` bound to the script's context map.
    fn call(&self, engine: &Engine, function: &str, args: impl FuncArgs) -> Result<Dynamic, String> {
        let mut state = self.state.lock().expect("script state mutex poisoned");
        let ScriptState { scope, this } = &mut *state;
        let options = CallFnOptions::new()
            .eval_ast(false)
            .rewind_scope(true)
            .bind_this_ptr(this);
        engine
            .call_fn_with_options::<Dynamic>(options, scope, &self.ast, function, args)
            .map_err(|e| e.to_string())
    }
}

pub struct ScriptLoader {
    engine: Arc<Engine>,
    bus: EventBus,
}

impl FixtureLoader for ScriptLoader {
    type Entry = Script;

    fn extension(&self) -> &'static str {
        "rhai"
    }

    fn load(&self, path: &Path) -> Result<Vec<Script>, FixtureError> {
        let source = std::fs::read_to_string(path)?;
        let ast = self
            .engine
            .compile(&source)
            .map_err(|e| FixtureError::Script(e.to_string()))?;
        let script = Script::new(&self.engine, ast)?;

        if script.defines("setup") {
            if let Err(e) = script.call(&self.engine, "setup", ()) {
                self.bus
                    .error(NAME, format!("{}: setup failed: {e}", path.display()));
            }
        }
        Ok(vec![script])
    }

    fn unload(&self, file: &LoadedFile<Script>) {
        for script in &file.entries {
            if script.defines("teardown") {
                if let Err(e) = script.call(&self.engine, "teardown", ()) {
                    self.bus
                        .error(NAME, format!("{}: teardown failed: {e}", file.name));
                }
            }
        }
    }
}

/// Answers requests with user-supplied Rhai handlers.
pub struct ScriptInjector {
    active: AtomicBool,
    engine: Arc<Engine>,
    set: FixtureSet<ScriptLoader>,
    claims: DashMap<String, Arc<LoadedFile<Script>>>,
    bus: EventBus,
}

impl ScriptInjector {
    pub fn new(ctx: &ServerContext, dirs: Vec<PathBuf>) -> Self {
        let engine = Arc::new(create_engine());
        let loader = ScriptLoader {
            engine: Arc::clone(&engine),
            bus: ctx.bus().clone(),
        };
        Self {
            active: AtomicBool::new(true),
            engine,
            set: FixtureSet::open(NAME, loader, dirs, ctx.bus().clone()),
            claims: DashMap::new(),
            bus: ctx.bus().clone(),
        }
    }

    fn report(&self, file: &str, function: &str, error: &str) {
        tracing::warn!(script = file, function, error, "Script failed");
        self.bus.error(NAME, format!("{file}: {function}: {error}"));
    }

    fn scripts_value(&self) -> Value {
        let files: Vec<Value> = self
            .set
            .snapshot()
            .iter()
            .map(|file| {
                let entries: Vec<Value> = file
                    .entries
                    .iter()
                    .map(|script| json!({"label": file.name, "active": script.is_active()}))
                    .collect();
                json!({"file": file.name, "error": file.error, "entries": entries})
            })
            .collect();
        Value::Array(files)
    }
}

fn answer_template() -> Dynamic {
    let mut map = rhai::Map::new();
    map.insert("status".into(), Dynamic::from(200_i64));
    map.insert("headers".into(), Dynamic::from(rhai::Map::new()));
    map.insert("content".into(), Dynamic::from(String::new()));
    Dynamic::from(map)
}

fn status_code(value: &Value) -> Result<u16, String> {
    value
        .as_u64()
        .and_then(|code| u16::try_from(code).ok())
        .ok_or_else(|| format!("invalid status code {value}"))
}

/// Convert a handler result into an answer. `()` means no answer.
fn to_answer(result: Dynamic) -> Result<Option<Answer>, String> {
    if result.is_unit() {
        return Ok(None);
    }
    if result.is_string() {
        let text = result.into_string().map_err(|t| format!("unexpected {t}"))?;
        return Ok(Some(Answer::new(200).with_content(text)));
    }

    let value: Value = rhai::serde::from_dynamic(&result).map_err(|e| e.to_string())?;
    let Value::Object(map) = value else {
        return Err("handle must return a map or ()".to_string());
    };

    let mut answer = Answer::new(200);
    match map.get("status") {
        Some(code @ Value::Number(_)) => {
            answer.status = Status::new(status_code(code)?);
        }
        Some(Value::Object(status)) => {
            let code = match status.get("code") {
                Some(code) => status_code(code)?,
                None => 200,
            };
            answer.status = Status::new(code);
            if let Some(text) = status.get("text").and_then(Value::as_str) {
                answer.status.text = text.to_string();
            }
        }
        _ => {}
    }
    if let Some(Value::Object(headers)) = map.get("headers") {
        for (name, value) in headers {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            answer = answer.with_header(name, value);
        }
    }
    answer.content = match map.get("content") {
        None | Some(Value::Null) => Content::default(),
        Some(Value::String(text)) => Content::Text(text.clone()),
        Some(other) => {
            answer
                .headers
                .entry("content-type".to_string())
                .or_insert_with(|| "application/json".to_string());
            Content::Text(other.to_string())
        }
    };
    if let Some(url) = map.get("url").and_then(Value::as_str) {
        answer.url = url.to_string();
    }
    answer.redirect_url = map
        .get("redirect_url")
        .or_else(|| map.get("redirectUrl"))
        .and_then(Value::as_str)
        .map(str::to_string);
    Ok(Some(answer))
}

#[async_trait]
impl Injector for ScriptInjector {
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
        let request_value = match rhai::serde::to_dynamic(request) {
            Ok(value) => value,
            Err(e) => {
                self.bus.error(NAME, format!("request conversion failed: {e}"));
                return None;
            }
        };

        for file in self.set.snapshot().iter() {
            for script in file.entries.iter().filter(|s| s.is_active() && s.defines("handle")) {
                let args = (request_value.clone(), answer_template());
                let outcome = script
                    .call(&self.engine, "handle", args)
                    .and_then(to_answer);
                match outcome {
                    Ok(Some(answer)) => {
                        let answer = if answer.url.is_empty() {
                            answer.with_url(&request.url)
                        } else {
                            answer
                        };
                        return Some(answer.with_file(NAME, &file.name, None));
                    }
                    Ok(None) => {}
                    Err(e) => self.report(&file.name, "handle", &e),
                }
            }
        }
        None
    }

    fn options(&self) -> OptionSet {
        let mut set = OptionSet::new();
        set.insert(
            DIRECTORIES.to_string(),
            OptionField::new(
                OptionKind::Directory,
                "Directories",
                "Directories watched for Rhai scripts",
                options::dirs_value(&self.set.dirs()),
            ),
        );
        set.insert(
            ENTRIES.to_string(),
            OptionField::new(
                OptionKind::Entry,
                "Scripts",
                "Loaded scripts and their activation flags",
                self.scripts_value(),
            ),
        );
        set
    }

    fn set_options(&self, options: &Map<String, Value>) -> Result<(), InjectorError> {
        let dirs = options
            .get(DIRECTORIES)
            .map(|value| options::as_dirs(DIRECTORIES, value))
            .transpose()?;
        let flags = options.get(ENTRIES).map(parse_entry_flags).transpose()?;

        if let Some(dirs) = dirs {
            self.set.set_dirs(dirs);
        }
        if let Some(flags) = flags {
            let files = self.set.snapshot();
            for (name, index, active) in flags {
                if let Some(script) = files
                    .iter()
                    .find(|f| f.name == name)
                    .and_then(|f| f.entries.get(index))
                {
                    script.active.store(active, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }

    async fn connected(&self, session: &SessionInfo) -> bool {
        let Ok(session_value) = rhai::serde::to_dynamic(session) else {
            return false;
        };
        for file in self.set.snapshot().iter() {
            for script in file.entries.iter().filter(|s| s.is_active() && s.defines("connected")) {
                match script.call(&self.engine, "connected", (session_value.clone(),)) {
                    Ok(claimed) if claimed.as_bool().unwrap_or(false) => {
                        tracing::debug!(script = %file.name, session = %session.id, "Script claimed session");
                        self.claims.insert(session.id.clone(), Arc::clone(file));
                        return true;
                    }
                    Ok(_) => {}
                    Err(e) => self.report(&file.name, "connected", &e),
                }
            }
        }
        false
    }

    async fn message(&self, session: &SessionInfo, content: &str) -> Option<String> {
        let file = self.claims.get(&session.id).map(|r| Arc::clone(r.value()))?;
        let script = file.entries.first()?;
        if !script.defines("message") {
            return None;
        }
        let session_value = rhai::serde::to_dynamic(session).ok()?;
        match script.call(
            &self.engine,
            "message",
            (session_value, Dynamic::from(content.to_string())),
        ) {
            Ok(reply) if reply.is_unit() => None,
            Ok(reply) if reply.is_string() => reply.into_string().ok(),
            Ok(reply) => rhai::serde::from_dynamic::<Value>(&reply)
                .ok()
                .map(|v| v.to_string()),
            Err(e) => {
                self.report(&file.name, "message", &e);
                None
            }
        }
    }

    async fn disconnected(&self, session: &SessionInfo) {
        let Some((_, file)) = self.claims.remove(&session.id) else {
            return;
        };
        let Some(script) = file.entries.first() else {
            return;
        };
        if !script.defines("disconnected") {
            return;
        }
        let Ok(session_value) = rhai::serde::to_dynamic(session) else {
            return;
        };
        if let Err(e) = script.call(&self.engine, "disconnected", (session_value,)) {
            self.report(&file.name, "disconnected", &e);
        }
    }

    fn dispose(&self) {
        self.claims.clear();
        self.set.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn request(url: &str) -> NormalizedRequest {
        NormalizedRequest {
            url: url.into(),
            target: "/".into(),
            query: BTreeMap::new(),
            method: "GET".into(),
            headers: BTreeMap::new(),
            content: Content::default(),
        }
    }

    fn injector_with(scripts: &[(&str, &str)]) -> (tempfile::TempDir, ScriptInjector) {
        let dir = tempfile::tempdir().unwrap();
        for (name, source) in scripts {
            std::fs::write(dir.path().join(name), source).unwrap();
        }
        let injector = ScriptInjector::new(&ServerContext::default(), vec![dir.path().to_path_buf()]);
        (dir, injector)
    }

    const COUNTER: &str = r#"
        fn setup() { this.count = 0; }
        fn handle(request, answer) {
            if request.url != "/count" { return (); }
            this.count += 1;
            answer.status = 201;
            answer.headers["x-count"] = this.count.to_string();
            answer.content = #{ count: this.count };
            answer
        }
    "#;

    #[tokio::test]
    async fn handle_keeps_this_between_calls() {
        let (_dir, injector) = injector_with(&[("counter.rhai", COUNTER)]);

        let first = injector.handle(&request("/count")).await.unwrap();
        assert_eq!(first.status.code, 201);
        assert_eq!(first.headers["x-count"], "1");
        assert_eq!(first.headers["content-type"], "application/json");

        let second = injector.handle(&request("/count")).await.unwrap();
        assert_eq!(second.content, Content::from(r#"{"count":2}"#));
        assert_eq!(second.injector.unwrap().file.unwrap().name, "counter.rhai");

        assert!(injector.handle(&request("/other")).await.is_none());
        injector.dispose();
    }

    #[tokio::test]
    async fn runtime_errors_are_reported_and_decline() {
        let ctx = ServerContext::default();
        let mut rx = ctx.bus().subscribe();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("boom.rhai"),
            r#"fn handle(request, answer) { throw "boom"; }"#,
        )
        .unwrap();
        let injector = ScriptInjector::new(&ctx, vec![dir.path().to_path_buf()]);

        assert!(injector.handle(&request("/")).await.is_none());
        let mut reported = false;
        while let Ok(event) = rx.try_recv() {
            if let crate::events::Event::Error { source, message } = event {
                reported |= source == "script" && message.contains("boom");
            }
        }
        assert!(reported);
        injector.dispose();
    }

    #[tokio::test]
    async fn broken_script_is_listed_and_declines() {
        let (_dir, injector) = injector_with(&[
            ("a.rhai", "fn handle(request, answer) { answer"),
            ("b.rhai", r#"fn handle(request, answer) { "plain" }"#),
        ]);
        let entries = &injector.options()["entries"].value;
        assert_eq!(entries.as_array().unwrap().len(), 2);
        assert!(entries[0]["error"].is_string());

        let answer = injector.handle(&request("/")).await.unwrap();
        assert_eq!(answer.content, Content::from("plain"));
        injector.dispose();
    }

    #[tokio::test]
    async fn teardown_runs_on_dispose() {
        let ctx = ServerContext::default();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("t.rhai"),
            r#"fn teardown() { throw "closing"; }"#,
        )
        .unwrap();
        let injector = ScriptInjector::new(&ctx, vec![dir.path().to_path_buf()]);
        assert_eq!(injector.set.snapshot().len(), 1);

        let mut rx = ctx.bus().subscribe();
        injector.dispose();
        assert!(injector.set.snapshot().is_empty());

        let mut torn_down = false;
        while let Ok(event) = rx.try_recv() {
            if let crate::events::Event::Error { message, .. } = event {
                torn_down |= message.contains("teardown failed");
            }
        }
        assert!(torn_down);
    }

    #[tokio::test]
    async fn sessions_can_be_claimed() {
        let (_dir, injector) = injector_with(&[(
            "chat.rhai",
            r#"
                fn connected(session) { session.url.starts_with("/chat") }
                fn message(session, content) {
                    if content == "quiet" { return (); }
                    "echo: " + content
                }
                fn disconnected(session) { this.left = session.id; }
            "#,
        )]);

        let chat = SessionInfo::new("ws-1", "/chat/room", "/");
        let other = SessionInfo::new("ws-2", "/feed", "/");
        assert!(injector.connected(&chat).await);
        assert!(!injector.connected(&other).await);

        assert_eq!(injector.message(&chat, "hi").await.as_deref(), Some("echo: hi"));
        assert_eq!(injector.message(&chat, "quiet").await, None);
        assert_eq!(injector.message(&other, "hi").await, None);

        injector.disconnected(&chat).await;
        assert_eq!(injector.message(&chat, "hi").await, None);
        injector.dispose();
    }

    #[test]
    fn out_of_range_status_is_an_error() {
        for code in [Dynamic::from(65_736_i64), Dynamic::from(-1_i64)] {
            let mut map = rhai::Map::new();
            map.insert("status".into(), code.clone());
            let err = to_answer(Dynamic::from(map)).unwrap_err();
            assert!(err.contains("invalid status code"), "{err}");

            let mut status = rhai::Map::new();
            status.insert("code".into(), code);
            let mut map = rhai::Map::new();
            map.insert("status".into(), Dynamic::from(status));
            assert!(to_answer(Dynamic::from(map)).is_err());
        }
    }

    #[test]
    fn results_convert_to_answers() {
        assert!(to_answer(Dynamic::UNIT).unwrap().is_none());
        assert!(to_answer(Dynamic::from(5_i64)).is_err());

        let mut map = rhai::Map::new();
        let mut status = rhai::Map::new();
        status.insert("code".into(), Dynamic::from(418_i64));
        status.insert("text".into(), Dynamic::from("Teapot".to_string()));
        map.insert("status".into(), Dynamic::from(status));
        map.insert("redirect_url".into(), Dynamic::from("/elsewhere".to_string()));
        let answer = to_answer(Dynamic::from(map)).unwrap().unwrap();
        assert_eq!(answer.status.code, 418);
        assert_eq!(answer.status.text, "Teapot");
        assert_eq!(answer.redirect_url.as_deref(), Some("/elsewhere"));
    }
}
