pub mod claude;
pub mod codex;
pub mod flags;
pub mod gemini;
pub mod registry;

pub use flags::{map_options, resolve_model, BackendOptions};
pub use registry::BackendRegistry;

use crate::errors::{AppError, AppResult};
use crate::events::{EventCollector, EventContent, EventParser};
use crate::models::{Backend, TokenUsage, UnifiedOptions};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A fully resolved subprocess invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// `None` runs in the gateway's own working directory.
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// When set the command is described, never spawned.
    pub dry_run: bool,
}

impl CommandSpec {
    pub(crate) fn new(program: &str, args: Vec<String>, options: &UnifiedOptions) -> Self {
        let cwd = (!options.work_dir.trim().is_empty()).then(|| PathBuf::from(&options.work_dir));
        Self {
            program: program.to_string(),
            args,
            cwd,
            env: BTreeMap::new(),
            dry_run: options.dry_run,
        }
    }

    /// Shell-like rendering of the invocation, for logs and dry runs.
    pub fn describe(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Layers adapter-level environment over the inherited one.
    pub(crate) fn with_env(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env.extend(env.iter().map(|(key, value)| (key.clone(), value.clone())));
        self
    }

    pub fn dry_run_output(&self) -> String {
        let cwd = self
            .cwd
            .as_ref()
            .map(|path| path.to_string_lossy().to_string())
            .unwrap_or_else(|| ".".to_string());
        format!("[dry-run] {} (cwd: {})", self.describe(), cwd)
    }
}

fn shell_quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '/' | '=' | ',' | ':'));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "'\"'\"'"))
    }
}

/// Normalized view of a captured (non-streaming) run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseEnvelope {
    pub content: String,
    pub session_id: Option<String>,
    pub usage: Option<TokenUsage>,
    pub error: Option<String>,
}

#[async_trait]
pub trait Adapter: Send + Sync {
    fn backend(&self) -> Backend;

    fn name(&self) -> &'static str {
        self.backend().as_str()
    }

    /// Executable name or absolute path.
    fn binary(&self) -> &str;

    fn is_available(&self) -> bool {
        which::which(self.binary()).is_ok()
    }

    /// Whether stderr must be kept apart from stdout so its noise can be
    /// filtered out of error text.
    fn separate_stderr(&self) -> bool;

    fn validate_prompt(&self, prompt: &str) -> AppResult<()> {
        if prompt.trim().is_empty() {
            return Err(AppError::Request("Prompt cannot be empty".to_string()));
        }
        Ok(())
    }

    fn build_command(&self, prompt: &str, options: &UnifiedOptions) -> AppResult<CommandSpec>;

    fn build_resume_command(
        &self,
        session_id: &str,
        prompt: &str,
        options: &UnifiedOptions,
    ) -> AppResult<CommandSpec>;

    fn parse_output(&self, raw: &str) -> ResponseEnvelope;

    /// Removes any session artifact the CLI persisted on its own.
    async fn cleanup_session(&self, _backend_session_id: &str) -> AppResult<()> {
        Ok(())
    }
}

pub(crate) fn require_session_id(session_id: &str) -> AppResult<&str> {
    let trimmed = session_id.trim();
    if trimmed.is_empty() {
        return Err(AppError::Request(
            "Resume requires a backend session id".to_string(),
        ));
    }
    Ok(trimmed)
}

/// True when at least one line of `raw` is a JSON object.
pub(crate) fn looks_structured(raw: &str) -> bool {
    raw.lines().any(|line| {
        let trimmed = line.trim();
        trimmed.starts_with('{')
            && serde_json::from_str::<Value>(trimmed)
                .map(|value| value.is_object())
                .unwrap_or(false)
    })
}

/// Builds an envelope by replaying captured JSONL through the event parser.
pub(crate) fn envelope_from_events(backend: Backend, raw: &str) -> ResponseEnvelope {
    if !looks_structured(raw) {
        return ResponseEnvelope {
            content: raw.trim().to_string(),
            ..Default::default()
        };
    }

    let mut parser = EventParser::new(backend, "capture");
    let (events, errors) = parser.parse_all(raw);
    if !errors.is_empty() {
        tracing::debug!(backend = %backend, count = errors.len(), "skipped malformed output lines");
    }
    let mut collector = EventCollector::new();
    collector.extend(events);

    ResponseEnvelope {
        content: collector.final_text(),
        session_id: collector.backend_session_id().map(ToString::to_string),
        usage: collector.reported_usage(),
        error: collector.last_error().map(|error| error.message.clone()),
    }
}

pub(crate) fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

pub(crate) fn u64_field(value: &Value, key: &str) -> u64 {
    value.get(key).and_then(Value::as_u64).unwrap_or(0)
}

pub(crate) fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// Prefers a nested `error.message`, falling back to a top-level `message`.
pub(crate) fn error_content(value: &Value, fallback: &str) -> EventContent {
    let nested = value
        .get("error")
        .and_then(|error| error.get("message"))
        .and_then(Value::as_str);
    let message = non_empty(nested)
        .or_else(|| non_empty(str_field(value, "message")))
        .or_else(|| non_empty(value.get("error").and_then(Value::as_str)))
        .unwrap_or(fallback);
    let code = value
        .get("error")
        .and_then(|error| error.get("code").or_else(|| error.get("type")))
        .or_else(|| value.get("code"))
        .map(stringify_json_value)
        .filter(|code| !code.is_empty());
    crate::events::ErrorContent {
        message: message.to_string(),
        code,
    }
    .into()
}

pub(crate) fn stringify_json_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        _ => value.to_string(),
    }
}

pub(crate) fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}

/// An adapter environment override, else the process variable.
pub(crate) fn env_path(env: &BTreeMap<String, String>, key: &str) -> Option<PathBuf> {
    match env.get(key).filter(|value| !value.trim().is_empty()) {
        Some(value) => Some(PathBuf::from(value)),
        None => std::env::var_os(key)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from),
    }
}
