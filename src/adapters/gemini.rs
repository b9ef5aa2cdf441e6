use super::flags::push_pair;
use super::{
    error_content, map_options, non_empty, require_session_id, str_field, stringify_json_value,
    u64_field, Adapter, CommandSpec, ResponseEnvelope,
};
use crate::errors::{AppError, AppResult};
use crate::events::parser::ParserState;
use crate::events::{
    DoneContent, EventContent, InitContent, MessageContent, ThinkingContent, ToolResultContent,
    ToolUseContent,
};
use crate::models::{ApprovalMode, Backend, OutputFormat, SandboxMode, TokenUsage, UnifiedOptions};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

pub const DEFAULT_BINARY: &str = "gemini";

const DELETE_SESSION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct GeminiAdapter {
    binary: String,
    env: BTreeMap<String, String>,
}

impl GeminiAdapter {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            env: BTreeMap::new(),
        }
    }

    /// Environment variables set on every process this adapter starts.
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    fn finish(&self, mut args: Vec<String>, prompt: &str, options: &UnifiedOptions) -> AppResult<CommandSpec> {
        args.extend(map_options(Backend::Gemini, options)?.args());
        args.push("-p".to_string());
        args.push(prompt.to_string());
        Ok(CommandSpec::new(&self.binary, args, options).with_env(&self.env))
    }
}

impl Default for GeminiAdapter {
    fn default() -> Self {
        Self::new(DEFAULT_BINARY)
    }
}

#[async_trait]
impl Adapter for GeminiAdapter {
    fn backend(&self) -> Backend {
        Backend::Gemini
    }

    fn binary(&self) -> &str {
        &self.binary
    }

    fn separate_stderr(&self) -> bool {
        true
    }

    fn build_command(&self, prompt: &str, options: &UnifiedOptions) -> AppResult<CommandSpec> {
        self.validate_prompt(prompt)?;
        self.finish(Vec::new(), prompt, options)
    }

    fn build_resume_command(
        &self,
        session_id: &str,
        prompt: &str,
        options: &UnifiedOptions,
    ) -> AppResult<CommandSpec> {
        self.validate_prompt(prompt)?;
        let session_id = require_session_id(session_id)?;
        self.finish(
            vec!["--resume".to_string(), session_id.to_string()],
            prompt,
            options,
        )
    }

    fn parse_output(&self, raw: &str) -> ResponseEnvelope {
        // json mode prints one pretty-printed document rather than JSONL.
        match serde_json::from_str::<Value>(raw.trim()) {
            Ok(document)
                if document.get("response").is_some() || document.get("error").is_some() =>
            {
                envelope_from_document(&document)
            }
            _ => super::envelope_from_events(Backend::Gemini, raw),
        }
    }

    async fn cleanup_session(&self, backend_session_id: &str) -> AppResult<()> {
        let mut command = tokio::process::Command::new(&self.binary);
        command
            .arg("--delete-session")
            .arg(backend_session_id)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let status = tokio::time::timeout(DELETE_SESSION_TIMEOUT, command.status())
            .await
            .map_err(|_| AppError::Io("gemini --delete-session timed out".to_string()))??;
        if !status.success() {
            return Err(AppError::Io(format!(
                "gemini --delete-session exited with {}",
                status
            )));
        }
        Ok(())
    }
}

pub(crate) fn model_alias(alias: &str) -> Option<&'static str> {
    match alias {
        "fast" | "quick" => Some("gemini-2.5-flash"),
        "balanced" | "default" | "best" | "powerful" => Some("gemini-2.5-pro"),
        _ => None,
    }
}

pub(crate) fn derived_flags(options: &UnifiedOptions, model: &str) -> Vec<String> {
    let mut args = Vec::new();
    if !model.is_empty() {
        push_pair(&mut args, "--model", model);
    }

    let approval = match options.approval_mode {
        ApprovalMode::Default => None,
        ApprovalMode::Auto => Some("auto_edit"),
        ApprovalMode::None => Some("yolo"),
        ApprovalMode::Always => Some("default"),
    };
    if let Some(approval) = approval {
        push_pair(&mut args, "--approval-mode", approval);
    }

    // Gemini only has an on/off sandbox; full access means leaving it off.
    if matches!(options.sandbox_mode, SandboxMode::ReadOnly | SandboxMode::Workspace) {
        args.push("--sandbox".to_string());
    }

    let format = match options.output_format {
        OutputFormat::Default => None,
        OutputFormat::Text => Some("text"),
        OutputFormat::Json => Some("json"),
        OutputFormat::StreamJson => Some("stream-json"),
    };
    if let Some(format) = format {
        push_pair(&mut args, "--output-format", format);
    }

    if options.verbose {
        args.push("--debug".to_string());
    }
    if !options.allowed_dirs.is_empty() {
        push_pair(&mut args, "--include-directories", options.allowed_dirs.join(","));
    }
    if !options.allowed_tools.is_empty() {
        push_pair(&mut args, "--allowed-tools", options.allowed_tools.join(","));
    }
    args
}

pub(crate) fn parse_event(
    value: &Value,
    state: &mut ParserState,
) -> AppResult<Option<EventContent>> {
    let content = match str_field(value, "type").unwrap_or_default() {
        "init" => {
            let session_id = non_empty(str_field(value, "session_id")).ok_or_else(|| {
                AppError::Parse("gemini init event is missing session_id".to_string())
            })?;
            Some(
                InitContent {
                    backend_session_id: session_id.to_string(),
                    model: str_field(value, "model").map(ToString::to_string),
                }
                .into(),
            )
        }
        "message" => {
            let role = str_field(value, "role").unwrap_or("assistant");
            if role == "user" {
                return Ok(None);
            }
            let text = str_field(value, "content").unwrap_or_default();
            if text.is_empty() {
                return Ok(None);
            }
            Some(
                MessageContent {
                    text: text.to_string(),
                    role: role.to_string(),
                    partial: value.get("delta").and_then(Value::as_bool).unwrap_or(false),
                }
                .into(),
            )
        }
        "thought" => {
            let text = non_empty(str_field(value, "content"))
                .or_else(|| non_empty(str_field(value, "description")))
                .or_else(|| non_empty(str_field(value, "subject")));
            text.map(|text| {
                ThinkingContent {
                    text: text.to_string(),
                    partial: value.get("delta").and_then(Value::as_bool).unwrap_or(false),
                }
                .into()
            })
        }
        "tool_use" => {
            let tool_name = non_empty(str_field(value, "tool_name")).ok_or_else(|| {
                AppError::Parse("gemini tool_use event is missing tool_name".to_string())
            })?;
            let tool_id = str_field(value, "tool_id").unwrap_or_default().to_string();
            if !tool_id.is_empty() {
                state.tool_names.insert(tool_id.clone(), tool_name.to_string());
            }
            Some(
                ToolUseContent {
                    tool_id,
                    tool_name: tool_name.to_string(),
                    input: value.get("parameters").cloned().unwrap_or(Value::Null),
                }
                .into(),
            )
        }
        "tool_result" => {
            let tool_id = str_field(value, "tool_id").unwrap_or_default().to_string();
            let is_error = str_field(value, "status") == Some("error");
            let mut output = value.get("output").map(stringify_json_value).unwrap_or_default();
            if let Some(message) = value
                .get("error")
                .and_then(|error| error.get("message"))
                .and_then(Value::as_str)
            {
                if output.is_empty() {
                    output = message.to_string();
                } else {
                    output = format!("{}\n{}", output, message);
                }
            }
            Some(
                ToolResultContent {
                    tool_name: state.tool_names.get(&tool_id).cloned().unwrap_or_default(),
                    tool_id,
                    output,
                    is_error,
                }
                .into(),
            )
        }
        "error" => {
            let mut content = error_content(value, "gemini reported an error");
            if let (EventContent::Error(error), Some(severity)) =
                (&mut content, str_field(value, "severity"))
            {
                error.code.get_or_insert_with(|| severity.to_string());
            }
            Some(content)
        }
        "result" => {
            if str_field(value, "status") == Some("error") {
                Some(error_content(value, "gemini run failed"))
            } else {
                let stats = value.get("stats");
                Some(
                    DoneContent {
                        usage: stats.and_then(gemini_usage),
                        duration_ms: stats
                            .and_then(|stats| stats.get("duration_ms"))
                            .and_then(Value::as_u64),
                        turns: None,
                    }
                    .into(),
                )
            }
        }
        _ => None,
    };
    Ok(content)
}

/// Reads both the flat stream stats and the per-model json-mode layout.
fn gemini_usage(stats: &Value) -> Option<TokenUsage> {
    let mut usage = TokenUsage::default();
    match stats.get("models").and_then(Value::as_object) {
        Some(models) => {
            for model in models.values() {
                let Some(tokens) = model.get("tokens") else {
                    continue;
                };
                usage.accumulate(&TokenUsage {
                    input_tokens: u64_field(tokens, "prompt"),
                    output_tokens: u64_field(tokens, "candidates"),
                    cached_tokens: u64_field(tokens, "cached"),
                });
            }
        }
        None => {
            usage.input_tokens = u64_field(stats, "input_tokens");
            usage.output_tokens = u64_field(stats, "output_tokens");
            usage.cached_tokens = u64_field(stats, "cached");
        }
    }
    (!usage.is_empty()).then_some(usage)
}

fn envelope_from_document(document: &Value) -> ResponseEnvelope {
    let error = document.get("error").filter(|error| !error.is_null()).map(|error| {
        error
            .get("message")
            .map(stringify_json_value)
            .unwrap_or_else(|| stringify_json_value(error))
    });
    ResponseEnvelope {
        content: str_field(document, "response").unwrap_or_default().trim().to_string(),
        session_id: non_empty(str_field(document, "session_id")).map(ToString::to_string),
        usage: document.get("stats").and_then(gemini_usage),
        error,
    }
}
