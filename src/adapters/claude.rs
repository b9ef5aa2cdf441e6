use super::flags::push_pair;
use super::{
    env_path, error_content, home_dir, map_options, non_empty, require_session_id, str_field,
    stringify_json_value, u64_field, Adapter, CommandSpec, ResponseEnvelope,
};
use crate::errors::{AppError, AppResult};
use crate::events::parser::ParserState;
use crate::events::{
    DoneContent, EventContent, InitContent, MessageContent, ThinkingContent, ToolResultContent,
    ToolUseContent,
};
use crate::models::{ApprovalMode, Backend, OutputFormat, TokenUsage, UnifiedOptions};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;

pub const DEFAULT_BINARY: &str = "claude";

#[derive(Debug, Clone)]
pub struct ClaudeAdapter {
    binary: String,
    env: BTreeMap<String, String>,
}

impl ClaudeAdapter {
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
}

impl Default for ClaudeAdapter {
    fn default() -> Self {
        Self::new(DEFAULT_BINARY)
    }
}

#[async_trait]
impl Adapter for ClaudeAdapter {
    fn backend(&self) -> Backend {
        Backend::Claude
    }

    fn binary(&self) -> &str {
        &self.binary
    }

    fn separate_stderr(&self) -> bool {
        false
    }

    fn build_command(&self, prompt: &str, options: &UnifiedOptions) -> AppResult<CommandSpec> {
        self.validate_prompt(prompt)?;
        let mapped = map_options(Backend::Claude, options)?;
        let mut args = vec!["-p".to_string(), prompt.to_string()];
        args.extend(mapped.args());
        Ok(CommandSpec::new(&self.binary, args, options).with_env(&self.env))
    }

    fn build_resume_command(
        &self,
        session_id: &str,
        prompt: &str,
        options: &UnifiedOptions,
    ) -> AppResult<CommandSpec> {
        self.validate_prompt(prompt)?;
        let session_id = require_session_id(session_id)?;
        let mapped = map_options(Backend::Claude, options)?;
        let mut args = vec![
            "-p".to_string(),
            prompt.to_string(),
            "--resume".to_string(),
            session_id.to_string(),
        ];
        args.extend(mapped.args());
        Ok(CommandSpec::new(&self.binary, args, options).with_env(&self.env))
    }

    fn parse_output(&self, raw: &str) -> ResponseEnvelope {
        match find_result(raw) {
            Some(result) => envelope_from_result(&result),
            None => super::envelope_from_events(Backend::Claude, raw),
        }
    }

    async fn cleanup_session(&self, backend_session_id: &str) -> AppResult<()> {
        let Some(home) = env_path(&self.env, "HOME").or_else(home_dir) else {
            return Ok(());
        };
        let projects = home.join(".claude").join("projects");
        let file_name = format!("{}.jsonl", backend_session_id);
        let mut entries = match tokio::fs::read_dir(&projects).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(error) => return Err(error.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let candidate = entry.path().join(&file_name);
            if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
                tokio::fs::remove_file(&candidate).await?;
                tracing::debug!(path = %candidate.display(), "removed claude session file");
            }
        }
        Ok(())
    }
}

pub(crate) fn model_alias(alias: &str) -> Option<&'static str> {
    match alias {
        "fast" | "quick" => Some("haiku"),
        "balanced" | "default" => Some("sonnet"),
        "best" | "powerful" => Some("opus"),
        _ => None,
    }
}

pub(crate) fn derived_flags(options: &UnifiedOptions, model: &str) -> Vec<String> {
    let mut args = Vec::new();
    if !model.is_empty() {
        push_pair(&mut args, "--model", model);
    }

    let permission_mode = match options.approval_mode {
        ApprovalMode::Default => None,
        ApprovalMode::Auto => Some("acceptEdits"),
        ApprovalMode::None => Some("bypassPermissions"),
        ApprovalMode::Always => Some("default"),
    };
    if let Some(mode) = permission_mode {
        push_pair(&mut args, "--permission-mode", mode);
    }

    match options.output_format {
        OutputFormat::Default => {}
        OutputFormat::Text => push_pair(&mut args, "--output-format", "text"),
        OutputFormat::Json => push_pair(&mut args, "--output-format", "json"),
        OutputFormat::StreamJson => {
            // stream-json is rejected by the CLI in print mode without --verbose.
            push_pair(&mut args, "--output-format", "stream-json");
            args.push("--verbose".to_string());
        }
    }
    if options.verbose && !args.iter().any(|arg| arg == "--verbose") {
        args.push("--verbose".to_string());
    }

    if let Some(system_prompt) = non_empty(options.system_prompt.as_deref()) {
        push_pair(&mut args, "--system-prompt", system_prompt);
    }
    if let Some(max_turns) = options.max_turns {
        push_pair(&mut args, "--max-turns", max_turns.to_string());
    }
    for dir in &options.allowed_dirs {
        push_pair(&mut args, "--add-dir", dir.clone());
    }
    if !options.allowed_tools.is_empty() {
        push_pair(&mut args, "--allowedTools", options.allowed_tools.join(","));
    }
    if options.ephemeral {
        args.push("--no-session-persistence".to_string());
    }
    args
}

pub(crate) fn parse_event(
    value: &Value,
    state: &mut ParserState,
) -> AppResult<Option<EventContent>> {
    match str_field(value, "type").unwrap_or_default() {
        "system" => {
            if str_field(value, "subtype") != Some("init") {
                return Ok(None);
            }
            let session_id = non_empty(str_field(value, "session_id")).ok_or_else(|| {
                AppError::Parse("claude init event is missing session_id".to_string())
            })?;
            Ok(Some(
                InitContent {
                    backend_session_id: session_id.to_string(),
                    model: str_field(value, "model").map(ToString::to_string),
                }
                .into(),
            ))
        }
        "assistant" => parse_assistant(value, state),
        "user" => Ok(parse_tool_result(value, state)),
        "stream_event" => Ok(parse_stream_delta(value)),
        "result" => Ok(Some(result_content(value))),
        "error" => Ok(Some(error_content(value, "claude reported an error"))),
        _ => Ok(None),
    }
}

fn content_blocks(value: &Value) -> &[Value] {
    value
        .get("message")
        .and_then(|message| message.get("content"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// One event per line: a tool call wins over text, text over thinking.
/// Text that shares a line with a tool call is not reported; the CLI writes
/// one content block per assistant line in stream-json mode.
fn parse_assistant(value: &Value, state: &mut ParserState) -> AppResult<Option<EventContent>> {
    let blocks = content_blocks(value);

    if let Some(tool) = blocks
        .iter()
        .find(|block| str_field(block, "type") == Some("tool_use"))
    {
        let tool_name = non_empty(str_field(tool, "name")).ok_or_else(|| {
            AppError::Parse("claude tool_use block is missing name".to_string())
        })?;
        let tool_id = str_field(tool, "id").unwrap_or_default().to_string();
        if !tool_id.is_empty() {
            state.tool_names.insert(tool_id.clone(), tool_name.to_string());
        }
        return Ok(Some(
            ToolUseContent {
                tool_id,
                tool_name: tool_name.to_string(),
                input: tool.get("input").cloned().unwrap_or(Value::Null),
            }
            .into(),
        ));
    }

    let text = blocks
        .iter()
        .filter(|block| str_field(block, "type") == Some("text"))
        .filter_map(|block| str_field(block, "text"))
        .collect::<String>();
    if !text.is_empty() {
        return Ok(Some(MessageContent::assistant(text, false).into()));
    }

    let thinking = blocks
        .iter()
        .filter(|block| str_field(block, "type") == Some("thinking"))
        .filter_map(|block| str_field(block, "thinking"))
        .collect::<String>();
    if !thinking.is_empty() {
        return Ok(Some(
            ThinkingContent {
                text: thinking,
                partial: false,
            }
            .into(),
        ));
    }
    Ok(None)
}

fn parse_tool_result(value: &Value, state: &ParserState) -> Option<EventContent> {
    let block = content_blocks(value)
        .iter()
        .find(|block| str_field(block, "type") == Some("tool_result"))?;
    let tool_id = str_field(block, "tool_use_id").unwrap_or_default().to_string();
    let output = match block.get("content") {
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| str_field(part, "text"))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => stringify_json_value(other),
        None => String::new(),
    };
    Some(
        ToolResultContent {
            tool_name: state.tool_names.get(&tool_id).cloned().unwrap_or_default(),
            tool_id,
            output,
            is_error: block
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }
        .into(),
    )
}

fn parse_stream_delta(value: &Value) -> Option<EventContent> {
    let event = value.get("event")?;
    if str_field(event, "type") != Some("content_block_delta") {
        return None;
    }
    let delta = event.get("delta")?;
    match str_field(delta, "type")? {
        "text_delta" => Some(MessageContent::assistant(str_field(delta, "text")?, true).into()),
        "thinking_delta" => Some(
            ThinkingContent {
                text: str_field(delta, "thinking")?.to_string(),
                partial: true,
            }
            .into(),
        ),
        _ => None,
    }
}

fn is_error_result(value: &Value) -> bool {
    value.get("is_error").and_then(Value::as_bool).unwrap_or(false)
        || str_field(value, "subtype").is_some_and(|subtype| subtype.starts_with("error"))
}

fn result_content(value: &Value) -> EventContent {
    if is_error_result(value) {
        return crate::events::ErrorContent {
            message: result_error_message(value),
            code: str_field(value, "subtype").map(ToString::to_string),
        }
        .into();
    }
    DoneContent {
        usage: claude_usage(value.get("usage")),
        duration_ms: value.get("duration_ms").and_then(Value::as_u64),
        turns: value
            .get("num_turns")
            .and_then(Value::as_u64)
            .and_then(|turns| u32::try_from(turns).ok()),
    }
    .into()
}

fn result_error_message(value: &Value) -> String {
    if let Some(result) = non_empty(str_field(value, "result")) {
        return result.to_string();
    }
    let errors = value
        .get("errors")
        .and_then(Value::as_array)
        .map(|errors| {
            errors
                .iter()
                .map(stringify_json_value)
                .filter(|error| !error.is_empty())
                .collect::<Vec<_>>()
                .join("; ")
        })
        .unwrap_or_default();
    if !errors.is_empty() {
        return errors;
    }
    str_field(value, "subtype")
        .unwrap_or("claude run failed")
        .to_string()
}

fn claude_usage(value: Option<&Value>) -> Option<TokenUsage> {
    let usage = value.filter(|usage| usage.is_object())?;
    let usage = TokenUsage {
        input_tokens: u64_field(usage, "input_tokens"),
        output_tokens: u64_field(usage, "output_tokens"),
        cached_tokens: u64_field(usage, "cache_read_input_tokens"),
    };
    (!usage.is_empty()).then_some(usage)
}

/// Finds the trailing `result` object, whether printed alone or as the last
/// element of a verbose JSON array.
fn find_result(raw: &str) -> Option<Value> {
    raw.lines().rev().find_map(|line| {
        let trimmed = line.trim();
        if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
            return None;
        }
        match serde_json::from_str::<Value>(trimmed).ok()? {
            Value::Array(items) => items
                .into_iter()
                .rev()
                .find(|item| str_field(item, "type") == Some("result")),
            value if str_field(&value, "type") == Some("result") => Some(value),
            _ => None,
        }
    })
}

fn envelope_from_result(result: &Value) -> ResponseEnvelope {
    let failed = is_error_result(result);
    ResponseEnvelope {
        content: if failed {
            String::new()
        } else {
            str_field(result, "result").unwrap_or_default().trim().to_string()
        },
        session_id: non_empty(str_field(result, "session_id")).map(ToString::to_string),
        usage: claude_usage(result.get("usage")),
        error: failed.then(|| result_error_message(result)),
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_event, ClaudeAdapter};
    use crate::adapters::Adapter;
    use std::collections::BTreeMap;
    use crate::events::parser::ParserState;
    use crate::events::EventContent;
    use crate::models::{ApprovalMode, OutputFormat, SandboxMode, UnifiedOptions};

    fn parse(line: &str, state: &mut ParserState) -> Option<EventContent> {
        let value = serde_json::from_str(line).expect("json");
        parse_event(&value, state).expect("parse")
    }

    #[test]
    fn builds_print_mode_command() {
        let adapter = ClaudeAdapter::default();
        let options = UnifiedOptions {
            model: "best".to_string(),
            approval_mode: ApprovalMode::Auto,
            sandbox_mode: SandboxMode::ReadOnly,
            output_format: OutputFormat::StreamJson,
            verbose: true,
            system_prompt: Some("be terse".to_string()),
            max_turns: Some(3),
            allowed_dirs: vec!["/tmp/extra".to_string()],
            ephemeral: true,
            extra_flags: vec!["--debug".to_string()],
            ..Default::default()
        };
        let command = adapter.build_command("hello", &options).expect("command");
        assert_eq!(command.program, "claude");
        assert_eq!(
            command.args,
            vec![
                "-p",
                "hello",
                "--model",
                "opus",
                "--permission-mode",
                "acceptEdits",
                "--output-format",
                "stream-json",
                "--verbose",
                "--system-prompt",
                "be terse",
                "--max-turns",
                "3",
                "--add-dir",
                "/tmp/extra",
                "--no-session-persistence",
                "--debug",
            ]
        );
        assert!(command.cwd.is_none());
    }

    #[test]
    fn resume_threads_session_as_flag() {
        let adapter = ClaudeAdapter::default();
        let command = adapter
            .build_resume_command("sess-9", "again", &UnifiedOptions::default())
            .expect("command");
        assert_eq!(command.args, vec!["-p", "again", "--resume", "sess-9"]);
        assert!(adapter
            .build_resume_command("  ", "again", &UnifiedOptions::default())
            .is_err());
    }

    #[test]
    fn parses_init_and_message_blocks() {
        let mut state = ParserState::default();
        match parse(
            r#"{"type":"system","subtype":"init","session_id":"abc","model":"claude-opus"}"#,
            &mut state,
        ) {
            Some(EventContent::Init(init)) => {
                assert_eq!(init.backend_session_id, "abc");
                assert_eq!(init.model.as_deref(), Some("claude-opus"));
            }
            other => panic!("unexpected {:?}", other),
        }

        match parse(
            r#"{"type":"assistant","message":{"content":[{"type":"thinking","thinking":"hmm"},{"type":"text","text":"Hi"}]}}"#,
            &mut state,
        ) {
            Some(EventContent::Message(message)) => {
                assert_eq!(message.text, "Hi");
                assert!(!message.partial);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn tool_results_recall_tool_names() {
        let mut state = ParserState::default();
        match parse(
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"Bash","input":{"command":"ls"}}]}}"#,
            &mut state,
        ) {
            Some(EventContent::ToolUse(tool)) => {
                assert_eq!(tool.tool_name, "Bash");
                assert_eq!(tool.input["command"], "ls");
            }
            other => panic!("unexpected {:?}", other),
        }
        match parse(
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":[{"type":"text","text":"a.txt"}],"is_error":false}]}}"#,
            &mut state,
        ) {
            Some(EventContent::ToolResult(result)) => {
                assert_eq!(result.tool_name, "Bash");
                assert_eq!(result.output, "a.txt");
                assert!(!result.is_error);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn tool_use_without_name_is_a_parse_error() {
        let value = serde_json::json!({
            "type": "assistant",
            "message": { "content": [{ "type": "tool_use", "id": "t1" }] }
        });
        assert!(parse_event(&value, &mut ParserState::default()).is_err());
    }

    #[test]
    fn stream_deltas_are_partial() {
        let mut state = ParserState::default();
        match parse(
            r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"He"}}}"#,
            &mut state,
        ) {
            Some(EventContent::Message(message)) => assert!(message.partial),
            other => panic!("unexpected {:?}", other),
        }
        match parse(
            r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"thinking_delta","thinking":"so"}}}"#,
            &mut state,
        ) {
            Some(EventContent::Thinking(thinking)) => assert!(thinking.partial),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn result_maps_to_done_or_error() {
        let mut state = ParserState::default();
        match parse(
            r#"{"type":"result","subtype":"success","is_error":false,"duration_ms":42,"num_turns":2,"result":"ok","usage":{"input_tokens":10,"output_tokens":5,"cache_read_input_tokens":3}}"#,
            &mut state,
        ) {
            Some(EventContent::Done(done)) => {
                let usage = done.usage.expect("usage");
                assert_eq!(usage.input_tokens, 10);
                assert_eq!(usage.output_tokens, 5);
                assert_eq!(usage.cached_tokens, 3);
                assert_eq!(done.duration_ms, Some(42));
                assert_eq!(done.turns, Some(2));
            }
            other => panic!("unexpected {:?}", other),
        }
        match parse(
            r#"{"type":"result","subtype":"error_max_turns","is_error":true}"#,
            &mut state,
        ) {
            Some(EventContent::Error(error)) => {
                assert_eq!(error.message, "error_max_turns");
                assert_eq!(error.code.as_deref(), Some("error_max_turns"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parse_output_reads_trailing_result_after_noise() {
        let adapter = ClaudeAdapter::default();
        let raw = concat!(
            "{\"type\":\"result\",\"subtype\":\"success\",\"is_error\":false,\"result\":\"4\",\"session_id\":\"s-1\",\"usage\":{\"input_tokens\":2,\"output_tokens\":1}}\n",
            "some stderr line\n"
        );
        let envelope = adapter.parse_output(raw);
        assert_eq!(envelope.content, "4");
        assert_eq!(envelope.session_id.as_deref(), Some("s-1"));
        assert_eq!(envelope.usage.expect("usage").output_tokens, 1);
        assert!(envelope.error.is_none());

        let plain = adapter.parse_output("just text\n");
        assert_eq!(plain.content, "just text");
    }

    #[test]
    fn tool_call_wins_over_text_on_a_mixed_line() {
        let mut state = ParserState::default();
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Let me look."},{"type":"tool_use","id":"t9","name":"Read","input":{}}]}}"#;
        match parse(line, &mut state) {
            Some(EventContent::ToolUse(tool)) => assert_eq!(tool.tool_name, "Read"),
            other => panic!("unexpected content {:?}", other),
        }
    }

    #[tokio::test]
    async fn cleanup_removes_project_session_file() {
        let home = tempfile::tempdir().expect("tempdir");
        let project = home.path().join(".claude").join("projects").join("-work-repo");
        std::fs::create_dir_all(&project).expect("mkdir");
        let target = project.join("sess-42.jsonl");
        let other = project.join("sess-7.jsonl");
        std::fs::write(&target, "{}").expect("write");
        std::fs::write(&other, "{}").expect("write");

        let adapter = ClaudeAdapter::default().with_env(BTreeMap::from([(
            "HOME".to_string(),
            home.path().to_string_lossy().to_string(),
        )]));
        adapter.cleanup_session("sess-42").await.expect("cleanup");
        assert!(!target.exists());
        assert!(other.exists());

        let empty = tempfile::tempdir().expect("tempdir");
        let adapter = ClaudeAdapter::default().with_env(BTreeMap::from([(
            "HOME".to_string(),
            empty.path().to_string_lossy().to_string(),
        )]));
        adapter.cleanup_session("sess-42").await.expect("missing projects dir");
    }
}
