use super::flags::push_pair;
use super::{
    env_path, error_content, home_dir, map_options, non_empty, require_session_id, str_field,
    stringify_json_value, u64_field, Adapter, CommandSpec, ResponseEnvelope,
};
use crate::errors::{AppError, AppResult};
use crate::events::parser::ParserState;
use crate::events::{
    DoneContent, EventContent, InitContent, MessageContent, ProgressContent, ThinkingContent,
    TokenUsageContent, ToolResultContent, ToolUseContent,
};
use crate::models::{ApprovalMode, Backend, OutputFormat, SandboxMode, TokenUsage, UnifiedOptions};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_BINARY: &str = "codex";

#[derive(Debug, Clone)]
pub struct CodexAdapter {
    binary: String,
    env: BTreeMap<String, String>,
}

impl CodexAdapter {
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
        args.push("--skip-git-repo-check".to_string());
        args.extend(map_options(Backend::Codex, options)?.args());
        if prompt.starts_with('-') {
            args.push("--".to_string());
        }
        args.push(prompt.to_string());
        Ok(CommandSpec::new(&self.binary, args, options).with_env(&self.env))
    }
}

impl Default for CodexAdapter {
    fn default() -> Self {
        Self::new(DEFAULT_BINARY)
    }
}

#[async_trait]
impl Adapter for CodexAdapter {
    fn backend(&self) -> Backend {
        Backend::Codex
    }

    fn binary(&self) -> &str {
        &self.binary
    }

    fn separate_stderr(&self) -> bool {
        true
    }

    fn build_command(&self, prompt: &str, options: &UnifiedOptions) -> AppResult<CommandSpec> {
        self.validate_prompt(prompt)?;
        self.finish(vec!["exec".to_string()], prompt, options)
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
            vec![
                "exec".to_string(),
                "resume".to_string(),
                session_id.to_string(),
            ],
            prompt,
            options,
        )
    }

    fn parse_output(&self, raw: &str) -> ResponseEnvelope {
        let mut envelope = super::envelope_from_events(Backend::Codex, raw);
        if let Some(last) = extract_last_agent_message(raw) {
            envelope.content = last;
        }
        envelope
    }

    async fn cleanup_session(&self, backend_session_id: &str) -> AppResult<()> {
        let Some(root) = sessions_root(&self.env) else {
            return Ok(());
        };
        let session_id = backend_session_id.to_string();
        let removed = tokio::task::spawn_blocking(move || remove_rollouts(&root, &session_id))
            .await
            .map_err(|error| AppError::Internal(error.to_string()))??;
        tracing::debug!(removed, "removed codex rollout files");
        Ok(())
    }
}

pub(crate) fn model_alias(alias: &str) -> Option<&'static str> {
    match alias {
        "fast" | "quick" => Some("gpt-5.1-codex-mini"),
        "balanced" | "default" => Some("gpt-5.1-codex"),
        "best" | "powerful" => Some("gpt-5.1-codex-max"),
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
        ApprovalMode::Auto => Some("on-request"),
        ApprovalMode::None => Some("never"),
        ApprovalMode::Always => Some("untrusted"),
    };
    if let Some(approval) = approval {
        push_pair(&mut args, "--ask-for-approval", approval);
    }

    let sandbox = match options.sandbox_mode {
        SandboxMode::Default => None,
        SandboxMode::ReadOnly => Some("read-only"),
        SandboxMode::Workspace => Some("workspace-write"),
        SandboxMode::Full => Some("danger-full-access"),
    };
    if let Some(sandbox) = sandbox {
        push_pair(&mut args, "--sandbox", sandbox);
    }

    if matches!(options.output_format, OutputFormat::Json | OutputFormat::StreamJson) {
        args.push("--json".to_string());
    }

    if let Some(system_prompt) = non_empty(options.system_prompt.as_deref()) {
        push_pair(
            &mut args,
            "--config",
            format!("instructions={}", to_toml_value(system_prompt)),
        );
    }
    if let Some(max_tokens) = options.max_tokens {
        push_pair(
            &mut args,
            "--config",
            format!("model_max_output_tokens={}", max_tokens),
        );
    }
    for dir in &options.allowed_dirs {
        push_pair(&mut args, "--add-dir", dir.clone());
    }
    args
}

pub(crate) fn parse_event(
    value: &Value,
    state: &mut ParserState,
) -> AppResult<Option<EventContent>> {
    // Older releases wrap every event as {"id": .., "msg": {..}}.
    let value = match value.get("msg") {
        Some(inner) if inner.is_object() => inner,
        _ => value,
    };
    let event_type = str_field(value, "type").unwrap_or_default().to_ascii_lowercase();

    let content = match event_type.as_str() {
        "thread.started" => Some(init(value, "thread_id")?),
        "session_configured" => Some(init(value, "session_id")?),
        "turn.started" | "task_started" => Some(
            ProgressContent {
                stage: event_type.clone(),
            }
            .into(),
        ),
        "item.started" => item_started(value, state)?,
        "item.completed" => item_completed(value, state),
        "turn.completed" | "task_complete" => Some(
            DoneContent {
                usage: codex_usage(value.get("usage")),
                duration_ms: None,
                turns: None,
            }
            .into(),
        ),
        "turn.failed" | "error" | "stream_error" => {
            Some(error_content(value, "codex reported an error"))
        }
        "token_count" => token_count(value),
        "agent_message" => non_empty(str_field(value, "message"))
            .map(|text| MessageContent::assistant(text, false).into()),
        "agent_reasoning" => non_empty(str_field(value, "text")).map(|text| {
            ThinkingContent {
                text: text.to_string(),
                partial: false,
            }
            .into()
        }),
        other if other.ends_with("delta") => delta(value, state),
        _ => None,
    };
    Ok(content)
}

fn init(value: &Value, key: &str) -> AppResult<EventContent> {
    let session_id = non_empty(str_field(value, key)).ok_or_else(|| {
        AppError::Parse(format!("codex session event is missing {}", key))
    })?;
    Ok(InitContent {
        backend_session_id: session_id.to_string(),
        model: str_field(value, "model").map(ToString::to_string),
    }
    .into())
}

fn mcp_tool_name(item: &Value) -> Option<String> {
    let tool = non_empty(str_field(item, "tool").or_else(|| str_field(item, "tool_name")))?;
    Some(match non_empty(str_field(item, "server")) {
        Some(server) => format!("{}.{}", server, tool),
        None => tool.to_string(),
    })
}

fn item_started(value: &Value, state: &mut ParserState) -> AppResult<Option<EventContent>> {
    let Some(item) = value.get("item") else {
        return Ok(None);
    };
    let item_id = str_field(item, "id").unwrap_or_default().to_string();
    let item_type = str_field(item, "type").unwrap_or_default();
    if !item_id.is_empty() {
        state.item_types.insert(item_id.clone(), item_type.to_string());
    }

    let tool_name = match item_type {
        "command_execution" => "shell".to_string(),
        "file_change" => "file_change".to_string(),
        "web_search" => "web_search".to_string(),
        "mcp_tool_call" => mcp_tool_name(item).ok_or_else(|| {
            AppError::Parse("codex mcp_tool_call item is missing tool name".to_string())
        })?,
        _ => return Ok(None),
    };
    if !item_id.is_empty() {
        state.tool_names.insert(item_id.clone(), tool_name.clone());
    }
    Ok(Some(
        ToolUseContent {
            tool_id: item_id,
            tool_name,
            input: item.clone(),
        }
        .into(),
    ))
}

fn item_completed(value: &Value, state: &ParserState) -> Option<EventContent> {
    let item = value.get("item")?;
    let item_id = str_field(item, "id").unwrap_or_default().to_string();
    let item_type = str_field(item, "type").unwrap_or_default();
    let failed = str_field(item, "status") == Some("failed");

    let tool_result = |fallback_name: &str, output: String, is_error: bool| -> EventContent {
        ToolResultContent {
            tool_name: state
                .tool_names
                .get(&item_id)
                .cloned()
                .unwrap_or_else(|| fallback_name.to_string()),
            tool_id: item_id.clone(),
            output,
            is_error,
        }
        .into()
    };

    match item_type {
        "agent_message" => non_empty(str_field(item, "text"))
            .map(|text| MessageContent::assistant(text, false).into()),
        "reasoning" => non_empty(str_field(item, "text")).map(|text| {
            ThinkingContent {
                text: text.to_string(),
                partial: false,
            }
            .into()
        }),
        "command_execution" => {
            let exit_code = item.get("exit_code").and_then(Value::as_i64);
            Some(tool_result(
                "shell",
                str_field(item, "aggregated_output").unwrap_or_default().to_string(),
                failed || exit_code.is_some_and(|code| code != 0),
            ))
        }
        "file_change" => {
            let output = item
                .get("changes")
                .and_then(Value::as_array)
                .map(|changes| {
                    changes
                        .iter()
                        .map(|change| {
                            format!(
                                "{} {}",
                                str_field(change, "kind").unwrap_or("update"),
                                str_field(change, "path").unwrap_or_default()
                            )
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .unwrap_or_default();
            Some(tool_result("file_change", output, failed))
        }
        "mcp_tool_call" => {
            let error = item.get("error").filter(|error| !error.is_null());
            let output = match error {
                Some(error) => error
                    .get("message")
                    .map(stringify_json_value)
                    .unwrap_or_else(|| stringify_json_value(error)),
                None => item.get("result").map(stringify_json_value).unwrap_or_default(),
            };
            let name = mcp_tool_name(item).unwrap_or_else(|| "mcp".to_string());
            Some(tool_result(&name, output, failed || error.is_some()))
        }
        "web_search" => Some(tool_result(
            "web_search",
            str_field(item, "query").unwrap_or_default().to_string(),
            failed,
        )),
        "error" => Some(error_content(item, "codex item failed")),
        _ => None,
    }
}

fn delta(value: &Value, state: &ParserState) -> Option<EventContent> {
    let item = value.get("item");
    let item_id = str_field(value, "item_id")
        .or_else(|| item.and_then(|item| str_field(item, "id")))
        .unwrap_or_default();
    let item_type = item
        .and_then(|item| str_field(item, "type"))
        .or_else(|| state.item_types.get(item_id).map(String::as_str))
        .unwrap_or_default();
    let text = match value.get("delta") {
        Some(Value::String(text)) => text.as_str(),
        Some(delta) => str_field(delta, "text")?,
        None => return None,
    };
    if text.is_empty() {
        return None;
    }

    let event_type = str_field(value, "type").unwrap_or_default();
    if item_type.contains("reason") || event_type.contains("reason") {
        Some(
            ThinkingContent {
                text: text.to_string(),
                partial: true,
            }
            .into(),
        )
    } else {
        Some(MessageContent::assistant(text, true).into())
    }
}

fn token_count(value: &Value) -> Option<EventContent> {
    let info = value.get("info").filter(|info| info.is_object());
    let source = info
        .and_then(|info| info.get("last_token_usage").or_else(|| info.get("total_token_usage")))
        .or(Some(value));
    codex_usage(source).map(|usage| TokenUsageContent { usage }.into())
}

fn codex_usage(value: Option<&Value>) -> Option<TokenUsage> {
    let usage = value.filter(|usage| usage.is_object())?;
    let usage = TokenUsage {
        input_tokens: u64_field(usage, "input_tokens"),
        output_tokens: u64_field(usage, "output_tokens"),
        cached_tokens: u64_field(usage, "cached_input_tokens"),
    };
    (!usage.is_empty()).then_some(usage)
}

fn to_toml_value<T: serde::Serialize>(value: T) -> String {
    serde_json::to_string(&value).unwrap_or_else(|_| "\"\"".to_string())
}

fn extract_last_agent_message(raw: &str) -> Option<String> {
    let mut last = None;
    for line in raw.lines() {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            continue;
        }
        let Ok(parsed) = serde_json::from_str::<Value>(trimmed) else {
            continue;
        };
        if str_field(&parsed, "type") != Some("item.completed") {
            continue;
        }
        let Some(item) = parsed.get("item") else {
            continue;
        };
        if str_field(item, "type") != Some("agent_message") {
            continue;
        }
        if let Some(text) = non_empty(str_field(item, "text")) {
            last = Some(text.to_string());
        }
    }
    last
}

fn sessions_root(env: &BTreeMap<String, String>) -> Option<PathBuf> {
    match env_path(env, "CODEX_HOME") {
        Some(codex_home) => Some(codex_home.join("sessions")),
        None => env_path(env, "HOME")
            .or_else(home_dir)
            .map(|home| home.join(".codex").join("sessions")),
    }
}

/// Walks the dated rollout tree removing files that name `session_id`.
fn remove_rollouts(root: &Path, session_id: &str) -> std::io::Result<usize> {
    if !root.is_dir() {
        return Ok(0);
    }
    let mut removed = 0;
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
                continue;
            }
            let matches = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(".jsonl") && name.contains(session_id));
            if matches {
                std::fs::remove_file(&path)?;
                removed += 1;
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::{parse_event, remove_rollouts, CodexAdapter};
    use crate::adapters::Adapter;
    use crate::events::parser::ParserState;
    use crate::events::EventContent;
    use crate::models::{ApprovalMode, OutputFormat, SandboxMode, UnifiedOptions};
    use std::collections::BTreeMap;

    fn parse(line: &str, state: &mut ParserState) -> Option<EventContent> {
        let value = serde_json::from_str(line).expect("json");
        parse_event(&value, state).expect("parse")
    }

    #[test]
    fn builds_exec_command_with_prompt_last() {
        let adapter = CodexAdapter::default();
        let options = UnifiedOptions {
            model: "fast".to_string(),
            approval_mode: ApprovalMode::None,
            sandbox_mode: SandboxMode::Workspace,
            output_format: OutputFormat::StreamJson,
            system_prompt: Some("be \"brief\"".to_string()),
            max_tokens: Some(512),
            extra_flags: vec!["--oss".to_string()],
            ..Default::default()
        };
        let command = adapter.build_command("fix it", &options).expect("command");
        assert_eq!(
            command.args,
            vec![
                "exec",
                "--skip-git-repo-check",
                "--model",
                "gpt-5.1-codex-mini",
                "--ask-for-approval",
                "never",
                "--sandbox",
                "workspace-write",
                "--json",
                "--config",
                "instructions=\"be \\\"brief\\\"\"",
                "--config",
                "model_max_output_tokens=512",
                "--oss",
                "fix it",
            ]
        );
    }

    #[test]
    fn resume_threads_session_as_subcommand_argument() {
        let adapter = CodexAdapter::default();
        let options = UnifiedOptions {
            output_format: OutputFormat::Text,
            ..Default::default()
        };
        let command = adapter
            .build_resume_command("thread-7", "-continue", &options)
            .expect("command");
        assert_eq!(
            command.args,
            vec!["exec", "resume", "thread-7", "--skip-git-repo-check", "--", "-continue"]
        );
    }

    #[test]
    fn parses_thread_lifecycle() {
        let mut state = ParserState::default();
        assert!(matches!(
            parse(r#"{"type":"thread.started","thread_id":"th-1"}"#, &mut state),
            Some(EventContent::Init(init)) if init.backend_session_id == "th-1"
        ));
        assert!(matches!(
            parse(r#"{"type":"turn.started"}"#, &mut state),
            Some(EventContent::Progress(progress)) if progress.stage == "turn.started"
        ));
        match parse(
            r#"{"type":"turn.completed","usage":{"input_tokens":100,"cached_input_tokens":40,"output_tokens":7}}"#,
            &mut state,
        ) {
            Some(EventContent::Done(done)) => {
                let usage = done.usage.expect("usage");
                assert_eq!(usage.input_tokens, 100);
                assert_eq!(usage.cached_tokens, 40);
                assert_eq!(usage.output_tokens, 7);
            }
            other => panic!("unexpected {:?}", other),
        }
        match parse(r#"{"type":"turn.failed","error":{"message":"quota exceeded"}}"#, &mut state) {
            Some(EventContent::Error(error)) => assert_eq!(error.message, "quota exceeded"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn thread_started_without_id_is_a_parse_error() {
        let value = serde_json::json!({ "type": "thread.started" });
        assert!(parse_event(&value, &mut ParserState::default()).is_err());
    }

    #[test]
    fn command_items_become_tool_use_and_result() {
        let mut state = ParserState::default();
        match parse(
            r#"{"type":"item.started","item":{"id":"item_1","type":"command_execution","command":"ls","status":"in_progress"}}"#,
            &mut state,
        ) {
            Some(EventContent::ToolUse(tool)) => {
                assert_eq!(tool.tool_id, "item_1");
                assert_eq!(tool.tool_name, "shell");
                assert_eq!(tool.input["command"], "ls");
            }
            other => panic!("unexpected {:?}", other),
        }
        match parse(
            r#"{"type":"item.completed","item":{"id":"item_1","type":"command_execution","aggregated_output":"nope","exit_code":1,"status":"completed"}}"#,
            &mut state,
        ) {
            Some(EventContent::ToolResult(result)) => {
                assert_eq!(result.tool_name, "shell");
                assert_eq!(result.output, "nope");
                assert!(result.is_error);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn mcp_calls_are_named_by_server_and_tool() {
        let mut state = ParserState::default();
        match parse(
            r#"{"type":"item.started","item":{"id":"m1","type":"mcp_tool_call","server":"docs","tool":"search","arguments":{"q":"x"}}}"#,
            &mut state,
        ) {
            Some(EventContent::ToolUse(tool)) => assert_eq!(tool.tool_name, "docs.search"),
            other => panic!("unexpected {:?}", other),
        }
        match parse(
            r#"{"type":"item.completed","item":{"id":"m1","type":"mcp_tool_call","server":"docs","tool":"search","status":"failed","error":{"message":"offline"}}}"#,
            &mut state,
        ) {
            Some(EventContent::ToolResult(result)) => {
                assert_eq!(result.output, "offline");
                assert!(result.is_error);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn messages_reasoning_and_deltas() {
        let mut state = ParserState::default();
        assert!(matches!(
            parse(r#"{"type":"item.completed","item":{"id":"i2","type":"agent_message","text":"Done."}}"#, &mut state),
            Some(EventContent::Message(message)) if message.text == "Done." && !message.partial
        ));
        assert!(matches!(
            parse(r#"{"type":"item.completed","item":{"id":"i3","type":"reasoning","text":"think"}}"#, &mut state),
            Some(EventContent::Thinking(thinking)) if !thinking.partial
        ));
        parse(r#"{"type":"item.started","item":{"id":"r1","type":"reasoning"}}"#, &mut state);
        assert!(matches!(
            parse(r#"{"type":"item.delta","item_id":"r1","delta":{"text":"hm"}}"#, &mut state),
            Some(EventContent::Thinking(thinking)) if thinking.partial && thinking.text == "hm"
        ));
        assert!(matches!(
            parse(r#"{"type":"item.agent_message.delta","item_id":"a1","delta":"He"}"#, &mut state),
            Some(EventContent::Message(message)) if message.partial && message.text == "He"
        ));
    }

    #[test]
    fn legacy_token_count_is_unwrapped() {
        let mut state = ParserState::default();
        match parse(
            r#"{"id":"0","msg":{"type":"token_count","info":{"last_token_usage":{"input_tokens":9,"output_tokens":3}}}}"#,
            &mut state,
        ) {
            Some(EventContent::TokenUsage(content)) => {
                assert_eq!(content.usage.input_tokens, 9);
                assert_eq!(content.usage.output_tokens, 3);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parse_output_keeps_last_agent_message() {
        let raw = concat!(
            "{\"type\":\"thread.started\",\"thread_id\":\"th-2\"}\n",
            "{\"type\":\"item.completed\",\"item\":{\"id\":\"a\",\"type\":\"agent_message\",\"text\":\"Looking...\"}}\n",
            "{\"type\":\"item.completed\",\"item\":{\"id\":\"b\",\"type\":\"agent_message\",\"text\":\"All done\"}}\n",
            "{\"type\":\"turn.completed\",\"usage\":{\"input_tokens\":5,\"output_tokens\":2}}\n"
        );
        let envelope = CodexAdapter::default().parse_output(raw);
        assert_eq!(envelope.content, "All done");
        assert_eq!(envelope.session_id.as_deref(), Some("th-2"));
        assert_eq!(envelope.usage.expect("usage").total(), 7);
    }

    #[test]
    fn parse_output_counts_a_turn_once() {
        let raw = concat!(
            "{\"type\":\"thread.started\",\"thread_id\":\"th-3\"}\n",
            "{\"id\":\"0\",\"msg\":{\"type\":\"token_count\",\"info\":{\"last_token_usage\":{\"input_tokens\":10,\"output_tokens\":5}}}}\n",
            "{\"type\":\"item.completed\",\"item\":{\"id\":\"a\",\"type\":\"agent_message\",\"text\":\"ok\"}}\n",
            "{\"type\":\"turn.completed\",\"usage\":{\"input_tokens\":10,\"output_tokens\":5}}\n"
        );
        let usage = CodexAdapter::default().parse_output(raw).usage.expect("usage");
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 5);
    }

    #[test]
    fn removes_matching_rollout_files() {
        let root = tempfile::tempdir().expect("tempdir");
        let day = root.path().join("2025").join("01").join("02");
        std::fs::create_dir_all(&day).expect("mkdir");
        let target = day.join("rollout-2025-01-02T10-00-00-th-9.jsonl");
        let other = day.join("rollout-2025-01-02T10-00-00-th-1.jsonl");
        std::fs::write(&target, "{}").expect("write");
        std::fs::write(&other, "{}").expect("write");

        assert_eq!(remove_rollouts(root.path(), "th-9").expect("remove"), 1);
        assert!(!target.exists());
        assert!(other.exists());
    }

    #[tokio::test]
    async fn configured_codex_home_drives_commands_and_cleanup() {
        let codex_home = tempfile::tempdir().expect("tempdir");
        let day = codex_home.path().join("sessions").join("2025").join("03").join("04");
        std::fs::create_dir_all(&day).expect("mkdir");
        let target = day.join("rollout-2025-03-04T08-00-00-th-5.jsonl");
        std::fs::write(&target, "{}").expect("write");

        let env = BTreeMap::from([(
            "CODEX_HOME".to_string(),
            codex_home.path().to_string_lossy().to_string(),
        )]);
        let adapter = CodexAdapter::default().with_env(env.clone());
        let command = adapter
            .build_command("hi", &UnifiedOptions::default())
            .expect("command");
        assert_eq!(command.env, env);

        adapter.cleanup_session("th-5").await.expect("cleanup");
        assert!(!target.exists());
    }
}
