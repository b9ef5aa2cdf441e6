use crate::adapters::flags::{resolve_backend_model, warn_unsupported_once};
use crate::adapters::{Adapter, BackendRegistry, CommandSpec};
use crate::config::GatewayConfig;
use crate::errors::{AppError, AppResult};
use crate::events::parser::line_too_long;
use crate::events::{
    DoneContent, EventCollector, EventParser, UnifiedEvent, MAX_STREAM_LINE_BYTES,
};
use crate::harness::line_buffer::LineBuffer;
use crate::harness::stderr_filter::{filter_stderr, is_cli_missing_line};
use crate::models::{
    Backend, OutputFormat, PromptRequest, PromptResult, SessionRecord,
};
use crate::policy::{validate_extra_flags, PolicyEngine};
use crate::session::{InMemorySessionStore, SessionStore};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::time::{timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const READ_CHUNK_BYTES: usize = 8192;
const TERMINATE_GRACE: Duration = Duration::from_millis(1500);
const KILL_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExecutionMode {
    Capture,
    Stream,
}

/// A request that passed validation and is ready to spawn.
pub(crate) struct PreparedRun {
    pub adapter: Arc<dyn Adapter>,
    pub backend: Backend,
    pub prompt: String,
    /// Alias-resolved model, empty when the backend picks its own.
    pub model: String,
    pub command: CommandSpec,
    pub ephemeral: bool,
    /// Stored session this run continues, if any.
    pub session: Option<SessionRecord>,
}

impl PreparedRun {
    fn backend_name(&self) -> &'static str {
        self.backend.as_str()
    }
}

/// Runs prompts against backend CLIs. Cheap to clone; clones share the
/// registry, session store and configuration.
#[derive(Clone)]
pub struct Executor {
    registry: Arc<BackendRegistry>,
    sessions: Arc<dyn SessionStore>,
    config: Arc<GatewayConfig>,
    policy: Arc<PolicyEngine>,
}

impl Executor {
    pub fn new(config: GatewayConfig) -> Self {
        let registry = Arc::new(BackendRegistry::from_config(&config));
        Self::with_parts(config, registry, Arc::new(InMemorySessionStore::new()))
    }

    pub fn with_parts(
        config: GatewayConfig,
        registry: Arc<BackendRegistry>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            policy: Arc::new(PolicyEngine::from_config(&config)),
            registry,
            sessions,
            config: Arc::new(config),
        }
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> Arc<dyn SessionStore> {
        self.sessions.clone()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub(crate) async fn prepare(
        &self,
        request: &PromptRequest,
        mode: ExecutionMode,
    ) -> AppResult<PreparedRun> {
        if request.backend.trim().is_empty() {
            return Err(AppError::Request("backend is required".to_string()));
        }
        if request.prompt.trim().is_empty() {
            return Err(AppError::Request("prompt is required".to_string()));
        }
        if request.interactive {
            return Err(AppError::Request(
                "interactive execution is not supported".to_string(),
            ));
        }
        validate_extra_flags(&request.extra_flags)?;

        let adapter = self.registry.get(&request.backend)?;
        let backend = adapter.backend();
        let dry_run =
            request.dry_run || self.config.dry_run || self.config.unified_defaults.dry_run;
        if !dry_run && !self.registry.is_available(adapter.name())? {
            return Err(AppError::BackendUnavailable(format!(
                "backend {} is not available: '{}' was not found on PATH",
                backend,
                adapter.binary()
            )));
        }

        let mut options = request.unified_options();
        options.model = request
            .model
            .as_deref()
            .map(str::trim)
            .filter(|model| !model.is_empty())
            .or_else(|| self.config.default_model_for(backend))
            .unwrap_or_default()
            .to_string();
        options.fill_gaps(&self.config.unified_defaults);
        if let Some(backend_config) = self.config.backend(backend) {
            options.fill_gaps(&backend_config.overrides());
        }
        options.dry_run = dry_run;
        options.interactive = false;
        options.output_format = match mode {
            ExecutionMode::Stream => OutputFormat::StreamJson,
            ExecutionMode::Capture => match options.output_format {
                OutputFormat::Default if self.config.default_output_format == OutputFormat::Default => {
                    OutputFormat::Json
                }
                OutputFormat::Default => self.config.default_output_format,
                explicit => explicit,
            },
        };

        if let Some(work_dir) = self.policy.validate_work_dir(&options.work_dir)? {
            options.work_dir = work_dir.to_string_lossy().to_string();
        }
        for dir in &options.allowed_dirs {
            if dir.trim().is_empty() {
                return Err(AppError::Request("allowed directories cannot be empty".to_string()));
            }
            self.policy.validate_work_dir(dir)?;
        }

        let session = self.resolve_session(request, backend, options.ephemeral).await?;
        warn_unsupported_once(backend, &options);

        let resume_id = session
            .as_ref()
            .and_then(|record| record.backend_session_id.as_deref());
        let command = match resume_id {
            Some(backend_session_id) => {
                adapter.build_resume_command(backend_session_id, &request.prompt, &options)?
            }
            None => adapter.build_command(&request.prompt, &options)?,
        };
        self.policy.validate_command(&command)?;

        Ok(PreparedRun {
            model: resolve_backend_model(backend, &options.model),
            adapter,
            backend,
            prompt: request.prompt.clone(),
            command,
            ephemeral: options.ephemeral,
            session,
        })
    }

    async fn resolve_session(
        &self,
        request: &PromptRequest,
        backend: Backend,
        ephemeral: bool,
    ) -> AppResult<Option<SessionRecord>> {
        let Some(session_id) = request
            .session_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
        else {
            return Ok(None);
        };
        if ephemeral {
            return Err(AppError::Request(
                "ephemeral requests cannot resume a session".to_string(),
            ));
        }
        let record = self
            .sessions
            .get(session_id)
            .await?
            .ok_or_else(|| AppError::Request(format!("unknown session {}", session_id)))?;
        if record.backend != backend {
            return Err(AppError::Request(format!(
                "session {} belongs to backend {}",
                session_id, record.backend
            )));
        }
        Ok(Some(record))
    }

    /// Runs one prompt to completion and returns its captured result.
    ///
    /// Only rejected requests return `Err`; a failing backend produces an
    /// `Ok` result with a non-zero exit code or an error message.
    pub async fn execute(
        &self,
        request: &PromptRequest,
        cancel: &CancellationToken,
    ) -> AppResult<PromptResult> {
        let prepared = self.prepare(request, ExecutionMode::Capture).await?;
        Ok(self.run_prepared(prepared, cancel).await)
    }

    pub(crate) async fn run_prepared(
        &self,
        prepared: PreparedRun,
        cancel: &CancellationToken,
    ) -> PromptResult {
        let result = self.run_capture(&prepared, cancel).await;
        self.finish(&prepared, result).await
    }

    /// Streams a prompt, delivering each event to `on_event` in arrival order.
    ///
    /// A failing callback terminates the subprocess and its error is returned.
    pub async fn execute_stream<F>(
        &self,
        request: &PromptRequest,
        cancel: &CancellationToken,
        on_event: F,
    ) -> AppResult<PromptResult>
    where
        F: FnMut(&UnifiedEvent) -> AppResult<()> + Send,
    {
        let prepared = self.prepare(request, ExecutionMode::Stream).await?;
        match self.run_stream(&prepared, cancel, on_event).await {
            Ok(result) => Ok(self.finish(&prepared, result).await),
            Err((error, backend_session_id)) => {
                if prepared.ephemeral {
                    if let Some(backend_session_id) = backend_session_id {
                        spawn_cleanup(prepared.adapter.clone(), backend_session_id);
                    }
                }
                Err(error)
            }
        }
    }

    async fn run_capture(&self, prepared: &PreparedRun, cancel: &CancellationToken) -> PromptResult {
        let started = Instant::now();
        let backend = prepared.backend_name();

        if prepared.command.dry_run {
            let envelope = prepared
                .adapter
                .parse_output(&prepared.command.dry_run_output());
            return PromptResult {
                backend: backend.to_string(),
                model: prepared.model.clone(),
                exit_code: 0,
                duration_ms: elapsed_ms(started),
                output: envelope.content,
                ..Default::default()
            };
        }

        tracing::info!(backend, model = %prepared.model, "starting backend run");
        let mut child = match spawn(&prepared.command) {
            Ok(child) => child,
            Err(error) => return spawn_failure(prepared, started, error),
        };
        let stdout_task = tokio::spawn(read_to_string(child.stdout.take()));
        let stderr_task = tokio::spawn(read_to_string(child.stderr.take()));

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(backend, "backend run canceled");
                return PromptResult::canceled(backend, &prepared.model);
            }
            status = child.wait() => status,
        };
        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        let status = match status {
            Ok(status) => status,
            Err(error) => {
                return PromptResult::failed(
                    backend,
                    &prepared.model,
                    format!("failed to wait for {}: {}", prepared.command.program, error),
                )
            }
        };

        let (raw, stderr_text) = if prepared.adapter.separate_stderr() {
            (stdout, filter_stderr(&stderr))
        } else {
            (join_streams(&stdout, &stderr), String::new())
        };
        let envelope = prepared.adapter.parse_output(&raw);
        let exit_code = exit_code(status);
        let error = envelope.error.clone().or_else(|| {
            (exit_code != 0).then(|| fallback_error(exit_code, &stderr_text, &envelope.content))
        });

        let result = PromptResult {
            backend: backend.to_string(),
            model: prepared.model.clone(),
            exit_code,
            duration_ms: elapsed_ms(started),
            output: envelope.content,
            session_id: envelope.session_id,
            usage: envelope.usage,
            error,
        };
        log_completion(&result);
        result
    }

    /// `Err` carries the callback failure plus any backend session id seen
    /// before it, so ephemeral artifacts can still be cleaned up.
    async fn run_stream<F>(
        &self,
        prepared: &PreparedRun,
        cancel: &CancellationToken,
        mut on_event: F,
    ) -> Result<PromptResult, (AppError, Option<String>)>
    where
        F: FnMut(&UnifiedEvent) -> AppResult<()> + Send,
    {
        let started = Instant::now();
        let backend = prepared.backend_name();
        let correlation_id = prepared
            .session
            .as_ref()
            .map(|record| record.id.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut parser = EventParser::new(prepared.backend, correlation_id);
        let mut collector = EventCollector::new();

        if prepared.command.dry_run {
            let line = prepared.command.dry_run_output();
            let mut events = Vec::new();
            if let Some(event) = parser.parse_line(&line).map_err(|error| (error, None))? {
                events.push(event);
            }
            events.push(parser.emit(DoneContent {
                usage: None,
                duration_ms: Some(elapsed_ms(started)),
                turns: None,
            }));
            for event in events {
                on_event(&event).map_err(|error| (error, None))?;
                collector.push(event);
            }
            return Ok(PromptResult {
                backend: backend.to_string(),
                model: prepared.model.clone(),
                exit_code: 0,
                duration_ms: elapsed_ms(started),
                output: collector.final_text(),
                ..Default::default()
            });
        }

        tracing::info!(backend, model = %prepared.model, "starting streaming backend run");
        let mut child = match spawn(&prepared.command) {
            Ok(child) => child,
            Err(error) => return Ok(spawn_failure(prepared, started, error)),
        };
        let stderr_task = tokio::spawn(read_to_string(child.stderr.take()));
        let Some(mut stdout) = child.stdout.take() else {
            return Ok(PromptResult::failed(backend, &prepared.model, "stdout was not captured"));
        };

        let mut buffer = LineBuffer::new(MAX_STREAM_LINE_BYTES);
        let mut chunk = vec![0_u8; READ_CHUNK_BYTES];
        let mut stream_error: Option<String> = None;
        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(backend, "streaming backend run canceled");
                    return Ok(PromptResult::canceled(backend, &prepared.model));
                }
                read = stdout.read(&mut chunk) => read,
            };
            let size = match read {
                Ok(0) => break,
                Ok(size) => size,
                Err(error) => {
                    stream_error = Some(format!("failed to read backend output: {}", error));
                    break;
                }
            };

            let lines = buffer.push(&chunk[..size]);
            let overflowed = buffer.take_overflow();
            for line in lines {
                if let Err(error) = self.deliver(&mut parser, &mut collector, &line, &mut on_event) {
                    let _ = terminate_then_kill(&mut child).await;
                    let seen = collector.backend_session_id().map(ToString::to_string);
                    return Err((error, seen));
                }
            }
            if overflowed {
                stream_error = Some(line_too_long(buffer.max_line_bytes()).to_string());
                let _ = terminate_then_kill(&mut child).await;
                break;
            }
        }
        if stream_error.is_none() {
            if let Some(rest) = buffer.flush() {
                if let Err(error) = self.deliver(&mut parser, &mut collector, &rest, &mut on_event) {
                    let _ = terminate_then_kill(&mut child).await;
                    let seen = collector.backend_session_id().map(ToString::to_string);
                    return Err((error, seen));
                }
            }
        }

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Ok(PromptResult::canceled(backend, &prepared.model));
            }
            status = child.wait() => status,
        };
        let stderr = stderr_task.await.unwrap_or_default();
        let exit_code = match status {
            Ok(status) => exit_code(status),
            Err(error) => {
                stream_error.get_or_insert_with(|| format!("failed to wait for backend: {}", error));
                -1
            }
        };

        let usage = collector.reported_usage();
        let output = collector.final_text();
        let error = stream_error
            .or_else(|| collector.last_error().map(|error| error.message.clone()))
            .or_else(|| {
                (exit_code != 0).then(|| fallback_error(exit_code, &filter_stderr(&stderr), ""))
            });
        let result = PromptResult {
            backend: backend.to_string(),
            model: prepared.model.clone(),
            exit_code,
            duration_ms: elapsed_ms(started),
            output,
            session_id: collector.backend_session_id().map(ToString::to_string),
            usage,
            error,
        };
        log_completion(&result);
        Ok(result)
    }

    /// Parses one line and hands the event to the callback. Only callback
    /// failures are returned; malformed lines are logged and skipped.
    fn deliver<F>(
        &self,
        parser: &mut EventParser,
        collector: &mut EventCollector,
        line: &str,
        on_event: &mut F,
    ) -> AppResult<()>
    where
        F: FnMut(&UnifiedEvent) -> AppResult<()>,
    {
        match parser.parse_line(line) {
            Ok(Some(event)) => {
                on_event(&event)?;
                collector.push(event);
            }
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(backend = %parser.backend(), error = %error, "skipping malformed output line");
            }
        }
        Ok(())
    }

    /// Persists the turn unless the run is ephemeral or a dry run; ephemeral
    /// runs get a detached cleanup of whatever the CLI stored on its own.
    async fn finish(&self, prepared: &PreparedRun, mut result: PromptResult) -> PromptResult {
        if prepared.command.dry_run || result.error.as_deref() == Some(PromptResult::CANCELED) {
            return result;
        }
        if prepared.ephemeral {
            if let Some(backend_session_id) = result.session_id.clone() {
                spawn_cleanup(prepared.adapter.clone(), backend_session_id);
            }
            return result;
        }

        let (mut record, is_new) = match prepared.session.clone() {
            Some(record) => (record, false),
            None => (
                SessionRecord::new(
                    prepared.backend,
                    prepared
                        .command
                        .cwd
                        .as_ref()
                        .map(|cwd| cwd.to_string_lossy().to_string())
                        .unwrap_or_default(),
                    prepared.model.clone(),
                ),
                true,
            ),
        };
        record.record_turn(&prepared.prompt, &result);
        let persisted = if is_new {
            self.sessions.create(record.clone()).await.map(|_| ())
        } else {
            self.sessions.save(record.clone()).await
        };
        match persisted {
            Ok(()) => {
                tracing::debug!(
                    backend = %prepared.backend,
                    session_id = %record.id,
                    turn_count = record.turn_count,
                    "persisted session"
                );
                result.session_id = Some(record.id);
            }
            Err(error) => {
                tracing::warn!(backend = %prepared.backend, error = %error, "failed to persist session");
            }
        }
        result
    }
}

fn spawn(command: &CommandSpec) -> std::io::Result<Child> {
    let mut process = Command::new(&command.program);
    process
        .args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = &command.cwd {
        process.current_dir(cwd);
    }
    for (key, value) in &command.env {
        process.env(key, value);
    }
    process.spawn()
}

fn spawn_failure(prepared: &PreparedRun, started: Instant, error: std::io::Error) -> PromptResult {
    let message = format!("failed to spawn {}: {}", prepared.command.program, error);
    if is_cli_missing_line(&message) {
        tracing::warn!(backend = %prepared.backend, program = %prepared.command.program, "backend CLI is missing");
    } else {
        tracing::warn!(backend = %prepared.backend, error = %error, "failed to spawn backend");
    }
    PromptResult {
        duration_ms: elapsed_ms(started),
        ..PromptResult::failed(prepared.backend_name(), &prepared.model, message)
    }
}

fn spawn_cleanup(adapter: Arc<dyn Adapter>, backend_session_id: String) {
    tokio::spawn(async move {
        if let Err(error) = adapter.cleanup_session(&backend_session_id).await {
            tracing::debug!(
                backend = %adapter.backend(),
                session_id = %backend_session_id,
                error = %error,
                "session cleanup failed"
            );
        }
    });
}

async fn read_to_string<R>(source: Option<R>) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(mut source) = source else {
        return String::new();
    };
    let mut bytes = Vec::new();
    if let Err(error) = source.read_to_end(&mut bytes).await {
        tracing::debug!(error = %error, "backend stream read failed");
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

fn join_streams(stdout: &str, stderr: &str) -> String {
    match (stdout.trim().is_empty(), stderr.trim().is_empty()) {
        (_, true) => stdout.to_string(),
        (true, false) => stderr.to_string(),
        (false, false) => format!("{}\n{}", stdout.trim_end(), stderr),
    }
}

fn fallback_error(exit_code: i32, stderr: &str, output: &str) -> String {
    [stderr.trim(), output.trim()]
        .into_iter()
        .find(|text| !text.is_empty())
        .map(ToString::to_string)
        .unwrap_or_else(|| format!("process exited with code {}", exit_code))
}

fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn log_completion(result: &PromptResult) {
    if result.is_success() {
        tracing::info!(
            backend = %result.backend,
            exit_code = result.exit_code,
            duration_ms = result.duration_ms,
            "backend run completed"
        );
    } else {
        tracing::warn!(
            backend = %result.backend,
            exit_code = result.exit_code,
            duration_ms = result.duration_ms,
            error = result.error.as_deref().unwrap_or_default(),
            "backend run failed"
        );
    }
}

/// SIGTERM first, then a hard kill if the process ignores it.
async fn terminate_then_kill(child: &mut Child) -> AppResult<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }

    if timeout(TERMINATE_GRACE, child.wait()).await.is_ok() {
        return Ok(());
    }

    child.start_kill()?;
    let _ = timeout(KILL_WAIT, child.wait()).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{fallback_error, join_streams, ExecutionMode, Executor};
    use crate::config::GatewayConfig;
    use crate::events::EventType;
    use crate::models::{OutputFormat, PromptRequest};
    use crate::errors::AppError;
    use tokio_util::sync::CancellationToken;

    fn dry_request(backend: &str, prompt: &str) -> PromptRequest {
        PromptRequest {
            dry_run: true,
            ..PromptRequest::new(backend, prompt)
        }
    }

    #[tokio::test]
    async fn prepare_rejects_bad_requests_before_spawning() {
        let executor = Executor::new(GatewayConfig::default());
        let interactive = PromptRequest {
            interactive: true,
            ..dry_request("claude", "hi")
        };
        assert!(matches!(
            executor.prepare(&interactive, ExecutionMode::Capture).await,
            Err(AppError::Request(_))
        ));

        let unknown = dry_request("cursor", "hi");
        assert!(matches!(
            executor.prepare(&unknown, ExecutionMode::Capture).await,
            Err(AppError::BackendNotFound(_))
        ));

        let flagged = PromptRequest {
            extra_flags: vec!["--no-verify".to_string()],
            ..dry_request("codex", "hi")
        };
        assert!(matches!(
            executor.prepare(&flagged, ExecutionMode::Capture).await,
            Err(AppError::Policy(_))
        ));

        let resume = PromptRequest {
            session_id: Some("missing".to_string()),
            ..dry_request("gemini", "hi")
        };
        assert!(matches!(
            executor.prepare(&resume, ExecutionMode::Capture).await,
            Err(AppError::Request(_))
        ));
    }

    #[tokio::test]
    async fn unavailable_backend_is_rejected_outside_dry_run() {
        let config = GatewayConfig::from_yaml_str(
            "backends:\n  codex:\n    binary: /nonexistent/bin/codex-cli-missing\n",
        )
        .expect("config");
        let executor = Executor::new(config);
        let error = executor
            .execute(&PromptRequest::new("codex", "hi"), &CancellationToken::new())
            .await
            .err()
            .expect("unavailable");
        assert!(matches!(error, AppError::BackendUnavailable(_)));
    }

    #[tokio::test]
    async fn layers_defaults_without_clobbering_request() {
        let config = GatewayConfig::from_yaml_str(
            r#"
unifiedDefaults:
  model: balanced
  maxTurns: 7
backends:
  claude:
    defaultModel: fast
    approvalMode: none
    systemPrompt: from-config
"#,
        )
        .expect("config");
        let executor = Executor::new(config);
        let request = PromptRequest {
            system_prompt: Some("from-request".to_string()),
            ..dry_request("claude", "hi")
        };
        let prepared = executor
            .prepare(&request, ExecutionMode::Capture)
            .await
            .expect("prepared");
        assert_eq!(prepared.model, "haiku");
        let args = prepared.command.args.join(" ");
        assert!(args.contains("--permission-mode bypassPermissions"));
        assert!(args.contains("--system-prompt from-request"));
        assert!(args.contains("--max-turns 7"));
        assert!(args.contains("--output-format json"));
        assert!(prepared.command.dry_run);
    }

    #[tokio::test]
    async fn stream_mode_forces_stream_json() {
        let executor = Executor::new(GatewayConfig::default());
        let request = PromptRequest {
            output_format: OutputFormat::Text,
            ..dry_request("gemini", "hi")
        };
        let prepared = executor
            .prepare(&request, ExecutionMode::Stream)
            .await
            .expect("prepared");
        assert!(prepared.command.args.join(" ").contains("--output-format stream-json"));
    }

    #[tokio::test]
    async fn dry_run_describes_command_without_spawning() {
        let executor = Executor::new(GatewayConfig::default());
        let result = executor
            .execute(&dry_request("codex", "hello"), &CancellationToken::new())
            .await
            .expect("result");
        assert_eq!(result.exit_code, 0);
        assert!(result.output.starts_with("[dry-run] codex exec"));
        assert!(result.output.ends_with("hello (cwd: .)"));
        assert!(executor.sessions().list().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn dry_run_stream_emits_message_then_done() {
        let executor = Executor::new(GatewayConfig::default());
        let mut types = Vec::new();
        let result = executor
            .execute_stream(&dry_request("claude", "hello"), &CancellationToken::new(), |event| {
                types.push(event.event_type());
                Ok(())
            })
            .await
            .expect("result");
        assert_eq!(types, vec![EventType::Message, EventType::Done]);
        assert!(result.output.contains("--output-format stream-json --verbose"));
    }

    #[tokio::test]
    async fn stream_callback_failure_is_returned() {
        let executor = Executor::new(GatewayConfig::default());
        let error = executor
            .execute_stream(&dry_request("gemini", "hello"), &CancellationToken::new(), |_| {
                Err(AppError::Internal("client went away".to_string()))
            })
            .await
            .expect_err("callback failure");
        assert!(error.to_string().contains("client went away"));
    }

    #[test]
    fn error_text_falls_back_in_order() {
        assert_eq!(fallback_error(2, " boom \n", "out"), "boom");
        assert_eq!(fallback_error(2, "", "out"), "out");
        assert_eq!(fallback_error(3, "", ""), "process exited with code 3");
        assert_eq!(join_streams("a\n", "b"), "a\nb");
        assert_eq!(join_streams("", "b"), "b");
    }
}
