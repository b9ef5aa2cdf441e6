use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    Claude,
    Codex,
    Gemini,
}

impl Backend {
    pub const ALL: [Backend; 3] = [Backend::Claude, Backend::Codex, Backend::Gemini];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Gemini => "gemini",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "claude" => Ok(Self::Claude),
            "codex" => Ok(Self::Codex),
            "gemini" => Ok(Self::Gemini),
            other => Err(AppError::BackendNotFound(format!("backend not found: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalMode {
    #[default]
    Default,
    Auto,
    None,
    Always,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxMode {
    #[default]
    Default,
    ReadOnly,
    Workspace,
    Full,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    #[default]
    Default,
    Text,
    Json,
    StreamJson,
}

/// Backend-agnostic configuration for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UnifiedOptions {
    pub work_dir: String,
    pub model: String,
    pub approval_mode: ApprovalMode,
    pub sandbox_mode: SandboxMode,
    pub output_format: OutputFormat,
    pub allowed_dirs: Vec<String>,
    pub allowed_tools: Vec<String>,
    pub interactive: bool,
    pub verbose: bool,
    pub dry_run: bool,
    pub max_tokens: Option<u32>,
    pub max_turns: Option<u32>,
    pub system_prompt: Option<String>,
    pub extra_flags: Vec<String>,
    pub ephemeral: bool,
}

impl UnifiedOptions {
    /// Copies values from `defaults` into fields still at their zero value.
    pub fn fill_gaps(&mut self, defaults: &UnifiedOptions) {
        if self.work_dir.is_empty() {
            self.work_dir = defaults.work_dir.clone();
        }
        if self.model.is_empty() {
            self.model = defaults.model.clone();
        }
        if self.approval_mode == ApprovalMode::Default {
            self.approval_mode = defaults.approval_mode;
        }
        if self.sandbox_mode == SandboxMode::Default {
            self.sandbox_mode = defaults.sandbox_mode;
        }
        if self.output_format == OutputFormat::Default {
            self.output_format = defaults.output_format;
        }
        if self.allowed_dirs.is_empty() {
            self.allowed_dirs = defaults.allowed_dirs.clone();
        }
        if self.allowed_tools.is_empty() {
            self.allowed_tools = defaults.allowed_tools.clone();
        }
        self.verbose |= defaults.verbose;
        self.dry_run |= defaults.dry_run;
        self.interactive |= defaults.interactive;
        self.ephemeral |= defaults.ephemeral;
        if self.max_tokens.is_none() {
            self.max_tokens = defaults.max_tokens;
        }
        if self.max_turns.is_none() {
            self.max_turns = defaults.max_turns;
        }
        if self.system_prompt.as_deref().map(str::trim).unwrap_or_default().is_empty() {
            self.system_prompt = defaults.system_prompt.clone();
        }
        if self.extra_flags.is_empty() {
            self.extra_flags = defaults.extra_flags.clone();
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0 && self.cached_tokens == 0
    }

    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.cached_tokens = self.cached_tokens.saturating_add(other.cached_tokens);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PromptRequest {
    pub backend: String,
    pub prompt: String,
    pub model: Option<String>,
    pub work_dir: String,
    pub approval_mode: ApprovalMode,
    pub sandbox_mode: SandboxMode,
    pub output_format: OutputFormat,
    pub allowed_dirs: Vec<String>,
    pub interactive: bool,
    pub verbose: bool,
    pub dry_run: bool,
    pub max_tokens: Option<u32>,
    pub max_turns: Option<u32>,
    pub system_prompt: Option<String>,
    pub extra_flags: Vec<String>,
    pub ephemeral: bool,
    /// Gateway session to resume; `None` starts a fresh backend session.
    pub session_id: Option<String>,
}

impl PromptRequest {
    pub fn new(backend: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn unified_options(&self) -> UnifiedOptions {
        UnifiedOptions {
            work_dir: self.work_dir.clone(),
            model: self.model.clone().unwrap_or_default(),
            approval_mode: self.approval_mode,
            sandbox_mode: self.sandbox_mode,
            output_format: self.output_format,
            allowed_dirs: self.allowed_dirs.clone(),
            allowed_tools: Vec::new(),
            interactive: self.interactive,
            verbose: self.verbose,
            dry_run: self.dry_run,
            max_tokens: self.max_tokens,
            max_turns: self.max_turns,
            system_prompt: self.system_prompt.clone(),
            extra_flags: self.extra_flags.clone(),
            ephemeral: self.ephemeral,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptResult {
    pub backend: String,
    pub model: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub output: String,
    pub session_id: Option<String>,
    pub usage: Option<TokenUsage>,
    pub error: Option<String>,
}

impl PromptResult {
    pub const CANCELED: &'static str = "canceled";

    pub fn canceled(backend: &str, model: &str) -> Self {
        Self {
            backend: backend.to_string(),
            model: model.to_string(),
            exit_code: -1,
            error: Some(Self::CANCELED.to_string()),
            ..Default::default()
        }
    }

    pub fn failed(backend: &str, model: &str, error: impl Into<String>) -> Self {
        Self {
            backend: backend.to_string(),
            model: model.to_string(),
            exit_code: -1,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
            && self
                .error
                .as_deref()
                .map(str::trim)
                .unwrap_or_default()
                .is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParallelRequest {
    pub tasks: Vec<PromptRequest>,
    pub max_concurrency: usize,
    pub fail_fast: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelResult {
    pub results: Vec<PromptResult>,
    pub completed: usize,
    pub failed: usize,
    pub total_duration_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChainRequest {
    pub steps: Vec<PromptRequest>,
    pub stop_on_failure: bool,
    pub pass_working_dir: bool,
    pub pass_session_id: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainResult {
    pub steps: Vec<PromptResult>,
    pub completed: usize,
    /// Index of the first step that failed.
    pub failed_step: Option<usize>,
    pub stopped_early: bool,
    pub total_duration_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompareRequest {
    pub backends: Vec<String>,
    pub prompt: String,
    pub model: Option<String>,
    pub work_dir: String,
    pub sequential: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareEntry {
    pub backend: String,
    pub model: String,
    pub duration_ms: u64,
    pub result: PromptResult,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareResult {
    pub prompt: String,
    pub results: Vec<CompareEntry>,
    pub total_duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    Active,
    Completed,
    Error,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub backend: Backend,
    pub backend_session_id: Option<String>,
    pub work_dir: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub turn_count: u32,
    pub usage: TokenUsage,
    pub status: SessionStatus,
    pub last_prompt: Option<String>,
}
