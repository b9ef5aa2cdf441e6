use crate::errors::{AppError, AppResult};
use crate::models::{ApprovalMode, Backend, OutputFormat, SandboxMode, UnifiedOptions};
use crate::policy::validate_extra_flags;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_MAX_PARALLEL_WORKERS: usize = 3;
pub const DEFAULT_AVAILABILITY_TTL_SECS: u64 = 30;

/// Per-backend defaults layered under every request for that backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackendConfig {
    /// Executable override; defaults to the backend's name on `PATH`.
    pub binary: Option<String>,
    pub default_model: Option<String>,
    pub approval_mode: ApprovalMode,
    pub sandbox_mode: SandboxMode,
    pub system_prompt: Option<String>,
    pub allowed_tools: Vec<String>,
    pub extra_flags: Vec<String>,
    /// Extra environment for the CLI process and its cleanup calls.
    pub env: BTreeMap<String, String>,
}

impl BackendConfig {
    /// Model-agnostic overrides, shaped for [`UnifiedOptions::fill_gaps`].
    pub fn overrides(&self) -> UnifiedOptions {
        UnifiedOptions {
            approval_mode: self.approval_mode,
            sandbox_mode: self.sandbox_mode,
            system_prompt: self.system_prompt.clone(),
            allowed_tools: self.allowed_tools.clone(),
            extra_flags: self.extra_flags.clone(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    pub backends: BTreeMap<Backend, BackendConfig>,
    /// Filled into every request before backend defaults.
    pub unified_defaults: UnifiedOptions,
    pub max_parallel_workers: usize,
    pub allowed_dirs: Vec<String>,
    /// Extra prefixes refused in addition to the built-in system paths.
    pub blocked_dirs: Vec<String>,
    pub default_output_format: OutputFormat,
    pub dry_run: bool,
    pub availability_cache_ttl_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            backends: BTreeMap::new(),
            unified_defaults: UnifiedOptions::default(),
            max_parallel_workers: DEFAULT_MAX_PARALLEL_WORKERS,
            allowed_dirs: Vec::new(),
            blocked_dirs: Vec::new(),
            default_output_format: OutputFormat::Json,
            dry_run: false,
            availability_cache_ttl_secs: DEFAULT_AVAILABILITY_TTL_SECS,
        }
    }
}

impl GatewayConfig {
    pub async fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read gateway config {}", path.display()))
            .map_err(|error| AppError::Config(format!("{:#}", error)))?;
        let config = Self::from_yaml_str(&contents)?;
        tracing::info!(
            path = %path.display(),
            backends = config.backends.len(),
            max_parallel_workers = config.max_parallel_workers,
            "loaded gateway config"
        );
        Ok(config)
    }

    pub fn from_yaml_str(contents: &str) -> AppResult<Self> {
        let config = if contents.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str::<Self>(contents)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.max_parallel_workers == 0 {
            return Err(AppError::Config(
                "maxParallelWorkers must be greater than zero".to_string(),
            ));
        }
        validate_extra_flags(&self.unified_defaults.extra_flags)
            .map_err(|error| AppError::Config(format!("unifiedDefaults: {}", error)))?;
        for (backend, config) in &self.backends {
            validate_extra_flags(&config.extra_flags)
                .map_err(|error| AppError::Config(format!("backends.{}: {}", backend, error)))?;
            if config
                .binary
                .as_deref()
                .is_some_and(|binary| binary.trim().is_empty())
            {
                return Err(AppError::Config(format!(
                    "backends.{}: binary cannot be empty",
                    backend
                )));
            }
        }
        Ok(())
    }

    pub fn backend(&self, backend: Backend) -> Option<&BackendConfig> {
        self.backends.get(&backend)
    }

    pub fn binary_for(&self, backend: Backend) -> String {
        self.backend(backend)
            .and_then(|config| config.binary.as_deref())
            .map(str::trim)
            .filter(|binary| !binary.is_empty())
            .unwrap_or(backend.as_str())
            .to_string()
    }

    pub fn env_for(&self, backend: Backend) -> BTreeMap<String, String> {
        self.backend(backend)
            .map(|config| config.env.clone())
            .unwrap_or_default()
    }

    pub fn default_model_for(&self, backend: Backend) -> Option<&str> {
        self.backend(backend)
            .and_then(|config| config.default_model.as_deref())
            .map(str::trim)
            .filter(|model| !model.is_empty())
    }

    pub fn availability_ttl(&self) -> Duration {
        Duration::from_secs(self.availability_cache_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::GatewayConfig;
    use crate::errors::AppError;
    use crate::models::{ApprovalMode, Backend, OutputFormat};

    #[test]
    fn empty_config_uses_defaults() {
        let config = GatewayConfig::from_yaml_str("").expect("config");
        assert_eq!(config.max_parallel_workers, 3);
        assert_eq!(config.default_output_format, OutputFormat::Json);
        assert_eq!(config.availability_cache_ttl_secs, 30);
        assert_eq!(config.binary_for(Backend::Gemini), "gemini");
        assert!(config.default_model_for(Backend::Claude).is_none());
    }

    #[test]
    fn parses_backend_sections() {
        let yaml = r#"
maxParallelWorkers: 5
blockedDirs: ["/srv/secret"]
unifiedDefaults:
  verbose: true
backends:
  claude:
    binary: /opt/claude/bin/claude
    defaultModel: best
    approvalMode: auto
    extraFlags: ["--debug"]
  codex:
    sandboxMode: read-only
    env:
      CODEX_HOME: /var/lib/codex
"#;
        let config = GatewayConfig::from_yaml_str(yaml).expect("config");
        assert_eq!(config.max_parallel_workers, 5);
        assert!(config.unified_defaults.verbose);
        assert_eq!(config.binary_for(Backend::Claude), "/opt/claude/bin/claude");
        assert_eq!(config.default_model_for(Backend::Claude), Some("best"));
        let claude = config.backend(Backend::Claude).expect("claude section");
        assert_eq!(claude.overrides().approval_mode, ApprovalMode::Auto);
        assert_eq!(config.binary_for(Backend::Codex), "codex");
        assert_eq!(
            config.env_for(Backend::Codex).get("CODEX_HOME").map(String::as_str),
            Some("/var/lib/codex")
        );
        assert!(config.env_for(Backend::Gemini).is_empty());
    }

    #[test]
    fn rejects_invalid_values() {
        let error = GatewayConfig::from_yaml_str("maxParallelWorkers: 0").expect_err("zero workers");
        assert!(matches!(error, AppError::Config(_)));

        let error = GatewayConfig::from_yaml_str("backends:\n  codex:\n    extraFlags: [\"--yolo\"]\n")
            .expect_err("denied flag");
        assert!(error.to_string().contains("backends.codex"));

        let error = GatewayConfig::from_yaml_str("backends:\n  cursor: {}\n").expect_err("unknown backend");
        assert!(error.to_string().starts_with("CONFIG_INVALID"));
    }

    #[tokio::test]
    async fn load_reports_missing_file_as_config_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let error = GatewayConfig::load(dir.path().join("missing.yaml"))
            .await
            .expect_err("missing file");
        assert!(error.to_string().contains("failed to read gateway config"));
    }
}
