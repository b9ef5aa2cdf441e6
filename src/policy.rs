use crate::adapters::CommandSpec;
use crate::config::GatewayConfig;
use crate::errors::{AppError, AppResult};
use std::path::{Component, Path, PathBuf};

/// Flags that bypass permission checks or verification, or that force
/// destructive operations.
pub const DENIED_FLAGS: &[&str] = &[
    "--force",
    "-f",
    "--no-verify",
    "--dangerously-skip-permissions",
    "--dangerously-bypass-approvals-and-sandbox",
    "--yolo",
];

const SENSITIVE_PREFIXES: &[&str] = &[
    "/etc",
    "/private/etc",
    "/dev",
    "/proc",
    "/sys",
    "/bin",
    "/sbin",
    "/usr/bin",
    "/usr/sbin",
    "/boot",
];

/// Every extra flag must start with `-` and must not name a denied flag,
/// with or without an `=value` suffix.
pub fn validate_extra_flags(flags: &[String]) -> AppResult<()> {
    for flag in flags {
        let trimmed = flag.trim();
        if trimmed.contains('\0') {
            return Err(AppError::Policy(
                "extra flag contains a null byte".to_string(),
            ));
        }
        if !trimmed.starts_with('-') {
            return Err(AppError::Policy(format!(
                "extra flag '{}' must start with '-'",
                trimmed
            )));
        }
        let key = trimmed.split('=').next().unwrap_or(trimmed);
        if DENIED_FLAGS.contains(&key) {
            return Err(AppError::Policy(format!(
                "extra flag '{}' is not allowed",
                key
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PolicyEngine {
    blocked_prefixes: Vec<PathBuf>,
    allowed_prefixes: Vec<PathBuf>,
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new(&[], &[])
    }
}

impl PolicyEngine {
    pub fn new(allowed_dirs: &[String], blocked_dirs: &[String]) -> Self {
        let blocked_prefixes = SENSITIVE_PREFIXES
            .iter()
            .map(|prefix| PathBuf::from(*prefix))
            .chain(blocked_dirs.iter().map(|dir| resolve_prefix(dir)))
            .collect();
        let allowed_prefixes = allowed_dirs.iter().map(|dir| resolve_prefix(dir)).collect();
        Self {
            blocked_prefixes,
            allowed_prefixes,
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(&config.allowed_dirs, &config.blocked_dirs)
    }

    /// Resolves a working directory. `Ok(None)` means "use the process
    /// default"; anything else is an existing, symlink-free directory that is
    /// outside the blocked prefixes and inside the allow-list when one is set.
    pub fn validate_work_dir(&self, work_dir: &str) -> AppResult<Option<PathBuf>> {
        let trimmed = work_dir.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        let candidate = Path::new(trimmed);
        if !candidate.is_absolute() {
            return Err(AppError::Policy(format!(
                "Working directory '{}' must be absolute",
                trimmed
            )));
        }
        if candidate
            .components()
            .any(|component| component == Component::ParentDir)
        {
            return Err(AppError::Policy(format!(
                "Working directory '{}' must not contain '..'",
                trimmed
            )));
        }

        let canonical = candidate.canonicalize().map_err(|error| {
            AppError::Policy(format!(
                "Working directory '{}' does not exist: {}",
                trimmed, error
            ))
        })?;

        if let Some(prefix) = self
            .blocked_prefixes
            .iter()
            .find(|prefix| canonical.starts_with(prefix))
        {
            return Err(AppError::Policy(format!(
                "Working directory '{}' is under blocked prefix {}",
                trimmed,
                prefix.display()
            )));
        }

        if !self.allowed_prefixes.is_empty()
            && !self
                .allowed_prefixes
                .iter()
                .any(|prefix| canonical.starts_with(prefix))
        {
            return Err(AppError::Policy(format!(
                "Working directory '{}' is outside the allowed directories",
                trimmed
            )));
        }

        if !canonical.is_dir() {
            return Err(AppError::Policy(format!(
                "Working directory '{}' is not a directory",
                trimmed
            )));
        }
        Ok(Some(canonical))
    }

    /// Rejects resolved arguments that no CLI should ever receive.
    pub fn validate_command(&self, command: &CommandSpec) -> AppResult<()> {
        if command.program.trim().is_empty() {
            return Err(AppError::Policy("Resolved command has no program".to_string()));
        }
        for arg in &command.args {
            if arg.contains('\0') {
                return Err(AppError::Policy(
                    "Resolved command contains a null byte".to_string(),
                ));
            }
            if arg
                .chars()
                .any(|ch| ch.is_control() && ch != '\n' && ch != '\r' && ch != '\t')
            {
                return Err(AppError::Policy(format!(
                    "Resolved command contains unsupported control character in argument '{}'",
                    arg.escape_debug()
                )));
            }
        }
        Ok(())
    }
}

/// Canonical form of a configured prefix, or the literal path when it does
/// not exist yet.
fn resolve_prefix(dir: &str) -> PathBuf {
    let path = PathBuf::from(dir.trim());
    path.canonicalize().unwrap_or(path)
}
