use super::{claude, codex, gemini};
use crate::errors::AppResult;
use crate::models::{Backend, SandboxMode, UnifiedOptions};
use crate::policy::validate_extra_flags;
use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::sync::Mutex;

/// Backend-specific rendering of a [`UnifiedOptions`] record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendOptions {
    pub backend: Backend,
    /// Alias-resolved model; empty when none was requested.
    pub model: String,
    pub derived_flags: Vec<String>,
    pub extra_flags: Vec<String>,
}

impl BackendOptions {
    /// Derived flags first so user-supplied extras can override them.
    pub fn args(&self) -> Vec<String> {
        self.derived_flags
            .iter()
            .chain(self.extra_flags.iter())
            .cloned()
            .collect()
    }
}

/// Resolves an abstract model alias for a backend given by name. Unknown
/// backends and non-alias models pass through unchanged.
pub fn resolve_model(backend: &str, model: &str) -> String {
    match backend.parse::<Backend>() {
        Ok(backend) => resolve_backend_model(backend, model),
        Err(_) => model.to_string(),
    }
}

pub fn resolve_backend_model(backend: Backend, model: &str) -> String {
    let trimmed = model.trim();
    let alias = trimmed.to_ascii_lowercase();
    let resolved = match backend {
        Backend::Claude => claude::model_alias(&alias),
        Backend::Codex => codex::model_alias(&alias),
        Backend::Gemini => gemini::model_alias(&alias),
    };
    resolved.map(ToString::to_string).unwrap_or_else(|| trimmed.to_string())
}

/// Pure translation of unified options into backend flags. Fails only when
/// the user-supplied extra flags are rejected.
pub fn map_options(backend: Backend, options: &UnifiedOptions) -> AppResult<BackendOptions> {
    validate_extra_flags(&options.extra_flags)?;
    let model = resolve_backend_model(backend, &options.model);
    let derived_flags = match backend {
        Backend::Claude => claude::derived_flags(options, &model),
        Backend::Codex => codex::derived_flags(options, &model),
        Backend::Gemini => gemini::derived_flags(options, &model),
    };
    Ok(BackendOptions {
        backend,
        model,
        derived_flags,
        extra_flags: options.extra_flags.clone(),
    })
}

/// Options set on `options` that `backend` has no flag for.
pub fn unsupported_options(backend: Backend, options: &UnifiedOptions) -> Vec<&'static str> {
    let mut unsupported = Vec::new();
    let has_system_prompt = options
        .system_prompt
        .as_deref()
        .is_some_and(|prompt| !prompt.trim().is_empty());
    match backend {
        Backend::Claude => {
            if options.sandbox_mode != SandboxMode::Default {
                unsupported.push("sandbox_mode");
            }
            if options.max_tokens.is_some() {
                unsupported.push("max_tokens");
            }
        }
        Backend::Codex => {
            if options.max_turns.is_some() {
                unsupported.push("max_turns");
            }
            if !options.allowed_tools.is_empty() {
                unsupported.push("allowed_tools");
            }
        }
        Backend::Gemini => {
            if has_system_prompt {
                unsupported.push("system_prompt");
            }
            if options.max_turns.is_some() {
                unsupported.push("max_turns");
            }
            if options.max_tokens.is_some() {
                unsupported.push("max_tokens");
            }
        }
    }
    unsupported
}

static WARNED: Lazy<Mutex<HashSet<(Backend, &'static str)>>> =
    Lazy::new(|| Mutex::new(HashSet::new()));

/// Logs each unsupported (backend, option) pair once per process.
pub(crate) fn warn_unsupported_once(backend: Backend, options: &UnifiedOptions) {
    let unsupported = unsupported_options(backend, options);
    if unsupported.is_empty() {
        return;
    }
    let mut warned = WARNED
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    for option in unsupported {
        if warned.insert((backend, option)) {
            tracing::warn!(backend = %backend, option, "option not supported by backend; ignoring");
        }
    }
}

pub(crate) fn push_pair(args: &mut Vec<String>, flag: &str, value: impl Into<String>) {
    args.push(flag.to_string());
    args.push(value.into());
}
