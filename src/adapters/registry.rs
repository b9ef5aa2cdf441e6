use super::claude::ClaudeAdapter;
use super::codex::CodexAdapter;
use super::gemini::GeminiAdapter;
use super::Adapter;
use crate::config::GatewayConfig;
use crate::errors::{AppError, AppResult};
use crate::models::Backend;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Name-keyed adapter table shared by every execution.
pub struct BackendRegistry {
    adapters: RwLock<HashMap<String, Arc<dyn Adapter>>>,
    availability: Mutex<HashMap<String, (bool, Instant)>>,
    availability_ttl: Duration,
}

impl BackendRegistry {
    /// An empty registry. A zero ttl checks on every lookup.
    pub fn new(availability_ttl: Duration) -> Self {
        Self {
            adapters: RwLock::new(HashMap::new()),
            availability: Mutex::new(HashMap::new()),
            availability_ttl,
        }
    }

    /// Registers the three built-in backends with configured binaries.
    pub fn from_config(config: &GatewayConfig) -> Self {
        let registry = Self::new(config.availability_ttl());
        registry.register(Arc::new(
            ClaudeAdapter::new(config.binary_for(Backend::Claude))
                .with_env(config.env_for(Backend::Claude)),
        ));
        registry.register(Arc::new(
            CodexAdapter::new(config.binary_for(Backend::Codex))
                .with_env(config.env_for(Backend::Codex)),
        ));
        registry.register(Arc::new(
            GeminiAdapter::new(config.binary_for(Backend::Gemini))
                .with_env(config.env_for(Backend::Gemini)),
        ));
        registry
    }

    /// Adds or replaces the adapter registered under its name.
    pub fn register(&self, adapter: Arc<dyn Adapter>) {
        let name = adapter.name().to_string();
        self.availability
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&name);
        let previous = self
            .adapters
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.clone(), adapter);
        tracing::debug!(backend = %name, replaced = previous.is_some(), "registered backend adapter");
    }

    pub fn get(&self, name: &str) -> AppResult<Arc<dyn Adapter>> {
        let key = name.trim().to_ascii_lowercase();
        self.adapters
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&key)
            .cloned()
            .ok_or_else(|| AppError::BackendNotFound(format!("backend not found: {}", name)))
    }

    /// Sorted names of every registered backend.
    pub fn list(&self) -> Vec<String> {
        let mut names = self
            .adapters
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    pub fn is_available(&self, name: &str) -> AppResult<bool> {
        let adapter = self.get(name)?;
        let key = adapter.name().to_string();
        if let Some((available, checked_at)) = self
            .availability
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&key)
        {
            if checked_at.elapsed() < self.availability_ttl {
                return Ok(*available);
            }
        }

        let available = adapter.is_available();
        self.availability
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key, (available, Instant::now()));
        Ok(available)
    }

    pub fn list_available(&self) -> Vec<String> {
        self.list()
            .into_iter()
            .filter(|name| self.is_available(name).unwrap_or(false))
            .collect()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::from_config(&GatewayConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::BackendRegistry;
    use crate::adapters::{Adapter, CommandSpec, ResponseEnvelope};
    use crate::errors::{AppError, AppResult};
    use crate::models::{Backend, UnifiedOptions};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct CheckCounter {
        checks: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Adapter for CheckCounter {
        fn backend(&self) -> Backend {
            Backend::Codex
        }

        fn binary(&self) -> &str {
            "codex"
        }

        fn is_available(&self) -> bool {
            self.checks.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn separate_stderr(&self) -> bool {
            true
        }

        fn build_command(&self, _prompt: &str, _options: &UnifiedOptions) -> AppResult<CommandSpec> {
            Err(AppError::Internal("unused".to_string()))
        }

        fn build_resume_command(
            &self,
            _session_id: &str,
            _prompt: &str,
            _options: &UnifiedOptions,
        ) -> AppResult<CommandSpec> {
            Err(AppError::Internal("unused".to_string()))
        }

        fn parse_output(&self, raw: &str) -> ResponseEnvelope {
            ResponseEnvelope {
                content: raw.to_string(),
                ..Default::default()
            }
        }
    }

    #[test]
    fn registers_builtin_backends() {
        let registry = BackendRegistry::default();
        assert_eq!(registry.list(), vec!["claude", "codex", "gemini"]);
        assert_eq!(registry.get("Claude").expect("claude").backend(), Backend::Claude);
        let error = registry.get("cursor").err().expect("unknown backend");
        assert!(error.to_string().contains("backend not found"));
    }

    #[test]
    fn availability_check_is_cached_until_ttl() {
        let checks = Arc::new(AtomicUsize::new(0));
        let registry = BackendRegistry::new(Duration::from_secs(60));
        registry.register(Arc::new(CheckCounter {
            checks: checks.clone(),
        }));
        assert!(registry.is_available("codex").expect("availability"));
        assert!(registry.is_available("codex").expect("availability"));
        assert_eq!(registry.list_available(), vec!["codex"]);
        assert_eq!(checks.load(Ordering::SeqCst), 1);

        let uncached = BackendRegistry::new(Duration::ZERO);
        uncached.register(Arc::new(CheckCounter {
            checks: checks.clone(),
        }));
        uncached.is_available("codex").expect("availability");
        uncached.is_available("codex").expect("availability");
        assert_eq!(checks.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn register_overwrites_existing_name() {
        let checks = Arc::new(AtomicUsize::new(0));
        let registry = BackendRegistry::default();
        registry.register(Arc::new(CheckCounter {
            checks: checks.clone(),
        }));
        assert_eq!(registry.list().len(), 3);
        assert!(registry.is_available("codex").expect("availability"));
        assert_eq!(checks.load(Ordering::SeqCst), 1);
    }
}
