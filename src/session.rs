use crate::errors::{AppError, AppResult};
use crate::models::{Backend, PromptResult, SessionRecord, SessionStatus, TokenUsage};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

const PROMPT_PREVIEW_CHARS: usize = 200;

/// Persistence for gateway sessions. Implementations own their own locking.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, record: SessionRecord) -> AppResult<SessionRecord>;
    async fn save(&self, record: SessionRecord) -> AppResult<()>;
    async fn get(&self, id: &str) -> AppResult<Option<SessionRecord>>;
    async fn list(&self) -> AppResult<Vec<SessionRecord>>;
    async fn delete(&self, id: &str) -> AppResult<bool>;
}

impl SessionRecord {
    pub fn new(backend: Backend, work_dir: impl Into<String>, model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            backend,
            backend_session_id: None,
            work_dir: work_dir.into(),
            model: model.into(),
            created_at: now,
            updated_at: now,
            turn_count: 0,
            usage: TokenUsage::default(),
            status: SessionStatus::Active,
            last_prompt: None,
        }
    }

    /// Folds one finished turn into the record.
    pub fn record_turn(&mut self, prompt: &str, result: &PromptResult) {
        self.turn_count += 1;
        if let Some(usage) = &result.usage {
            self.usage.accumulate(usage);
        }
        if let Some(backend_session_id) = result.session_id.as_deref().filter(|id| !id.is_empty()) {
            self.backend_session_id = Some(backend_session_id.to_string());
        }
        self.status = if result.is_success() {
            SessionStatus::Completed
        } else {
            SessionStatus::Error
        };
        self.last_prompt = Some(prompt.chars().take(PROMPT_PREVIEW_CHARS).collect());
        self.updated_at = Utc::now();
    }
}

#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    sessions: Arc<Mutex<HashMap<String, SessionRecord>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, mut record: SessionRecord) -> AppResult<SessionRecord> {
        if record.id.trim().is_empty() {
            record.id = Uuid::new_v4().to_string();
        }
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&record.id) {
            return Err(AppError::Request(format!(
                "Session {} already exists",
                record.id
            )));
        }
        sessions.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn save(&self, record: SessionRecord) -> AppResult<()> {
        let mut sessions = self.sessions.lock().await;
        sessions.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get(&self, id: &str) -> AppResult<Option<SessionRecord>> {
        let sessions = self.sessions.lock().await;
        Ok(sessions.get(id).cloned())
    }

    async fn list(&self) -> AppResult<Vec<SessionRecord>> {
        let sessions = self.sessions.lock().await;
        let mut records = sessions.values().cloned().collect::<Vec<_>>();
        records.sort_by(|left, right| right.updated_at.cmp(&left.updated_at));
        Ok(records)
    }

    async fn delete(&self, id: &str) -> AppResult<bool> {
        let mut sessions = self.sessions.lock().await;
        Ok(sessions.remove(id).is_some())
    }
}
