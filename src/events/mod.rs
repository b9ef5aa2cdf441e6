//! Canonical event model shared by every backend.
//!
//! Each backend's native JSON-per-line schema is normalized into
//! [`UnifiedEvent`]s by an [`EventParser`]. The payload of an event is a
//! closed [`EventContent`] union; typed accessors refuse to read a payload
//! under the wrong event type.

pub mod collector;
pub mod parser;

pub use collector::EventCollector;
pub use parser::{EventParser, MAX_LINE_BYTES, MAX_STREAM_LINE_BYTES};

use crate::errors::{AppError, AppResult};
use crate::models::{Backend, TokenUsage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Init,
    Message,
    ToolUse,
    ToolResult,
    Thinking,
    Error,
    Done,
    Progress,
    TokenUsage,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Message => "message",
            Self::ToolUse => "tool_use",
            Self::ToolResult => "tool_result",
            Self::Thinking => "thinking",
            Self::Error => "error",
            Self::Done => "done",
            Self::Progress => "progress",
            Self::TokenUsage => "token_usage",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitContent {
    /// Session identifier native to the backend CLI.
    pub backend_session_id: String,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageContent {
    pub text: String,
    pub role: String,
    pub partial: bool,
}

impl MessageContent {
    pub fn assistant(text: impl Into<String>, partial: bool) -> Self {
        Self {
            text: text.into(),
            role: "assistant".to_string(),
            partial,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUseContent {
    pub tool_id: String,
    pub tool_name: String,
    /// Backend-native input payload, kept verbatim.
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultContent {
    pub tool_id: String,
    pub tool_name: String,
    pub output: String,
    pub is_error: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingContent {
    pub text: String,
    pub partial: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorContent {
    pub message: String,
    pub code: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoneContent {
    pub usage: Option<TokenUsage>,
    pub duration_ms: Option<u64>,
    pub turns: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressContent {
    pub stage: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsageContent {
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum EventContent {
    Init(InitContent),
    Message(MessageContent),
    ToolUse(ToolUseContent),
    ToolResult(ToolResultContent),
    Thinking(ThinkingContent),
    Error(ErrorContent),
    Done(DoneContent),
    Progress(ProgressContent),
    TokenUsage(TokenUsageContent),
}

impl EventContent {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Init(_) => EventType::Init,
            Self::Message(_) => EventType::Message,
            Self::ToolUse(_) => EventType::ToolUse,
            Self::ToolResult(_) => EventType::ToolResult,
            Self::Thinking(_) => EventType::Thinking,
            Self::Error(_) => EventType::Error,
            Self::Done(_) => EventType::Done,
            Self::Progress(_) => EventType::Progress,
            Self::TokenUsage(_) => EventType::TokenUsage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnifiedEvent {
    pub backend: Backend,
    /// Correlation id the parser was bound to.
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub seq: u64,
    #[serde(flatten)]
    content: EventContent,
}

impl UnifiedEvent {
    pub fn new(
        backend: Backend,
        session_id: impl Into<String>,
        seq: u64,
        content: impl Into<EventContent>,
    ) -> Self {
        Self {
            backend,
            session_id: session_id.into(),
            timestamp: Utc::now(),
            seq,
            content: content.into(),
        }
    }

    pub fn event_type(&self) -> EventType {
        self.content.event_type()
    }

    pub fn content(&self) -> &EventContent {
        &self.content
    }

    pub fn set_content(&mut self, content: impl Into<EventContent>) {
        self.content = content.into();
    }

    fn mismatch(&self, expected: EventType) -> AppError {
        AppError::InvalidEventType {
            expected: expected.as_str(),
            found: self.event_type().as_str(),
        }
    }
}

macro_rules! typed_content {
    ($($variant:ident => $payload:ty, $accessor:ident;)+) => {
        $(
            impl From<$payload> for EventContent {
                fn from(value: $payload) -> Self {
                    Self::$variant(value)
                }
            }

            impl UnifiedEvent {
                pub fn $accessor(&self) -> AppResult<&$payload> {
                    match &self.content {
                        EventContent::$variant(payload) => Ok(payload),
                        _ => Err(self.mismatch(EventType::$variant)),
                    }
                }
            }
        )+
    };
}

typed_content! {
    Init => InitContent, init_content;
    Message => MessageContent, message_content;
    ToolUse => ToolUseContent, tool_use_content;
    ToolResult => ToolResultContent, tool_result_content;
    Thinking => ThinkingContent, thinking_content;
    Error => ErrorContent, error_content;
    Done => DoneContent, done_content;
    Progress => ProgressContent, progress_content;
    TokenUsage => TokenUsageContent, token_usage_content;
}
