use super::{EventContent, MessageContent, UnifiedEvent};
use crate::adapters::{claude, codex, gemini};
use crate::errors::{AppError, AppResult};
use crate::harness::line_buffer::LineBuffer;
use crate::models::Backend;
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

/// Line ceiling for line-mode parsing.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;
/// Line ceiling for raw subprocess streams.
pub const MAX_STREAM_LINE_BYTES: usize = 10 * 1024 * 1024;

const READ_CHUNK_BYTES: usize = 8192;

/// Cross-line state some backends need to resolve later lines.
#[derive(Debug, Default)]
pub(crate) struct ParserState {
    /// tool id -> tool name, for backends whose results omit the name.
    pub tool_names: HashMap<String, String>,
    /// item id -> item type, for backends whose deltas omit the type.
    pub item_types: HashMap<String, String>,
}

/// Normalizes one backend's output lines into [`UnifiedEvent`]s.
#[derive(Debug)]
pub struct EventParser {
    backend: Backend,
    session_id: String,
    seq: u64,
    state: ParserState,
}

impl EventParser {
    pub fn new(backend: Backend, session_id: impl Into<String>) -> Self {
        Self {
            backend,
            session_id: session_id.into(),
            seq: 0,
            state: ParserState::default(),
        }
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Parses one raw line into zero or one event.
    ///
    /// Blank lines yield nothing. Lines that are not JSON objects are treated
    /// as plain assistant text. Unknown discriminators are skipped.
    pub fn parse_line(&mut self, line: &str) -> AppResult<Option<UnifiedEvent>> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        let value = match serde_json::from_str::<serde_json::Value>(trimmed) {
            Ok(value) if value.is_object() => value,
            _ => {
                return Ok(Some(self.emit(MessageContent::assistant(line, false))));
            }
        };

        let content = match self.backend {
            Backend::Claude => claude::parse_event(&value, &mut self.state)?,
            Backend::Codex => codex::parse_event(&value, &mut self.state)?,
            Backend::Gemini => gemini::parse_event(&value, &mut self.state)?,
        };
        Ok(content.map(|content| self.emit(content)))
    }

    /// Stamps `content` with the next sequence number.
    pub fn emit(&mut self, content: impl Into<EventContent>) -> UnifiedEvent {
        self.seq += 1;
        UnifiedEvent::new(self.backend, self.session_id.clone(), self.seq, content)
    }

    /// Parses a fully captured output, collecting per-line failures.
    pub fn parse_all(&mut self, raw: &str) -> (Vec<UnifiedEvent>, Vec<AppError>) {
        let mut events = Vec::new();
        let mut errors = Vec::new();
        for line in raw.lines() {
            match self.parse_line(line) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(error) => errors.push(error),
            }
        }
        (events, errors)
    }

    pub async fn parse_stream<R>(
        &mut self,
        source: R,
        events: &mpsc::Sender<UnifiedEvent>,
        errors: &mpsc::Sender<AppError>,
    ) -> AppResult<()>
    where
        R: AsyncRead + Unpin,
    {
        self.parse_stream_with_limit(source, events, errors, MAX_LINE_BYTES)
            .await
    }

    /// Reads `source` to end-of-stream. Per-line failures go to `errors`;
    /// a line over `max_line_bytes` ends the stream with an error.
    pub async fn parse_stream_with_limit<R>(
        &mut self,
        mut source: R,
        events: &mpsc::Sender<UnifiedEvent>,
        errors: &mpsc::Sender<AppError>,
        max_line_bytes: usize,
    ) -> AppResult<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut buffer = LineBuffer::new(max_line_bytes);
        let mut chunk = vec![0_u8; READ_CHUNK_BYTES];
        loop {
            let size = source.read(&mut chunk).await?;
            if size == 0 {
                break;
            }
            for line in buffer.push(&chunk[..size]) {
                if !self.forward(&line, events, errors).await {
                    return Ok(());
                }
            }
            if buffer.take_overflow() {
                return Err(line_too_long(max_line_bytes));
            }
        }

        if let Some(rest) = buffer.flush() {
            self.forward(&rest, events, errors).await;
        }
        Ok(())
    }

    /// Returns false once the event receiver is gone.
    async fn forward(
        &mut self,
        line: &str,
        events: &mpsc::Sender<UnifiedEvent>,
        errors: &mpsc::Sender<AppError>,
    ) -> bool {
        match self.parse_line(line) {
            Ok(Some(event)) => events.send(event).await.is_ok(),
            Ok(None) => true,
            Err(error) => {
                let _ = errors.send(error).await;
                true
            }
        }
    }
}

pub(crate) fn line_too_long(limit: usize) -> AppError {
    AppError::Parse(format!("output line exceeds maximum length of {} bytes", limit))
}
