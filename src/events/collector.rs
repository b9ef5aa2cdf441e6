use super::{EventContent, EventType, ErrorContent, UnifiedEvent};
use crate::models::TokenUsage;

/// Accumulates events in arrival order for non-streaming callers.
#[derive(Debug, Default, Clone)]
pub struct EventCollector {
    events: Vec<UnifiedEvent>,
}

impl EventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: UnifiedEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[UnifiedEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn by_type(&self, event_type: EventType) -> Vec<&UnifiedEvent> {
        self.events
            .iter()
            .filter(|event| event.event_type() == event_type)
            .collect()
    }

    /// Concatenation of every message event's text, partial or not.
    pub fn text(&self) -> String {
        self.events
            .iter()
            .filter_map(|event| match event.content() {
                EventContent::Message(message) => Some(message.text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// The answer text: complete messages joined by newlines, or the
    /// concatenated deltas when the backend only streamed partials.
    pub fn final_text(&self) -> String {
        let complete = self
            .events
            .iter()
            .filter_map(|event| match event.content() {
                EventContent::Message(message) if !message.partial => Some(message.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>();
        if !complete.is_empty() {
            return complete.join("\n").trim().to_string();
        }
        self.text().trim().to_string()
    }

    pub fn last_error(&self) -> Option<&ErrorContent> {
        self.events.iter().rev().find_map(|event| match event.content() {
            EventContent::Error(error) => Some(error),
            _ => None,
        })
    }

    /// Sums usage reported by both `done` and `token_usage` events.
    pub fn token_totals(&self) -> TokenUsage {
        let mut totals = TokenUsage::default();
        for event in &self.events {
            match event.content() {
                EventContent::Done(done) => {
                    if let Some(usage) = &done.usage {
                        totals.accumulate(usage);
                    }
                }
                EventContent::TokenUsage(content) => totals.accumulate(&content.usage),
                _ => {}
            }
        }
        totals
    }

    /// Usage to report for a finished run: what `done` events carried, or the
    /// periodic `token_usage` notices when no `done` reported any. Backends
    /// that send both describe the same turn twice.
    pub fn reported_usage(&self) -> Option<TokenUsage> {
        let mut from_done = TokenUsage::default();
        let mut from_notices = TokenUsage::default();
        for event in &self.events {
            match event.content() {
                EventContent::Done(done) => {
                    if let Some(usage) = &done.usage {
                        from_done.accumulate(usage);
                    }
                }
                EventContent::TokenUsage(content) => from_notices.accumulate(&content.usage),
                _ => {}
            }
        }
        [from_done, from_notices]
            .into_iter()
            .find(|usage| !usage.is_empty())
    }

    pub fn backend_session_id(&self) -> Option<&str> {
        self.events.iter().find_map(|event| match event.content() {
            EventContent::Init(init) if !init.backend_session_id.is_empty() => {
                Some(init.backend_session_id.as_str())
            }
            _ => None,
        })
    }
}

impl Extend<UnifiedEvent> for EventCollector {
    fn extend<T: IntoIterator<Item = UnifiedEvent>>(&mut self, iter: T) {
        self.events.extend(iter);
    }
}

#[cfg(test)]
mod tests {
    use super::EventCollector;
    use crate::events::{
        DoneContent, ErrorContent, EventType, InitContent, MessageContent, TokenUsageContent,
        UnifiedEvent,
    };
    use crate::models::{Backend, TokenUsage};

    fn collector() -> EventCollector {
        let mut collector = EventCollector::new();
        let mut seq = 0;
        let mut push = |content: crate::events::EventContent| {
            seq += 1;
            collector.push(UnifiedEvent::new(Backend::Codex, "corr", seq, content));
        };
        push(
            InitContent {
                backend_session_id: "thread-1".to_string(),
                model: None,
            }
            .into(),
        );
        push(MessageContent::assistant("Hel", true).into());
        push(MessageContent::assistant("lo", true).into());
        push(
            ErrorContent {
                message: "first".to_string(),
                code: None,
            }
            .into(),
        );
        push(
            TokenUsageContent {
                usage: TokenUsage {
                    input_tokens: 5,
                    output_tokens: 1,
                    cached_tokens: 0,
                },
            }
            .into(),
        );
        push(
            ErrorContent {
                message: "second".to_string(),
                code: None,
            }
            .into(),
        );
        push(
            DoneContent {
                usage: Some(TokenUsage {
                    input_tokens: 10,
                    output_tokens: 20,
                    cached_tokens: 2,
                }),
                duration_ms: None,
                turns: None,
            }
            .into(),
        );
        collector
    }

    #[test]
    fn concatenates_message_text_in_order() {
        let collector = collector();
        assert_eq!(collector.text(), "Hello");
        assert_eq!(collector.final_text(), "Hello");
        assert_eq!(collector.by_type(EventType::Message).len(), 2);
        assert_eq!(collector.len(), 7);
    }

    #[test]
    fn final_text_prefers_complete_messages() {
        let mut collector = collector();
        collector.push(UnifiedEvent::new(
            Backend::Codex,
            "corr",
            99,
            MessageContent::assistant("Hello, world", false),
        ));
        assert_eq!(collector.final_text(), "Hello, world");
        assert_eq!(collector.text(), "HelloHello, world");
    }

    #[test]
    fn reports_most_recent_error_and_summed_tokens() {
        let collector = collector();
        assert_eq!(collector.last_error().map(|error| error.message.as_str()), Some("second"));
        let totals = collector.token_totals();
        assert_eq!(totals.input_tokens, 15);
        assert_eq!(totals.output_tokens, 21);
        assert_eq!(totals.cached_tokens, 2);
        assert_eq!(collector.backend_session_id(), Some("thread-1"));
    }

    #[test]
    fn reported_usage_prefers_done_over_notices() {
        let collector = collector();
        let usage = collector.reported_usage().expect("usage");
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 20);
        assert_eq!(usage.cached_tokens, 2);

        let mut same_turn_twice = EventCollector::new();
        let usage = TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
            cached_tokens: 0,
        };
        same_turn_twice.push(UnifiedEvent::new(
            Backend::Codex,
            "corr",
            1,
            TokenUsageContent { usage },
        ));
        same_turn_twice.push(UnifiedEvent::new(
            Backend::Codex,
            "corr",
            2,
            DoneContent {
                usage: Some(usage),
                duration_ms: None,
                turns: None,
            },
        ));
        assert_eq!(same_turn_twice.reported_usage(), Some(usage));
        assert_eq!(same_turn_twice.token_totals().total(), 30);
    }

    #[test]
    fn reported_usage_falls_back_to_notices() {
        let mut collector = EventCollector::new();
        assert_eq!(collector.reported_usage(), None);
        collector.push(UnifiedEvent::new(
            Backend::Gemini,
            "corr",
            1,
            TokenUsageContent {
                usage: TokenUsage {
                    input_tokens: 4,
                    output_tokens: 3,
                    cached_tokens: 0,
                },
            },
        ));
        collector.push(UnifiedEvent::new(Backend::Gemini, "corr", 2, DoneContent::default()));
        assert_eq!(collector.reported_usage().map(|usage| usage.total()), Some(7));
    }
}
